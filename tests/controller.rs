// Control-plane dispatcher tests: plugin lifecycle, graph wiring and cycle
// rejection, per-plugin forwarding, status aggregation, the bound control
// channel, and shutdown.

use std::time::Duration;

use framewriter::ipc::{IpcChannel, IpcMessage, MsgType, MsgVal};
use framewriter::Controller;
use tempfile::TempDir;

fn cmd() -> IpcMessage {
    IpcMessage::new(MsgType::Cmd, MsgVal::Configure)
}

fn reply() -> IpcMessage {
    IpcMessage::new(MsgType::Ack, MsgVal::Configure)
}

fn load(controller: &Controller, index: &str) -> IpcMessage {
    let mut config = cmd();
    config.set_param("plugin/load/index", index);
    config.set_param("plugin/load/name", "FileWriter");
    config.set_param("plugin/load/library", "builtin");
    let mut r = reply();
    controller.configure(&config, &mut r);
    r
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn load_and_list_plugins() {
    let controller = Controller::new().unwrap();
    let r = load(&controller, "hdf");
    assert!(!r.has_param("error"), "{:?}", r.get_param::<String>("error"));
    assert_eq!(controller.plugin_names(), vec!["hdf".to_string()]);

    let mut config = cmd();
    config.set_param("plugin/list", true);
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert_eq!(
        r.get_param::<Vec<String>>("plugins/names").unwrap(),
        vec!["hdf"]
    );
    controller.stop();
}

#[test]
fn duplicate_index_is_rejected() {
    let controller = Controller::new().unwrap();
    assert!(!load(&controller, "hdf").has_param("error"));
    let r = load(&controller, "hdf");
    let text = r.get_param::<String>("error").unwrap();
    assert!(text.contains("already loaded"), "{text}");
    controller.stop();
}

#[test]
fn unknown_class_is_rejected() {
    let controller = Controller::new().unwrap();
    let mut config = cmd();
    config.set_param("plugin/load/index", "x");
    config.set_param("plugin/load/name", "NoSuchClass");
    config.set_param("plugin/load/library", "builtin");
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(r.has_param("error"));
    controller.stop();
}

// ─────────────────────────────────────────────────────────────────────────────
// Graph wiring
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn connect_requires_loaded_plugin_and_ingest() {
    let controller = Controller::new().unwrap();

    // Not loaded at all.
    let mut config = cmd();
    config.set_param("plugin/connect/index", "hdf");
    config.set_param("plugin/connect/connection", "frame_receiver");
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(r.get_param::<String>("error").unwrap().contains("not loaded"));

    // Loaded, but the frame receiver is not configured.
    load(&controller, "hdf");
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(r
        .get_param::<String>("error")
        .unwrap()
        .contains("frame_receiver"));
    controller.stop();
}

#[test]
fn plugin_to_plugin_wiring_and_cycle_rejection() {
    let controller = Controller::new().unwrap();
    load(&controller, "a");
    load(&controller, "b");

    // a feeds b.
    let mut config = cmd();
    config.set_param("plugin/connect/index", "b");
    config.set_param("plugin/connect/connection", "a");
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(!r.has_param("error"), "{:?}", r.get_param::<String>("error"));
    assert_eq!(controller.plugin("a").unwrap().sink_names(), vec!["b"]);

    // b feeding a again would close a loop.
    let mut config = cmd();
    config.set_param("plugin/connect/index", "a");
    config.set_param("plugin/connect/connection", "b");
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(r
        .get_param::<String>("error")
        .unwrap()
        .contains("cycle"));

    // Self-connection is the 1-edge cycle.
    let mut config = cmd();
    config.set_param("plugin/connect/index", "a");
    config.set_param("plugin/connect/connection", "a");
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(r.get_param::<String>("error").unwrap().contains("cycle"));

    // Disconnect then rewire in the other direction.
    let mut config = cmd();
    config.set_param("plugin/disconnect/index", "b");
    config.set_param("plugin/disconnect/connection", "a");
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(!r.has_param("error"));
    assert!(controller.plugin("a").unwrap().sink_names().is_empty());

    let mut config = cmd();
    config.set_param("plugin/connect/index", "a");
    config.set_param("plugin/connect/connection", "b");
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(!r.has_param("error"), "reverse edge is legal after disconnect");
    controller.stop();
}

// ─────────────────────────────────────────────────────────────────────────────
// Forwarding and status
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn sub_messages_are_forwarded_to_plugins() {
    let dir = TempDir::new().unwrap();
    let controller = Controller::new().unwrap();
    load(&controller, "hdf");

    let mut config = cmd();
    config.set_param("hdf/file/path", format!("{}/", dir.path().display()));
    config.set_param("hdf/file/name", "run.fwf");
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(!r.has_param("error"));

    let mut config = cmd();
    config.set_param("status", true);
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert_eq!(r.get_param::<String>("hdf/file_name").unwrap(), "run.fwf");
    assert_eq!(r.get_param::<bool>("hdf/writing").unwrap(), false);
    controller.stop();
}

#[test]
fn best_effort_configure_keeps_later_steps_running() {
    let controller = Controller::new().unwrap();
    // One message: a failing load (duplicate) plus a valid list request.
    load(&controller, "hdf");
    let mut config = cmd();
    config.set_param("plugin/load/index", "hdf");
    config.set_param("plugin/load/name", "FileWriter");
    config.set_param("plugin/load/library", "builtin");
    config.set_param("plugin/list", true);
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(r.has_param("error"));
    assert_eq!(
        r.get_param::<Vec<String>>("plugins/names").unwrap(),
        vec!["hdf"],
        "list ran despite the load failure"
    );
    controller.stop();
}

// ─────────────────────────────────────────────────────────────────────────────
// Control channel and shutdown
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn bound_control_channel_answers_configure() {
    let pid = std::process::id();
    let endpoint = format!("inproc://ctrl-{pid}");
    let controller = Controller::new().unwrap();

    let mut config = cmd();
    config.set_param("ctrl_endpoint", endpoint.clone());
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(!r.has_param("error"));

    let client = IpcChannel::connect(&endpoint).unwrap();
    let mut remote = cmd();
    remote.set_param("plugin/load/index", "hdf");
    remote.set_param("plugin/load/name", "FileWriter");
    remote.set_param("plugin/load/library", "builtin");
    client.send(&remote).unwrap();

    let ack = client
        .recv_timeout(Duration::from_secs(2))
        .unwrap()
        .expect("configure reply");
    assert_eq!(ack.msg_type(), MsgType::Ack);
    assert_eq!(controller.plugin_names(), vec!["hdf".to_string()]);
    controller.stop();
}

#[test]
fn shutdown_releases_wait_for_shutdown() {
    let controller = std::sync::Arc::new(Controller::new().unwrap());
    let waiter = {
        let controller = std::sync::Arc::clone(&controller);
        std::thread::spawn(move || controller.wait_for_shutdown())
    };

    let mut config = cmd();
    config.set_param("shutdown", true);
    let mut r = reply();
    controller.configure(&config, &mut r);

    waiter.join().expect("wait_for_shutdown returned");
    controller.stop();
}
