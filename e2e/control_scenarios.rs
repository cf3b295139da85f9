//! E2E: control-plane scenarios — configuration guarded during a live run,
//! and master-dataset accounting across interleaved datasets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use framewriter::frame::Frame;
use framewriter::ipc::{IpcMessage, MsgType, MsgVal};
use framewriter::pool::DataBlockPool;
use framewriter::store::ChunkFileReader;
use framewriter::Controller;
use tempfile::TempDir;

fn cmd() -> IpcMessage {
    IpcMessage::new(MsgType::Cmd, MsgVal::Configure)
}

fn reply() -> IpcMessage {
    IpcMessage::new(MsgType::Ack, MsgVal::Configure)
}

fn status_of(controller: &Controller) -> IpcMessage {
    let mut config = cmd();
    config.set_param("status", true);
    let mut r = reply();
    controller.configure(&config, &mut r);
    r
}

fn frame(pool: &Arc<DataBlockPool>, dataset: &str, n: u64, fill: u8) -> Arc<Frame> {
    let mut f = Frame::new(pool, dataset);
    f.set_dataset_name(dataset);
    f.set_frame_number(n);
    f.set_dimensions("frame", vec![4, 4]);
    f.copy_data(&[fill; 16]);
    Arc::new(f)
}

fn wait_for<F: Fn() -> bool>(cond: F) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(cond(), "condition not met within deadline");
}

// Controller with a loaded writer, configured for `dir` with datasets
// `img` and `meta`, not yet writing.
fn capture_setup(dir: &TempDir) -> Controller {
    let controller = Controller::new().unwrap();

    let mut config = cmd();
    config.set_param("plugin/load/index", "hdf");
    config.set_param("plugin/load/name", "FileWriter");
    config.set_param("plugin/load/library", "builtin");
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(!r.has_param("error"));

    for name in ["img", "meta"] {
        let mut config = cmd();
        config.set_param("hdf/dataset/cmd", "create");
        config.set_param("hdf/dataset/name", name);
        config.set_param("hdf/dataset/datatype", 0);
        config.set_param("hdf/dataset/dims", vec![4u64, 4]);
        config.set_param("hdf/dataset/chunks", vec![1u64, 4, 4]);
        let mut r = reply();
        controller.configure(&config, &mut r);
        assert!(!r.has_param("error"));
    }

    let mut config = cmd();
    config.set_param("hdf/file/path", format!("{}/", dir.path().display()));
    config.set_param("hdf/file/name", "run.fwf");
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(!r.has_param("error"));

    controller
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: configuration is rejected while writing
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn config_while_writing_is_rejected_and_harmless() {
    let dir = TempDir::new().unwrap();
    let controller = capture_setup(&dir);
    let pool = DataBlockPool::new();

    let mut config = cmd();
    config.set_param("hdf/frames", 3u64);
    config.set_param("hdf/write", true);
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(!r.has_param("error"));

    // A path change mid-run must bounce with an error reply...
    let mut config = cmd();
    config.set_param("hdf/file/path", "/somewhere/else/");
    let mut r = reply();
    controller.configure(&config, &mut r);
    let text = r.get_param::<String>("error").unwrap();
    assert!(text.contains("rejected"), "{text}");

    // ...leaving state untouched and the run live.
    let status = status_of(&controller);
    assert_eq!(
        status.get_param::<String>("hdf/file_path").unwrap(),
        format!("{}/", dir.path().display())
    );
    assert!(status.get_param::<bool>("hdf/writing").unwrap());

    let stage = controller.plugin("hdf").unwrap();
    stage.push(frame(&pool, "img", 1, 1));
    wait_for(|| {
        status_of(&controller)
            .get_param::<u64>("hdf/frames_written")
            .unwrap()
            == 1
    });

    // Stop the run through the normal path.
    let mut config = cmd();
    config.set_param("hdf/write", false);
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(!r.has_param("error"));
    assert!(!status_of(&controller).get_param::<bool>("hdf/writing").unwrap());
    controller.stop();
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: master dataset drives termination
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn master_dataset_terminates_after_three_master_frames() {
    let dir = TempDir::new().unwrap();
    let controller = capture_setup(&dir);
    let pool = DataBlockPool::new();

    let mut config = cmd();
    config.set_param("hdf/master", "img");
    config.set_param("hdf/frames", 3u64);
    config.set_param("hdf/write", true);
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(!r.has_param("error"));

    // img, meta, img, meta, img — all five are written, the three img
    // frames drive the budget.
    let stage = controller.plugin("hdf").unwrap();
    stage.push(frame(&pool, "img", 1, 0x11));
    stage.push(frame(&pool, "meta", 1, 0xA1));
    stage.push(frame(&pool, "img", 2, 0x12));
    stage.push(frame(&pool, "meta", 2, 0xA2));
    stage.push(frame(&pool, "img", 3, 0x13));

    wait_for(|| !status_of(&controller).get_param::<bool>("hdf/writing").unwrap());
    let status = status_of(&controller);
    assert_eq!(status.get_param::<u64>("hdf/frames_written").unwrap(), 3);
    controller.stop();

    let mut reader = ChunkFileReader::open(dir.path().join("run.fwf")).unwrap();
    assert_eq!(reader.dims("img").unwrap(), &[3, 4, 4]);
    assert_eq!(reader.dims("meta").unwrap(), &[2, 4, 4]);
    assert_eq!(
        reader.chunk_count("img").unwrap() + reader.chunk_count("meta").unwrap(),
        5,
        "every accepted frame was written"
    );
    assert_eq!(
        reader.read_chunk("img", &[2, 0, 0]).unwrap().unwrap(),
        vec![0x13; 16]
    );
    assert_eq!(
        reader.read_chunk("meta", &[1, 0, 0]).unwrap().unwrap(),
        vec![0xA2; 16]
    );
}
