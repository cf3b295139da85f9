//! E2E: the full pipeline — shared segment in, container file out.
//!
//! Plays the upstream frame receiver against a real controller: creates the
//! shared segment, binds the notification endpoints, drives the whole run
//! through configure messages, and checks both the release traffic and the
//! final bytes on disk.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::time::{Duration, Instant};

use framewriter::ipc::{IpcChannel, IpcMessage, MsgType, MsgVal};
use framewriter::shmem::{BUFFER_HEADER_SIZE, SHARED_HEADER_SIZE};
use framewriter::store::ChunkFileReader;
use framewriter::Controller;
use nix::fcntl::OFlag;
use nix::sys::mman;
use nix::sys::stat::Mode;
use tempfile::TempDir;

const BUFFER_SIZE: u64 = (BUFFER_HEADER_SIZE + 16) as u64;

struct Upstream {
    shm_name: String,
    file: File,
    ready: IpcChannel,
    release: IpcChannel,
}

impl Upstream {
    fn start(tag: &str, num_buffers: u64) -> Upstream {
        let pid = std::process::id();
        let shm_name = format!("/fw-e2e-{pid}-{tag}");
        let fd = mman::shm_open(
            shm_name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_TRUNC,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .expect("shm_open for e2e segment");
        let file = File::from(fd);
        file.set_len(SHARED_HEADER_SIZE as u64 + num_buffers * BUFFER_SIZE)
            .unwrap();
        let mut header = Vec::with_capacity(SHARED_HEADER_SIZE);
        header.extend_from_slice(&1u64.to_ne_bytes());
        header.extend_from_slice(&num_buffers.to_ne_bytes());
        header.extend_from_slice(&BUFFER_SIZE.to_ne_bytes());
        file.write_all_at(&header, 0).unwrap();

        let ready = IpcChannel::bind(&format!("inproc://e2e-ready-{pid}-{tag}")).unwrap();
        let release = IpcChannel::bind(&format!("inproc://e2e-release-{pid}-{tag}")).unwrap();
        Upstream {
            shm_name,
            file,
            ready,
            release,
        }
    }

    fn fill_buffer(&self, idx: u64, frame_number: u64, payload: &[u8]) {
        let base = SHARED_HEADER_SIZE as u64 + idx * BUFFER_SIZE;
        let mut meta = Vec::with_capacity(BUFFER_HEADER_SIZE);
        meta.extend_from_slice(&frame_number.to_ne_bytes());
        meta.extend_from_slice(&0u64.to_ne_bytes());
        self.file.write_all_at(&meta, base).unwrap();
        self.file
            .write_all_at(payload, base + BUFFER_HEADER_SIZE as u64)
            .unwrap();
    }

    fn notify_ready(&self, frame_number: u64, buffer_id: u64) {
        let mut ready = IpcMessage::new(MsgType::Notify, MsgVal::FrameReady);
        ready.set_param("frame_number", frame_number);
        ready.set_param("buffer_id", buffer_id);
        ready.set_param("dataset", "data");
        ready.set_param("frame_size", 16u64);
        ready.set_param("dimensions/frame", vec![4u64, 4]);
        self.ready.send(&ready).unwrap();
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        let _ = mman::shm_unlink(self.shm_name.as_str());
    }
}

fn cmd() -> IpcMessage {
    IpcMessage::new(MsgType::Cmd, MsgVal::Configure)
}

fn reply() -> IpcMessage {
    IpcMessage::new(MsgType::Ack, MsgVal::Configure)
}

#[test]
fn frames_flow_from_shared_memory_to_disk() {
    let pid = std::process::id();
    let dir = TempDir::new().unwrap();
    let upstream = Upstream::start("flow", 2);
    upstream.fill_buffer(0, 1, &[0x11; 16]);
    upstream.fill_buffer(1, 2, &[0x22; 16]);

    let controller = Controller::new().unwrap();

    // One configure message wires the whole service: ingest, plugin,
    // connection, and the run parameters.
    let mut config = cmd();
    config.set_param("fr_setup/fr_shared_mem", upstream.shm_name.clone());
    config.set_param("fr_setup/fr_ready_cnxn", format!("inproc://e2e-ready-{pid}-flow"));
    config.set_param(
        "fr_setup/fr_release_cnxn",
        format!("inproc://e2e-release-{pid}-flow"),
    );
    config.set_param("plugin/load/index", "hdf");
    config.set_param("plugin/load/name", "FileWriter");
    config.set_param("plugin/load/library", "builtin");
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(!r.has_param("error"), "{:?}", r.get_param::<String>("error"));

    let mut config = cmd();
    config.set_param("plugin/connect/index", "hdf");
    config.set_param("plugin/connect/connection", "frame_receiver");
    config.set_param("hdf/file/path", format!("{}/", dir.path().display()));
    config.set_param("hdf/file/name", "capture.fwf");
    config.set_param("hdf/dataset/cmd", "create");
    config.set_param("hdf/dataset/name", "data");
    config.set_param("hdf/dataset/datatype", 0);
    config.set_param("hdf/dataset/dims", vec![4u64, 4]);
    config.set_param("hdf/dataset/chunks", vec![1u64, 4, 4]);
    config.set_param("hdf/frames", 2u64);
    config.set_param("hdf/write", true);
    let mut r = reply();
    controller.configure(&config, &mut r);
    assert!(!r.has_param("error"), "{:?}", r.get_param::<String>("error"));

    upstream.notify_ready(1, 0);
    upstream.notify_ready(2, 1);

    // Buffer releases come back once the copies are done.
    for expect in [0u64, 1] {
        let release = upstream
            .release
            .recv_timeout(Duration::from_secs(3))
            .unwrap()
            .expect("release notification");
        assert_eq!(release.get_param::<u64>("buffer_id").unwrap(), expect);
    }

    // The run closes itself after two frames.
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let mut config = cmd();
        config.set_param("status", true);
        let mut status = reply();
        controller.configure(&config, &mut status);
        if !status.get_param::<bool>("hdf/writing").unwrap() {
            assert_eq!(status.get_param::<u64>("hdf/frames_written").unwrap(), 2);
            break;
        }
        assert!(Instant::now() < deadline, "run did not close in time");
        std::thread::sleep(Duration::from_millis(10));
    }
    controller.stop();

    let mut reader = ChunkFileReader::open(dir.path().join("capture.fwf")).unwrap();
    assert_eq!(reader.dims("data").unwrap(), &[2, 4, 4]);
    assert_eq!(
        reader.read_chunk("data", &[0, 0, 0]).unwrap().unwrap(),
        vec![0x11; 16]
    );
    assert_eq!(
        reader.read_chunk("data", &[1, 0, 0]).unwrap().unwrap(),
        vec![0x22; 16]
    );
}
