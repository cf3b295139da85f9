// Shared-memory ingest tests against a real POSIX shared segment.
//
// The fixture plays the upstream frame receiver: it creates the segment,
// fills buffers, binds the ready/release endpoints, and sends the ready
// notifications the controller normally reacts to.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use framewriter::error::FwResult;
use framewriter::frame::Frame;
use framewriter::ipc::{IpcChannel, IpcMessage, IpcReactor, MsgType, MsgVal};
use framewriter::plugin::{FramePlugin, PluginStage};
use framewriter::pool::DataBlockPool;
use framewriter::shmem::{SharedMemoryController, SharedMemoryParser, BUFFER_HEADER_SIZE, SHARED_HEADER_SIZE};
use nix::fcntl::OFlag;
use nix::sys::mman;
use nix::sys::stat::Mode;

// ─────────────────────────────────────────────────────────────────────────────
// Segment fixture
// ─────────────────────────────────────────────────────────────────────────────

struct Segment {
    name: String,
    file: File,
    buffer_size: u64,
}

impl Segment {
    fn create(tag: &str, manager_id: u64, num_buffers: u64, buffer_size: u64) -> Segment {
        let name = format!("/fw-test-{}-{tag}", std::process::id());
        let fd = mman::shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_TRUNC,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .expect("shm_open for test segment");
        let file = File::from(fd);
        file.set_len(SHARED_HEADER_SIZE as u64 + num_buffers * buffer_size)
            .unwrap();

        let mut header = Vec::with_capacity(SHARED_HEADER_SIZE);
        header.extend_from_slice(&manager_id.to_ne_bytes());
        header.extend_from_slice(&num_buffers.to_ne_bytes());
        header.extend_from_slice(&buffer_size.to_ne_bytes());
        file.write_all_at(&header, 0).unwrap();
        Segment {
            name,
            file,
            buffer_size,
        }
    }

    fn fill_buffer(&self, idx: u64, frame_number: u64, payload: &[u8]) {
        let base = SHARED_HEADER_SIZE as u64 + idx * self.buffer_size;
        let mut meta = Vec::with_capacity(BUFFER_HEADER_SIZE);
        meta.extend_from_slice(&frame_number.to_ne_bytes());
        meta.extend_from_slice(&0u64.to_ne_bytes());
        self.file.write_all_at(&meta, base).unwrap();
        self.file
            .write_all_at(payload, base + BUFFER_HEADER_SIZE as u64)
            .unwrap();
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let _ = mman::shm_unlink(self.name.as_str());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recording sink
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    name: Mutex<String>,
    seen: Mutex<Vec<(String, u64, Vec<u8>)>>,
}

impl Recorder {
    fn seen(&self) -> Vec<(String, u64, Vec<u8>)> {
        self.seen.lock().unwrap().clone()
    }
}

impl FramePlugin for Recorder {
    fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_owned();
    }
    fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }
    fn configure(&self, _config: &IpcMessage, _reply: &mut IpcMessage) -> FwResult<()> {
        Ok(())
    }
    fn status(&self, _reply: &mut IpcMessage) {}
    fn process_frame(&self, frame: &Arc<Frame>) {
        self.seen.lock().unwrap().push((
            frame.dataset_name().to_owned(),
            frame.frame_number(),
            frame.data().to_vec(),
        ));
    }
}

fn wait_for<F: Fn() -> bool>(cond: F) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(cond(), "condition not met within deadline");
}

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn parser_reads_header_and_buffers() {
    let segment = Segment::create("parser", 42, 3, 1040);
    segment.fill_buffer(1, 17, &[0xCD; 8]);

    let parser = SharedMemoryParser::open(&segment.name).unwrap();
    assert_eq!(parser.manager_id(), 42);
    assert_eq!(parser.num_buffers(), 3);
    assert_eq!(parser.buffer_size(), 1040);
    assert_eq!(parser.payload_size(), 1040 - BUFFER_HEADER_SIZE);

    let (meta, payload) = parser.buffer(1).unwrap();
    assert_eq!(meta.frame_number, 17);
    assert_eq!(&payload[..8], &[0xCD; 8]);

    assert!(parser.buffer(3).is_err(), "index out of range");
}

#[test]
fn parser_rejects_missing_segment() {
    assert!(SharedMemoryParser::open("/fw-test-definitely-missing").is_err());
}

#[test]
fn parser_rejects_bad_geometry() {
    // Claims more buffers than the mapping can hold.
    let segment = Segment::create("badgeo", 1, 2, 64);
    let bogus = 1_000_000u64;
    segment
        .file
        .write_all_at(&bogus.to_ne_bytes(), 8)
        .unwrap();
    assert!(SharedMemoryParser::open(&segment.name).is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller: ready -> frame -> sinks -> release
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn ready_notification_becomes_frame_and_release() {
    let pid = std::process::id();
    let ready_ep = format!("inproc://shm-ready-{pid}");
    let release_ep = format!("inproc://shm-release-{pid}");

    let segment = Segment::create("flow", 1, 2, 1040);
    segment.fill_buffer(0, 1, &[0x11; 16]);
    segment.fill_buffer(1, 2, &[0x22; 16]);

    // Upstream side of both channels.
    let ready_up = IpcChannel::bind(&ready_ep).unwrap();
    let release_up = IpcChannel::bind(&release_ep).unwrap();

    let reactor = Arc::new(IpcReactor::new());
    let pool = DataBlockPool::new();
    let smc =
        SharedMemoryController::new(&reactor, &ready_ep, &release_ep, &pool, None).unwrap();
    smc.set_parser(Arc::new(SharedMemoryParser::open(&segment.name).unwrap()));

    let recorder = Arc::new(Recorder::default());
    let stage = PluginStage::new("rec", Arc::clone(&recorder) as Arc<dyn FramePlugin>);
    stage.start();
    smc.register_callback("rec", Arc::clone(&stage));

    let r = Arc::clone(&reactor);
    let reactor_thread = std::thread::spawn(move || r.run());

    for (n, buffer) in [(1u64, 0u64), (2, 1)] {
        let mut ready = IpcMessage::new(MsgType::Notify, MsgVal::FrameReady);
        ready.set_param("frame_number", n);
        ready.set_param("buffer_id", buffer);
        ready.set_param("dataset", "img");
        ready.set_param("frame_size", 16u64);
        ready_up.send(&ready).unwrap();
    }

    wait_for(|| recorder.seen().len() == 2);
    let seen = recorder.seen();
    assert_eq!(seen[0], ("img".to_owned(), 1, vec![0x11; 16]));
    assert_eq!(seen[1], ("img".to_owned(), 2, vec![0x22; 16]));

    // Release notifications carry buffer_id and frame_number.
    for expect_buffer in [0u64, 1] {
        let release = release_up
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("release notification");
        assert_eq!(release.msg_val(), MsgVal::FrameRelease);
        assert_eq!(release.get_param::<u64>("buffer_id").unwrap(), expect_buffer);
    }

    reactor.stop();
    reactor_thread.join().unwrap();
    stage.stop();
}

#[test]
fn release_is_published_even_without_sinks() {
    let pid = std::process::id();
    let ready_ep = format!("inproc://shm-ready-nosink-{pid}");
    let release_ep = format!("inproc://shm-release-nosink-{pid}");

    let segment = Segment::create("nosink", 1, 1, 1040);
    segment.fill_buffer(0, 5, &[0; 4]);

    let ready_up = IpcChannel::bind(&ready_ep).unwrap();
    let release_up = IpcChannel::bind(&release_ep).unwrap();

    let reactor = Arc::new(IpcReactor::new());
    let pool = DataBlockPool::new();
    let smc =
        SharedMemoryController::new(&reactor, &ready_ep, &release_ep, &pool, None).unwrap();
    smc.set_parser(Arc::new(SharedMemoryParser::open(&segment.name).unwrap()));

    let r = Arc::clone(&reactor);
    let reactor_thread = std::thread::spawn(move || r.run());

    let mut ready = IpcMessage::new(MsgType::Notify, MsgVal::FrameReady);
    ready.set_param("frame_number", 5u64);
    ready.set_param("buffer_id", 0u64);
    ready.set_param("dataset", "img");
    ready_up.send(&ready).unwrap();

    let release = release_up
        .recv_timeout(Duration::from_secs(2))
        .unwrap()
        .expect("release notification");
    assert_eq!(release.get_param::<u64>("frame_number").unwrap(), 5);

    reactor.stop();
    reactor_thread.join().unwrap();
}
