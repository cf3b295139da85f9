//! E2E: writing-engine scenarios against real container files.
//!
//! Covers single-rank capture, rank striping, the start-offset latch, and
//! subframe stripes, verifying the bytes on disk through the container
//! reader.

use std::sync::Arc;

use framewriter::error::FwError;
use framewriter::frame::Frame;
use framewriter::ipc::{IpcMessage, MsgType, MsgVal};
use framewriter::plugin::FramePlugin;
use framewriter::pool::DataBlockPool;
use framewriter::store::ChunkFileReader;
use framewriter::writer::FileWriterPlugin;
use tempfile::TempDir;

fn cmd() -> IpcMessage {
    IpcMessage::new(MsgType::Cmd, MsgVal::Configure)
}

fn ack() -> IpcMessage {
    IpcMessage::new(MsgType::Ack, MsgVal::Configure)
}

fn writer(dir: &TempDir, processes: u64, rank: u64, frames: u64, datatype: i64) -> FileWriterPlugin {
    let w = FileWriterPlugin::new();
    w.set_name("hdf");
    let mut config = cmd();
    config.set_param("process/number", processes);
    config.set_param("process/rank", rank);
    config.set_param("file/path", format!("{}/", dir.path().display()));
    config.set_param("file/name", "t.fwf");
    config.set_param("dataset/cmd", "create");
    config.set_param("dataset/name", "d");
    config.set_param("dataset/datatype", datatype);
    config.set_param("dataset/dims", vec![4u64, 4]);
    config.set_param("dataset/chunks", vec![1u64, 4, 4]);
    config.set_param("frames", frames);
    config.set_param("write", true);
    w.configure(&config, &mut ack()).unwrap();
    w
}

fn frame(pool: &Arc<DataBlockPool>, n: u64, payload: &[u8]) -> Arc<Frame> {
    let mut f = Frame::new(pool, "d");
    f.set_dataset_name("d");
    f.set_frame_number(n);
    f.set_dimensions("frame", vec![4, 4]);
    f.copy_data(payload);
    Arc::new(f)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: single rank, two frames
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn single_rank_two_frames() {
    let dir = TempDir::new().unwrap();
    let w = writer(&dir, 1, 0, 2, 2);
    let pool = DataBlockPool::new();

    w.process_frame(&frame(&pool, 1, &[0xAA; 16]));
    w.process_frame(&frame(&pool, 2, &[0xAA; 16]));
    assert!(!w.is_writing(), "writing stops after the second frame");

    let path = dir.path().join("t.fwf");
    assert!(path.exists());
    let mut reader = ChunkFileReader::open(&path).unwrap();
    assert_eq!(reader.dims("d").unwrap(), &[2, 4, 4], "leading extent is 2");
    assert_eq!(
        reader.read_chunk("d", &[0, 0, 0]).unwrap().unwrap(),
        vec![0xAA; 16]
    );
    assert_eq!(
        reader.read_chunk("d", &[1, 0, 0]).unwrap().unwrap(),
        vec![0xAA; 16]
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: two-rank striping, rank 0
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn striping_keeps_own_frames_and_rejects_the_rest() {
    let dir = TempDir::new().unwrap();
    let w = writer(&dir, 2, 0, 2, 0);
    let pool = DataBlockPool::new();

    // Frames 1 and 3 belong here; 2 and 4 belong to rank 1.
    w.process_frame(&frame(&pool, 1, &[0x01; 16]));
    w.process_frame(&frame(&pool, 2, &[0x02; 16]));
    assert!(w.is_writing(), "wrong-rank frame does not abort the run");
    w.process_frame(&frame(&pool, 3, &[0x03; 16]));
    w.process_frame(&frame(&pool, 4, &[0x04; 16]));

    assert!(!w.is_writing());
    assert_eq!(w.frames_written(), 2);

    let mut reader = ChunkFileReader::open(dir.path().join("t.fwf")).unwrap();
    assert_eq!(reader.dims("d").unwrap(), &[2, 4, 4]);
    assert_eq!(
        reader.read_chunk("d", &[0, 0, 0]).unwrap().unwrap(),
        vec![0x01; 16],
        "frame 1 lands at this rank's row 0"
    );
    assert_eq!(
        reader.read_chunk("d", &[1, 0, 0]).unwrap().unwrap(),
        vec![0x03; 16],
        "frame 3 lands at this rank's row 1"
    );
}

#[test]
fn wrong_rank_is_reported_by_the_offset_translator() {
    let w = FileWriterPlugin::new();
    let mut config = cmd();
    config.set_param("process/number", 2u64);
    config.set_param("process/rank", 0u64);
    w.configure(&config, &mut ack()).unwrap();

    assert!(matches!(
        w.frame_offset(2),
        Err(FwError::WrongRank {
            frame: 2,
            rank: 0,
            processes: 2
        })
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: start-offset latch
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn start_offset_latch() {
    let w = FileWriterPlugin::new();
    w.set_start_frame_offset(1000);

    assert!(matches!(
        w.frame_offset(999),
        Err(FwError::OutOfOrder {
            frame: 999,
            start: 1000
        })
    ));
    assert_eq!(w.frame_offset(1001).unwrap(), 1);
    assert_eq!(w.frame_offset(1000).unwrap(), 0, "the latched frame is row 0");
}

#[test]
fn latched_run_writes_from_row_zero() {
    let dir = TempDir::new().unwrap();
    let w = writer(&dir, 1, 0, 2, 0);
    w.set_start_frame_offset(1000);
    let pool = DataBlockPool::new();

    w.process_frame(&frame(&pool, 999, &[0xEE; 16])); // out of order, dropped
    w.process_frame(&frame(&pool, 1000, &[0x10; 16]));
    w.process_frame(&frame(&pool, 1001, &[0x11; 16]));
    assert!(!w.is_writing());

    let mut reader = ChunkFileReader::open(dir.path().join("t.fwf")).unwrap();
    assert_eq!(reader.dims("d").unwrap(), &[2, 4, 4]);
    assert_eq!(
        reader.read_chunk("d", &[0, 0, 0]).unwrap().unwrap(),
        vec![0x10; 16]
    );
    assert_eq!(
        reader.read_chunk("d", &[1, 0, 0]).unwrap().unwrap(),
        vec![0x11; 16]
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario: subframe stripes
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn subframes_write_one_chunk_per_stripe() {
    let dir = TempDir::new().unwrap();
    let w = FileWriterPlugin::new();
    w.set_name("hdf");
    let mut config = cmd();
    config.set_param("file/path", format!("{}/", dir.path().display()));
    config.set_param("file/name", "t.fwf");
    config.set_param("dataset/cmd", "create");
    config.set_param("dataset/name", "d");
    config.set_param("dataset/datatype", 0);
    config.set_param("dataset/dims", vec![4u64, 4]);
    // Chunk covers one 4x2 stripe; the frame holds two of them.
    config.set_param("dataset/chunks", vec![1u64, 4, 2]);
    config.set_param("frames", 1u64);
    config.set_param("write", true);
    w.configure(&config, &mut ack()).unwrap();

    let pool = DataBlockPool::new();
    let mut f = Frame::new(&pool, "d");
    f.set_dataset_name("d");
    f.set_frame_number(1);
    f.set_parameter("subframe_count", 2);
    f.set_parameter("subframe_size", 8);
    f.set_dimensions("subframe", vec![4, 2]);
    let payload: Vec<u8> = (0u8..16).collect();
    f.copy_data(&payload);
    w.process_frame(&Arc::new(f));
    assert!(!w.is_writing());

    let mut reader = ChunkFileReader::open(dir.path().join("t.fwf")).unwrap();
    assert_eq!(
        reader.read_chunk("d", &[0, 0, 0]).unwrap().unwrap(),
        payload[..8].to_vec(),
        "first stripe at column 0"
    );
    assert_eq!(
        reader.read_chunk("d", &[0, 0, 2]).unwrap().unwrap(),
        payload[8..].to_vec(),
        "second stripe at column 2"
    );
    assert_eq!(reader.chunk_count("d").unwrap(), 2);
}
