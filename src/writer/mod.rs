//! The writing engine: turns accepted frames into direct chunk writes
//! against a per-run container file.
//!
//! Lifecycle: dataset definitions and run parameters accumulate while the
//! stage is idle; `write=true` creates the container and one open dataset
//! per definition, `write=false` (or reaching the frame budget) closes it.
//! Anything that would change the shape of the run — path, name, stripe
//! geometry, datasets — is rejected while a run is live.
//!
//! Striping: with `processes > 1` each writer instance owns the residue
//! class `(n - 1) mod processes == rank` of 1-based hardware frame numbers
//! and packs its frames densely via integer division.  A latched start
//! offset makes that frame number on-disk row 0; unlatched runs use the
//! 1-based origin directly, so the first hardware frame lands at row 0.
//!
//! All state sits behind one mutex, serializing configuration against the
//! write path; the worker thread and the control plane never interleave
//! inside the engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::{FwError, FwResult};
use crate::frame::Frame;
use crate::ipc::IpcMessage;
use crate::plugin::FramePlugin;
use crate::store::{ChunkFile, DatasetSpec, Dtype};

// Configuration keys understood by `configure`.
const CONFIG_PROCESS: &str = "process";
const CONFIG_PROCESS_NUMBER: &str = "number";
const CONFIG_PROCESS_RANK: &str = "rank";
const CONFIG_FILE: &str = "file";
const CONFIG_FILE_PATH: &str = "path";
const CONFIG_FILE_NAME: &str = "name";
const CONFIG_DATASET: &str = "dataset";
const CONFIG_DATASET_CMD: &str = "cmd";
const CONFIG_DATASET_NAME: &str = "name";
const CONFIG_DATASET_TYPE: &str = "datatype";
const CONFIG_DATASET_DIMS: &str = "dims";
const CONFIG_DATASET_CHUNKS: &str = "chunks";
const CONFIG_FRAMES: &str = "frames";
const CONFIG_MASTER_DATASET: &str = "master";
const CONFIG_WRITE: &str = "write";

/// Pixel type of the incoming image stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    Raw8Bit,
    Raw16Bit,
    Float32,
}

impl PixelType {
    /// Wire code used in `dataset` configuration messages.
    pub fn code(self) -> i64 {
        match self {
            PixelType::Raw8Bit => 0,
            PixelType::Raw16Bit => 1,
            PixelType::Float32 => 2,
        }
    }

    pub fn from_code(code: i64) -> FwResult<PixelType> {
        match code {
            0 => Ok(PixelType::Raw8Bit),
            1 => Ok(PixelType::Raw16Bit),
            2 => Ok(PixelType::Float32),
            other => Err(FwError::ConfigRejected(format!(
                "unknown datatype code {other}"
            ))),
        }
    }

    /// On-disk element type.  `Float32` streams are stored under a 32-bit
    /// unsigned element type, preserving the format's established quirk.
    pub fn dtype(self) -> Dtype {
        match self {
            PixelType::Raw8Bit => Dtype::U8,
            PixelType::Raw16Bit => Dtype::U16,
            PixelType::Float32 => Dtype::U32,
        }
    }
}

/// One dataset to be written during a run.
#[derive(Debug, Clone)]
pub struct DatasetDefinition {
    pub name: String,
    pub pixel: PixelType,
    pub frame_dimensions: Vec<u64>,
    pub chunks: Option<Vec<u64>>,
    pub num_frames: u64,
}

impl DatasetDefinition {
    /// Initial on-disk dimensions: one frame slot ahead of the per-frame
    /// shape; the leading axis is unbounded.
    fn dataset_dims(&self) -> Vec<u64> {
        let mut dims = Vec::with_capacity(1 + self.frame_dimensions.len());
        dims.push(1);
        dims.extend_from_slice(&self.frame_dimensions);
        dims
    }

    /// Chunk shape; an omitted or mis-sized chunk spec falls back to one
    /// full frame per chunk.
    fn chunk_dims(&self) -> Vec<u64> {
        match &self.chunks {
            Some(chunks) if chunks.len() == self.frame_dimensions.len() + 1 => chunks.clone(),
            _ => self.dataset_dims(),
        }
    }
}

// Runtime counterpart of a definition once the container is open.
struct OpenDataset {
    dims: Vec<u64>,
    // Reserved write cursors; only the length is meaningful today.
    #[allow(dead_code)]
    offsets: Vec<u64>,
}

struct WriterState {
    name: String,
    writing: bool,
    master_dataset: String,
    frames_to_write: u64,
    frames_written: u64,
    file_path: String,
    file_name: String,
    processes: usize,
    rank: usize,
    start_frame_offset: u64,
    definitions: BTreeMap<String, DatasetDefinition>,
    opens: BTreeMap<String, OpenDataset>,
    file: Option<ChunkFile>,
}

impl Default for WriterState {
    fn default() -> Self {
        WriterState {
            name: "filewriter".into(),
            writing: false,
            master_dataset: String::new(),
            frames_to_write: 3,
            frames_written: 0,
            file_path: "./".into(),
            file_name: "capture.fwf".into(),
            processes: 1,
            rank: 0,
            start_frame_offset: 0,
            definitions: BTreeMap::new(),
            opens: BTreeMap::new(),
            file: None,
        }
    }
}

// Storage diagnostics collected for the engine's lifetime.
#[derive(Default)]
struct ErrorLog {
    flag: AtomicBool,
    entries: Mutex<Vec<String>>,
}

impl ErrorLog {
    fn record(&self, entry: String) {
        warn!("storage error: {entry}");
        self.flag.store(true, Ordering::SeqCst);
        self.entries.lock().push(entry);
    }

    fn check(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn read(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    fn clear(&self) {
        self.entries.lock().clear();
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// The file-writing stage.
#[derive(Default)]
pub struct FileWriterPlugin {
    state: Mutex<WriterState>,
    errors: ErrorLog,
}

impl FileWriterPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the frame number that becomes on-disk row 0 for this run.
    pub fn set_start_frame_offset(&self, frame_no: u64) {
        self.state.lock().start_frame_offset = frame_no;
    }

    /// Translate a hardware frame number to this rank's dataset row.
    pub fn frame_offset(&self, frame_no: u64) -> FwResult<u64> {
        dataset_offset(&self.state.lock(), frame_no)
    }

    pub fn is_writing(&self) -> bool {
        self.state.lock().writing
    }

    pub fn frames_written(&self) -> u64 {
        self.state.lock().frames_written
    }

    /// Open the container and every defined dataset.  Idempotent.
    pub fn start_writing(&self) -> FwResult<()> {
        do_start(&mut self.state.lock(), &self.errors)
    }

    /// Close the container.  Idempotent.
    pub fn stop_writing(&self) {
        do_stop(&mut self.state.lock(), &self.errors)
    }

    /// True when any storage operation has failed since the last clear.
    pub fn check_errors(&self) -> bool {
        self.errors.check()
    }

    /// The collected storage diagnostics.
    pub fn read_errors(&self) -> Vec<String> {
        self.errors.read()
    }

    pub fn clear_errors(&self) {
        self.errors.clear()
    }
}

impl FramePlugin for FileWriterPlugin {
    fn set_name(&self, name: &str) {
        self.state.lock().name = name.to_owned();
    }

    fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    fn configure(&self, config: &IpcMessage, reply: &mut IpcMessage) -> FwResult<()> {
        let mut state = self.state.lock();
        debug!(config = %config.encode(), "writer configure");

        if let Some(sub) = config.get_subtree(CONFIG_PROCESS) {
            configure_process(&mut state, sub)?;
        }
        if let Some(sub) = config.get_subtree(CONFIG_FILE) {
            configure_file(&mut state, sub)?;
        }
        if let Some(sub) = config.get_subtree(CONFIG_DATASET) {
            configure_dataset(&mut state, sub)?;
        }
        if config.has_param(CONFIG_FRAMES) {
            state.frames_to_write = config.get_param(CONFIG_FRAMES)?;
        }
        if config.has_param(CONFIG_MASTER_DATASET) {
            state.master_dataset = config.get_param(CONFIG_MASTER_DATASET)?;
        }
        // Start/stop is always processed last so one message can fully
        // describe a run and launch it.
        if config.has_param(CONFIG_WRITE) {
            if config.get_param(CONFIG_WRITE)? {
                if let Err(e) = do_start(&mut state, &self.errors) {
                    reply.set_param("error", e.to_string());
                    reply.set_nack();
                    return Err(e);
                }
            } else {
                do_stop(&mut state, &self.errors);
            }
        }
        Ok(())
    }

    fn status(&self, reply: &mut IpcMessage) {
        let state = self.state.lock();
        let n = &state.name;
        reply.set_param(&format!("{n}/writing"), state.writing);
        reply.set_param(&format!("{n}/frames_max"), state.frames_to_write);
        reply.set_param(&format!("{n}/frames_written"), state.frames_written);
        reply.set_param(&format!("{n}/file_path"), state.file_path.clone());
        reply.set_param(&format!("{n}/file_name"), state.file_name.clone());
        reply.set_param(&format!("{n}/processes"), state.processes as u64);
        reply.set_param(&format!("{n}/rank"), state.rank as u64);
        for (name, def) in &state.definitions {
            reply.set_param(&format!("{n}/datasets/{name}/type"), def.pixel.code());
            for dim in &def.frame_dimensions {
                reply.set_param(&format!("{n}/datasets/{name}/dimensions[]"), *dim);
            }
            if let Some(chunks) = &def.chunks {
                for chunk in chunks {
                    reply.set_param(&format!("{n}/datasets/{name}/chunks[]"), *chunk);
                }
            }
        }
    }

    fn process_frame(&self, frame: &Arc<Frame>) {
        let mut state = self.state.lock();
        if !state.writing {
            trace!(
                frame = frame.frame_number(),
                dataset = frame.dataset_name(),
                "not writing, frame dropped"
            );
            return;
        }
        match write_frame(&mut state, &self.errors, frame) {
            Ok(()) => {
                // Auxiliary datasets stream at their own cadence; only the
                // master (or everything, when no master is set) drives the
                // frame budget.
                if state.master_dataset.is_empty()
                    || state.master_dataset == frame.dataset_name()
                {
                    state.frames_written += 1;
                }
                if state.frames_written == state.frames_to_write {
                    info!(
                        frames = state.frames_written,
                        "frame budget reached, closing"
                    );
                    do_stop(&mut state, &self.errors);
                }
            }
            Err(e) => {
                warn!(
                    frame = frame.frame_number(),
                    dataset = frame.dataset_name(),
                    "frame not written: {e}"
                );
            }
        }
    }
}

fn configure_process(state: &mut WriterState, sub: &serde_json::Value) -> FwResult<()> {
    if state.writing {
        return Err(FwError::ConfigRejected(
            "cannot change processes or rank while writing".into(),
        ));
    }
    let sub = IpcMessage::from_subtree(crate::ipc::MsgVal::Configure, sub);
    let number = if sub.has_param(CONFIG_PROCESS_NUMBER) {
        sub.get_param::<usize>(CONFIG_PROCESS_NUMBER)?
    } else {
        state.processes
    };
    let rank = if sub.has_param(CONFIG_PROCESS_RANK) {
        sub.get_param::<usize>(CONFIG_PROCESS_RANK)?
    } else {
        state.rank
    };
    if number < 1 || rank >= number {
        return Err(FwError::ConfigRejected(format!(
            "invalid stripe: rank {rank} of {number}"
        )));
    }
    state.processes = number;
    state.rank = rank;
    debug!(processes = number, rank, "stripe configured");
    Ok(())
}

fn configure_file(state: &mut WriterState, sub: &serde_json::Value) -> FwResult<()> {
    if state.writing {
        return Err(FwError::ConfigRejected(
            "cannot change file path or name while writing".into(),
        ));
    }
    let sub = IpcMessage::from_subtree(crate::ipc::MsgVal::Configure, sub);
    if sub.has_param(CONFIG_FILE_PATH) {
        state.file_path = sub.get_param(CONFIG_FILE_PATH)?;
    }
    if sub.has_param(CONFIG_FILE_NAME) {
        state.file_name = sub.get_param(CONFIG_FILE_NAME)?;
    }
    debug!(path = %state.file_path, name = %state.file_name, "output configured");
    Ok(())
}

fn configure_dataset(state: &mut WriterState, sub: &serde_json::Value) -> FwResult<()> {
    if state.writing {
        return Err(FwError::ConfigRejected(
            "cannot update datasets while writing".into(),
        ));
    }
    let sub = IpcMessage::from_subtree(crate::ipc::MsgVal::Configure, sub);
    // Only the create command exists today; anything else is ignored.
    if !sub.has_param(CONFIG_DATASET_CMD)
        || sub.get_param::<String>(CONFIG_DATASET_CMD)? != "create"
    {
        return Ok(());
    }
    let name: String = sub.get_param(CONFIG_DATASET_NAME)?;
    let pixel = PixelType::from_code(sub.get_param(CONFIG_DATASET_TYPE)?)?;
    let frame_dimensions: Vec<u64> = sub.get_param(CONFIG_DATASET_DIMS)?;
    let chunks: Option<Vec<u64>> = if sub.has_param(CONFIG_DATASET_CHUNKS) {
        Some(sub.get_param(CONFIG_DATASET_CHUNKS)?)
    } else {
        None
    };
    debug!(dataset = %name, dims = ?frame_dimensions, "dataset defined");
    state.definitions.insert(
        name.clone(),
        DatasetDefinition {
            name,
            pixel,
            frame_dimensions,
            chunks,
            num_frames: 0,
        },
    );
    Ok(())
}

fn do_start(state: &mut WriterState, errors: &ErrorLog) -> FwResult<()> {
    if state.writing {
        return Ok(());
    }
    let path = format!("{}{}", state.file_path, state.file_name);
    info!(path = %path, "starting run");
    let mut file = match ChunkFile::create(&path) {
        Ok(file) => file,
        Err(e) => {
            errors.record(format!("create {path}: {e}"));
            return Err(e.into());
        }
    };

    let frames = state.frames_to_write;
    let mut opens = BTreeMap::new();
    for def in state.definitions.values_mut() {
        def.num_frames = frames;
        let spec = DatasetSpec {
            name: def.name.clone(),
            dtype: def.pixel.dtype(),
            dims: def.dataset_dims(),
            chunk: def.chunk_dims(),
        };
        if let Err(e) = file.create_dataset(&spec) {
            errors.record(format!("create dataset {}: {e}", def.name));
            // Partial state unwinds here: the container handle drops
            // unclosed and no open datasets are recorded.
            return Err(e.into());
        }
        opens.insert(
            def.name.clone(),
            OpenDataset {
                offsets: vec![0; spec.dims.len()],
                dims: spec.dims,
            },
        );
    }

    state.frames_written = 0;
    state.opens = opens;
    state.file = Some(file);
    state.writing = true;
    Ok(())
}

fn do_stop(state: &mut WriterState, errors: &ErrorLog) {
    if !state.writing {
        return;
    }
    state.writing = false;
    state.opens.clear();
    if let Some(file) = state.file.take() {
        info!(path = %file.path().display(), frames = state.frames_written, "run closed");
        if let Err(e) = file.close() {
            errors.record(format!("close: {e}"));
        }
    }
}

// Frame-number to dataset-row translation; see the striping notes in the
// module docs.
fn dataset_offset(state: &WriterState, frame_no: u64) -> FwResult<u64> {
    let start = state.start_frame_offset;
    if frame_no < start || frame_no == 0 {
        return Err(FwError::OutOfOrder {
            frame: frame_no,
            start,
        });
    }
    let raw = if start == 0 {
        frame_no - 1
    } else {
        frame_no - start
    };
    if state.processes > 1 {
        if (frame_no - 1) % state.processes as u64 != state.rank as u64 {
            return Err(FwError::WrongRank {
                frame: frame_no,
                rank: state.rank,
                processes: state.processes,
            });
        }
        Ok(raw / state.processes as u64)
    } else {
        Ok(raw)
    }
}

fn write_frame(state: &mut WriterState, errors: &ErrorLog, frame: &Frame) -> FwResult<()> {
    let name = frame.dataset_name().to_owned();
    if !state.opens.contains_key(&name) {
        return Err(FwError::UnknownDataset(name));
    }
    let offset = dataset_offset(state, frame.frame_number())?;

    let WriterState { file, opens, .. } = state;
    let Some(open) = opens.get_mut(&name) else {
        return Err(FwError::UnknownDataset(name));
    };
    let Some(file) = file.as_mut() else {
        // `writing` implies an open container; a missing handle is a bug
        // surfaced as storage corruption rather than a panic.
        return Err(FwError::Storage(crate::error::StoreError::Corrupt(
            "no open container".into(),
        )));
    };

    if offset + 1 > open.dims[0] {
        open.dims[0] = offset + 1;
        if let Err(e) = file.set_extent(&name, &open.dims) {
            errors.record(format!("extend {name} to {}: {e}", offset + 1));
            return Err(e.into());
        }
    }

    trace!(
        frame = frame.frame_number(),
        row = offset,
        dataset = %name,
        "writing frame"
    );

    if frame.has_parameter("subframe_count") {
        write_subframes(file, errors, &name, offset, frame)
    } else {
        let mut coord = vec![0u64; open.dims.len()];
        coord[0] = offset;
        file.write_chunk(&name, &coord, frame.data(), 0).map_err(|e| {
            errors.record(format!("chunk write {name} row {offset}: {e}"));
            e.into()
        })
    }
}

// Horizontal readout stripes packed into one payload: one direct chunk
// write per stripe, stepping the third axis by the stripe width.
fn write_subframes(
    file: &mut ChunkFile,
    errors: &ErrorLog,
    name: &str,
    offset: u64,
    frame: &Frame,
) -> FwResult<()> {
    let count = frame.get_parameter("subframe_count")?;
    let size = frame.get_parameter("subframe_size")? as usize;
    let subframe_dims = frame.get_dimensions("subframe")?;
    let width = *subframe_dims
        .get(1)
        .ok_or_else(|| FwError::UnknownLabel("subframe".into()))?;
    if count as usize * size > frame.data_size() {
        return Err(FwError::ConfigRejected(format!(
            "subframe geometry {count}x{size} exceeds {}-byte payload",
            frame.data_size()
        )));
    }
    for i in 0..count {
        let coord = vec![offset, 0, i * width];
        let payload = &frame.data()[i as usize * size..(i as usize + 1) * size];
        file.write_chunk(name, &coord, payload, 0).map_err(|e| {
            errors.record(format!("subframe write {name} row {offset} stripe {i}: {e}"));
            FwError::from(e)
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(processes: usize, rank: usize, start: u64) -> WriterState {
        WriterState {
            processes,
            rank,
            start_frame_offset: start,
            ..WriterState::default()
        }
    }

    #[test]
    fn single_rank_offsets_are_zero_based() {
        let s = state(1, 0, 0);
        assert_eq!(dataset_offset(&s, 1).unwrap(), 0);
        assert_eq!(dataset_offset(&s, 2).unwrap(), 1);
        assert_eq!(dataset_offset(&s, 10).unwrap(), 9);
    }

    #[test]
    fn frame_zero_is_out_of_order() {
        let s = state(1, 0, 0);
        assert!(matches!(
            dataset_offset(&s, 0),
            Err(FwError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn latched_start_becomes_row_zero() {
        let s = state(1, 0, 1000);
        assert!(matches!(
            dataset_offset(&s, 999),
            Err(FwError::OutOfOrder { frame: 999, .. })
        ));
        assert_eq!(dataset_offset(&s, 1000).unwrap(), 0);
        assert_eq!(dataset_offset(&s, 1001).unwrap(), 1);
    }

    #[test]
    fn striping_accepts_own_residue_class_only() {
        let s = state(2, 0, 0);
        assert_eq!(dataset_offset(&s, 1).unwrap(), 0);
        assert!(matches!(
            dataset_offset(&s, 2),
            Err(FwError::WrongRank { frame: 2, .. })
        ));
        assert_eq!(dataset_offset(&s, 3).unwrap(), 1);
        assert!(matches!(dataset_offset(&s, 4), Err(FwError::WrongRank { .. })));

        let s = state(2, 1, 0);
        assert!(matches!(dataset_offset(&s, 1), Err(FwError::WrongRank { .. })));
        assert_eq!(dataset_offset(&s, 2).unwrap(), 0);
        assert_eq!(dataset_offset(&s, 4).unwrap(), 1);
    }

    #[test]
    fn unknown_datatype_code_is_rejected() {
        assert!(matches!(
            PixelType::from_code(7),
            Err(FwError::ConfigRejected(_))
        ));
    }

    #[test]
    fn chunk_default_is_one_full_frame() {
        let def = DatasetDefinition {
            name: "d".into(),
            pixel: PixelType::Raw8Bit,
            frame_dimensions: vec![4, 4],
            chunks: Some(vec![4, 4]), // mis-sized: rank must be 3
            num_frames: 0,
        };
        assert_eq!(def.chunk_dims(), vec![1, 4, 4]);
        assert_eq!(def.dataset_dims(), vec![1, 4, 4]);
    }
}
