//! External transcoder management
//!
//! Everything that touches the ffmpeg subprocess lives here: the process
//! supervisor, the fragmented-media segmenter over its stdout, the recording
//! pipeline variant, and one-shot invocations for snapshots.

pub mod exec;
pub mod process;
pub mod recording;
pub mod segmenter;

pub use exec::FfmpegExec;
pub use process::{
    ExitClassifier, ExitDisposition, ExitStatusInfo, FfmpegProcess, ProcessCallbacks,
    ProcessOptions,
};
pub use recording::{FfmpegRecordingProcess, RecordingProcessOptions};
pub use segmenter::{spawn_segment_pump, Fmp4Parser, MediaBox, SegmentAssembler};
