//! Segmented RTSP-to-MP4 recording engine: one long-lived worker per stream
//! copies packets from a persistent RTSP connection into a rolling series of
//! fixed-duration MP4 files, surviving network loss and reconfiguration.

pub mod catalog;
pub mod clock;
pub mod control;
pub mod error;
pub mod rebase;
pub mod segment;
pub mod session;
pub mod shutdown;

pub use catalog::{MemoryCatalog, RecordingCatalog, RecordingMeta, StreamConfig};
pub use clock::{Clock, FakeClock, SystemClock};
pub use control::{Writer, WriterOptions, is_recording, start_recording, stop_recording};
pub use error::{RecordError, Result};
pub use segment::{
    FfmpegSegmentRecorder, InputSlot, SegmentInfo, SegmentRecorder, SegmentRequest,
    record_segment,
};
pub use session::SessionEnv;
pub use shutdown::{
    ComponentId, ComponentKind, ComponentState, ShutdownCoordinator, SignalShutdown,
    WRITER_PRIORITY,
};
