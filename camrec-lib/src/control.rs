//! Public control surface: create a [`Writer`], start and stop its recording
//! worker, query its status.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crate::error::{RecordError, Result};
use crate::session::{self, SessionEnv};
use crate::shutdown::{
    ComponentKind, ComponentState, ShutdownCoordinator, WRITER_PRIORITY,
};

/// Options for creating a [`Writer`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub stream_name: String,
    /// Directory segment files are created in.
    pub output_dir: PathBuf,
    /// Segment length in seconds. `None` uses the 30 s default; `Some(0)`
    /// records a single unbounded file.
    pub segment_duration: Option<u32>,
    pub record_audio: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            stream_name: "camera".to_string(),
            output_dir: PathBuf::from("."),
            segment_duration: None,
            record_audio: false,
        }
    }
}

/// Session state shared between the caller and the recording worker. While
/// the worker runs it owns every field except the two stop flags.
pub(crate) struct WriterState {
    pub(crate) stream_name: String,
    pub(crate) output_dir: PathBuf,
    pub(crate) output_path: PathBuf,
    pub(crate) segment_duration: u32,
    pub(crate) record_audio: bool,
    pub(crate) last_rotation_time: SystemTime,
    pub(crate) last_packet_time: SystemTime,
    pub(crate) current_recording_id: u64,
    pub(crate) rotating: bool,
    pub(crate) shutdown_component_id: Option<crate::shutdown::ComponentId>,
}

pub(crate) struct Worker {
    handle: JoinHandle<()>,
    done: mpsc::Receiver<()>,
    shutdown: Arc<dyn ShutdownCoordinator>,
}

/// One recorded stream. Held behind an `Arc` so the worker and the caller
/// share it without a raw back-reference; stopping never races a destructor.
pub struct Writer {
    pub(crate) running: AtomicBool,
    pub(crate) shutdown_requested: AtomicBool,
    pub(crate) state: Mutex<WriterState>,
    pub(crate) worker: Mutex<Option<Worker>>,
}

impl Writer {
    pub fn new(options: WriterOptions, now: SystemTime) -> Arc<Writer> {
        let segment_duration = options
            .segment_duration
            .unwrap_or(session::DEFAULT_SEGMENT_DURATION);
        let output_path = options.output_dir.join(session::segment_filename(now));
        Arc::new(Writer {
            running: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            state: Mutex::new(WriterState {
                stream_name: options.stream_name,
                output_dir: options.output_dir,
                output_path,
                segment_duration,
                record_audio: options.record_audio,
                last_rotation_time: now,
                last_packet_time: now,
                current_recording_id: 0,
                rotating: false,
                shutdown_component_id: None,
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn stream_name(&self) -> String {
        self.state.lock().unwrap().stream_name.clone()
    }

    /// Path of the file the current segment writes into.
    pub fn output_path(&self) -> PathBuf {
        self.state.lock().unwrap().output_path.clone()
    }

    /// Last time the worker completed a segment attempt; activity signal for
    /// external health checks.
    pub fn last_packet_time(&self) -> SystemTime {
        self.state.lock().unwrap().last_packet_time
    }

    /// Effective segment duration in seconds (0 = unbounded).
    pub fn segment_duration(&self) -> u32 {
        self.state.lock().unwrap().segment_duration
    }

    pub fn record_audio(&self) -> bool {
        self.state.lock().unwrap().record_audio
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

/// Join timeout before a stuck worker is abandoned.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn the recording worker for `writer`. Exactly one worker may exist per
/// writer; call [`stop_recording`] before starting again.
pub fn start_recording(writer: &Arc<Writer>, url: &str, env: &SessionEnv) -> Result<()> {
    if url.is_empty() {
        return Err(RecordError::EmptyUrl);
    }
    if writer
        .state
        .lock()
        .unwrap()
        .output_dir
        .as_os_str()
        .is_empty()
    {
        return Err(RecordError::EmptyOutputDir);
    }

    let mut worker_slot = writer.worker.lock().unwrap();
    if worker_slot.is_some() {
        return Err(RecordError::AlreadyRunning(writer.stream_name()));
    }

    writer.running.store(true, Ordering::SeqCst);
    writer.shutdown_requested.store(false, Ordering::SeqCst);

    let (done_tx, done_rx) = mpsc::channel();
    let thread_writer = Arc::clone(writer);
    let thread_env = env.clone();
    let thread_url = url.to_string();
    let handle = std::thread::spawn(move || {
        session::run_session(thread_writer, thread_url, thread_env);
        let _ = done_tx.send(());
    });

    let name = writer.stream_name();
    match env
        .shutdown
        .register(&name, ComponentKind::SegmentWriter, WRITER_PRIORITY)
    {
        Some(id) => {
            log::info!("registered recording worker for {name} with shutdown coordinator");
            writer.state.lock().unwrap().shutdown_component_id = Some(id);
        }
        None => {
            log::warn!("failed to register recording worker for {name} with shutdown coordinator")
        }
    }

    *worker_slot = Some(Worker {
        handle,
        done: done_rx,
        shutdown: Arc::clone(&env.shutdown),
    });
    log::info!("started recording worker for {name}");
    Ok(())
}

/// Signal the worker to stop and wait up to 5 s for it to exit. A worker
/// stuck inside the media layer is detached rather than killed; the shared
/// state stays alive behind the `Arc`, so nothing is leaked or freed early.
pub fn stop_recording(writer: &Arc<Writer>) {
    let name = writer.stream_name();
    let Some(worker) = writer.worker.lock().unwrap().take() else {
        log::warn!("no recording worker to stop for {name}");
        return;
    };

    log::info!("signaling recording worker for {name} to stop");
    writer.running.store(false, Ordering::SeqCst);
    writer.shutdown_requested.store(true, Ordering::SeqCst);

    match worker.done.recv_timeout(STOP_JOIN_TIMEOUT) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if worker.handle.join().is_err() {
                log::error!("recording worker for {name} panicked");
            } else {
                log::info!("joined recording worker for {name}");
            }
        }
        Err(RecvTimeoutError::Timeout) => {
            log::warn!(
                "recording worker for {name} did not stop within {}s, detaching it",
                STOP_JOIN_TIMEOUT.as_secs()
            );
            drop(worker.handle);
        }
    }

    if let Some(id) = writer.state.lock().unwrap().shutdown_component_id {
        worker.shutdown.update_state(id, ComponentState::Stopped);
        log::info!("recording worker for {name} reported STOPPED");
    }
}

/// True while the writer is rotating segments or its worker is running.
pub fn is_recording(writer: &Writer) -> bool {
    if writer.state.lock().unwrap().rotating {
        return true;
    }
    writer.worker.lock().unwrap().is_some() && writer.running.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::clock::SystemClock;
    use crate::segment::{InputSlot, SegmentInfo, SegmentRecorder, SegmentRequest};
    use crate::shutdown::SignalShutdown;

    struct NoopRecorder;

    impl SegmentRecorder for NoopRecorder {
        fn record(
            &self,
            _request: &SegmentRequest<'_>,
            _slot: &mut InputSlot,
            _info: &mut SegmentInfo,
        ) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn test_env() -> SessionEnv {
        SessionEnv {
            catalog: Arc::new(MemoryCatalog::new()),
            shutdown: Arc::new(SignalShutdown::new()),
            clock: Arc::new(SystemClock),
            recorder: Arc::new(NoopRecorder),
        }
    }

    #[test]
    fn start_rejects_empty_url() {
        let writer = Writer::new(WriterOptions::default(), SystemTime::now());
        let env = test_env();
        assert!(matches!(
            start_recording(&writer, "", &env),
            Err(RecordError::EmptyUrl)
        ));
        assert!(!is_recording(&writer));
    }

    #[test]
    fn start_rejects_empty_output_dir() {
        let options = WriterOptions {
            output_dir: PathBuf::new(),
            ..WriterOptions::default()
        };
        let writer = Writer::new(options, SystemTime::now());
        let env = test_env();
        assert!(matches!(
            start_recording(&writer, "rtsp://cam/1", &env),
            Err(RecordError::EmptyOutputDir)
        ));
    }

    #[test]
    fn stop_without_worker_is_a_noop() {
        let writer = Writer::new(WriterOptions::default(), SystemTime::now());
        stop_recording(&writer);
        assert!(!is_recording(&writer));
    }
}
