//! The long-lived per-stream supervisor: loops producing segments over one
//! persistent input connection, rotating output files and keeping the
//! recordings catalog current.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};

use crate::catalog::{RecordingCatalog, RecordingMeta};
use crate::clock::Clock;
use crate::control::Writer;
use crate::segment::{InputSlot, SegmentInfo, SegmentRecorder, SegmentRequest};
use crate::shutdown::ShutdownCoordinator;

/// Collaborators a recording session runs against. Production wiring uses
/// `FfmpegSegmentRecorder` and `SystemClock`; tests substitute both.
#[derive(Clone)]
pub struct SessionEnv {
    pub catalog: Arc<dyn RecordingCatalog>,
    pub shutdown: Arc<dyn ShutdownCoordinator>,
    pub clock: Arc<dyn Clock>,
    pub recorder: Arc<dyn SegmentRecorder>,
}

/// Segment length used when neither the catalog nor the caller configured
/// one.
pub(crate) const DEFAULT_SEGMENT_DURATION: u32 = 30;

/// Consecutive failures after which the input connection is forcibly
/// recreated.
const MAX_RETRIES_BEFORE_RECONNECT: u32 = 5;

/// Flat backoff once the forced-reconnect path kicks in.
const RECONNECT_BACKOFF_SECS: u64 = 5;

/// `recording_<YYYYMMDD_HHMMSS>.mp4`, in local time.
pub(crate) fn segment_filename(now: SystemTime) -> String {
    let local: DateTime<Local> = now.into();
    format!("recording_{}.mp4", local.format("%Y%m%d_%H%M%S"))
}

/// Backoff after a failed segment: 1, 2, 4, 8, 16, 16, ... seconds, never
/// more than 30.
pub(crate) fn backoff_seconds(retries: u32) -> u64 {
    (1u64 << retries.min(4)).min(30)
}

fn file_size(path: &Path) -> Option<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Some(meta.len()),
        Err(e) => {
            log::warn!("failed to stat {}: {e}", path.display());
            None
        }
    }
}

fn refresh_config(writer: &Writer, stream_name: &str, env: &SessionEnv) {
    let Some(config) = env.catalog.stream_config(stream_name) else {
        return;
    };
    let mut state = writer.state.lock().unwrap();
    if state.segment_duration != config.segment_duration {
        log::info!(
            "updating segment duration for stream {stream_name} from {} to {} seconds",
            state.segment_duration,
            config.segment_duration
        );
        state.segment_duration = config.segment_duration;
    }
    if state.record_audio != config.record_audio {
        log::info!(
            "updating audio recording for stream {stream_name}: now {}",
            if config.record_audio { "enabled" } else { "disabled" }
        );
        state.record_audio = config.record_audio;
    }
}

/// Rotate to a fresh output file when the current one has been open for a
/// full segment duration. The new catalog record is published before the old
/// one is finalized, so an `is_complete = false` record always means "in
/// progress or crashed".
fn maybe_rotate(writer: &Writer, stream_name: &str, env: &SessionEnv, now: SystemTime) {
    let (segment_duration, last_rotation, output_dir, current_path, current_id) = {
        let state = writer.state.lock().unwrap();
        (
            state.segment_duration,
            state.last_rotation_time,
            state.output_dir.clone(),
            state.output_path.clone(),
            state.current_recording_id,
        )
    };
    if segment_duration == 0 {
        return;
    }
    let elapsed = now
        .duration_since(last_rotation)
        .unwrap_or_default()
        .as_secs();
    if elapsed < u64::from(segment_duration) {
        return;
    }

    log::info!(
        "rotating segment for stream {stream_name} (elapsed {elapsed}s, segment duration {segment_duration}s)"
    );
    writer.state.lock().unwrap().rotating = true;

    let new_path = output_dir.join(segment_filename(now));
    let new_id = env.catalog.add(&RecordingMeta {
        stream_name: stream_name.to_string(),
        file_path: new_path.clone(),
        start_time: now,
        end_time: None,
        size_bytes: 0,
        is_complete: false,
    });
    if new_id == 0 {
        log::error!("failed to add recording record for stream {stream_name} during rotation");
    } else {
        log::info!("added recording {new_id} for rotated file {}", new_path.display());
    }

    if current_id > 0 {
        let size = file_size(&current_path).unwrap_or(0);
        env.catalog.update(current_id, Some(now), size, true);
        log::info!(
            "marked recording {current_id} complete for stream {stream_name} ({size} bytes)"
        );
    }

    let mut state = writer.state.lock().unwrap();
    state.output_path = new_path;
    if new_id > 0 {
        state.current_recording_id = new_id;
    }
    state.last_rotation_time = now;
    state.rotating = false;
}

/// Body of the recording worker thread.
pub(crate) fn run_session(writer: Arc<Writer>, url: String, env: SessionEnv) {
    // Local copy: the parent may be mutated while the worker runs.
    let stream_name = writer.state.lock().unwrap().stream_name.clone();
    log::info!("starting recording session for stream {stream_name}");

    {
        let now = env.clock.now();
        let path = writer.state.lock().unwrap().output_path.clone();
        let id = env.catalog.add(&RecordingMeta {
            stream_name: stream_name.clone(),
            file_path: path.clone(),
            start_time: now,
            end_time: None,
            size_bytes: 0,
            is_complete: false,
        });
        if id == 0 {
            log::error!("failed to add initial recording record for stream {stream_name}");
        } else {
            log::info!("added initial recording {id} for file {}", path.display());
            writer.state.lock().unwrap().current_recording_id = id;
        }
    }

    // The caller may have stopped us during initialization.
    if !writer.is_running() || writer.is_shutdown_requested() {
        log::info!("recording session for {stream_name} exiting early due to shutdown");
        return;
    }

    let mut slot: InputSlot = None;
    let mut segment_info = SegmentInfo::default();
    // Worker-local on purpose: one stream's failures must not stretch another
    // stream's backoff.
    let mut retries: u32 = 0;

    while writer.is_running() && !writer.is_shutdown_requested() {
        if env.shutdown.is_shutdown_initiated() {
            log::info!("recording session for {stream_name} stopping due to system shutdown");
            writer.set_running(false);
            break;
        }

        let now = env.clock.now();
        refresh_config(&writer, &stream_name, &env);
        maybe_rotate(&writer, &stream_name, &env, now);

        let (output_path, record_audio, segment_duration) = {
            let state = writer.state.lock().unwrap();
            (
                state.output_path.clone(),
                state.record_audio,
                state.segment_duration,
            )
        };

        log::info!(
            "recording segment for stream {stream_name} to {}",
            output_path.display()
        );
        let request = SegmentRequest {
            url: &url,
            output_path: &output_path,
            duration: segment_duration,
            record_audio,
        };
        match env.recorder.record(&request, &mut slot, &mut segment_info) {
            Ok(()) => {
                if retries > 0 {
                    log::info!(
                        "successfully recorded segment for {stream_name} after {retries} retries"
                    );
                    retries = 0;
                }
            }
            Err(e) => {
                log::error!("failed to record segment for stream {stream_name}: {e}");
                if slot.is_none() {
                    log::warn!("input connection was closed, will reopen on next attempt");
                }
                let mut backoff = backoff_seconds(retries);
                retries += 1;
                if retries > MAX_RETRIES_BEFORE_RECONNECT {
                    log::warn!(
                        "{retries} consecutive segment failures for {stream_name}, attempting aggressive recovery"
                    );
                    if slot.take().is_some() {
                        log::info!("forcibly closed input connection to ensure a fresh one");
                    }
                    backoff = RECONNECT_BACKOFF_SECS;
                }
                log::info!(
                    "waiting {backoff} seconds before retrying segment recording for {stream_name} (retry #{retries})"
                );
                env.clock.sleep(Duration::from_secs(backoff));
            }
        }

        let now = env.clock.now();
        let (current_id, current_path) = {
            let mut state = writer.state.lock().unwrap();
            state.last_packet_time = now;
            (state.current_recording_id, state.output_path.clone())
        };
        if current_id > 0 {
            if let Some(size) = file_size(&current_path) {
                env.catalog.update(current_id, None, size, false);
                log::debug!("updated recording {current_id} size to {size} bytes");
            }
        }
    }

    // Finalize the open record so a graceful stop leaves no dangling
    // in-progress entry for this session.
    let now = env.clock.now();
    let (current_id, current_path) = {
        let state = writer.state.lock().unwrap();
        (state.current_recording_id, state.output_path.clone())
    };
    if current_id > 0 {
        let size = file_size(&current_path).unwrap_or(0);
        env.catalog.update(current_id, Some(now), size, true);
        log::info!("finalized recording {current_id} ({size} bytes)");
    }

    if slot.take().is_some() {
        log::debug!("closed input connection for stream {stream_name}");
    }
    log::info!("recording session for stream {stream_name} exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_plateaus() {
        let seq: Vec<u64> = (0..7).map(backoff_seconds).collect();
        assert_eq!(seq, vec![1, 2, 4, 8, 16, 16, 16]);
    }

    #[test]
    fn segment_filename_shape() {
        let name = segment_filename(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        assert!(name.starts_with("recording_"));
        assert!(name.ends_with(".mp4"));
        // recording_YYYYMMDD_HHMMSS.mp4
        assert_eq!(name.len(), "recording_".len() + 15 + ".mp4".len());
        let stamp = &name["recording_".len()..name.len() - ".mp4".len()];
        assert!(stamp[..8].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(&stamp[8..9], "_");
        assert!(stamp[9..].chars().all(|c| c.is_ascii_digit()));
    }
}
