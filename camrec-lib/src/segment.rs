//! One-shot segment recording: pull packets from a (possibly pre-opened)
//! RTSP input and copy them into a single MP4 file, ending on a keyframe
//! boundary where possible.

extern crate ffmpeg_next as ffmpeg;
extern crate ffmpeg_sys_next as ffi;

use std::path::Path;
use std::sync::Arc;
use std::sync::Once;
use std::time::{Duration, Instant};

use ffmpeg::{Dictionary, Packet, Rational, Rescale, codec, encoder, format, media};

use crate::error::{RecordError, Result};
use crate::rebase::TimestampRebase;
use crate::shutdown::ShutdownCoordinator;

/// Persistent input connection, reused across segments to avoid reconnect
/// gaps. The session supervisor owns the slot; the recorder only borrows it,
/// populating it on first use.
pub type InputSlot = Option<format::context::Input>;

/// State carried from one segment to its successor within a session.
#[derive(Debug, Default, Clone)]
pub struct SegmentInfo {
    /// 0-based index of the next segment to record.
    pub index: u32,
    pub has_audio: bool,
    /// Whether the previous segment's final video frame was a keyframe. When
    /// true, the next segment starts on the very next frame instead of
    /// discarding up to the next keyframe.
    pub last_frame_was_key: bool,
}

/// Inputs for one `record_segment` invocation.
pub struct SegmentRequest<'a> {
    pub url: &'a str,
    pub output_path: &'a Path,
    /// Target duration in seconds; 0 records until EOF or shutdown.
    pub duration: u32,
    pub record_audio: bool,
}

/// Seam between the session supervisor and the actual recording, so the
/// supervisor loop can be exercised in tests without a network.
pub trait SegmentRecorder: Send + Sync {
    fn record(
        &self,
        request: &SegmentRequest<'_>,
        slot: &mut InputSlot,
        info: &mut SegmentInfo,
    ) -> Result<()>;
}

/// Production recorder backed by FFmpeg.
pub struct FfmpegSegmentRecorder {
    shutdown: Arc<dyn ShutdownCoordinator>,
}

impl FfmpegSegmentRecorder {
    pub fn new(shutdown: Arc<dyn ShutdownCoordinator>) -> Self {
        FfmpegSegmentRecorder { shutdown }
    }
}

impl SegmentRecorder for FfmpegSegmentRecorder {
    fn record(
        &self,
        request: &SegmentRequest<'_>,
        slot: &mut InputSlot,
        info: &mut SegmentInfo,
    ) -> Result<()> {
        record_segment(request, slot, info, self.shutdown.as_ref())
    }
}

/// How long to keep copying while waiting for a closing keyframe.
const FINAL_KEYFRAME_WAIT: Duration = Duration::from_secs(2);

/// Sleep between reads when the source reports try-again.
const READ_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Progress log cadence, in packets per stream.
const PROGRESS_INTERVAL: u64 = 300;

/// Durations above this are considered bogus and clamped.
const MAX_PACKET_DURATION: i64 = 10_000_000;
const CLAMPED_PACKET_DURATION: i64 = 90_000;

static FFMPEG_INIT: Once = Once::new();

/// Custom FFmpeg log callback that routes messages through Rust's `log`
/// crate.
///
/// # Safety
/// Called by FFmpeg's internal logging system. Uses `av_log_format_line2` to
/// safely format the variadic arguments into a fixed buffer.
unsafe extern "C" fn ffmpeg_log_callback(
    ptr: *mut libc::c_void,
    level: libc::c_int,
    fmt: *const libc::c_char,
    vl: ffi::va_list,
) {
    let rust_level = match level {
        ffi::AV_LOG_PANIC | ffi::AV_LOG_FATAL | ffi::AV_LOG_ERROR => log::Level::Error,
        ffi::AV_LOG_WARNING => log::Level::Warn,
        ffi::AV_LOG_INFO => log::Level::Info,
        ffi::AV_LOG_VERBOSE => log::Level::Debug,
        ffi::AV_LOG_DEBUG | ffi::AV_LOG_TRACE => log::Level::Trace,
        _ => return,
    };

    if !log::log_enabled!(rust_level) {
        return;
    }

    let mut buf = [0u8; 1024];
    let mut print_prefix: libc::c_int = 1;
    let written = unsafe {
        ffi::av_log_format_line2(
            ptr,
            level,
            fmt,
            vl,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len() as libc::c_int,
            &mut print_prefix,
        )
    };
    if written < 0 {
        return;
    }

    let len = (written as usize).min(buf.len() - 1);
    let msg = std::str::from_utf8(&buf[..len])
        .unwrap_or_default()
        .trim_end();
    if msg.is_empty() {
        return;
    }

    log::log!(target: "ffmpeg", rust_level, "{}", msg);
}

pub(crate) fn ensure_init() {
    FFMPEG_INIT.call_once(|| {
        ffmpeg::init().expect("Failed to initialise FFmpeg");
        ffmpeg::format::network::init();
        unsafe {
            ffi::av_log_set_callback(Some(ffmpeg_log_callback));
        }
    });
}

/// Open an RTSP input with the low-latency options the engine always uses:
/// TCP transport, no buffering, 500 ms maximum internal delay, 5 s socket
/// timeout.
fn open_rtsp_input(url: &str) -> Result<format::context::Input> {
    let mut opts = Dictionary::new();
    opts.set("rtsp_transport", "tcp");
    opts.set("fflags", "nobuffer");
    opts.set("flags", "low_delay");
    opts.set("max_delay", "500000");
    opts.set("timeout", "5000000");

    format::input_with_dictionary(&url, opts).map_err(|e| {
        log::error!("failed to open input {url}: {e}");
        RecordError::OpenInput {
            url: url.to_string(),
            source: e,
        }
    })
}

struct VideoStreamInfo {
    index: usize,
    time_base: Rational,
    /// Fallback duration for packets that arrive without one, derived from
    /// the average frame rate.
    frame_duration: i64,
    parameters: codec::Parameters,
}

struct AudioStreamInfo {
    index: usize,
    time_base: Rational,
    sample_rate: i32,
    channels: i32,
    bits_per_coded_sample: i32,
    parameters: codec::Parameters,
}

fn select_video_stream(ictx: &format::context::Input) -> Result<VideoStreamInfo> {
    let stream = ictx
        .streams()
        .find(|s| s.parameters().medium() == media::Type::Video)
        .ok_or(RecordError::NoVideoStream)?;
    let time_base = stream.time_base();
    let rate = stream.avg_frame_rate();
    log::debug!(
        "found video stream {} ({:?}, {}/{} fps)",
        stream.index(),
        stream.parameters().id(),
        rate.numerator(),
        rate.denominator()
    );
    Ok(VideoStreamInfo {
        index: stream.index(),
        time_base,
        frame_duration: video_fallback_duration(rate, time_base),
        parameters: stream.parameters(),
    })
}

fn select_audio_stream(ictx: &format::context::Input) -> Option<AudioStreamInfo> {
    let stream = ictx
        .streams()
        .find(|s| s.parameters().medium() == media::Type::Audio)?;
    let parameters = stream.parameters();
    let (sample_rate, channels, bits_per_coded_sample) = unsafe {
        let par = parameters.as_ptr();
        (
            (*par).sample_rate,
            (*par).ch_layout.nb_channels,
            (*par).bits_per_coded_sample,
        )
    };
    log::debug!(
        "found audio stream {} ({:?}, {} Hz, {} channels)",
        stream.index(),
        parameters.id(),
        sample_rate,
        channels
    );
    Some(AudioStreamInfo {
        index: stream.index(),
        time_base: stream.time_base(),
        sample_rate,
        channels,
        bits_per_coded_sample,
        parameters,
    })
}

fn video_fallback_duration(avg_frame_rate: Rational, time_base: Rational) -> i64 {
    if avg_frame_rate.numerator() > 0 && avg_frame_rate.denominator() > 0 {
        1i64.rescale(avg_frame_rate.invert(), time_base).max(1)
    } else {
        1
    }
}

fn audio_packet_duration(audio: &AudioStreamInfo, packet_size: usize) -> i64 {
    if audio.sample_rate > 0 {
        let samples = audio_sample_count(
            packet_size,
            audio.channels,
            audio.bits_per_coded_sample,
        );
        samples
            .rescale(Rational::new(1, audio.sample_rate), audio.time_base)
            .max(1)
    } else {
        log::debug!("audio stream has no sample rate, defaulting packet duration to 1");
        1
    }
}

/// Samples in a packet of `size` bytes, for raw/PCM streams where that can be
/// derived. Compressed codecs do not expose a per-packet sample count; 1024
/// matches the common AAC frame size.
fn audio_sample_count(size: usize, channels: i32, bits_per_coded_sample: i32) -> i64 {
    let bytes_per_sample = bits_per_coded_sample / 8;
    if channels > 0 && bytes_per_sample > 0 {
        let samples = size as i64 / (channels as i64 * bytes_per_sample as i64);
        if samples > 0 {
            return samples;
        }
    }
    1024
}

fn clamp_duration(duration: i64) -> i64 {
    if duration > MAX_PACKET_DURATION {
        log::warn!("packet duration too large: {duration}, capping at {CLAMPED_PACKET_DURATION}");
        CLAMPED_PACKET_DURATION
    } else {
        duration
    }
}

/// Record one segment from `request.url` into `request.output_path`.
///
/// The input connection in `slot` is reused when present and opened (and
/// stored) otherwise; it is never closed here, so the caller can carry it
/// across segments and retries. `info` carries the segment index and the
/// keyframe-splice flag between invocations.
pub fn record_segment(
    request: &SegmentRequest<'_>,
    slot: &mut InputSlot,
    info: &mut SegmentInfo,
    shutdown: &dyn ShutdownCoordinator,
) -> Result<()> {
    ensure_init();

    let segment_index = info.index;
    log::info!(
        "recording segment {} from {} to {} ({}s)",
        segment_index,
        request.url,
        request.output_path.display(),
        request.duration
    );

    if slot.is_none() {
        *slot = Some(open_rtsp_input(request.url)?);
    } else {
        log::debug!("reusing existing input connection");
    }
    let ictx = slot.as_mut().expect("input slot populated above");

    let video = select_video_stream(ictx)?;
    let audio = if request.record_audio {
        select_audio_stream(ictx)
    } else {
        None
    };

    let mut octx =
        format::output(&request.output_path).map_err(|e| RecordError::CreateOutput {
            path: request.output_path.to_path_buf(),
            source: e,
        })?;

    let video_index = video.index;
    let video_tb = video.time_base;
    let video_frame_duration = video.frame_duration;
    {
        let mut ost = octx
            .add_stream(encoder::find(codec::Id::None))
            .map_err(RecordError::AddStream)?;
        ost.set_parameters(video.parameters);
        ost.set_time_base(video_tb);
    }
    let out_video_index = 0;

    let audio = audio.map(|a| {
        log::info!("including audio stream in recording");
        let mut ost = octx
            .add_stream(encoder::find(codec::Id::None))
            .map_err(RecordError::AddStream)?;
        ost.set_parameters(a.parameters.clone());
        ost.set_time_base(a.time_base);
        Ok::<_, RecordError>(a)
    });
    let audio = match audio {
        Some(result) => Some(result?),
        None => None,
    };
    let out_audio_index = 1;

    // faststart would rewrite the file after the trailer; an abrupt stop
    // during that second pass corrupts the recording. empty_moov keeps the
    // index writable in a single pass.
    let mut out_opts = Dictionary::new();
    out_opts.set("movflags", "empty_moov");
    octx.write_header_with(out_opts)
        .map_err(RecordError::WriteHeader)?;

    // The muxer may adjust stream time bases while writing the header.
    let out_video_tb = octx.stream(out_video_index).unwrap().time_base();
    let out_audio_tb = audio
        .as_ref()
        .map(|_| octx.stream(out_audio_index).unwrap().time_base());

    let mut video_rebase = TimestampRebase::video();
    let mut audio_rebase = TimestampRebase::audio();
    let mut video_packets: u64 = 0;
    let mut audio_packets: u64 = 0;
    let mut found_first_keyframe = false;
    let mut awaiting_final_keyframe = false;
    let mut shutdown_detected = false;
    // Per-invocation wait timer, armed when entering the final-keyframe wait.
    let mut final_wait_start: Option<Instant> = None;
    let mut segment_start = Instant::now();
    let mut read_error: Option<RecordError> = None;

    log::info!("recording started");

    loop {
        if !shutdown_detected && !awaiting_final_keyframe && shutdown.is_shutdown_initiated() {
            log::info!("shutdown initiated, waiting for next key frame to end segment");
            awaiting_final_keyframe = true;
            shutdown_detected = true;
            final_wait_start = Some(Instant::now());
        }

        if request.duration > 0 && !awaiting_final_keyframe && !shutdown_detected {
            let elapsed = segment_start.elapsed().as_secs();
            if elapsed >= u64::from(request.duration) {
                log::info!(
                    "reached duration limit of {} seconds, waiting for next key frame",
                    request.duration
                );
                awaiting_final_keyframe = true;
                final_wait_start = Some(Instant::now());
            } else if elapsed + 1 >= u64::from(request.duration) {
                log::info!(
                    "within 1 second of duration limit ({} seconds), waiting for next key frame",
                    request.duration
                );
                awaiting_final_keyframe = true;
                final_wait_start = Some(Instant::now());
            }
        }

        let mut packet = Packet::empty();
        match packet.read(ictx) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                log::info!("end of stream reached");
                break;
            }
            Err(ffmpeg::Error::Other { errno: libc::EAGAIN }) => {
                std::thread::sleep(READ_RETRY_SLEEP);
                continue;
            }
            Err(e) => {
                log::error!("error reading frame: {e}");
                read_error = Some(RecordError::ReadFrame(e));
                break;
            }
        }

        let stream_index = packet.stream();
        if stream_index == video_index {
            let is_key = packet.is_key();

            if !found_first_keyframe {
                if info.last_frame_was_key && segment_index > 0 {
                    log::info!("previous segment ended on a key frame, starting immediately");
                } else if is_key {
                    log::info!("found first key frame, starting recording");
                } else {
                    continue;
                }
                found_first_keyframe = true;
                segment_start = Instant::now();
            }

            let mut is_final = false;
            if awaiting_final_keyframe {
                let waited = final_wait_start.get_or_insert_with(Instant::now).elapsed();
                if is_key {
                    log::info!("found final key frame, ending segment");
                    info.last_frame_was_key = true;
                    is_final = true;
                } else if waited > FINAL_KEYFRAME_WAIT {
                    log::info!(
                        "waited {}s for a key frame, ending segment on a non-key frame",
                        waited.as_secs()
                    );
                    info.last_frame_was_key = false;
                    is_final = true;
                }
            }

            let (dts, pts) = video_rebase.apply(segment_index, packet.dts(), packet.pts());
            packet.set_dts(dts);
            packet.set_pts(pts);
            if packet.duration() <= 0 {
                packet.set_duration(video_frame_duration);
            }
            packet.set_duration(clamp_duration(packet.duration()));
            packet.set_stream(out_video_index);
            packet.set_position(-1);
            packet.rescale_ts(video_tb, out_video_tb);
            match packet.write_interleaved(&mut octx) {
                Ok(()) => {
                    video_packets += 1;
                    if video_packets % PROGRESS_INTERVAL == 0 {
                        log::debug!("processed {video_packets} video packets");
                    }
                }
                Err(e) => log::error!("error writing video frame: {e}"),
            }

            if is_final {
                break;
            }
        } else if let Some(audio) = audio.as_ref().filter(|a| a.index == stream_index) {
            // No audio before the first emitted video keyframe: the file must
            // start decodable.
            if !found_first_keyframe {
                continue;
            }

            let (dts, pts) = audio_rebase.apply(segment_index, packet.dts(), packet.pts());
            packet.set_dts(dts);
            packet.set_pts(pts);
            if packet.duration() <= 0 {
                packet.set_duration(audio_packet_duration(audio, packet.size()));
            }
            packet.set_duration(clamp_duration(packet.duration()));
            packet.set_stream(out_audio_index);
            packet.set_position(-1);
            packet.rescale_ts(audio.time_base, out_audio_tb.unwrap());
            match packet.write_interleaved(&mut octx) {
                Ok(()) => {
                    audio_packets += 1;
                    if audio_packets % PROGRESS_INTERVAL == 0 {
                        log::debug!("processed {audio_packets} audio packets");
                    }
                }
                Err(e) => log::error!("error writing audio frame: {e}"),
            }
        }
    }

    log::info!(
        "segment complete (video packets: {video_packets}, audio packets: {audio_packets})"
    );

    // Close the file even if the trailer fails, so the catalog can still
    // record the partial recording.
    if let Err(e) = octx.write_trailer() {
        log::error!("failed to write trailer: {e}");
    }

    info.index = segment_index + 1;
    info.has_audio = audio.is_some();
    log::debug!(
        "saved segment info for next segment: index={}, has_audio={}",
        info.index,
        info.has_audio
    );

    match read_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_fallback_duration_from_frame_rate() {
        // 30 fps in a 90 kHz time base is 3000 ticks per frame.
        let duration =
            video_fallback_duration(Rational::new(30, 1), Rational::new(1, 90_000));
        assert_eq!(duration, 3000);
    }

    #[test]
    fn video_fallback_duration_unknown_rate() {
        let duration =
            video_fallback_duration(Rational::new(0, 1), Rational::new(1, 90_000));
        assert_eq!(duration, 1);
    }

    #[test]
    fn audio_sample_count_from_pcm_size() {
        // 4096 bytes of 16-bit stereo PCM is 1024 samples.
        assert_eq!(audio_sample_count(4096, 2, 16), 1024);
        assert_eq!(audio_sample_count(8, 2, 16), 2);
    }

    #[test]
    fn audio_sample_count_falls_back_for_compressed() {
        // Compressed packets are far smaller than channels * bytes_per_sample
        // would suggest, or carry no sample-size info at all.
        assert_eq!(audio_sample_count(2, 2, 16), 1024);
        assert_eq!(audio_sample_count(512, 0, 0), 1024);
    }

    #[test]
    fn duration_clamp() {
        assert_eq!(clamp_duration(1), 1);
        assert_eq!(clamp_duration(MAX_PACKET_DURATION), MAX_PACKET_DURATION);
        assert_eq!(clamp_duration(MAX_PACKET_DURATION + 1), CLAMPED_PACKET_DURATION);
    }
}
