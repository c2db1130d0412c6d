use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};

use camrec_lib::{
    Clock, FfmpegSegmentRecorder, MemoryCatalog, SessionEnv, ShutdownCoordinator,
    SignalShutdown, SystemClock, Writer, WriterOptions, is_recording, start_recording,
    stop_recording,
};

/// RTSP segment recorder: archives a live camera stream as rolling MP4 files.
#[derive(Parser)]
#[command(name = "camrec")]
struct Args {
    /// RTSP stream URL to record
    #[arg(required_unless_present = "version")]
    url: Option<String>,

    /// Stream name used in catalog records and logs
    #[arg(long = "stream-name", default_value = "camera")]
    stream_name: String,

    /// Directory segment files are created in
    #[arg(long = "output-folder", default_value = "./")]
    output_folder: String,

    /// Segment duration in seconds (0 = single unbounded file)
    #[arg(long = "segment-duration", default_value_t = 30)]
    segment_duration: u32,

    /// Record audio if the stream provides it
    #[arg(long = "with-audio", default_value_t = false, action = ArgAction::Set)]
    with_audio: bool,

    /// Write a JSON manifest of all catalog records to this file on exit
    #[arg(long = "manifest")]
    manifest: Option<PathBuf>,

    /// Display version and quit
    #[arg(long = "version")]
    version: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = run(&args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.version {
        println!("camrec RTSP segment recorder");
        println!();

        let release = env!("RELEASE_VERSION");
        let commit = env!("GIT_COMMIT");
        if !release.is_empty() {
            println!("\tVersion:     {release}");
        } else {
            println!("\tGit commit:  {commit}");
        }
        return Ok(());
    }

    let url = args
        .url
        .as_deref()
        .ok_or("Expected an RTSP URL as input!")?;

    std::fs::create_dir_all(&args.output_folder)?;

    let catalog = Arc::new(MemoryCatalog::new());
    let shutdown = Arc::new(SignalShutdown::new());
    let clock = Arc::new(SystemClock);

    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            log::info!("interrupt received, shutting down");
            shutdown.initiate();
        })?;
    }

    let env = SessionEnv {
        catalog: catalog.clone(),
        shutdown: shutdown.clone(),
        clock: clock.clone(),
        recorder: Arc::new(FfmpegSegmentRecorder::new(shutdown.clone())),
    };

    let writer = Writer::new(
        WriterOptions {
            stream_name: args.stream_name.clone(),
            output_dir: PathBuf::from(&args.output_folder),
            segment_duration: Some(args.segment_duration),
            record_audio: args.with_audio,
        },
        clock.now(),
    );

    start_recording(&writer, url, &env)?;
    log::info!("recording {url}; press Ctrl-C to stop");

    while is_recording(&writer) && !shutdown.is_shutdown_initiated() {
        std::thread::sleep(Duration::from_millis(200));
    }

    stop_recording(&writer);

    if let Some(path) = &args.manifest {
        let records: Vec<_> = catalog
            .snapshot()
            .into_iter()
            .map(|(_, meta)| meta)
            .collect();
        std::fs::write(path, serde_json::to_string_pretty(&records)?)?;
        log::info!(
            "wrote manifest with {} records to {}",
            records.len(),
            path.display()
        );
    }

    Ok(())
}
