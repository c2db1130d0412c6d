extern crate ffmpeg_next as ffmpeg;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("failed to open input {url}: {source}")]
    OpenInput { url: String, source: ffmpeg::Error },

    #[error("no video stream found in input")]
    NoVideoStream,

    #[error("failed to create output {}: {source}", .path.display())]
    CreateOutput {
        path: PathBuf,
        source: ffmpeg::Error,
    },

    #[error("failed to add output stream: {0}")]
    AddStream(ffmpeg::Error),

    #[error("failed to write header: {0}")]
    WriteHeader(ffmpeg::Error),

    #[error("error reading frame: {0}")]
    ReadFrame(ffmpeg::Error),

    #[error("stream URL must not be empty")]
    EmptyUrl,

    #[error("output directory must not be empty")]
    EmptyOutputDir,

    #[error("a recording worker is already running for stream {0}")]
    AlreadyRunning(String),
}

pub type Result<T> = std::result::Result<T, RecordError>;
