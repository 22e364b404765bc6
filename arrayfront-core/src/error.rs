use thiserror::Error;

use crate::protocol::FrameError;

/// All errors produced by arrayfront-core.
#[derive(Debug, Error)]
pub enum ArrayError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("DSP processing error: {0}")]
    Dsp(String),

    #[error("cannot open control link {path}: {source}")]
    LinkOpen {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("control link write failed: {0}")]
    LinkWrite(#[source] std::io::Error),

    #[error("control link is not open")]
    LinkUnavailable,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("capture backend was lost when the pipeline thread failed")]
    CaptureLost,

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ArrayError>;
