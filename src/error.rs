use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Audio input device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Capture already in progress")]
    AlreadyCapturing,

    #[error("Playback already in progress")]
    AlreadyPlaying,

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Not connected to backend")]
    NotConnected,

    #[error("Outbound queue full")]
    SendQueueFull,

    #[error("Connection to backend lost")]
    ConnectionLost,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Settings error: {0}")]
    Settings(#[from] crate::settings::SettingsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
