pub mod capture;
pub mod channel;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod settings;

pub use error::{Result, SessionError};
