//! Session settings: backend address and capture-trigger mode.
//!
//! Settings come from the environment (with a `.env` file for
//! development) or from whatever front-end owns the user-facing
//! controls; the resolver publishes changes so the engine can react
//! (address change reconnects, mode change applies once idle).

use std::env;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

pub const ENV_BACKEND_URL: &str = "VOICE_BACKEND_URL";
pub const ENV_CAPTURE_MODE: &str = "VOICE_CAPTURE_MODE";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid backend URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Invalid capture mode '{0}' (expected push-to-talk or hands-free)")]
    InvalidCaptureMode(String),
}

/// How capture is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum CaptureMode {
    /// Capture only while the user holds the talk control.
    #[strum(serialize = "push-to-talk")]
    PushToTalk,
    /// Capture auto-starts when the connection comes up; release is
    /// decided by a pluggable policy (see the engine's `ReleasePolicy`).
    #[strum(serialize = "hands-free")]
    HandsFree,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub server_url: Url,
    pub capture_mode: CaptureMode,
}

impl SessionSettings {
    /// Build settings from raw strings, validating the URL scheme.
    pub fn from_parts(url: &str, mode: &str) -> Result<Self, SettingsError> {
        let server_url = Url::parse(url).map_err(|e| SettingsError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if server_url.scheme() != "ws" && server_url.scheme() != "wss" {
            return Err(SettingsError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", server_url.scheme()),
            });
        }
        let capture_mode = CaptureMode::from_str(mode)
            .map_err(|_| SettingsError::InvalidCaptureMode(mode.to_string()))?;
        Ok(Self {
            server_url,
            capture_mode,
        })
    }

    /// Load settings from environment variables.
    pub fn load() -> Result<Self, SettingsError> {
        // Load .env if present (development convenience).
        dotenvy::dotenv().ok();

        let url = env::var(ENV_BACKEND_URL)
            .map_err(|_| SettingsError::MissingEnvVar(ENV_BACKEND_URL.to_string()))?;
        let mode = env::var(ENV_CAPTURE_MODE).unwrap_or_else(|_| "push-to-talk".to_string());
        Self::from_parts(&url, &mode)
    }
}

/// What changed between two settings snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SettingsDelta {
    pub address_changed: bool,
    pub mode_changed: bool,
}

/// Owns the current settings and notifies subscribers of changes.
pub struct SettingsResolver {
    tx: watch::Sender<SessionSettings>,
}

impl SettingsResolver {
    pub fn new(initial: SessionSettings) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> SessionSettings {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSettings> {
        self.tx.subscribe()
    }

    /// Replace the settings, returning what changed. Subscribers are
    /// only woken when something actually differs.
    pub fn apply(&self, next: SessionSettings) -> SettingsDelta {
        let current = self.tx.borrow().clone();
        let delta = SettingsDelta {
            address_changed: current.server_url != next.server_url,
            mode_changed: current.capture_mode != next.capture_mode,
        };
        if delta.address_changed || delta.mode_changed {
            log::info!(
                "Settings changed: url {} -> {}, mode {} -> {}",
                current.server_url,
                next.server_url,
                current.capture_mode,
                next.capture_mode
            );
            let _ = self.tx.send(next);
        }
        delta
    }
}
