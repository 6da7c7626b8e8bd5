//! Footer record and the per-session log that produces it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use capsule_common::{Error, Result};

/// Free-text accumulators stored at the end of the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footer {
    pub error_log: String,
    pub session_log: String,
}

impl Footer {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Log context owned by one open container.
///
/// Seeded from the footer found on open and exported as the footer written
/// on close. Every line is mirrored to `tracing`.
#[derive(Debug, Clone)]
pub struct SessionLog {
    session_id: Uuid,
    error_log: String,
    session_log: String,
}

impl SessionLog {
    /// Start a session continuing the logs of `previous`.
    pub fn new(previous: Footer) -> Self {
        let mut log = Self {
            session_id: Uuid::new_v4(),
            error_log: previous.error_log,
            session_log: previous.session_log,
        };
        log.push(Level::Info, "Session started");
        log
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn push(&mut self, level: Level, message: &str) {
        let line = format!(
            "{} [{}] {} {}\n",
            Utc::now().to_rfc3339(),
            self.session_id,
            level.tag(),
            message
        );
        if level == Level::Error {
            self.error_log.push_str(&line);
        }
        self.session_log.push_str(&line);
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(session = %self.session_id, "{}", message);
        self.push(Level::Info, message);
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        warn!(session = %self.session_id, "{}", message);
        self.push(Level::Warn, message);
    }

    /// Record a failure in both the error log and the session log.
    pub fn error(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        error!(session = %self.session_id, "{}", message);
        self.push(Level::Error, message);
    }

    pub fn error_log(&self) -> &str {
        &self.error_log
    }

    pub fn session_log(&self) -> &str {
        &self.session_log
    }

    /// Snapshot the accumulated logs as a footer record.
    pub fn export(&self) -> Footer {
        Footer {
            error_log: self.error_log.clone(),
            session_log: self.session_log.clone(),
        }
    }
}
