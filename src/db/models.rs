use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// One row of `call_history`, serialized as-is by `GET /api/history`.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct CallRecord {
    pub id: i64,
    pub call_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Download path of the call's recording, once one has been uploaded.
    pub audio_url: Option<String>,
}

impl CallRecord {
    pub fn has_recording(&self) -> bool {
        self.audio_url.as_deref().is_some_and(|url| !url.is_empty())
    }
}

/// Result of claiming the recording slot of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The call now points at the new recording.
    Attached,
    /// An earlier upload won; carries the URL already on record.
    AlreadyRecorded(String),
}
