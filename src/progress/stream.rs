//! Wire messages of the per-project progress stream.

use serde::{Deserialize, Serialize};

use super::{EventKind, ProgressEvent};

/// One message on the progress stream. The first message of every stream
/// is `connected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Connected {
        #[serde(rename = "projectId")]
        project_id: String,
    },
    Progress {
        stage: String,
        percent: u8,
        message: String,
    },
    Complete {
        stage: String,
        percent: u8,
        message: String,
    },
    Error {
        stage: String,
        message: String,
    },
}

impl From<ProgressEvent> for StreamMessage {
    fn from(event: ProgressEvent) -> Self {
        match event.kind {
            EventKind::Progress => StreamMessage::Progress {
                stage: event.stage,
                percent: event.percent,
                message: event.message,
            },
            EventKind::Complete => StreamMessage::Complete {
                stage: event.stage,
                percent: event.percent,
                message: event.message,
            },
            EventKind::Error => StreamMessage::Error {
                stage: event.stage,
                message: event.message,
            },
        }
    }
}

impl StreamMessage {
    pub fn json(&self) -> String {
        // Plain enums of strings and integers always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// `data: <json>\n\n` framing.
    pub fn frame(&self) -> String {
        format!("data: {}\n\n", self.json())
    }
}
