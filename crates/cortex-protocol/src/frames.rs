use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Client → Server chat frame.
/// Wire: `{ "type": "message", "content": "...", "department": "it" }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        department: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        attachments: Option<Vec<Uuid>>,
    },
    VoiceStart,
    VoiceChunk {
        /// Base64-encoded audio.
        data: String,
    },
    VoiceStop,
    Cancel,
}

/// Server → Client chat frame.
/// Wire: `{ "type": "token", "text": "Hel" }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Token {
        text: String,
    },
    /// Pipeline stage transition, for client-side progress rendering.
    Trace {
        step: String,
        data: Value,
    },
    /// Passages that backed the reply, sent once after streaming ends.
    Citation {
        passages: Vec<CitedPassage>,
    },
    Error {
        code: String,
        message: String,
    },
    Done {
        query_id: Uuid,
        elapsed_ms: u64,
    },
}

impl ServerFrame {
    pub fn token(text: impl Into<String>) -> Self {
        ServerFrame::Token { text: text.into() }
    }

    pub fn trace(step: impl Into<String>, data: impl Serialize) -> Self {
        ServerFrame::Trace {
            step: step.into(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Sanitized passage reference for the `citation` frame. Content is not
/// echoed back; clients fetch it through their own document views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitedPassage {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    pub score: f32,
}
