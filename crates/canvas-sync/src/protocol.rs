use serde::{Deserialize, Serialize};

use crate::presence::Presence;

/// JSON messages carried in text frames; CRDT updates travel as binary frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Sender's state vector; the receiver answers with the updates it is missing
    SyncRequest {
        #[serde(rename = "stateVector")]
        state_vector: Vec<u8>,
    },
    Awareness(Presence),
    PresenceRemoved {
        id: String,
    },
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Unknown or malformed control messages are dropped by the caller
    pub fn from_json(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::debug!(error = %e, "ignoring unrecognized control message");
                None
            }
        }
    }
}

/// One message on a project connection
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Update(Vec<u8>),
    Control(ControlMessage),
}
