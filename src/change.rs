//! Change messages (§3, §6): the wire format between a Collection's sync
//! session and its subscribers, and the terminal shape the D2 graph's
//! Output operator produces.

use crate::row::{Key, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeMessage {
    Insert { key: Key, value: Row },
    Update { key: Key, value: Row, previous_value: Row },
    Delete { key: Key, value: Row },
}

impl ChangeMessage {
    pub fn key(&self) -> &Key {
        match self {
            ChangeMessage::Insert { key, .. }
            | ChangeMessage::Update { key, .. }
            | ChangeMessage::Delete { key, .. } => key,
        }
    }

    pub fn value(&self) -> &Row {
        match self {
            ChangeMessage::Insert { value, .. }
            | ChangeMessage::Update { value, .. }
            | ChangeMessage::Delete { value, .. } => value,
        }
    }
}
