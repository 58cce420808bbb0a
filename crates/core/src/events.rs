//! Typed event variants
//!
//! Upstream events arrive as a type tag plus a flat payload object. The
//! store keeps the payload opaque; consumers that need fields pattern-match
//! on this tagged union instead of poking at JSON paths.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::EventRecord;

/// One event, decoded from its type tag and payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StxTransferEvent {
        #[serde(default)]
        sender: Option<String>,
        #[serde(default)]
        recipient: Option<String>,
        #[serde(default)]
        amount: Option<String>,
    },
    StxMintEvent {
        #[serde(default)]
        recipient: Option<String>,
        #[serde(default)]
        amount: Option<String>,
    },
    StxBurnEvent {
        #[serde(default)]
        sender: Option<String>,
        #[serde(default)]
        amount: Option<String>,
    },
    StxLockEvent {
        #[serde(default)]
        locked_address: Option<String>,
        #[serde(default)]
        locked_amount: Option<String>,
        #[serde(default)]
        unlock_height: Option<u64>,
    },
    FtTransferEvent {
        #[serde(default)]
        asset_identifier: Option<String>,
        #[serde(default)]
        sender: Option<String>,
        #[serde(default)]
        recipient: Option<String>,
        #[serde(default)]
        amount: Option<String>,
    },
    FtMintEvent {
        #[serde(default)]
        asset_identifier: Option<String>,
        #[serde(default)]
        recipient: Option<String>,
        #[serde(default)]
        amount: Option<String>,
    },
    FtBurnEvent {
        #[serde(default)]
        asset_identifier: Option<String>,
        #[serde(default)]
        sender: Option<String>,
        #[serde(default)]
        amount: Option<String>,
    },
    NftTransferEvent {
        #[serde(default)]
        asset_identifier: Option<String>,
        #[serde(default)]
        sender: Option<String>,
        #[serde(default)]
        recipient: Option<String>,
        #[serde(default)]
        value: Option<Value>,
    },
    NftMintEvent {
        #[serde(default)]
        asset_identifier: Option<String>,
        #[serde(default)]
        recipient: Option<String>,
        #[serde(default)]
        value: Option<Value>,
    },
    NftBurnEvent {
        #[serde(default)]
        asset_identifier: Option<String>,
        #[serde(default)]
        sender: Option<String>,
        #[serde(default)]
        value: Option<Value>,
    },
    SmartContractLog {
        #[serde(default)]
        contract_id: Option<String>,
        #[serde(default)]
        topic: Option<String>,
        #[serde(default)]
        value: Option<Value>,
    },
    /// A type the decoder does not model; the payload stays opaque
    #[serde(skip)]
    Other {
        event_type: String,
        payload: Value,
    },
}

impl EventKind {
    /// Decode a stored event row. Unknown types land in `Other` rather than
    /// failing; an event is never dropped for being unmodeled.
    pub fn from_record(record: &EventRecord) -> Self {
        Self::from_parts(&record.event_type, &record.payload)
    }

    /// Decode from a type tag and flat payload
    pub fn from_parts(event_type: &str, payload: &Value) -> Self {
        let mut tagged = match payload {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        tagged.insert(
            "type".to_string(),
            Value::String(event_type.to_string()),
        );

        match serde_json::from_value(Value::Object(tagged)) {
            Ok(kind) => kind,
            Err(_) => EventKind::Other {
                event_type: event_type.to_string(),
                payload: payload.clone(),
            },
        }
    }

    /// Contract principal associated with the event, when the variant has one
    pub fn contract_id(&self) -> Option<&str> {
        match self {
            EventKind::SmartContractLog { contract_id, .. } => contract_id.as_deref(),
            EventKind::FtTransferEvent {
                asset_identifier, ..
            }
            | EventKind::FtMintEvent {
                asset_identifier, ..
            }
            | EventKind::FtBurnEvent {
                asset_identifier, ..
            }
            | EventKind::NftTransferEvent {
                asset_identifier, ..
            }
            | EventKind::NftMintEvent {
                asset_identifier, ..
            }
            | EventKind::NftBurnEvent {
                asset_identifier, ..
            } => asset_identifier
                .as_deref()
                .map(|asset| asset.split("::").next().unwrap_or(asset)),
            _ => None,
        }
    }

    /// The address that initiated the event, when the variant has one
    pub fn sender(&self) -> Option<&str> {
        match self {
            EventKind::StxTransferEvent { sender, .. }
            | EventKind::StxBurnEvent { sender, .. }
            | EventKind::FtTransferEvent { sender, .. }
            | EventKind::FtBurnEvent { sender, .. }
            | EventKind::NftTransferEvent { sender, .. }
            | EventKind::NftBurnEvent { sender, .. } => sender.as_deref(),
            EventKind::StxLockEvent { locked_address, .. } => locked_address.as_deref(),
            _ => None,
        }
    }
}
