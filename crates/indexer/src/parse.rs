//! Wire payload parsing: push payload → entity inserts
//!
//! Blocks pass through. Transactions prefer the raw decode, then the HTTP
//! lookup, then whatever the push payload already supplied, then "unknown";
//! a transaction with a tx_id is never dropped. Events dispatch on their
//! type tag and keep the structured payload opaque.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use secondlayer_storage::blocks::{NewBlock, NewEvent, NewTransaction};

use crate::codec;
use crate::node_client::NodeClient;

/// Push payload for one new block
#[derive(Debug, Clone, Deserialize)]
pub struct NewBlockPayload {
    pub height: i64,
    pub hash: String,
    pub parent_hash: String,

    #[serde(default)]
    pub burn_block_height: i64,

    #[serde(default)]
    pub timestamp: i64,

    #[serde(default)]
    pub transactions: Vec<TxPayload>,

    #[serde(default)]
    pub events: Vec<EventPayload>,
}

/// One transaction as pushed. Fields beyond tx_id are all optional; the
/// parser fills the gaps.
#[derive(Debug, Clone, Deserialize)]
pub struct TxPayload {
    pub tx_id: String,

    #[serde(default)]
    pub tx_index: i32,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub raw_tx: Option<String>,

    #[serde(rename = "type", default)]
    pub tx_type: Option<String>,

    #[serde(default)]
    pub sender: Option<String>,

    #[serde(default)]
    pub contract_id: Option<String>,

    #[serde(default)]
    pub function_name: Option<String>,
}

/// One event as pushed: a type tag, position, and a sub-object keyed by the
/// type carrying the actual fields.
#[derive(Debug, Clone, Deserialize)]
pub struct EventPayload {
    #[serde(alias = "txid")]
    pub tx_id: String,

    #[serde(default)]
    pub event_index: i32,

    #[serde(rename = "type", default)]
    pub event_type: Option<String>,

    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

impl NewBlockPayload {
    /// Basic shape validation before any store work
    pub fn validate(&self) -> Result<(), String> {
        if self.height < 1 {
            return Err(format!("invalid block height {}", self.height));
        }
        if self.hash.is_empty() {
            return Err("missing block hash".to_string());
        }
        Ok(())
    }
}

/// Block pass-through. Genesis keeps timestamp 0.
pub fn block_from_payload(payload: &NewBlockPayload) -> NewBlock {
    NewBlock {
        height: payload.height,
        hash: payload.hash.clone(),
        parent_hash: payload.parent_hash.clone(),
        burn_block_height: payload.burn_block_height,
        timestamp: payload.timestamp,
    }
}

/// Convert pushed transactions to rows, resolving type/sender/contract via
/// raw decode → HTTP lookup → payload fields → "unknown".
pub async fn transactions_from_payload(
    payload: &NewBlockPayload,
    node: &NodeClient,
) -> Vec<NewTransaction> {
    let mut rows = Vec::with_capacity(payload.transactions.len());
    for tx in &payload.transactions {
        rows.push(resolve_transaction(tx, payload, node).await);
    }
    rows
}

async fn resolve_transaction(
    tx: &TxPayload,
    block: &NewBlockPayload,
    node: &NodeClient,
) -> NewTransaction {
    let mut decode_failed = false;
    let decoded = match tx.raw_tx.as_deref() {
        Some(raw) => match codec::decode_raw_tx(raw) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                debug!(tx_id = %tx.tx_id, error = %e, "Raw decode failed, trying lookup");
                decode_failed = true;
                None
            }
        },
        None => None,
    };

    // The lookup is a decode fallback; without raw bytes the push payload's
    // own fields are the source of truth.
    let lookup = if decode_failed {
        node.lookup_transaction(&tx.tx_id).await
    } else {
        None
    };

    let (tx_type, sender, contract_id, function_name) = if let Some(decoded) = decoded {
        (
            decoded.tx_type,
            decoded.sender,
            decoded.contract_id,
            decoded.function_name,
        )
    } else if let Some(lookup) = lookup {
        let contract_id = lookup
            .contract_call
            .as_ref()
            .and_then(|c| c.contract_id.clone())
            .or_else(|| {
                lookup
                    .smart_contract
                    .as_ref()
                    .and_then(|c| c.contract_id.clone())
            })
            .or_else(|| tx.contract_id.clone());
        (
            lookup
                .tx_type
                .or_else(|| tx.tx_type.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            lookup
                .sender
                .or_else(|| tx.sender.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            contract_id,
            lookup
                .contract_call
                .and_then(|c| c.function_name)
                .or_else(|| tx.function_name.clone()),
        )
    } else {
        (
            tx.tx_type.clone().unwrap_or_else(|| "unknown".to_string()),
            tx.sender.clone().unwrap_or_else(|| "unknown".to_string()),
            tx.contract_id.clone(),
            tx.function_name.clone(),
        )
    };

    NewTransaction {
        tx_id: tx.tx_id.clone(),
        block_height: block.height,
        block_hash: block.hash.clone(),
        tx_index: tx.tx_index,
        tx_type,
        sender,
        status: tx.status.clone().unwrap_or_else(|| "success".to_string()),
        contract_id,
        function_name,
        raw_tx: tx.raw_tx.clone(),
    }
}

/// Convert pushed events to rows. Events without a type are dropped; the
/// payload stored is the flat sub-object matching the type, falling back to
/// the remaining fields when the node sent the flat shape directly.
pub fn events_from_payload(payload: &NewBlockPayload) -> Vec<NewEvent> {
    let mut rows = Vec::with_capacity(payload.events.len());
    for event in &payload.events {
        let Some(event_type) = event.event_type.clone() else {
            warn!(tx_id = %event.tx_id, "Dropping event without a type");
            continue;
        };

        let body = match event.rest.get(&event_type) {
            Some(flat) => flat.clone(),
            None => Value::Object(event.rest.clone()),
        };

        rows.push(NewEvent {
            tx_id: event.tx_id.clone(),
            block_height: payload.height,
            block_hash: payload.hash.clone(),
            event_index: event.event_index,
            event_type,
            payload: body,
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> NewBlockPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn block_passes_through_with_genesis_default() {
        let block = block_from_payload(&payload(json!({
            "height": 1,
            "hash": "0xabc",
            "parent_hash": "0x00"
        })));
        assert_eq!(block.height, 1);
        assert_eq!(block.timestamp, 0);
        assert_eq!(block.burn_block_height, 0);
    }

    #[test]
    fn payload_validation_rejects_bad_shapes() {
        assert!(payload(json!({"height": 0, "hash": "a", "parent_hash": "b"}))
            .validate()
            .is_err());
        assert!(payload(json!({"height": 5, "hash": "", "parent_hash": "b"}))
            .validate()
            .is_err());
        assert!(payload(json!({"height": 5, "hash": "a", "parent_hash": "b"}))
            .validate()
            .is_ok());
    }

    #[test]
    fn events_dispatch_on_type_sub_object() {
        let block = payload(json!({
            "height": 100,
            "hash": "A",
            "parent_hash": "Z",
            "events": [
                {
                    "tx_id": "0x1",
                    "event_index": 0,
                    "type": "stx_transfer_event",
                    "stx_transfer_event": {"sender": "SP1", "amount": "100"}
                },
                {
                    "tx_id": "0x1",
                    "event_index": 1,
                    "type": "ft_transfer_event",
                    "asset_identifier": "SP1.token::t"
                },
                {
                    "tx_id": "0x2",
                    "event_index": 0
                }
            ]
        }));

        let events = events_from_payload(&block);
        assert_eq!(events.len(), 2, "typeless event must be dropped");

        assert_eq!(events[0].event_type, "stx_transfer_event");
        assert_eq!(events[0].block_hash, "A");
        assert_eq!(events[0].payload["amount"], "100");

        // Flat shape: remaining fields become the payload
        assert_eq!(events[1].event_type, "ft_transfer_event");
        assert_eq!(events[1].payload["asset_identifier"], "SP1.token::t");
    }

    #[test]
    fn event_accepts_txid_alias() {
        let block = payload(json!({
            "height": 100,
            "hash": "A",
            "parent_hash": "Z",
            "events": [
                {"txid": "0x9", "event_index": 0, "type": "stx_mint_event", "stx_mint_event": {}}
            ]
        }));
        let events = events_from_payload(&block);
        assert_eq!(events[0].tx_id, "0x9");
    }
}
