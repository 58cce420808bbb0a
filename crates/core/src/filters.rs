//! Stream filter grammar and evaluation
//!
//! Filters are a closed AST: a list of event matchers and a list of
//! transaction matchers. Fields present in one matcher must all match (AND);
//! any matcher matching is enough (OR). Unknown JSON shapes are rejected at
//! parse time rather than silently ignored.

use serde::{Deserialize, Serialize};

use crate::events::EventKind;
use crate::types::{EventRecord, TransactionRecord};
use crate::{Error, Result};

/// Field-equality matcher for events
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EventMatcher {
    /// Event type tag, e.g. `smart_contract_log`
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    /// Contract principal that emitted the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,

    /// Containing transaction id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
}

impl EventMatcher {
    /// AND across the fields that are present
    pub fn matches(&self, event: &EventRecord) -> bool {
        if let Some(want) = &self.event_type {
            if *want != event.event_type {
                return false;
            }
        }
        if let Some(want) = &self.contract_id {
            let kind = EventKind::from_record(event);
            if kind.contract_id() != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(want) = &self.tx_id {
            if *want != event.tx_id {
                return false;
            }
        }
        true
    }
}

/// Field-equality matcher for transactions
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TxMatcher {
    /// Transaction type, e.g. `contract_call`
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub tx_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
}

impl TxMatcher {
    /// AND across the fields that are present
    pub fn matches(&self, tx: &TransactionRecord) -> bool {
        if let Some(want) = &self.tx_type {
            if *want != tx.tx_type {
                return false;
            }
        }
        if let Some(want) = &self.contract_id {
            if tx.contract_id.as_deref() != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(want) = &self.function_name {
            if tx.function_name.as_deref() != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(want) = &self.sender {
            if *want != tx.sender {
                return false;
            }
        }
        if let Some(want) = &self.status {
            if *want != tx.status {
                return false;
            }
        }
        if let Some(want) = &self.tx_id {
            if *want != tx.tx_id {
                return false;
            }
        }
        true
    }
}

/// The filter object attached to a stream or view
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StreamFilters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventMatcher>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transactions: Vec<TxMatcher>,
}

/// The subset of a block's data that matched a filter
#[derive(Debug, Clone, Default)]
pub struct FilterMatch {
    pub transactions: Vec<TransactionRecord>,
    pub events: Vec<EventRecord>,
}

impl FilterMatch {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.events.is_empty()
    }
}

impl StreamFilters {
    /// Parse a stored filter value, refusing unknown shapes
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::validation(format!("invalid filter object: {}", e)))
    }

    /// Whether no matchers are declared at all. An empty filter matches the
    /// whole block.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.transactions.is_empty()
    }

    pub fn matches_event(&self, event: &EventRecord) -> bool {
        self.events.iter().any(|m| m.matches(event))
    }

    pub fn matches_tx(&self, tx: &TransactionRecord) -> bool {
        self.transactions.iter().any(|m| m.matches(tx))
    }

    /// Evaluate against a block's transactions and events, returning the
    /// matching subset. An empty filter object selects everything.
    pub fn apply(
        &self,
        transactions: &[TransactionRecord],
        events: &[EventRecord],
    ) -> FilterMatch {
        if self.is_empty() {
            return FilterMatch {
                transactions: transactions.to_vec(),
                events: events.to_vec(),
            };
        }

        FilterMatch {
            transactions: transactions
                .iter()
                .filter(|tx| self.matches_tx(tx))
                .cloned()
                .collect(),
            events: events
                .iter()
                .filter(|ev| self.matches_event(ev))
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx(tx_type: &str, sender: &str, contract: Option<&str>, function: Option<&str>) -> TransactionRecord {
        TransactionRecord {
            tx_id: format!("0x{}", tx_type),
            block_height: 100,
            block_hash: "A".to_string(),
            tx_index: 0,
            tx_type: tx_type.to_string(),
            sender: sender.to_string(),
            status: "success".to_string(),
            contract_id: contract.map(|s| s.to_string()),
            function_name: function.map(|s| s.to_string()),
            raw_tx: None,
        }
    }

    fn event(event_type: &str, payload: serde_json::Value) -> EventRecord {
        EventRecord {
            id: 1,
            tx_id: "0xabc".to_string(),
            block_height: 100,
            block_hash: "A".to_string(),
            event_index: 0,
            event_type: event_type.to_string(),
            payload,
        }
    }

    #[test]
    fn parses_field_equality_filters() {
        let value = json!({
            "transactions": [{"type": "contract_call", "function_name": "transfer"}],
            "events": [{"type": "ft_transfer_event"}]
        });
        let filters = StreamFilters::parse(&value).unwrap();
        assert_eq!(filters.transactions.len(), 1);
        assert_eq!(filters.events.len(), 1);
    }

    #[test]
    fn refuses_unknown_shapes() {
        let value = json!({"transactions": [{"regex": ".*"}]});
        assert!(StreamFilters::parse(&value).is_err());

        let value = json!({"anything": true});
        assert!(StreamFilters::parse(&value).is_err());
    }

    #[test]
    fn matcher_fields_are_anded() {
        let value = json!({
            "transactions": [{"type": "contract_call", "sender": "SP1"}]
        });
        let filters = StreamFilters::parse(&value).unwrap();

        assert!(filters.matches_tx(&tx("contract_call", "SP1", None, None)));
        assert!(!filters.matches_tx(&tx("contract_call", "SP2", None, None)));
        assert!(!filters.matches_tx(&tx("token_transfer", "SP1", None, None)));
    }

    #[test]
    fn matchers_are_ored() {
        let value = json!({
            "transactions": [
                {"type": "token_transfer"},
                {"type": "contract_call"}
            ]
        });
        let filters = StreamFilters::parse(&value).unwrap();
        assert!(filters.matches_tx(&tx("token_transfer", "SP1", None, None)));
        assert!(filters.matches_tx(&tx("contract_call", "SP1", None, None)));
        assert!(!filters.matches_tx(&tx("coinbase", "SP1", None, None)));
    }

    #[test]
    fn contract_id_matches_against_event_payload() {
        let value = json!({
            "events": [{"contract_id": "SP1.counter"}]
        });
        let filters = StreamFilters::parse(&value).unwrap();

        let matching = event(
            "smart_contract_log",
            json!({"contract_id": "SP1.counter", "value": 1}),
        );
        let other = event("smart_contract_log", json!({"contract_id": "SP2.other"}));
        assert!(filters.matches_event(&matching));
        assert!(!filters.matches_event(&other));
    }

    #[test]
    fn empty_filter_selects_everything() {
        let filters = StreamFilters::parse(&json!({})).unwrap();
        let txs = vec![tx("coinbase", "SP1", None, None)];
        let events = vec![event("stx_transfer_event", json!({}))];
        let matched = filters.apply(&txs, &events);
        assert_eq!(matched.transactions.len(), 1);
        assert_eq!(matched.events.len(), 1);
    }

    #[test]
    fn apply_returns_matching_subset() {
        let value = json!({
            "transactions": [{"type": "contract_call"}]
        });
        let filters = StreamFilters::parse(&value).unwrap();
        let txs = vec![
            tx("contract_call", "SP1", Some("SP1.c"), Some("f")),
            tx("coinbase", "SP1", None, None),
        ];
        let matched = filters.apply(&txs, &[]);
        assert_eq!(matched.transactions.len(), 1);
        assert_eq!(matched.transactions[0].tx_type, "contract_call");
        assert!(matched.events.is_empty());
    }
}
