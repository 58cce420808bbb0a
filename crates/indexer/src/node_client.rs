//! Upstream node HTTP client
//!
//! Used by the tip follower and auto-backfill to fetch blocks the push
//! stream never delivered, and by the parser as a decode fallback.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use secondlayer_core::{Config, Error, Result};

use crate::parse::NewBlockPayload;

/// Transaction fields resolved through the upstream indexer API
#[derive(Debug, Clone, Deserialize)]
pub struct TxLookup {
    #[serde(rename = "tx_type")]
    pub tx_type: Option<String>,

    #[serde(rename = "sender_address")]
    pub sender: Option<String>,

    #[serde(default)]
    pub contract_call: Option<ContractCallLookup>,

    #[serde(default)]
    pub smart_contract: Option<SmartContractLookup>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractCallLookup {
    pub contract_id: Option<String>,
    pub function_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmartContractLookup {
    pub contract_id: Option<String>,
}

/// HTTP client for the upstream node and its indexer API
#[derive(Clone)]
pub struct NodeClient {
    http: reqwest::Client,
    node_url: String,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    stacks_tip_height: i64,
}

impl NodeClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::network(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            node_url: config.node_url.trim_end_matches('/').to_string(),
            api_url: config.node_api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Current chain tip height as reported by the node
    pub async fn tip_height(&self) -> Result<i64> {
        let info: NodeInfo = self
            .http
            .get(format!("{}/v2/info", self.node_url))
            .send()
            .await
            .map_err(|e| Error::network(format!("node info: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::network(format!("node info: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::network(format!("node info body: {}", e)))?;
        Ok(info.stacks_tip_height)
    }

    /// Fetch one block in the same shape the push stream delivers
    pub async fn block_by_height(&self, height: i64) -> Result<NewBlockPayload> {
        let payload: NewBlockPayload = self
            .http
            .get(format!("{}/extended/v1/block/by_height/{}", self.api_url, height))
            .send()
            .await
            .map_err(|e| Error::network(format!("block {}: {}", height, e)))?
            .error_for_status()
            .map_err(|e| Error::network(format!("block {}: {}", height, e)))?
            .json()
            .await
            .map_err(|e| Error::network(format!("block {} body: {}", height, e)))?;
        Ok(payload)
    }

    /// Resolve transaction fields when the raw decode fails. Errors are
    /// soft: the parser treats None as "fall back further".
    pub async fn lookup_transaction(&self, tx_id: &str) -> Option<TxLookup> {
        let url = format!("{}/extended/v1/tx/{}", self.api_url, tx_id);
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                response.json::<TxLookup>().await.ok()
            }
            Ok(response) => {
                debug!(tx_id, status = %response.status(), "Transaction lookup refused");
                None
            }
            Err(e) => {
                debug!(tx_id, error = %e, "Transaction lookup failed");
                None
            }
        }
    }
}
