//! Store notification channels and payloads
//!
//! All cross-service wakeups go through Postgres NOTIFY. Payloads are JSON;
//! `new_job` carries none (the signal alone triggers a drain).

use serde::{Deserialize, Serialize};

/// Fan-out after a job enqueue batch; payload ignored
pub const NEW_JOB_CHANNEL: &str = "new_job";

/// View registry changed; consumers debounce before reloading
pub const VIEW_CHANGES_CHANNEL: &str = "view_changes";

/// A reorg happened; view processors rewind immediately
pub const VIEW_REORG_CHANNEL: &str = "view_reorg";

/// Debounce window for `view_changes` in milliseconds
pub const VIEW_CHANGES_DEBOUNCE_MS: u64 = 500;

/// Payload on `view_changes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewChangePayload {
    /// created | updated | deleted
    pub operation: String,

    /// View name affected
    pub name: String,
}

/// Payload on `view_reorg`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewReorgPayload {
    /// Height at which the chain diverged
    pub block_height: i64,

    /// Hash of the block that lost canonical status
    pub old_hash: String,

    /// Hash of the replacement block
    pub new_hash: String,
}
