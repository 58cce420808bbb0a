//! View processor service: materialized views over the contiguous stream

use std::sync::Arc;

use tokio::sync::watch;

use secondlayer_core::{Config, Result};
use secondlayer_storage::Store;

pub mod handler;
pub mod processor;
pub mod schema;

pub use handler::{EventLogHandler, HandlerRegistry, TableMapperHandler, ViewContext, ViewHandler};
pub use processor::ViewProcessor;
pub use schema::{schema_name_for, ColumnDefinition, ColumnType, TableDefinition, ViewDefinition};

/// Run the view processor with the built-in handler bindings
pub async fn run(config: Config, store: Store, shutdown: watch::Receiver<bool>) -> Result<()> {
    let registry = Arc::new(HandlerRegistry::with_defaults());
    let processor = ViewProcessor::new(store, config, registry);
    processor.run(shutdown).await
}
