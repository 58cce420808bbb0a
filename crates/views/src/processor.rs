//! View processor: advances views over the contiguous stream, rewinds on
//! reorgs, and hot-reloads the registry on definition changes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use secondlayer_core::notify::{
    ViewReorgPayload, VIEW_CHANGES_CHANNEL, VIEW_CHANGES_DEBOUNCE_MS, VIEW_REORG_CHANNEL,
};
use secondlayer_core::types::{ViewRecord, ViewStatus};
use secondlayer_core::{Config, Error, Result};
use secondlayer_storage::{blocks, views as view_store, Store};

use crate::handler::{HandlerRegistry, ViewContext};
use crate::schema::{self, ViewDefinition};

/// Poll cadence for advancing views between notifications
const ADVANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Signals from the notification listener
enum ViewSignal {
    Changed,
    Reorg(ViewReorgPayload),
}

/// A view held in the process-local registry cache
#[derive(Clone)]
struct CachedView {
    record: ViewRecord,
    definition: Arc<ViewDefinition>,
}

pub struct ViewProcessor {
    store: Store,
    config: Config,
    registry: Arc<HandlerRegistry>,

    /// Registry cache, invalidated by `view_changes`
    views: Mutex<HashMap<Uuid, CachedView>>,

    /// Views with an advance task in flight; enforces one task per view
    busy: StdMutex<HashSet<Uuid>>,

    /// Lowest height of a rewind waiting to run; advance loops stop before
    /// touching it. i64::MAX when no rewind is pending.
    rewind_pending: AtomicI64,

    /// Bounds parallel view tasks
    semaphore: Arc<Semaphore>,
}

impl ViewProcessor {
    pub fn new(store: Store, config: Config, registry: Arc<HandlerRegistry>) -> Arc<Self> {
        let concurrency = config.view_concurrency;
        Arc::new(Self {
            store,
            config,
            registry,
            views: Mutex::new(HashMap::new()),
            busy: StdMutex::new(HashSet::new()),
            rewind_pending: AtomicI64::new(i64::MAX),
            semaphore: Arc::new(Semaphore::new(concurrency)),
        })
    }

    /// Load active views from the store, ensure their physical schemas, and
    /// pause any whose stored hash no longer matches the definition.
    pub async fn reload_views(&self) -> Result<()> {
        let records = view_store::load_active_views(self.store.pool()).await?;
        let mut cache = HashMap::new();

        for record in records {
            match self.prepare_view(&record).await {
                Ok(Some(definition)) => {
                    cache.insert(
                        record.id,
                        CachedView {
                            record,
                            definition: Arc::new(definition),
                        },
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(view = %record.name, error = %e, "Failed to prepare view, pausing");
                    view_store::set_view_status(
                        self.store.pool(),
                        record.id,
                        ViewStatus::Error.as_str(),
                        Some(&e.to_string()),
                    )
                    .await?;
                }
            }
        }

        let count = cache.len();
        *self.views.lock().await = cache;
        info!(views = count, "View registry loaded");
        Ok(())
    }

    /// Parse the definition, apply DDL, and reconcile the schema hash.
    /// Returns None when the view was paused instead of prepared.
    async fn prepare_view(&self, record: &ViewRecord) -> Result<Option<ViewDefinition>> {
        let definition = ViewDefinition::parse(&record.definition)?;
        let hash = definition.definition_hash();

        if !record.schema_hash.is_empty() && record.schema_hash != hash {
            // Migration event: out of scope, record and pause.
            warn!(
                view = %record.name,
                stored = %record.schema_hash,
                current = %hash,
                "Definition hash changed, pausing view"
            );
            view_store::set_view_status(
                self.store.pool(),
                record.id,
                ViewStatus::Paused.as_str(),
                Some("definition changed since schema was built"),
            )
            .await?;
            return Ok(None);
        }

        let mut conn = self.store.pool().acquire().await?;
        view_store::ensure_schema(&mut conn, &record.schema_name).await?;
        let ddl = schema::generate_ddl(&record.schema_name, &definition)?;
        view_store::apply_view_ddl(&mut conn, &ddl).await?;
        drop(conn);

        if record.schema_hash.is_empty() {
            view_store::set_schema_hash(self.store.pool(), record.id, &hash).await?;
        }
        Ok(Some(definition))
    }

    /// Run until shutdown: advance on a cadence, react to notifications
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.reload_views().await?;

        let (signal_tx, mut signal_rx) = mpsc::channel::<ViewSignal>(64);
        let listener_task = tokio::spawn(listen_loop(
            self.store.clone(),
            signal_tx,
            shutdown.clone(),
        ));

        let mut interval = tokio::time::interval(ADVANCE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.advance_all(&shutdown).await;
                }
                signal = signal_rx.recv() => {
                    match signal {
                        Some(ViewSignal::Changed) => {
                            // Debounce: absorb the burst before reloading.
                            self.debounce_changes(&mut signal_rx).await;
                            if let Err(e) = self.reload_views().await {
                                error!(error = %e, "View registry reload failed");
                            }
                        }
                        Some(ViewSignal::Reorg(reorg)) => {
                            if let Err(e) = self.rewind(&reorg).await {
                                error!(error = %e, "View rewind failed");
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Let in-flight block transactions finish.
        let _ = self
            .semaphore
            .acquire_many(self.config.view_concurrency as u32)
            .await;
        let _ = listener_task.await;
        info!("View processor stopped");
        Ok(())
    }

    /// Advance every cached view to the current contiguous watermark, one
    /// view at a time, and wait for the work to finish. The cadence loop
    /// spawns instead; this sequential pass exists for operator catch-up
    /// and for exercising views deterministically.
    pub async fn catch_up(self: &Arc<Self>) -> Result<()> {
        let (_stop, stay_running) = watch::channel(false);
        let snapshot: Vec<CachedView> = self.views.lock().await.values().cloned().collect();

        for view in snapshot {
            let view_id = view.record.id;
            {
                let mut busy = self.busy.lock().expect("busy set poisoned");
                if !busy.insert(view_id) {
                    continue;
                }
            }

            let result = self.advance_view(&view, &stay_running).await;
            self.busy.lock().expect("busy set poisoned").remove(&view_id);
            result?;
        }
        Ok(())
    }

    /// Drain queued change signals until the debounce window stays quiet
    async fn debounce_changes(&self, rx: &mut mpsc::Receiver<ViewSignal>) {
        let window = Duration::from_millis(VIEW_CHANGES_DEBOUNCE_MS);
        loop {
            match tokio::time::timeout(window, rx.recv()).await {
                Ok(Some(ViewSignal::Changed)) => continue,
                Ok(Some(ViewSignal::Reorg(reorg))) => {
                    // Rewinds are not debounced even mid-burst.
                    if let Err(e) = self.rewind(&reorg).await {
                        error!(error = %e, "View rewind failed");
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    /// Spawn an advance task for every idle view
    async fn advance_all(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) {
        let snapshot: Vec<CachedView> = self.views.lock().await.values().cloned().collect();
        for view in snapshot {
            if *shutdown.borrow() {
                return;
            }
            let view_id = view.record.id;
            {
                let mut busy = self.busy.lock().expect("busy set poisoned");
                if !busy.insert(view_id) {
                    continue;
                }
            }

            // Never block the control loop on a full pool; the next tick
            // will pick this view up again.
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.busy.lock().expect("busy set poisoned").remove(&view_id);
                    return;
                }
            };

            let processor = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = processor.advance_view(&view, &shutdown).await {
                    warn!(view = %view.record.name, error = %e, "View advance failed");
                }
                processor
                    .busy
                    .lock()
                    .expect("busy set poisoned")
                    .remove(&view_id);
                drop(permit);
            });
        }
    }

    /// Advance one view over `(last_processed, last_contiguous]`, one block
    /// transaction at a time. A handler failure stops this view until the
    /// next cadence tick.
    async fn advance_view(
        self: &Arc<Self>,
        view: &CachedView,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let Some(handler) = self.registry.get(&view.record.handler) else {
            view_store::set_view_status(
                self.store.pool(),
                view.record.id,
                ViewStatus::Error.as_str(),
                Some(&format!("unknown handler {:?}", view.record.handler)),
            )
            .await?;
            return Err(Error::handler(format!(
                "no handler registered as {:?}",
                view.record.handler
            )));
        };

        let target = blocks::last_contiguous(self.store.pool(), &self.config.network).await?;
        let mut current = self.cached_progress(view.record.id).await
            .unwrap_or(view.record.last_processed_block);

        while current < target {
            if *shutdown.borrow() {
                break;
            }
            let height = current + 1;

            // A pending rewind must run before any block at or above its
            // height is processed.
            if self.rewind_pending.load(Ordering::SeqCst) <= height {
                break;
            }

            let Some((block, transactions, events)) =
                blocks::block_with_data(self.store.pool(), height).await?
            else {
                // Contiguity says this cannot happen unless a reorg is in
                // flight; the rewind will resynchronize.
                warn!(view = %view.record.name, height, "Contiguous block missing, stopping");
                break;
            };

            let matched = view.definition.sources.apply(&transactions, &events);

            let mut tx = self.store.pool().begin().await?;
            let handled = {
                let mut ctx = ViewContext::new(
                    &mut tx,
                    &view.record.schema_name,
                    view.definition.as_ref(),
                    height,
                );
                handler
                    .handle(&mut ctx, &block, &matched.transactions, &matched.events)
                    .await
            };

            match handled {
                Ok(()) => {
                    view_store::set_view_progress(&mut *tx, view.record.id, height).await?;
                    tx.commit().await?;
                    self.store_cached_progress(view.record.id, height).await;
                    current = height;
                }
                Err(e) => {
                    drop(tx); // rollback
                    view_store::record_view_error(
                        self.store.pool(),
                        view.record.id,
                        &e.to_string(),
                    )
                    .await?;
                    warn!(view = %view.record.name, height, error = %e, "Handler failed, backing off");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn cached_progress(&self, view_id: Uuid) -> Option<i64> {
        self.views
            .lock()
            .await
            .get(&view_id)
            .map(|v| v.record.last_processed_block)
    }

    async fn store_cached_progress(&self, view_id: Uuid, height: i64) {
        if let Some(view) = self.views.lock().await.get_mut(&view_id) {
            view.record.last_processed_block = height;
        }
    }

    /// Rewind every view past the reorg height: progress back to height-1
    /// and delete all rows at or above the height, atomically per view,
    /// before that view can process any block >= height again. Also the
    /// entry point for operator-driven rewinds.
    pub async fn rewind(&self, reorg: &ViewReorgPayload) -> Result<()> {
        let height = reorg.block_height;
        info!(height, old_hash = %reorg.old_hash, new_hash = %reorg.new_hash, "Rewinding views");

        self.rewind_pending.fetch_min(height, Ordering::SeqCst);
        let snapshot: Vec<CachedView> = self.views.lock().await.values().cloned().collect();
        for view in snapshot {
            let progress = self
                .cached_progress(view.record.id)
                .await
                .unwrap_or(view.record.last_processed_block);
            if progress < height {
                continue;
            }

            // Exclude the advance task: take the busy flag before touching
            // the view's schema.
            let view_id = view.record.id;
            loop {
                {
                    let mut busy = self.busy.lock().expect("busy set poisoned");
                    if busy.insert(view_id) {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            let result = self.rewind_one(&view, height).await;
            self.busy.lock().expect("busy set poisoned").remove(&view_id);
            result?;
        }

        self.rewind_pending.store(i64::MAX, Ordering::SeqCst);
        Ok(())
    }

    async fn rewind_one(&self, view: &CachedView, height: i64) -> Result<()> {
        let mut tx = self.store.pool().begin().await?;
        for table in view.definition.table_names() {
            let deleted =
                view_store::delete_rows_from(&mut tx, &view.record.schema_name, table, height)
                    .await?;
            debug!(view = %view.record.name, table, deleted, "Deleted rewound rows");
        }
        view_store::set_view_progress(&mut *tx, view.record.id, height - 1).await?;
        tx.commit().await?;

        self.store_cached_progress(view.record.id, height - 1).await;
        info!(view = %view.record.name, rewound_to = height - 1, "View rewound");
        Ok(())
    }
}

/// Subscribe to registry-change and reorg channels, forwarding signals
async fn listen_loop(
    store: Store,
    signals: mpsc::Sender<ViewSignal>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut listener = match store
            .listener(&[VIEW_CHANGES_CHANNEL, VIEW_REORG_CHANNEL])
            .await
        {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, "View notification listener failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        loop {
            tokio::select! {
                received = listener.recv() => {
                    let notification = match received {
                        Ok(notification) => notification,
                        Err(e) => {
                            warn!(error = %e, "View notification connection lost");
                            break;
                        }
                    };
                    let signal = match notification.channel() {
                        VIEW_REORG_CHANNEL => {
                            match serde_json::from_str::<ViewReorgPayload>(notification.payload()) {
                                Ok(reorg) => ViewSignal::Reorg(reorg),
                                Err(e) => {
                                    warn!(error = %e, payload = notification.payload(), "Bad reorg payload");
                                    continue;
                                }
                            }
                        }
                        _ => ViewSignal::Changed,
                    };
                    if signals.send(signal).await.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
