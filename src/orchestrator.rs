//! Per-entity driver tying the mapping store, the payload builders and the
//! posters together.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::{stream, StreamExt};

use crate::{
    batch::BatchPoster,
    codec,
    config::{PorterConfig, DEFAULT_CONCURRENCY},
    dedup::apply_dedup,
    entity::{missing_reference, Built, DateRange, EntityMigrator, EntitySettings, SourceRecord},
    error::MigrationError,
    functions::create::post_single,
    hierarchy::compute_levels,
    store::{MappingRow, MappingStore, PorterStatus, SqliteMappingStore, StatusUpdate, TableLayout},
    QBContext,
};

/// Final state of one entity run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    pub entity: String,
    /// New mapping rows inserted by this run.
    pub seeded: usize,
    /// Rows sent to QuickBooks, batch and single-record attempts combined.
    pub posted: usize,
    pub counts: BTreeMap<PorterStatus, usize>,
    pub cancelled: bool,
}

impl MigrationSummary {
    #[must_use]
    pub fn count(&self, status: PorterStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

impl std::fmt::Display for MigrationSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: seeded {}, posted {}", self.entity, self.seeded, self.posted)?;
        for (status, count) in &self.counts {
            write!(f, ", {status} {count}")?;
        }
        if self.cancelled {
            f.write_str(" (cancelled)")?;
        }
        Ok(())
    }
}

/// Sets the returned flag on Ctrl-C. Pass it to [`Migrator::with_shutdown`];
/// work already sent to QuickBooks is still written back.
#[must_use]
pub fn shutdown_on_ctrl_c() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Ctrl-C received, finishing in-flight requests");
            handle.store(true, Ordering::SeqCst);
        }
    });
    flag
}

pub struct Migrator {
    qb: Arc<QBContext>,
    store: Arc<dyn MappingStore>,
    concurrency: usize,
    shutdown: Arc<AtomicBool>,
}

impl Migrator {
    pub fn new(qb: Arc<QBContext>, store: Arc<dyn MappingStore>) -> Self {
        Self {
            qb,
            store,
            concurrency: DEFAULT_CONCURRENCY,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Context, file- or memory-backed store and worker count from `config`.
    pub fn from_config(config: &PorterConfig) -> Result<Self, MigrationError> {
        let qb = QBContext::from_config(config)?;
        let store = match &config.mapping_db_dir {
            Some(dir) => SqliteMappingStore::open_dir(dir, &config.mapping_schema)?,
            None => SqliteMappingStore::open_in_memory(&config.mapping_schema)?,
        };
        Ok(Self::new(Arc::new(qb), Arc::new(store)).with_concurrency(config.concurrency))
    }

    /// Workers used by the single-record fallback pass.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MappingStore> {
        &self.store
    }

    fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Migrates every record `migrator` reads for `range`.
    ///
    /// Rows already `Success` or `Exists` are never posted again, so the run
    /// can be repeated until nothing is left below the retry cap.
    pub async fn run(
        &self,
        migrator: &dyn EntityMigrator,
        range: &DateRange,
    ) -> Result<MigrationSummary, MigrationError> {
        let entity = migrator.entity();
        let settings = migrator.settings();
        let references = migrator.references();
        let mut summary = MigrationSummary {
            entity: entity.to_string(),
            ..MigrationSummary::default()
        };

        let layout = TableLayout::new(&references, migrator.unique_field());
        self.store.ensure_schema_and_table(entity, &layout).await?;

        let records = migrator.source_records(range).await?;
        log::info!("{entity}: {} source records", records.len());

        if settings.rebuild_on_mismatch {
            let existing = self.store.row_count(entity).await?;
            if existing != records.len() {
                log::warn!(
                    "{entity}: mapping has {existing} rows for {} source records, rebuilding",
                    records.len()
                );
                self.store.rebuild(entity).await?;
            }
        }

        summary.seeded = self.store.seed_from_source(entity, &records).await?;
        self.store.resolve_references(entity, &references).await?;

        if migrator.unique_field().is_some() {
            apply_dedup(self.store.as_ref(), entity).await?;
        }
        if records.iter().any(|r| r.parent_id.is_some()) {
            self.store.write_levels(entity, &compute_levels(&records)).await?;
        }

        let by_id: HashMap<&str, &SourceRecord> =
            records.iter().map(|r| (r.source_id.as_str(), r)).collect();

        for level in self.store.levels(entity).await? {
            if self.cancelled() {
                break;
            }
            if level > 0 {
                log::info!("{entity}: level {level}");
                self.store.resolve_references(entity, &references).await?;
            }
            self.generate_payloads(migrator, &settings, &by_id, level).await?;
            summary.posted += self.post_level(entity, &settings, level).await?;
            summary.posted += self.fallback_level(entity, &settings, level).await?;
        }

        summary.cancelled = self.cancelled();
        summary.counts = self.store.status_counts(entity).await?;
        log::info!("{summary}");
        Ok(summary)
    }

    /// Builds and stores payloads for rows of `level` that have none yet.
    ///
    /// Store errors end the run here: nothing of the slice has been sent, so
    /// stopping loses no QuickBooks state.
    async fn generate_payloads(
        &self,
        migrator: &dyn EntityMigrator,
        settings: &EntitySettings,
        records: &HashMap<&str, &SourceRecord>,
        level: u32,
    ) -> Result<(), MigrationError> {
        let entity = migrator.entity();
        let references = migrator.references();
        let mut after: Option<String> = None;

        loop {
            let rows = self
                .store
                .fetch_missing_payloads(
                    entity,
                    settings.retry_cap,
                    Some(level),
                    after.as_deref(),
                    settings.payload_batch.max(1),
                )
                .await?;
            let Some(last) = rows.last() else {
                break;
            };
            after = Some(last.source_id.clone());

            let mut payloads = Vec::new();
            let mut updates = Vec::new();
            for row in &rows {
                // Rows outside this run's date window are left alone.
                let Some(record) = records.get(row.source_id.as_str()) else {
                    continue;
                };
                if row.awaits_parent() {
                    let parent = row.parent_id.as_deref().unwrap_or_default();
                    log::warn!("{entity} {}: parent {parent} has no Target_Id", row.source_id);
                    let reason = format!("Missing parent Target_Id for {parent}");
                    updates.push(StatusUpdate::failed(&row.source_id, reason));
                    continue;
                }
                if let Some(reason) = missing_reference(&references, row) {
                    log::warn!("{entity} {}: {reason}", row.source_id);
                    updates.push(StatusUpdate::failed(&row.source_id, reason));
                    continue;
                }
                match migrator.build(record, row) {
                    Built::Payload(payload) => {
                        payloads.push((row.source_id.clone(), codec::encode(&payload)));
                    }
                    Built::Missing(reason) => {
                        log::warn!("{entity} {}: {reason}", row.source_id);
                        updates.push(StatusUpdate::failed(&row.source_id, reason));
                    }
                    Built::Skip(reason) => {
                        log::info!("{entity} {} skipped: {reason}", row.source_id);
                        updates.push(StatusUpdate::skipped(&row.source_id, reason));
                    }
                }
            }
            log::debug!(
                "{entity}: built {} payloads, {} rows not buildable",
                payloads.len(),
                updates.len()
            );
            self.store.store_payloads(entity, &payloads).await?;
            self.store.write_status_bulk(entity, &updates).await?;
        }
        Ok(())
    }

    /// Batch pass over the eligible rows of `level`, reading `db_slice` rows
    /// from the store at a time. Returns the number of rows sent.
    async fn post_level(
        &self,
        entity: &str,
        settings: &EntitySettings,
        level: u32,
    ) -> Result<usize, MigrationError> {
        let statuses = [PorterStatus::Ready, PorterStatus::Failed];
        let poster = BatchPoster::new(&self.qb, entity)?.with_cancel(self.shutdown.clone());
        let mut after: Option<String> = None;
        let mut posted = 0;

        while !self.cancelled() {
            let rows = self
                .store
                .fetch_eligible(
                    entity,
                    &statuses,
                    settings.retry_cap,
                    Some(level),
                    after.as_deref(),
                    settings.db_slice.max(1),
                )
                .await?;
            let Some(last) = rows.last() else {
                break;
            };
            after = Some(last.source_id.clone());

            let (work, undecodable) = decode_payloads(entity, &rows);
            self.write_back(entity, &undecodable).await;
            if work.is_empty() {
                continue;
            }

            let outcome = poster.post_batch(&work, settings.http_chunk_size).await;
            posted += outcome.updates.len();
            log::info!(
                "{entity}: batch slice of {} done, {} ok, {} failed",
                work.len(),
                outcome.successes().count(),
                outcome.failures().count()
            );
            self.write_back(entity, &outcome.updates).await;
        }
        Ok(posted)
    }

    /// Persists `updates`, logging instead of failing so the remaining slices
    /// still run.
    async fn write_back(&self, entity: &str, updates: &[StatusUpdate]) {
        if let Err(e) = self.store.write_status_bulk(entity, updates).await {
            log::error!("{entity}: could not write back {} updates: {e}", updates.len());
        }
    }

    /// One single-record attempt for every row of `level` still `Failed` with
    /// a payload, `concurrency` at a time.
    async fn fallback_level(
        &self,
        entity: &str,
        settings: &EntitySettings,
        level: u32,
    ) -> Result<usize, MigrationError> {
        let candidates: Vec<MappingRow> = self
            .store
            .fetch_fallback_candidates(entity, settings.retry_cap)
            .await?
            .into_iter()
            .filter(|row| row.level == level)
            .collect();
        if candidates.is_empty() || self.cancelled() {
            return Ok(0);
        }
        log::info!("{entity}: single-record fallback for {} rows", candidates.len());

        let (work, undecodable) = decode_payloads(entity, &candidates);
        self.write_back(entity, &undecodable).await;

        let posted = stream::iter(work)
            .map(|(source_id, payload)| async move {
                if self.cancelled() {
                    return false;
                }
                let outcome = post_single(&self.qb, entity, &source_id, payload).await;
                if let Some(replaced) = &outcome.replaced_payload {
                    let encoded = codec::encode(replaced);
                    if let Err(e) = self.store.replace_payload(entity, &source_id, &encoded).await {
                        log::error!("{entity} {source_id}: could not store shortened payload: {e}");
                    }
                }
                if let Err(e) = self.store.write_status(entity, &outcome.update).await {
                    log::error!("{entity} {source_id}: could not write back status: {e}");
                }
                true
            })
            .buffer_unordered(self.concurrency)
            .filter(|sent| std::future::ready(*sent))
            .count()
            .await;
        Ok(posted)
    }
}

/// Splits rows into `(source_id, payload)` work and `Failed` updates for
/// payloads that no longer parse. Rows without a payload are dropped.
fn decode_payloads(
    entity: &str,
    rows: &[MappingRow],
) -> (Vec<(String, serde_json::Value)>, Vec<StatusUpdate>) {
    let mut work = Vec::with_capacity(rows.len());
    let mut failed = Vec::new();
    for row in rows {
        let Some(raw) = row.payload_json.as_deref() else {
            continue;
        };
        match codec::decode(raw) {
            Ok(payload) => work.push((row.source_id.clone(), payload)),
            Err(e) => {
                log::error!("{entity} {}: stored payload is not valid JSON: {e}", row.source_id);
                let reason = format!("Invalid Payload_JSON: {e}");
                failed.push(StatusUpdate::failed(&row.source_id, reason));
            }
        }
    }
    (work, failed)
}
