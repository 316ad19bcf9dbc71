//! Per-entity mapping tables that track every source record through the
//! migration.
//!
//! Each `Map_<Entity>` row moves `Ready -> Success | Exists | Failed | Skipped`.
//! `Target_Id` is only ever written together with `Success` or `Exists`, and
//! rows whose `Retry_Count` reached the entity's cap are never handed out for
//! posting again.
use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::entity::{Reference, SourceRecord};

mod sqlite;
pub use sqlite::SqliteMappingStore;

/// Longest `Failure_Reason` kept in the table.
pub const FAILURE_REASON_MAX: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PorterStatus {
    Ready,
    Success,
    Failed,
    Exists,
    Skipped,
}

impl PorterStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PorterStatus::Ready => "Ready",
            PorterStatus::Success => "Success",
            PorterStatus::Failed => "Failed",
            PorterStatus::Exists => "Exists",
            PorterStatus::Skipped => "Skipped",
        }
    }

    /// Whether the row has a QuickBooks counterpart.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, PorterStatus::Success | PorterStatus::Exists)
    }
}

impl std::fmt::Display for PorterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PorterStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ready" => Ok(PorterStatus::Ready),
            "Success" => Ok(PorterStatus::Success),
            "Failed" => Ok(PorterStatus::Failed),
            "Exists" => Ok(PorterStatus::Exists),
            "Skipped" => Ok(PorterStatus::Skipped),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("unknown status {0:?} in mapping table")]
    UnknownStatus(String),
    #[error("mapping store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("mapping store lock poisoned")]
    Poisoned,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Optional columns of a mapping table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableLayout {
    pub references: Vec<String>,
    pub unique_field: Option<String>,
}

impl TableLayout {
    #[must_use]
    pub fn new(references: &[Reference], unique_field: Option<&str>) -> Self {
        Self {
            references: references.iter().map(|r| r.name.clone()).collect(),
            unique_field: unique_field.map(String::from),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRef {
    pub source: Option<String>,
    pub target: Option<String>,
}

/// One row of a mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRow {
    pub source_id: String,
    pub target_id: Option<String>,
    pub status: PorterStatus,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    pub payload_json: Option<String>,
    pub level: u32,
    pub is_deleted: bool,
    /// Source id of the parent record, for hierarchical entities.
    pub parent_id: Option<String>,
    /// The parent's `Target_Id` once it has one.
    pub parent_target_id: Option<String>,
    pub references: BTreeMap<String, ResolvedRef>,
    pub unique_value: Option<String>,
    pub duplicate_value: Option<String>,
}

impl MappingRow {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: None,
            status: PorterStatus::Ready,
            retry_count: 0,
            failure_reason: None,
            payload_json: None,
            level: 0,
            is_deleted: false,
            parent_id: None,
            parent_target_id: None,
            references: BTreeMap::new(),
            unique_value: None,
            duplicate_value: None,
        }
    }

    /// Whether the row sits below a parent that has no QuickBooks id yet.
    #[must_use]
    pub fn awaits_parent(&self) -> bool {
        self.level > 0 && self.parent_target_id.is_none()
    }

    #[must_use]
    pub fn reference(&self, name: &str) -> Option<&ResolvedRef> {
        self.references.get(name)
    }

    /// QuickBooks id of a resolved reference.
    #[must_use]
    pub fn mapped(&self, name: &str) -> Option<&str> {
        self.reference(name)?.target.as_deref()
    }

    /// Unique value to put in the payload: the de-duplicated one when the
    /// dedup pass assigned it, the original otherwise.
    #[must_use]
    pub fn effective_unique_value(&self) -> Option<&str> {
        self.duplicate_value
            .as_deref()
            .or(self.unique_value.as_deref())
    }
}

/// Unique-field state of one row, as read by the dedup pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueValueRow {
    pub source_id: String,
    pub value: Option<String>,
    pub duplicate: Option<String>,
    pub is_deleted: bool,
}

/// One status transition to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub source_id: String,
    pub status: PorterStatus,
    pub target_id: Option<String>,
    pub failure_reason: Option<String>,
    pub increment_retry: bool,
}

impl StatusUpdate {
    pub fn success(source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            status: PorterStatus::Success,
            target_id: Some(target_id.into()),
            failure_reason: None,
            increment_retry: false,
        }
    }

    pub fn exists(source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            status: PorterStatus::Exists,
            ..Self::success(source_id, target_id)
        }
    }

    pub fn failed(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            status: PorterStatus::Failed,
            target_id: None,
            failure_reason: Some(truncate_reason(&reason.into())),
            increment_retry: true,
        }
    }

    pub fn skipped(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            status: PorterStatus::Skipped,
            target_id: None,
            failure_reason: Some(truncate_reason(&reason.into())),
            increment_retry: false,
        }
    }
}

/// Cuts `reason` to [`FAILURE_REASON_MAX`] characters.
#[must_use]
pub fn truncate_reason(reason: &str) -> String {
    reason.chars().take(FAILURE_REASON_MAX).collect()
}

#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Creates the schema and `Map_<entity>` if absent and adds any missing
    /// reference or unique-field columns. Idempotent.
    async fn ensure_schema_and_table(&self, entity: &str, layout: &TableLayout) -> StoreResult<()>;

    /// Inserts one `Ready` row per unseen source id; existing rows are left
    /// untouched. Returns the number of rows inserted.
    async fn seed_from_source(&self, entity: &str, records: &[SourceRecord]) -> StoreResult<usize>;

    /// Fills `Mapped_*` columns from the sibling tables' `Target_Id` and
    /// `Parent_Target_Id` from the parent row of the same table.
    async fn resolve_references(&self, entity: &str, references: &[Reference]) -> StoreResult<()>;

    /// Up to `limit` rows in one of `statuses` with `Retry_Count < retry_cap`,
    /// optionally restricted to one hierarchy level, ordered by `Source_Id`
    /// and starting after `after`.
    async fn fetch_eligible(
        &self,
        entity: &str,
        statuses: &[PorterStatus],
        retry_cap: u32,
        level: Option<u32>,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<MappingRow>>;

    /// Ready or Failed rows without a payload, ordered by `Source_Id` and
    /// starting after `after`.
    async fn fetch_missing_payloads(
        &self,
        entity: &str,
        retry_cap: u32,
        level: Option<u32>,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<MappingRow>>;

    /// Stores first-time payloads. Rows that already carry one keep it.
    async fn store_payloads(&self, entity: &str, payloads: &[(String, String)]) -> StoreResult<()>;

    /// Overwrites an existing payload, logging the previous value.
    async fn replace_payload(&self, entity: &str, source_id: &str, payload: &str)
        -> StoreResult<()>;

    /// Failed rows without a `Target_Id` that still have a payload and retries
    /// left.
    async fn fetch_fallback_candidates(
        &self,
        entity: &str,
        retry_cap: u32,
    ) -> StoreResult<Vec<MappingRow>>;

    async fn write_status(&self, entity: &str, update: &StatusUpdate) -> StoreResult<()>;

    /// Persists many updates in one transaction.
    async fn write_status_bulk(&self, entity: &str, updates: &[StatusUpdate]) -> StoreResult<()>;

    async fn unique_values(&self, entity: &str) -> StoreResult<Vec<UniqueValueRow>>;

    async fn write_duplicate_values(
        &self,
        entity: &str,
        values: &[(String, String)],
    ) -> StoreResult<()>;

    async fn write_levels(&self, entity: &str, levels: &[(String, u32)]) -> StoreResult<()>;

    /// Distinct hierarchy levels, ascending.
    async fn levels(&self, entity: &str) -> StoreResult<Vec<u32>>;

    async fn fetch_row(&self, entity: &str, source_id: &str) -> StoreResult<Option<MappingRow>>;

    async fn row_count(&self, entity: &str) -> StoreResult<usize>;

    /// Deletes every row of `Map_<entity>`.
    async fn rebuild(&self, entity: &str) -> StoreResult<()>;

    async fn status_counts(&self, entity: &str) -> StoreResult<BTreeMap<PorterStatus, usize>>;
}
