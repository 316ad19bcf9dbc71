//! The contract between the engine and the per-entity payload mappers.
//!
//! An [`EntityMigrator`] knows how to read one entity's records from the
//! source system and how to turn one of them into a QuickBooks payload. The
//! engine owns everything else: seeding the mapping table, resolving
//! references, posting, retries and bookkeeping.
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::{error::MigrationError, store::MappingRow};

/// Inclusive date window handed to [`EntityMigrator::source_records`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    #[must_use]
    pub fn between(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.is_none_or(|from| date >= from) && self.to.is_none_or(|to| date <= to)
    }
}

/// A foreign key that must be translated through a sibling mapping table.
///
/// `name` is the QuickBooks reference name (e.g. `CustomerRef`); the mapping
/// table gets a `Source_<name>` and a `Mapped_<name>` column, and the mapped
/// value is looked up in `Map_<entity>.Target_Id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub entity: String,
    pub required: bool,
}

impl Reference {
    pub fn required(name: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity: entity.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity: entity.into(),
            required: false,
        }
    }

    #[must_use]
    pub fn source_column(&self) -> String {
        format!("Source_{}", self.name)
    }

    #[must_use]
    pub fn mapped_column(&self) -> String {
        format!("Mapped_{}", self.name)
    }
}

/// One record read from the source system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRecord {
    pub source_id: String,
    /// Self-referential parent, for hierarchical entities.
    pub parent_id: Option<String>,
    pub is_deleted: bool,
    /// Value of the entity's human-unique field (DocNumber, AcctNum, ...).
    pub unique_value: Option<String>,
    /// Source-side foreign keys, keyed by [`Reference::name`].
    pub references: BTreeMap<String, String>,
    /// Everything else the payload builder needs.
    pub fields: Map<String, Value>,
}

impl SourceRecord {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    #[must_use]
    pub fn with_reference(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.references.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_unique_value(mut self, value: impl Into<String>) -> Self {
        self.unique_value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn deleted(mut self) -> Self {
        self.is_deleted = true;
        self
    }

    /// String value of a field, if present and a string.
    #[must_use]
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// Outcome of building one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Built {
    Payload(Value),
    /// A required input is unavailable; the row is marked `Failed`.
    Missing(String),
    /// The record must not be migrated; the row is marked `Skipped`.
    Skip(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySettings {
    pub retry_cap: u32,
    /// Operations per `/batch` call, clamped to 1..=30.
    pub http_chunk_size: usize,
    /// Eligible rows handed to the batch poster at once.
    pub db_slice: usize,
    /// Rows built per payload generation round.
    pub payload_batch: usize,
    /// Wipe the mapping table when its row count no longer matches the source.
    pub rebuild_on_mismatch: bool,
}

impl Default for EntitySettings {
    fn default() -> Self {
        Self {
            retry_cap: 5,
            http_chunk_size: 10,
            db_slice: 300,
            payload_batch: 500,
            rebuild_on_mismatch: false,
        }
    }
}

#[async_trait]
pub trait EntityMigrator: Send + Sync {
    /// QuickBooks entity name, e.g. `Customer`. Also names `Map_<entity>`.
    fn entity(&self) -> &str;

    fn settings(&self) -> EntitySettings {
        EntitySettings::default()
    }

    fn references(&self) -> Vec<Reference> {
        Vec::new()
    }

    /// Human-unique field that gets a `Duplicate_<field>` shadow column.
    fn unique_field(&self) -> Option<&str> {
        None
    }

    async fn source_records(&self, range: &DateRange) -> Result<Vec<SourceRecord>, MigrationError>;

    /// Builds the payload for `record`. `row` carries the resolved references
    /// and the de-duplicated unique value. Must not perform I/O.
    fn build(&self, record: &SourceRecord, row: &MappingRow) -> Built;
}

/// Checks `row` against the declared references before a build.
///
/// A reference whose source value is set but unmapped is always missing; one
/// without a source value is missing only when required.
#[must_use]
pub fn missing_reference(references: &[Reference], row: &MappingRow) -> Option<String> {
    for reference in references {
        let resolved = row.reference(&reference.name);
        let source = resolved.and_then(|r| r.source.as_deref());
        let target = resolved.and_then(|r| r.target.as_deref());
        match (source, target) {
            (Some(source), None) => {
                return Some(format!("Missing {} for {source}", reference.mapped_column()));
            }
            (None, _) if reference.required => {
                return Some(format!("Missing {}", reference.source_column()));
            }
            _ => {}
        }
    }
    None
}
