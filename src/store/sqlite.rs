//! SQLite-backed [`MappingStore`].
//!
//! The mapping schema is an attached database: `:memory:` for in-memory
//! stores, `<dir>/<schema>.sqlite` otherwise. Tables live at
//! `"<schema>"."Map_<Entity>"`. All SQL runs on the blocking pool.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use rusqlite::{
    params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension, Row,
};
use tokio::task;

use super::{
    MappingRow, MappingStore, PorterStatus, ResolvedRef, StatusUpdate, StoreError, StoreResult,
    TableLayout, UniqueValueRow,
};
use crate::entity::{Reference, SourceRecord};

const BASE_COLUMNS: &str = "Source_Id, Target_Id, Porter_Status, Retry_Count, Failure_Reason, \
                            Payload_JSON, Level, Is_Deleted, Parent_Id, Parent_Target_Id";
/// Columns added after the first table layout; older tables get them on ensure.
const PARENT_COLUMNS: [&str; 2] = ["Parent_Id", "Parent_Target_Id"];

pub struct SqliteMappingStore {
    conn: Arc<Mutex<Connection>>,
    schema: String,
    dir: Option<PathBuf>,
}

impl SqliteMappingStore {
    /// Store whose mapping schema lives in memory.
    pub fn open_in_memory(schema: &str) -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, schema, None)
    }

    /// Store whose mapping schema is the file `<dir>/<schema>.sqlite`.
    pub fn open_dir(dir: impl AsRef<Path>, schema: &str) -> StoreResult<Self> {
        Self::from_connection(
            Connection::open_in_memory()?,
            schema,
            Some(dir.as_ref().to_path_buf()),
        )
    }

    /// Wraps an existing connection, e.g. one that already holds the source
    /// tables as its main database.
    pub fn from_connection(
        conn: Connection,
        schema: &str,
        dir: Option<PathBuf>,
    ) -> StoreResult<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            schema: ident(schema)?.to_string(),
            dir,
        })
    }

    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let schema = self.schema.clone();
        task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard, &schema)
        })
        .await?
    }
}

// ============================================================================
// Identifiers and layout
// ============================================================================

fn ident(name: &str) -> StoreResult<&str> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

fn table_name(entity: &str) -> StoreResult<String> {
    Ok(format!("Map_{}", ident(entity)?))
}

fn qualified(schema: &str, entity: &str) -> StoreResult<String> {
    Ok(format!("\"{schema}\".\"{}\"", table_name(entity)?))
}

fn columns(conn: &Connection, schema: &str, entity: &str) -> StoreResult<Vec<String>> {
    let sql = format!("PRAGMA \"{schema}\".table_info(\"{}\")", table_name(entity)?);
    let mut stmt = conn.prepare(&sql)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

fn table_exists(conn: &Connection, schema: &str, entity: &str) -> StoreResult<bool> {
    let sql =
        format!("SELECT 1 FROM \"{schema}\".sqlite_master WHERE type = 'table' AND name = ?1");
    Ok(conn
        .query_row(&sql, params![table_name(entity)?], |_| Ok(()))
        .optional()?
        .is_some())
}

/// Reference and unique-field columns present on the table.
fn read_layout(conn: &Connection, schema: &str, entity: &str) -> StoreResult<TableLayout> {
    let columns = columns(conn, schema, entity)?;
    let has = |name: &str| columns.iter().any(|c| c == name);
    let references = columns
        .iter()
        .filter_map(|c| c.strip_prefix("Source_"))
        .filter(|name| *name != "Id" && has(&format!("Mapped_{name}")))
        .map(String::from)
        .collect();
    let unique_field = columns
        .iter()
        .filter_map(|c| c.strip_prefix("Duplicate_"))
        .find(|field| has(field))
        .map(String::from);
    Ok(TableLayout {
        references,
        unique_field,
    })
}

fn select_list(layout: &TableLayout) -> String {
    let mut select = BASE_COLUMNS.to_string();
    for name in &layout.references {
        select.push_str(&format!(", \"Source_{name}\", \"Mapped_{name}\""));
    }
    if let Some(field) = &layout.unique_field {
        select.push_str(&format!(", \"{field}\", \"Duplicate_{field}\""));
    }
    select
}

fn map_row(row: &Row<'_>, layout: &TableLayout) -> rusqlite::Result<(MappingRow, String)> {
    let status: String = row.get(2)?;
    let mut mapped = MappingRow {
        source_id: row.get(0)?,
        target_id: row.get(1)?,
        status: PorterStatus::Ready,
        retry_count: row.get(3)?,
        failure_reason: row.get(4)?,
        payload_json: row.get(5)?,
        level: row.get(6)?,
        is_deleted: row.get(7)?,
        parent_id: row.get(8)?,
        parent_target_id: row.get(9)?,
        references: BTreeMap::new(),
        unique_value: None,
        duplicate_value: None,
    };
    let mut index = 10;
    for name in &layout.references {
        mapped.references.insert(
            name.clone(),
            ResolvedRef {
                source: row.get(index)?,
                target: row.get(index + 1)?,
            },
        );
        index += 2;
    }
    if layout.unique_field.is_some() {
        mapped.unique_value = row.get(index)?;
        mapped.duplicate_value = row.get(index + 1)?;
    }
    Ok((mapped, status))
}

fn query_rows(
    conn: &Connection,
    schema: &str,
    entity: &str,
    filter: &str,
    args: Vec<SqlValue>,
) -> StoreResult<Vec<MappingRow>> {
    let layout = read_layout(conn, schema, entity)?;
    let sql = format!(
        "SELECT {} FROM {} WHERE {filter}",
        select_list(&layout),
        qualified(schema, entity)?
    );
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map(params_from_iter(args), |row| map_row(row, &layout))?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter()
        .map(|(mut row, status)| {
            row.status = status.parse()?;
            Ok(row)
        })
        .collect()
}

// ============================================================================
// SQL operations (synchronous)
// ============================================================================

fn ensure_table(
    conn: &Connection,
    schema: &str,
    dir: Option<&Path>,
    entity: &str,
    layout: &TableLayout,
) -> StoreResult<()> {
    let attached = {
        let mut stmt = conn.prepare("PRAGMA database_list")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        names.iter().any(|name| name == schema)
    };
    if !attached {
        let location = match dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                dir.join(format!("{schema}.sqlite")).to_string_lossy().into_owned()
            }
            None => ":memory:".to_string(),
        };
        log::info!("Attaching mapping schema {schema} at {location}");
        conn.execute(&format!("ATTACH DATABASE ?1 AS \"{schema}\""), params![location])?;
    }

    let table = qualified(schema, entity)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            Source_Id TEXT PRIMARY KEY,
            Target_Id TEXT NULL,
            Porter_Status TEXT NOT NULL DEFAULT 'Ready',
            Retry_Count INTEGER NOT NULL DEFAULT 0,
            Failure_Reason TEXT NULL,
            Payload_JSON TEXT NULL,
            Level INTEGER NOT NULL DEFAULT 0,
            Is_Deleted INTEGER NOT NULL DEFAULT 0,
            Parent_Id TEXT NULL,
            Parent_Target_Id TEXT NULL
        );"
    ))?;

    let existing = columns(conn, schema, entity)?;
    let mut wanted: Vec<String> = PARENT_COLUMNS.iter().map(|c| (*c).to_string()).collect();
    for name in &layout.references {
        ident(name)?;
        wanted.push(format!("Source_{name}"));
        wanted.push(format!("Mapped_{name}"));
    }
    if let Some(field) = &layout.unique_field {
        ident(field)?;
        wanted.push(field.clone());
        wanted.push(format!("Duplicate_{field}"));
    }
    for column in wanted {
        if !existing.contains(&column) {
            log::info!("Adding column {column} to {table}");
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN \"{column}\" TEXT NULL"), [])?;
        }
    }
    Ok(())
}

fn seed(
    conn: &mut Connection,
    schema: &str,
    entity: &str,
    records: &[SourceRecord],
) -> StoreResult<usize> {
    let layout = read_layout(conn, schema, entity)?;
    let mut columns = vec![
        "Source_Id".to_string(),
        "Is_Deleted".to_string(),
        "Parent_Id".to_string(),
    ];
    if let Some(field) = &layout.unique_field {
        columns.push(format!("\"{field}\""));
    }
    columns.extend(layout.references.iter().map(|name| format!("\"Source_{name}\"")));
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT OR IGNORE INTO {} ({}) VALUES ({placeholders})",
        qualified(schema, entity)?,
        columns.join(", ")
    );

    let text = |value: Option<&String>| value.map_or(SqlValue::Null, |v| SqlValue::Text(v.clone()));
    let tx = conn.transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(&sql)?;
        for record in records {
            let mut values = vec![
                SqlValue::Text(record.source_id.clone()),
                SqlValue::Integer(i64::from(record.is_deleted)),
                text(record.parent_id.as_ref()),
            ];
            if layout.unique_field.is_some() {
                values.push(text(record.unique_value.as_ref()));
            }
            for name in &layout.references {
                values.push(text(record.references.get(name)));
            }
            inserted += stmt.execute(params_from_iter(values))?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

fn resolve(
    conn: &Connection,
    schema: &str,
    entity: &str,
    references: &[Reference],
) -> StoreResult<()> {
    let table = qualified(schema, entity)?;
    let parents = conn.execute(
        &format!(
            "UPDATE {table} AS t SET Parent_Target_Id = (
                SELECT p.Target_Id FROM {table} AS p
                WHERE p.Source_Id = t.Parent_Id AND p.Target_Id IS NOT NULL
             )
             WHERE t.Parent_Id IS NOT NULL AND t.Parent_Target_Id IS NULL"
        ),
        [],
    )?;
    log::debug!("{table}: resolved Parent_Target_Id on {parents} rows");

    for reference in references {
        ident(&reference.name)?;
        if !table_exists(conn, schema, &reference.entity)? {
            log::warn!(
                "{table}: sibling table for {} ({}) does not exist yet, leaving {} unresolved",
                reference.name,
                reference.entity,
                reference.mapped_column()
            );
            continue;
        }
        let sibling = qualified(schema, &reference.entity)?;
        let source = reference.source_column();
        let mapped = reference.mapped_column();
        let updated = conn.execute(
            &format!(
                "UPDATE {table} AS t SET \"{mapped}\" = (
                    SELECT m.Target_Id FROM {sibling} AS m
                    WHERE m.Source_Id = t.\"{source}\" AND m.Target_Id IS NOT NULL
                 )
                 WHERE t.\"{source}\" IS NOT NULL AND t.\"{mapped}\" IS NULL"
            ),
            [],
        )?;
        log::debug!("{table}: resolved {mapped} on {updated} rows");
    }
    Ok(())
}

fn write_updates(
    conn: &mut Connection,
    schema: &str,
    entity: &str,
    updates: &[StatusUpdate],
) -> StoreResult<()> {
    let table = qualified(schema, entity)?;
    let done_sql = format!(
        "UPDATE {table} SET Porter_Status = ?1, Target_Id = ?2, Failure_Reason = NULL
         WHERE Source_Id = ?3"
    );
    let failed_sql = format!(
        "UPDATE {table} SET Porter_Status = 'Failed', Failure_Reason = ?1,
             Retry_Count = Retry_Count + ?2
         WHERE Source_Id = ?3 AND Target_Id IS NULL"
    );
    let other_sql = format!(
        "UPDATE {table} SET Porter_Status = ?1, Failure_Reason = ?2
         WHERE Source_Id = ?3 AND Target_Id IS NULL"
    );

    let tx = conn.transaction()?;
    {
        let mut done = tx.prepare(&done_sql)?;
        let mut failed = tx.prepare(&failed_sql)?;
        let mut other = tx.prepare(&other_sql)?;
        for update in updates {
            match update.status {
                PorterStatus::Success | PorterStatus::Exists => {
                    let Some(target_id) = &update.target_id else {
                        log::warn!(
                            "{table}: ignoring {} for {} without a Target_Id",
                            update.status,
                            update.source_id
                        );
                        continue;
                    };
                    done.execute(params![update.status.as_str(), target_id, update.source_id])?;
                }
                PorterStatus::Failed => {
                    failed.execute(params![
                        update.failure_reason,
                        i64::from(update.increment_retry),
                        update.source_id
                    ])?;
                }
                PorterStatus::Ready | PorterStatus::Skipped => {
                    other.execute(params![
                        update.status.as_str(),
                        update.failure_reason,
                        update.source_id
                    ])?;
                }
            }
        }
    }
    tx.commit()?;
    Ok(())
}

fn set_column_values(
    conn: &mut Connection,
    schema: &str,
    entity: &str,
    column: &str,
    only_if_null: bool,
    values: &[(String, SqlValue)],
) -> StoreResult<()> {
    let guard = if only_if_null {
        format!(" AND \"{column}\" IS NULL")
    } else {
        String::new()
    };
    let sql = format!(
        "UPDATE {} SET \"{column}\" = ?1 WHERE Source_Id = ?2{guard}",
        qualified(schema, entity)?
    );
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&sql)?;
        for (source_id, value) in values {
            stmt.execute(params![value, source_id])?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn status_placeholders(statuses: &[PorterStatus], args: &mut Vec<SqlValue>) -> String {
    let start = args.len();
    args.extend(statuses.iter().map(|s| SqlValue::Text(s.as_str().to_string())));
    (start + 1..=args.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl MappingStore for SqliteMappingStore {
    async fn ensure_schema_and_table(&self, entity: &str, layout: &TableLayout) -> StoreResult<()> {
        let entity = entity.to_string();
        let layout = layout.clone();
        let dir = self.dir.clone();
        self.run(move |conn, schema| ensure_table(conn, schema, dir.as_deref(), &entity, &layout))
            .await
    }

    async fn seed_from_source(&self, entity: &str, records: &[SourceRecord]) -> StoreResult<usize> {
        let entity = entity.to_string();
        let records = records.to_vec();
        let inserted = self
            .run(move |conn, schema| seed(conn, schema, &entity, &records))
            .await?;
        Ok(inserted)
    }

    async fn resolve_references(&self, entity: &str, references: &[Reference]) -> StoreResult<()> {
        let entity = entity.to_string();
        let references = references.to_vec();
        self.run(move |conn, schema| resolve(conn, schema, &entity, &references))
            .await
    }

    async fn fetch_eligible(
        &self,
        entity: &str,
        statuses: &[PorterStatus],
        retry_cap: u32,
        level: Option<u32>,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<MappingRow>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let entity = entity.to_string();
        let statuses = statuses.to_vec();
        let after = after.map(String::from);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn, schema| {
            let mut args = Vec::new();
            let placeholders = status_placeholders(&statuses, &mut args);
            args.push(SqlValue::Integer(i64::from(retry_cap)));
            let mut filter = format!(
                "Porter_Status IN ({placeholders}) AND Retry_Count < ?{}",
                args.len()
            );
            if let Some(level) = level {
                args.push(SqlValue::Integer(i64::from(level)));
                filter.push_str(&format!(" AND Level = ?{}", args.len()));
            }
            if let Some(after) = after {
                args.push(SqlValue::Text(after));
                filter.push_str(&format!(" AND Source_Id > ?{}", args.len()));
            }
            args.push(SqlValue::Integer(limit));
            filter.push_str(&format!(" ORDER BY Source_Id LIMIT ?{}", args.len()));
            query_rows(conn, schema, &entity, &filter, args)
        })
        .await
    }

    async fn fetch_missing_payloads(
        &self,
        entity: &str,
        retry_cap: u32,
        level: Option<u32>,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<MappingRow>> {
        let entity = entity.to_string();
        let after = after.map(String::from);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn, schema| {
            let mut args = vec![SqlValue::Integer(i64::from(retry_cap))];
            let mut filter = "Porter_Status IN ('Ready', 'Failed') AND Target_Id IS NULL \
                              AND Payload_JSON IS NULL AND Retry_Count < ?1"
                .to_string();
            if let Some(level) = level {
                args.push(SqlValue::Integer(i64::from(level)));
                filter.push_str(&format!(" AND Level = ?{}", args.len()));
            }
            if let Some(after) = after {
                args.push(SqlValue::Text(after));
                filter.push_str(&format!(" AND Source_Id > ?{}", args.len()));
            }
            args.push(SqlValue::Integer(limit));
            filter.push_str(&format!(" ORDER BY Source_Id LIMIT ?{}", args.len()));
            query_rows(conn, schema, &entity, &filter, args)
        })
        .await
    }

    async fn store_payloads(&self, entity: &str, payloads: &[(String, String)]) -> StoreResult<()> {
        let entity = entity.to_string();
        let values = payloads
            .iter()
            .map(|(id, payload)| (id.clone(), SqlValue::Text(payload.clone())))
            .collect::<Vec<_>>();
        self.run(move |conn, schema| {
            set_column_values(conn, schema, &entity, "Payload_JSON", true, &values)
        })
        .await
    }

    async fn replace_payload(
        &self,
        entity: &str,
        source_id: &str,
        payload: &str,
    ) -> StoreResult<()> {
        let entity = entity.to_string();
        let source_id = source_id.to_string();
        let payload = payload.to_string();
        self.run(move |conn, schema| {
            let table = qualified(schema, &entity)?;
            let prior: Option<String> = conn
                .query_row(
                    &format!("SELECT Payload_JSON FROM {table} WHERE Source_Id = ?1"),
                    params![source_id],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            log::info!(
                "{table}: regenerating payload for {source_id}; previous payload: {}",
                prior.as_deref().unwrap_or("<none>")
            );
            conn.execute(
                &format!("UPDATE {table} SET Payload_JSON = ?1 WHERE Source_Id = ?2"),
                params![payload, source_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn fetch_fallback_candidates(
        &self,
        entity: &str,
        retry_cap: u32,
    ) -> StoreResult<Vec<MappingRow>> {
        let entity = entity.to_string();
        self.run(move |conn, schema| {
            query_rows(
                conn,
                schema,
                &entity,
                "Porter_Status = 'Failed' AND Target_Id IS NULL AND Payload_JSON IS NOT NULL \
                 AND Retry_Count < ?1 ORDER BY rowid",
                vec![SqlValue::Integer(i64::from(retry_cap))],
            )
        })
        .await
    }

    async fn write_status(&self, entity: &str, update: &StatusUpdate) -> StoreResult<()> {
        self.write_status_bulk(entity, std::slice::from_ref(update)).await
    }

    async fn write_status_bulk(&self, entity: &str, updates: &[StatusUpdate]) -> StoreResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let entity = entity.to_string();
        let updates = updates.to_vec();
        self.run(move |conn, schema| write_updates(conn, schema, &entity, &updates))
            .await
    }

    async fn unique_values(&self, entity: &str) -> StoreResult<Vec<UniqueValueRow>> {
        let entity = entity.to_string();
        self.run(move |conn, schema| {
            let Some(field) = read_layout(conn, schema, &entity)?.unique_field else {
                return Ok(Vec::new());
            };
            let sql = format!(
                "SELECT Source_Id, \"{field}\", \"Duplicate_{field}\", Is_Deleted
                 FROM {} ORDER BY rowid",
                qualified(schema, &entity)?
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(UniqueValueRow {
                        source_id: row.get(0)?,
                        value: row.get(1)?,
                        duplicate: row.get(2)?,
                        is_deleted: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn write_duplicate_values(
        &self,
        entity: &str,
        values: &[(String, String)],
    ) -> StoreResult<()> {
        let entity = entity.to_string();
        let values = values
            .iter()
            .map(|(id, value)| (id.clone(), SqlValue::Text(value.clone())))
            .collect::<Vec<_>>();
        self.run(move |conn, schema| {
            let Some(field) = read_layout(conn, schema, &entity)?.unique_field else {
                log::warn!("Map_{entity} has no unique field, dropping duplicate values");
                return Ok(());
            };
            set_column_values(conn, schema, &entity, &format!("Duplicate_{field}"), false, &values)
        })
        .await
    }

    async fn write_levels(&self, entity: &str, levels: &[(String, u32)]) -> StoreResult<()> {
        let entity = entity.to_string();
        let values = levels
            .iter()
            .map(|(id, level)| (id.clone(), SqlValue::Integer(i64::from(*level))))
            .collect::<Vec<_>>();
        self.run(move |conn, schema| {
            set_column_values(conn, schema, &entity, "Level", false, &values)
        })
        .await
    }

    async fn levels(&self, entity: &str) -> StoreResult<Vec<u32>> {
        let entity = entity.to_string();
        self.run(move |conn, schema| {
            let table = qualified(schema, &entity)?;
            let sql = format!("SELECT DISTINCT Level FROM {table} ORDER BY Level");
            let mut stmt = conn.prepare(&sql)?;
            let levels = stmt
                .query_map([], |row| row.get::<_, u32>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(levels)
        })
        .await
    }

    async fn fetch_row(&self, entity: &str, source_id: &str) -> StoreResult<Option<MappingRow>> {
        let entity = entity.to_string();
        let source_id = source_id.to_string();
        let rows = self
            .run(move |conn, schema| {
                query_rows(conn, schema, &entity, "Source_Id = ?1", vec![SqlValue::Text(source_id)])
            })
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn row_count(&self, entity: &str) -> StoreResult<usize> {
        let entity = entity.to_string();
        self.run(move |conn, schema| {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", qualified(schema, &entity)?),
                [],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
        .await
    }

    async fn rebuild(&self, entity: &str) -> StoreResult<()> {
        let entity = entity.to_string();
        self.run(move |conn, schema| {
            let table = qualified(schema, &entity)?;
            let removed = conn.execute(&format!("DELETE FROM {table}"), [])?;
            log::warn!("{table}: rebuilt, removed {removed} rows");
            Ok(())
        })
        .await
    }

    async fn status_counts(&self, entity: &str) -> StoreResult<BTreeMap<PorterStatus, usize>> {
        let entity = entity.to_string();
        self.run(move |conn, schema| {
            let sql = format!(
                "SELECT Porter_Status, COUNT(*) FROM {} GROUP BY Porter_Status",
                qualified(schema, &entity)?
            );
            let mut stmt = conn.prepare(&sql)?;
            let raw = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut counts = BTreeMap::new();
            for (status, count) in raw {
                counts.insert(status.parse()?, usize::try_from(count).unwrap_or_default());
            }
            Ok(counts)
        })
        .await
    }
}
