//! De-duplication of human-unique fields (DocNumber, AcctNum, ...).
//!
//! QuickBooks rejects a second object with the same unique value, while
//! source systems happily keep several. Every row with a value gets a
//! `Duplicate_<field>` assignment once: the first live row of a group keeps
//! the value, later live rows get a numbered variant and soft-deleted rows a
//! `-del` tag. Assignments are never recomputed.
use std::collections::{BTreeMap, HashSet};

use crate::store::{MappingStore, StoreResult, UniqueValueRow};

/// Longest unique value that still takes a `-NN` suffix.
pub const SUFFIX_MAX_LEN: usize = 18;
/// QuickBooks' DocNumber limit.
pub const DOC_NUMBER_MAX_LEN: usize = 21;

/// Numbered variant `i` of `value`: `1001-02`, or for long values the first
/// two characters replaced by the counter.
#[must_use]
pub fn numbered_variant(value: &str, i: usize) -> String {
    if value.chars().count() <= SUFFIX_MAX_LEN {
        format!("{value}-{i:02}")
    } else {
        let rest: String = value.chars().skip(2).collect();
        format!("{i:02}{rest}").chars().take(DOC_NUMBER_MAX_LEN).collect()
    }
}

/// Whether some row has a unique value but no assignment yet.
#[must_use]
pub fn needs_dedup(rows: &[UniqueValueRow]) -> bool {
    rows.iter().any(|row| clean(row.value.as_deref()).is_some() && row.duplicate.is_none())
}

fn clean(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Assignments for every row that has a value and no duplicate yet, as
/// `(source_id, duplicate_value)` in row order.
#[must_use]
pub fn plan_duplicates(rows: &[UniqueValueRow]) -> Vec<(String, String)> {
    let mut used: HashSet<String> = rows
        .iter()
        .flat_map(|row| [clean(row.value.as_deref()), row.duplicate.as_deref()])
        .flatten()
        .map(str::to_lowercase)
        .collect();

    let mut groups: BTreeMap<&str, Vec<&UniqueValueRow>> = BTreeMap::new();
    let mut order: Vec<&str> = Vec::new();
    for row in rows {
        if let Some(value) = clean(row.value.as_deref()) {
            let group = groups.entry(value).or_default();
            if group.is_empty() {
                order.push(value);
            }
            group.push(row);
        }
    }

    let mut planned = Vec::new();
    for value in order {
        let group = &groups[value];
        let mut keeper_taken = group
            .iter()
            .any(|row| !row.is_deleted && row.duplicate.as_deref() == Some(value));
        let deleted_total = group.iter().filter(|row| row.is_deleted).count();
        let mut live_counter = 0;
        let mut deleted_counter = 0;

        for row in group {
            if row.duplicate.is_some() {
                continue;
            }
            let assigned = if row.is_deleted {
                let tag = format!("{value}-del");
                if deleted_total == 1 && group.len() > 1 && used.insert(tag.to_lowercase()) {
                    tag
                } else if group.len() > 1 {
                    next_free(&mut used, |i| format!("{value}-del{i:02}"), &mut deleted_counter)
                } else {
                    value.to_string()
                }
            } else if !keeper_taken {
                keeper_taken = true;
                value.to_string()
            } else {
                next_free(&mut used, |i| numbered_variant(value, i), &mut live_counter)
            };
            if assigned != value {
                log::warn!("Unique value {value:?} of {} becomes {assigned:?}", row.source_id);
            }
            planned.push((row.source_id.clone(), assigned));
        }
    }
    planned
}

/// First candidate from `make` not yet in `used` (case-insensitively),
/// advancing `counter` past every attempt.
fn next_free(
    used: &mut HashSet<String>,
    make: impl Fn(usize) -> String,
    counter: &mut usize,
) -> String {
    loop {
        *counter += 1;
        let candidate = make(*counter);
        if used.insert(candidate.to_lowercase()) {
            return candidate;
        }
    }
}

/// Reads the unique values of `Map_<entity>`, plans the missing assignments
/// and writes them. Returns the number of rows assigned.
pub async fn apply_dedup(store: &dyn MappingStore, entity: &str) -> StoreResult<usize> {
    let rows = store.unique_values(entity).await?;
    if !needs_dedup(&rows) {
        return Ok(0);
    }
    let planned = plan_duplicates(&rows);
    store.write_duplicate_values(entity, &planned).await?;
    log::info!("{entity}: assigned {} unique values", planned.len());
    Ok(planned.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, value: Option<&str>, deleted: bool) -> UniqueValueRow {
        UniqueValueRow {
            source_id: id.to_string(),
            value: value.map(String::from),
            duplicate: None,
            is_deleted: deleted,
        }
    }

    fn assigned(planned: &[(String, String)], id: &str) -> Option<String> {
        planned.iter().find(|(source, _)| source == id).map(|(_, v)| v.clone())
    }

    #[test]
    fn numbered_variants_respect_length() {
        assert_eq!(numbered_variant("1001", 2), "1001-02");
        let long = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        let variant = numbered_variant(long, 3);
        assert_eq!(variant, "03CDEFGHIJKLMNOPQRSTU");
        assert_eq!(variant.len(), DOC_NUMBER_MAX_LEN);
    }

    #[test]
    fn first_live_row_keeps_value() {
        let rows = vec![
            row("1", Some("1001"), false),
            row("2", Some("1001"), false),
            row("3", Some("1001"), false),
            row("4", Some("2002"), false),
            row("5", None, false),
        ];
        let planned = plan_duplicates(&rows);
        assert_eq!(assigned(&planned, "1").as_deref(), Some("1001"));
        assert_eq!(assigned(&planned, "2").as_deref(), Some("1001-01"));
        assert_eq!(assigned(&planned, "3").as_deref(), Some("1001-02"));
        assert_eq!(assigned(&planned, "4").as_deref(), Some("2002"));
        assert_eq!(assigned(&planned, "5"), None);
    }

    #[test]
    fn deleted_rows_get_del_tags() {
        let single = plan_duplicates(&[row("1", Some("A1"), true), row("2", Some("A1"), false)]);
        assert_eq!(assigned(&single, "1").as_deref(), Some("A1-del"));
        assert_eq!(assigned(&single, "2").as_deref(), Some("A1"));

        let several = plan_duplicates(&[
            row("1", Some("A1"), true),
            row("2", Some("A1"), false),
            row("3", Some("A1"), true),
        ]);
        assert_eq!(assigned(&several, "1").as_deref(), Some("A1-del01"));
        assert_eq!(assigned(&several, "3").as_deref(), Some("A1-del02"));
        assert_eq!(assigned(&several, "2").as_deref(), Some("A1"));
    }

    #[test]
    fn variants_avoid_existing_values() {
        let rows = vec![
            row("1", Some("1001"), false),
            row("2", Some("1001"), false),
            row("3", Some("1001-01"), false),
        ];
        let planned = plan_duplicates(&rows);
        assert_eq!(assigned(&planned, "2").as_deref(), Some("1001-02"));
        assert_eq!(assigned(&planned, "3").as_deref(), Some("1001-01"));
    }

    #[test]
    fn existing_assignments_are_kept() {
        let mut keeper = row("1", Some("1001"), false);
        keeper.duplicate = Some("1001".into());
        let rows = vec![keeper, row("2", Some("1001"), false)];
        assert!(needs_dedup(&rows));
        let planned = plan_duplicates(&rows);
        assert_eq!(planned, vec![("2".to_string(), "1001-01".to_string())]);

        let mut done = rows.clone();
        done[1].duplicate = Some("1001-01".into());
        assert!(!needs_dedup(&done));
        assert!(plan_duplicates(&done).is_empty());
    }
}
