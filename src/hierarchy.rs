//! Parent/child ordering for self-referential entities (sub-customers,
//! sub-accounts, ...). A record's level is its distance from the root of its
//! parent chain; level `n` is only posted after level `n - 1` finished.
use std::collections::HashMap;

use crate::entity::SourceRecord;

/// Levels of every record, in input order.
///
/// Parents missing from `records` count as already migrated, so their
/// children land on level 0. Records on a parent cycle are put on level 0
/// as well and logged; QuickBooks will reject whichever one needs a parent
/// that does not exist yet.
#[must_use]
pub fn compute_levels(records: &[SourceRecord]) -> Vec<(String, u32)> {
    let parents: HashMap<&str, Option<&str>> = records
        .iter()
        .map(|r| (r.source_id.as_str(), r.parent_id.as_deref().filter(|p| !p.is_empty())))
        .collect();
    let mut levels: HashMap<&str, u32> = HashMap::with_capacity(records.len());

    for record in records {
        let start = record.source_id.as_str();
        if levels.contains_key(start) {
            continue;
        }

        // Walk up until a known level, a root, or a node already on the path.
        let mut path: Vec<&str> = vec![start];
        let mut base = loop {
            let current = path[path.len() - 1];
            match parents.get(current).copied().flatten() {
                Some(parent) if levels.contains_key(parent) => break levels[parent] + 1,
                Some(parent) if path.contains(&parent) => {
                    log::warn!(
                        "Parent cycle through {parent}, placing {} records on level 0",
                        path.len()
                    );
                    for id in &path {
                        levels.insert(*id, 0);
                    }
                    path.clear();
                    break 0;
                }
                Some(parent) if parents.contains_key(parent) => path.push(parent),
                _ => break 0,
            }
        };

        for id in path.into_iter().rev() {
            levels.insert(id, base);
            base += 1;
        }
    }

    records
        .iter()
        .map(|r| (r.source_id.clone(), levels.get(r.source_id.as_str()).copied().unwrap_or(0)))
        .collect()
}
