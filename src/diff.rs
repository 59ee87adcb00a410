//! Diff engine: `generate` and `apply`.
//!
//! `generate` compares the fingerprints of the stored rows with a freshly
//! loaded, hashed result and produces an [`EditScript`]. Rows are matched by
//! content hash first; unmatched new rows are then classified as copies,
//! key-correlated changes, or additions. Among rows matched by hash, the
//! longest run that kept its relative order stays put and every other
//! matched row is reported as a move.
//!
//! `apply` replays a script against the concrete old rows. For every pair of
//! sequences, `apply(old, generate(&fingerprints(old), new))` yields `new`.

use crate::changeset::{AddedRow, ChangedRow, CopiedRow, EditScript, MovedRow, RemovedRow};
use crate::error::{LiveError, Result};
use crate::row::{HashedRow, RowKey};
use std::collections::{HashMap, VecDeque};

/// Hash and key of one stored row, all `generate` needs from the old side.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub hash: String,
    pub key: RowKey,
}

pub fn fingerprints(rows: &[HashedRow]) -> Vec<Fingerprint> {
    rows.iter()
        .map(|r| Fingerprint {
            hash: r.hash.clone(),
            key: r.key.clone(),
        })
        .collect()
}

/// Compute the edit script turning `old` into `new`. Returns `None` when the
/// sequences are identical.
pub fn generate(old: &[Fingerprint], new: &[HashedRow]) -> Option<EditScript> {
    let mut consumed = vec![false; old.len()];
    let mut matched: Vec<Option<usize>> = vec![None; new.len()];

    // Same position, same content.
    for (j, row) in new.iter().enumerate() {
        if old.get(j).is_some_and(|o| o.hash == row.hash) {
            consumed[j] = true;
            matched[j] = Some(j);
        }
    }

    let mut by_hash: HashMap<&str, VecDeque<usize>> = HashMap::new();
    for (i, fp) in old.iter().enumerate() {
        by_hash.entry(fp.hash.as_str()).or_default().push_back(i);
    }

    for (j, row) in new.iter().enumerate() {
        if matched[j].is_some() {
            continue;
        }
        if let Some(queue) = by_hash.get_mut(row.hash.as_str()) {
            while let Some(i) = queue.pop_front() {
                if !consumed[i] {
                    consumed[i] = true;
                    matched[j] = Some(i);
                    break;
                }
            }
        }
    }

    let mut by_key: HashMap<&RowKey, VecDeque<usize>> = HashMap::new();
    for (i, fp) in old.iter().enumerate() {
        if !consumed[i] {
            by_key.entry(&fp.key).or_default().push_back(i);
        }
    }
    let first_by_hash: HashMap<&str, usize> = old
        .iter()
        .enumerate()
        .rev()
        .map(|(i, fp)| (fp.hash.as_str(), i))
        .collect();

    let mut script = EditScript::new();

    for (j, row) in new.iter().enumerate() {
        if matched[j].is_some() {
            continue;
        }
        if let Some(&from) = first_by_hash.get(row.hash.as_str()) {
            script.copied.push(CopiedRow { from, to: j });
            continue;
        }
        let old_index = by_key
            .get_mut(&row.key)
            .and_then(|queue| queue.pop_front());
        match old_index {
            Some(old_index) => {
                consumed[old_index] = true;
                script.changed.push(ChangedRow {
                    old_index,
                    index: j,
                    row: row.clone(),
                });
            }
            None => script.added.push(AddedRow {
                index: j,
                row: row.clone(),
            }),
        }
    }

    for (i, fp) in old.iter().enumerate() {
        if !consumed[i] {
            script.removed.push(RemovedRow {
                index: i,
                hash: fp.hash.clone(),
                key: fp.key.clone(),
            });
        }
    }

    let pairs: Vec<(usize, usize)> = matched
        .iter()
        .enumerate()
        .filter_map(|(j, m)| m.map(|i| (i, j)))
        .collect();
    let olds: Vec<usize> = pairs.iter().map(|&(i, _)| i).collect();
    let stable = longest_increasing(&olds);
    for (pos, &(from, to)) in pairs.iter().enumerate() {
        if !stable[pos] {
            script.moved.push(MovedRow {
                key: new[to].key.clone(),
                from,
                to,
            });
        }
    }

    if script.is_empty() {
        None
    } else {
        Some(script)
    }
}

/// Marks the members of one longest strictly increasing subsequence.
fn longest_increasing(values: &[usize]) -> Vec<bool> {
    // tails[k]: position of the smallest tail of an increasing run of length k+1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; values.len()];

    for (pos, &v) in values.iter().enumerate() {
        let k = tails.partition_point(|&t| values[t] < v);
        if k > 0 {
            prev[pos] = Some(tails[k - 1]);
        }
        if k == tails.len() {
            tails.push(pos);
        } else {
            tails[k] = pos;
        }
    }

    let mut keep = vec![false; values.len()];
    let mut cursor = tails.last().copied();
    while let Some(pos) = cursor {
        keep[pos] = true;
        cursor = prev[pos];
    }
    keep
}

/// Replay `script` against `old`.
pub fn apply(old: &[HashedRow], script: &EditScript) -> Result<Vec<HashedRow>> {
    let len = script
        .result_len(old.len())
        .ok_or_else(|| LiveError::Diff(format!(
            "{} removals from {} rows",
            script.removed.len(),
            old.len()
        )))?;

    let mut slots: Vec<Option<HashedRow>> = vec![None; len];
    let mut taken = vec![false; old.len()];

    let take = |taken: &mut Vec<bool>, i: usize, what: &str| -> Result<()> {
        match taken.get_mut(i) {
            Some(flag) if !*flag => {
                *flag = true;
                Ok(())
            }
            Some(_) => Err(LiveError::Diff(format!("old row {i} used twice ({what})"))),
            None => Err(LiveError::Diff(format!("old row {i} out of range ({what})"))),
        }
    };
    let place = |slots: &mut Vec<Option<HashedRow>>, to: usize, row: HashedRow| -> Result<()> {
        match slots.get_mut(to) {
            Some(slot) if slot.is_none() => {
                *slot = Some(row);
                Ok(())
            }
            Some(_) => Err(LiveError::Diff(format!("two rows placed at index {to}"))),
            None => Err(LiveError::Diff(format!("index {to} beyond result length {len}"))),
        }
    };
    let old_row = |i: usize| {
        old.get(i)
            .cloned()
            .ok_or_else(|| LiveError::Diff(format!("old row {i} out of range")))
    };

    for removed in &script.removed {
        take(&mut taken, removed.index, "removed")?;
    }
    for changed in &script.changed {
        take(&mut taken, changed.old_index, "changed")?;
        place(&mut slots, changed.index, changed.row.clone())?;
    }
    for moved in &script.moved {
        take(&mut taken, moved.from, "moved")?;
        place(&mut slots, moved.to, old_row(moved.from)?)?;
    }
    for added in &script.added {
        place(&mut slots, added.index, added.row.clone())?;
    }
    for copied in &script.copied {
        place(&mut slots, copied.to, old_row(copied.from)?)?;
    }

    let mut remaining = old
        .iter()
        .zip(&taken)
        .filter(|(_, taken)| !**taken)
        .map(|(row, _)| row);
    for slot in slots.iter_mut().filter(|s| s.is_none()) {
        let row = remaining
            .next()
            .ok_or_else(|| LiveError::Diff("not enough rows to fill the result".into()))?;
        *slot = Some(row.clone());
    }
    if remaining.next().is_some() {
        return Err(LiveError::Diff("old rows left over after apply".into()));
    }

    Ok(slots.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::row_from_value;
    use proptest::prelude::*;
    use serde_json::json;

    fn row(id: i64, name: &str) -> HashedRow {
        HashedRow::new(
            row_from_value(json!({"id": id, "name": name})),
            RowKey::new(id.to_string()),
        )
    }

    fn round_trip(old: &[HashedRow], new: &[HashedRow]) -> Option<EditScript> {
        let script = generate(&fingerprints(old), new);
        match &script {
            Some(s) => assert_eq!(apply(old, s).unwrap(), new),
            None => assert_eq!(old, new),
        }
        script
    }

    #[test]
    fn test_identical_sequences_yield_none() {
        let rows = vec![row(1, "a"), row(2, "b")];
        assert!(generate(&fingerprints(&rows), &rows).is_none());
        assert!(generate(&[], &[]).is_none());
    }

    #[test]
    fn test_insert_into_empty() {
        let script = round_trip(&[], &[row(1, "a")]).unwrap();
        assert_eq!(script.added.len(), 1);
        assert_eq!(script.added[0].index, 0);
        assert!(script.removed.is_empty() && script.moved.is_empty() && script.changed.is_empty());
    }

    #[test]
    fn test_change_correlated_by_key() {
        let script = round_trip(&[row(1, "a")], &[row(1, "b")]).unwrap();
        assert!(script.added.is_empty());
        assert!(script.removed.is_empty());
        assert_eq!(script.changed.len(), 1);
        assert_eq!(script.changed[0].row.data["name"], json!("b"));
    }

    #[test]
    fn test_delete_last_row() {
        let script = round_trip(&[row(1, "b")], &[]).unwrap();
        assert_eq!(script.removed.len(), 1);
        assert_eq!(script.removed[0].index, 0);
    }

    #[test]
    fn test_insert_in_middle_is_not_a_move() {
        let old = vec![row(1, "a"), row(3, "c")];
        let new = vec![row(1, "a"), row(2, "b"), row(3, "c")];
        let script = round_trip(&old, &new).unwrap();
        assert_eq!(script.added.len(), 1);
        assert_eq!(script.added[0].index, 1);
        assert!(script.moved.is_empty());
    }

    #[test]
    fn test_swap_reports_one_move() {
        let old = vec![row(1, "a"), row(2, "b"), row(3, "c")];
        let new = vec![row(3, "c"), row(1, "a"), row(2, "b")];
        let script = round_trip(&old, &new).unwrap();
        assert_eq!(script.moved.len(), 1);
        assert_eq!(script.moved[0].key, RowKey::new("3"));
        assert_eq!((script.moved[0].from, script.moved[0].to), (2, 0));
    }

    #[test]
    fn test_duplicate_content_is_a_copy() {
        let old = vec![row(1, "a")];
        let new = vec![row(1, "a"), row(1, "a")];
        let script = round_trip(&old, &new).unwrap();
        assert!(script.added.is_empty());
        assert_eq!(script.copied, vec![CopiedRow { from: 0, to: 1 }]);
    }

    #[test]
    fn test_mixed_edit() {
        let old = vec![row(1, "a"), row(2, "b"), row(3, "c"), row(4, "d")];
        let new = vec![row(4, "d"), row(2, "B"), row(5, "e"), row(1, "a")];
        let script = round_trip(&old, &new).unwrap();
        assert_eq!(script.removed.len(), 1);
        assert_eq!(script.removed[0].key, RowKey::new("3"));
        assert_eq!(script.changed.len(), 1);
        assert_eq!(script.added.len(), 1);
        assert_eq!(script.moved.len(), 1);
    }

    #[test]
    fn test_apply_rejects_bad_scripts() {
        let old = vec![row(1, "a")];

        let mut out_of_range = EditScript::new();
        out_of_range.moved.push(MovedRow {
            key: RowKey::new("1"),
            from: 5,
            to: 0,
        });
        assert!(matches!(apply(&old, &out_of_range), Err(LiveError::Diff(_))));

        let mut collision = EditScript::new();
        collision.added.push(AddedRow { index: 0, row: row(2, "b") });
        collision.added.push(AddedRow { index: 0, row: row(3, "c") });
        assert!(apply(&old, &collision).is_err());

        let mut too_many = EditScript::new();
        for _ in 0..2 {
            too_many.removed.push(RemovedRow {
                index: 0,
                hash: old[0].hash.clone(),
                key: old[0].key.clone(),
            });
        }
        assert!(apply(&old, &too_many).is_err());
    }

    #[test]
    fn test_longest_increasing() {
        assert_eq!(longest_increasing(&[]), Vec::<bool>::new());
        assert_eq!(longest_increasing(&[0, 1, 2]), vec![true, true, true]);
        let keep = longest_increasing(&[2, 0, 1]);
        assert_eq!(keep.iter().filter(|k| **k).count(), 2);
        assert!(!keep[0]);
    }

    fn rows_strategy() -> impl Strategy<Value = Vec<HashedRow>> {
        prop::collection::vec((0i64..6, 0i64..3), 0..8).prop_map(|pairs| {
            pairs
                .into_iter()
                .map(|(id, v)| {
                    HashedRow::new(
                        row_from_value(json!({"id": id, "v": v})),
                        RowKey::from_value(&json!(id)),
                    )
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_apply_generate_round_trips(old in rows_strategy(), new in rows_strategy()) {
            match generate(&fingerprints(&old), &new) {
                Some(script) => prop_assert_eq!(apply(&old, &script).unwrap(), new),
                None => prop_assert_eq!(old, new),
            }
        }
    }
}
