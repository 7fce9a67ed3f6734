//! Collection resynchronization planning.
//!
//! Reconciling a stale cached collection with an authoritative snapshot
//! must replay the difference as the incremental events an observer would
//! have seen: removals first, then insertions, never touching kept
//! elements. The plan is computed with a longest-common-subsequence diff
//! over the element rids, bounded to the differing middle by trimming the
//! common prefix and suffix.

use serde_json::Value;

use crate::bus::EventPayload;
use crate::client::{ClientInner, Effect, Effects, State};
use crate::error::{Error, Result};
use crate::resource::Resource;

/// The reconciliation plan for current order `a` → snapshot order `b`.
pub(crate) struct DiffPlan {
    /// Kept elements as `(index in a, index in b)` pairs, ascending.
    pub keeps: Vec<(usize, usize)>,
    /// Indices in `a` to remove, in descending order. Removing in this
    /// order keeps each index valid against the live list, and the index
    /// at removal time is the index observers see.
    pub removes: Vec<usize>,
    /// Insertions as `(final index, index in b)`, ascending. Applied after
    /// all removals, each insertion lands at its final position.
    pub inserts: Vec<(usize, usize)>,
}

/// Computes the diff plan from `a` to `b`.
pub(crate) fn diff(a: &[String], b: &[String]) -> DiffPlan {
    // Trim the common prefix and suffix so the LCS table only covers the
    // differing middle.
    let max_prefix = a.len().min(b.len());
    let mut prefix = 0;
    while prefix < max_prefix && a[prefix] == b[prefix] {
        prefix += 1;
    }
    let max_suffix = max_prefix - prefix;
    let mut suffix = 0;
    while suffix < max_suffix && a[a.len() - 1 - suffix] == b[b.len() - 1 - suffix] {
        suffix += 1;
    }

    let mid_a = &a[prefix..a.len() - suffix];
    let mid_b = &b[prefix..b.len() - suffix];
    let (n, m) = (mid_a.len(), mid_b.len());

    // LCS length table over the middle.
    let mut table = vec![vec![0usize; m + 1]; n + 1];
    for i in 1..=n {
        for j in 1..=m {
            table[i][j] = if mid_a[i - 1] == mid_b[j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }

    let mut keeps: Vec<(usize, usize)> = (0..prefix).map(|i| (i, i)).collect();
    let mut mid_keeps = Vec::new();
    let mut removes = Vec::new();
    let mut inserts = Vec::new();

    // Backtrack. On equal table values the removal branch wins, so a
    // remove always lands before an add competing for the same position.
    let (mut i, mut j) = (n, m);
    while i > 0 || j > 0 {
        if i > 0 && j > 0 && mid_a[i - 1] == mid_b[j - 1] {
            mid_keeps.push((prefix + i - 1, prefix + j - 1));
            i -= 1;
            j -= 1;
        } else if i > 0 && (j == 0 || table[i - 1][j] >= table[i][j - 1]) {
            removes.push(prefix + i - 1);
            i -= 1;
        } else {
            inserts.push((prefix + j - 1, prefix + j - 1));
            j -= 1;
        }
    }

    mid_keeps.reverse();
    keeps.extend(mid_keeps);
    keeps.extend((0..suffix).rev().map(|k| (a.len() - 1 - k, b.len() - 1 - k)));
    inserts.reverse();

    DiffPlan {
        keeps,
        removes,
        inserts,
    }
}

// ─── Snapshot application ─────────────────────────────────────────────────

impl ClientInner {
    /// Reconciles a stale cached resource with a fresh snapshot.
    ///
    /// A model resynchronizes through the change-event path. A collection
    /// resynchronizes by replaying the diff plan: nested updates for kept
    /// elements first, then removals, then insertions, leaving observers in
    /// the same state as the equivalent incremental events would have.
    pub(crate) fn sync_resource(
        &self,
        st: &mut State,
        effects: &mut Effects,
        rid: &str,
        payload: &Value,
    ) -> Result<()> {
        let item = st
            .cache
            .get(rid)
            .and_then(|e| e.item.clone())
            .ok_or_else(|| Error::cache(format!("resynchronizing {rid} with no cached item")))?;

        match (&item, payload) {
            (Resource::Model(_), Value::Object(_)) => {
                self.handle_change(st, effects, rid, Some(payload))
            }
            (Resource::Collection(coll), Value::Array(elems)) => {
                let coll = coll.clone();

                let mut b_rids = Vec::with_capacity(elems.len());
                let mut b_data: Vec<Option<&Value>> = Vec::with_capacity(elems.len());
                for elem in elems {
                    let child_rid = elem
                        .get("rid")
                        .and_then(Value::as_str)
                        .ok_or_else(|| Error::protocol("collection element carries no rid"))?;
                    b_rids.push(child_rid.to_string());
                    b_data.push(elem.get("data").filter(|d| !d.is_null()));
                }

                let a_rids = coll.rids();
                let plan = diff(&a_rids, &b_rids);

                for (_, b_idx) in &plan.keeps {
                    if let Some(data) = b_data[*b_idx] {
                        self.ingest_snapshot(st, effects, &b_rids[*b_idx], data, false)?;
                    }
                }
                for idx in &plan.removes {
                    self.remove_child_at(st, effects, &coll, rid, *idx)?;
                }
                for (idx, b_idx) in &plan.inserts {
                    let elem = &elems[*b_idx];
                    let model = self.ingest_element(st, effects, elem)?;
                    coll.insert(*idx, model.clone())?;
                    effects.push(Effect::emit(
                        rid,
                        "add",
                        EventPayload::Add {
                            item: model,
                            idx: *idx,
                        },
                    ));
                }
                Ok(())
            }
            _ => Err(Error::protocol(format!(
                "resource type inconsistency for {rid}: snapshot shape does not match cached kind"
            ))),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
