/// Merge candidate selection.
///
/// Within each partition the active parts are lined up by block range. A
/// candidate is a window of at least two neighbouring, unclaimed parts whose
/// combined row count stays within the policy limit. The smallest candidate
/// wins; among equals the one holding the oldest blocks, then the one that
/// removes more parts.
use config::MergePolicy;
use part::PartName;
use std::collections::{BTreeMap, HashSet};

use crate::PartStore;

/// Parts to merge together, in block order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCandidate {
    pub parts: Vec<PartName>,
    pub rows: u64,
}

impl MergeCandidate {
    /// Name of the part the merge produces.
    pub fn output(&self) -> anyhow::Result<PartName> {
        PartName::merged(&self.parts)
    }
}

#[derive(Debug, Clone)]
pub struct MergeSelector {
    policy: MergePolicy,
}

impl MergeSelector {
    #[must_use]
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    /// Picks the next merge among `parts` (active parts with row counts),
    /// ignoring any part in `claimed`. Pure: same input, same answer.
    #[must_use]
    pub fn select(&self, parts: &[(PartName, u64)], claimed: &HashSet<PartName>) -> Option<MergeCandidate> {
        let max_parts = self.policy.max_parts_per_merge.max(2);
        let mut by_partition: BTreeMap<&str, Vec<&(PartName, u64)>> = BTreeMap::new();
        for p in parts {
            by_partition.entry(p.0.partition.as_str()).or_default().push(p);
        }

        let mut best: Option<MergeCandidate> = None;
        for (_, mut list) in by_partition {
            if list.len() < self.policy.min_parts_to_merge.max(2) {
                continue;
            }
            list.sort_by(|a, b| a.0.cmp(&b.0));

            // Claimed parts split the line into independent runs.
            for run in list.split(|p| claimed.contains(&p.0)) {
                for start in 0..run.len() {
                    let mut rows = 0u64;
                    for end in start..run.len().min(start + max_parts) {
                        rows = rows.saturating_add(run[end].1);
                        if rows > self.policy.max_merge_rows {
                            break;
                        }
                        if end == start {
                            continue;
                        }
                        let candidate = MergeCandidate {
                            parts: run[start..=end].iter().map(|p| p.0.clone()).collect(),
                            rows,
                        };
                        if best.as_ref().map_or(true, |b| better(&candidate, b)) {
                            best = Some(candidate);
                        }
                    }
                }
            }
        }
        best
    }
}

fn better(a: &MergeCandidate, b: &MergeCandidate) -> bool {
    let oldest = |c: &MergeCandidate| c.parts.first().map_or(u64::MAX, |p| p.min_block);
    (a.rows, oldest(a), std::cmp::Reverse(a.parts.len())) < (b.rows, oldest(b), std::cmp::Reverse(b.parts.len()))
}

impl PartStore {
    /// Next merge for this store's active parts, skipping claimed ones.
    #[must_use]
    pub fn select_merge(&self, selector: &MergeSelector) -> Option<MergeCandidate> {
        selector.select(&self.active_part_rows(), &self.claimed())
    }
}
