//! Reconciliation primitives.
//!
//! This library provides helpers for loops that converge current state
//! toward desired state. Key concepts:
//!
//! - **Desired state**: what the authority says should be active.
//! - **Current state**: what the local process believes is active.
//! - **Convergence**: adding what is missing and removing what is extra.
//!
//! # Invariants
//!
//! - Diffs are symmetric: either side may be a superset of the other
//! - Decisions are deterministic given the same inputs
//! - Items present on both sides are never touched

use std::collections::BTreeSet;

/// Convergence status reported by a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Current state matches desired state.
    Converged,

    /// Some operations failed; the next pass will retry them.
    Converging,

    /// Desired state could not be determined (authority unreachable).
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// The result of diffing current state against desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<T> {
    /// Present in desired, absent in current.
    pub to_add: Vec<T>,

    /// Present in current, absent in desired.
    pub to_remove: Vec<T>,

    /// Present on both sides.
    pub unchanged: Vec<T>,
}

impl<T> SetDiff<T> {
    /// Returns true if nothing needs to change.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

impl<T> Default for SetDiff<T> {
    fn default() -> Self {
        Self {
            to_add: Vec::new(),
            to_remove: Vec::new(),
            unchanged: Vec::new(),
        }
    }
}

/// Diff two sets.
///
/// Output vectors are in ascending order.
pub fn diff<T>(current: &BTreeSet<T>, desired: &BTreeSet<T>) -> SetDiff<T>
where
    T: Ord + Clone,
{
    SetDiff {
        to_add: desired.difference(current).cloned().collect(),
        to_remove: current.difference(desired).cloned().collect(),
        unchanged: current.intersection(desired).cloned().collect(),
    }
}

/// Diff two lists, preserving the order in which items appear.
///
/// `to_add` follows the order of `desired`; `to_remove` and `unchanged`
/// follow the order of `current`. Duplicates in `desired` are collapsed.
pub fn diff_ordered<T>(current: &[T], desired: &[T]) -> SetDiff<T>
where
    T: Ord + Clone,
{
    let current_set: BTreeSet<&T> = current.iter().collect();
    let desired_set: BTreeSet<&T> = desired.iter().collect();

    let mut seen = BTreeSet::new();
    let to_add = desired
        .iter()
        .filter(|item| !current_set.contains(item) && seen.insert(*item))
        .cloned()
        .collect();

    let (unchanged, to_remove): (Vec<T>, Vec<T>) = current
        .iter()
        .cloned()
        .partition(|item| desired_set.contains(item));

    SetDiff {
        to_add,
        to_remove,
        unchanged,
    }
}
