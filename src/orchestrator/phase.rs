//! Derived phase status and phase advancement rules.

use std::collections::HashSet;

use crate::models::epic::{EpicSnapshot, Phase, PhaseStatus};

/// Compute display status and counts for every phase, ordered by number.
///
/// Tracker `completed`/`skipped` always wins. Otherwise a phase whose
/// sub-issues are all closed is completed, one with an open PR is ready,
/// one with an active worker is in progress, and the rest are not started.
#[must_use]
pub fn derive_phases(snapshot: &EpicSnapshot) -> Vec<Phase> {
    let mut phases: Vec<Phase> = snapshot
        .epic
        .phases
        .iter()
        .map(|phase| {
            let issues: Vec<_> = snapshot.phase_issues(phase.number).collect();
            let total_count = issues.len();
            let completed_count = issues.iter().filter(|issue| !issue.is_open()).count();
            let open = || issues.iter().filter(|issue| issue.is_open());

            let status = if phase.status.is_done() {
                phase.status
            } else if total_count > 0 && completed_count == total_count {
                PhaseStatus::Completed
            } else if open().any(|issue| issue.has_pr()) {
                PhaseStatus::Ready
            } else if open().any(|issue| issue.has_active_worker()) {
                PhaseStatus::InProgress
            } else {
                PhaseStatus::NotStarted
            };

            Phase {
                number: phase.number,
                name: phase.name.clone(),
                status,
                completed_count,
                total_count,
            }
        })
        .collect();
    phases.sort_by_key(|phase| phase.number);
    phases
}

/// Lowest-numbered phase that is neither completed nor skipped.
#[must_use]
pub fn current_phase(phases: &[Phase]) -> Option<u32> {
    phases
        .iter()
        .filter(|phase| !phase.status.is_done())
        .map(|phase| phase.number)
        .min()
}

/// Phase after `number` in ordinal order.
#[must_use]
pub fn next_phase(phases: &[Phase], number: u32) -> Option<u32> {
    phases
        .iter()
        .map(|phase| phase.number)
        .filter(|n| *n > number)
        .min()
}

/// Phase the caller may start next: the current phase, if nothing in it
/// has started yet.
#[must_use]
pub fn eligible_phase(phases: &[Phase]) -> Option<u32> {
    let current = current_phase(phases)?;
    phases
        .iter()
        .find(|phase| phase.number == current && phase.status == PhaseStatus::NotStarted)
        .map(|phase| phase.number)
}

/// Phases that are done in `after` but were not done in `before`.
#[must_use]
pub fn newly_completed(before: &[Phase], after: &[Phase]) -> Vec<u32> {
    let done_before: HashSet<u32> = before
        .iter()
        .filter(|phase| phase.status.is_done())
        .map(|phase| phase.number)
        .collect();
    after
        .iter()
        .filter(|phase| phase.status == PhaseStatus::Completed && !done_before.contains(&phase.number))
        .map(|phase| phase.number)
        .collect()
}

/// Phases whose last open sub-issues are all in `merged`.
///
/// A phase qualifies only if at least one of its open issues was merged;
/// phases already fully closed in `snapshot` are not reported again.
#[must_use]
pub fn phases_closed_by(snapshot: &EpicSnapshot, merged: &HashSet<u64>) -> Vec<u32> {
    let mut numbers: Vec<u32> = snapshot
        .sub_issues
        .iter()
        .filter_map(|issue| issue.phase)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    numbers.sort_unstable();

    numbers
        .into_iter()
        .filter(|&number| {
            let mut open = snapshot.phase_issues(number).filter(|issue| issue.is_open()).peekable();
            open.peek().is_some() && open.all(|issue| merged.contains(&issue.number))
        })
        .collect()
}
