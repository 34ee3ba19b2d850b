//! Open-to-closed transition detection and aggregate counting.

use std::collections::HashMap;

use crate::models::epic::{EpicSnapshot, IssueState, SubIssue};
use crate::models::snapshot::{CompletionEvent, Counts};

/// Remembers the last observed state of every sub-issue of one epic.
///
/// A completion is emitted only when an issue was previously observed in
/// a non-closed state and is now closed. First sightings never complete,
/// and repeated closed observations are silent.
#[derive(Debug, Default, Clone)]
pub struct CompletionDetector {
    previous: HashMap<u64, IssueState>,
}

impl CompletionDetector {
    /// Detector with no history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Detector primed from a known snapshot, so issues already closed in it
    /// are not reported again.
    #[must_use]
    pub fn seeded(snapshot: &EpicSnapshot) -> Self {
        let mut detector = Self::new();
        detector.observe(&snapshot.sub_issues);
        detector
    }

    /// Number of issues with recorded state.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.previous.len()
    }

    /// Compare against the previous observation and record the new one.
    pub fn detect(&mut self, issues: &[SubIssue]) -> Vec<CompletionEvent> {
        let mut events = Vec::new();
        for issue in issues {
            let before = self.previous.insert(issue.number, issue.state);
            if issue.state == IssueState::Closed
                && before.is_some_and(|state| state != IssueState::Closed)
            {
                events.push(CompletionEvent {
                    issue_number: issue.number,
                    title: issue.title.clone(),
                    phase: issue.phase,
                });
            }
        }
        events
    }

    fn observe(&mut self, issues: &[SubIssue]) {
        for issue in issues {
            self.previous.insert(issue.number, issue.state);
        }
    }
}

/// Tally sub-issues into aggregate counts.
///
/// When `gate_phase` is set, open unassigned issues in a later phase are
/// counted as blocked rather than queued.
#[must_use]
pub fn aggregate_counts(snapshot: &EpicSnapshot, gate_phase: Option<u32>) -> Counts {
    let mut counts = Counts::default();
    for issue in &snapshot.sub_issues {
        if !issue.is_open() {
            counts.completed += 1;
        } else if issue.has_pr() {
            counts.ready += 1;
        } else if issue.has_active_worker() {
            counts.in_progress += 1;
        } else if matches!((gate_phase, issue.phase), (Some(gate), Some(phase)) if phase > gate) {
            counts.blocked += 1;
        } else {
            counts.queued += 1;
        }
    }
    counts
}
