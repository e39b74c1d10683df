//! Cross-instance advisory lock: a timestamped marker note on the issue.
//!
//! A fresh marker from another instance means the issue is owned elsewhere.
//! A marker older than the staleness threshold is treated as abandoned. The
//! read and the write are not atomic; the ledger's attempt ceiling bounds
//! the damage of two instances racing.

use chrono::{DateTime, Duration, Utc};

use crate::tracker::{IssueTracker, Note};

pub const IN_PROGRESS_MARKER: &str = "🤖 **Automated fix in progress**";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerState {
    /// No marker on the issue.
    Free,
    /// The newest marker was posted by this instance.
    Ours,
    /// The newest marker is older than the threshold.
    Stale { age_minutes: i64 },
    /// Another instance posted a marker recently.
    HeldElsewhere { started: DateTime<Utc>, age_minutes: i64 },
}

pub fn marker_text(module: &str, instance_id: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}\n\nModule: {}\nStarted: {}\nInstance: {}",
        IN_PROGRESS_MARKER,
        module,
        now.to_rfc3339(),
        instance_id
    )
}

/// Decide ownership from the notes on an issue. The newest marker decides.
pub fn inspect_markers(
    notes: &[Note],
    instance_id: &str,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> MarkerState {
    let Some(newest) = notes
        .iter()
        .filter(|n| n.text.contains(IN_PROGRESS_MARKER))
        .max_by_key(|n| n.date_created)
    else {
        return MarkerState::Free;
    };

    let age = now - newest.date_created;
    if age >= stale_after {
        return MarkerState::Stale {
            age_minutes: age.num_minutes(),
        };
    }
    if newest.text.contains(&format!("Instance: {}", instance_id)) {
        return MarkerState::Ours;
    }
    MarkerState::HeldElsewhere {
        started: newest.date_created,
        age_minutes: age.num_minutes(),
    }
}

/// Read the issue's markers. A failed read lets processing proceed rather
/// than block the issue forever.
pub async fn check(
    tracker: &dyn IssueTracker,
    issue_id: &str,
    instance_id: &str,
    stale_after: Duration,
) -> MarkerState {
    match tracker.list_notes(issue_id).await {
        Ok(notes) => inspect_markers(&notes, instance_id, Utc::now(), stale_after),
        Err(e) => {
            tracing::warn!(issue_id, error = %format!("{:#}", e), "Could not read notes, proceeding");
            MarkerState::Free
        }
    }
}

/// Post this instance's marker. Failure is logged; the ledger still guards
/// against repeated work.
pub async fn acquire(tracker: &dyn IssueTracker, issue_id: &str, module: &str, instance_id: &str) {
    let text = marker_text(module, instance_id, Utc::now());
    if let Err(e) = tracker.add_note(issue_id, &text).await {
        tracing::warn!(issue_id, error = %format!("{:#}", e), "Could not post in-progress marker");
    }
}
