//! Remediation escalation
//!
//! Correlates reboot history with recurring failures. A failure that keeps
//! coming back after reboots escalates from [`RepairActionType::RebootSystem`]
//! to [`RepairActionType::HardwareInspection`].

use tracing::debug;

use crate::api::{Event, RepairActionType, SuggestedActions};
use crate::error::{Error, Result};

/// Threshold used when the caller passes a non-positive one
pub const DEFAULT_SEQUENCE_THRESHOLD: i32 = 2;

/// Recommend a repair action from reboot and failure histories
///
/// Both slices must be sorted by ascending time. A "sequence" is one reboot
/// followed by at least one failure before the next reboot; a failure at the
/// same instant as a reboot belongs to that reboot. Reaching
/// `sequence_threshold` sequences escalates to hardware inspection.
///
/// Returns `Ok(None)` when the earliest failure predates the earliest reboot,
/// since that reboot history cannot be correlated to these failures.
pub fn evaluate_suggested_actions(
    reboot_events: &[Event],
    failure_events: &[Event],
    sequence_threshold: i32,
) -> Result<Option<SuggestedActions>> {
    let Some(first_failure) = failure_events.first() else {
        return Err(Error::InvalidArgument(
            "no failure events to evaluate".to_string(),
        ));
    };

    let threshold = if sequence_threshold <= 0 {
        DEFAULT_SEQUENCE_THRESHOLD
    } else {
        sequence_threshold
    };

    let Some(first_reboot) = reboot_events.first() else {
        return Ok(Some(SuggestedActions::single(
            RepairActionType::RebootSystem,
            "failure detected and no reboot has been recorded, reboot the system",
        )));
    };

    if first_failure.time < first_reboot.time {
        debug!(
            first_failure = %first_failure.time,
            first_reboot = %first_reboot.time,
            "Earliest failure predates reboot history, no suggestion"
        );
        return Ok(None);
    }

    let sequences = count_sequences(reboot_events, failure_events);
    debug!(
        sequences,
        threshold,
        reboots = reboot_events.len(),
        failures = failure_events.len(),
        "Evaluated reboot and failure sequences"
    );

    if sequences >= threshold as usize {
        return Ok(Some(SuggestedActions::single(
            RepairActionType::HardwareInspection,
            format!(
                "failure recurred after {} reboots, inspect the hardware",
                sequences
            ),
        )));
    }

    Ok(Some(SuggestedActions::single(
        RepairActionType::RebootSystem,
        "failure recurred after fewer reboots than the escalation threshold, reboot the system",
    )))
}

/// Number of reboots followed by at least one failure before the next reboot
fn count_sequences(reboot_events: &[Event], failure_events: &[Event]) -> usize {
    let mut failures = failure_events.iter().peekable();
    let mut sequences = 0;

    for (i, reboot) in reboot_events.iter().enumerate() {
        let next_reboot = reboot_events.get(i + 1).map(|e| e.time);

        // Skip failures that happened before this reboot
        while failures.next_if(|f| f.time < reboot.time).is_some() {}

        let in_window = failures
            .peek()
            .is_some_and(|f| next_reboot.map_or(true, |next| f.time < next));
        if in_window {
            sequences += 1;
        }
    }

    sequences
}

/// Severity rank, higher wins during aggregation
fn priority(action: RepairActionType) -> u8 {
    match action {
        RepairActionType::HardwareInspection => 3,
        RepairActionType::RebootSystem => 2,
        RepairActionType::CheckUserAppAndGpu => 1,
        RepairActionType::IgnoreNoActionRequired => 0,
    }
}

/// Merge several recommendations into the single most severe action
///
/// Absent entries and entries without repair actions are ignored. The
/// description is taken from the first entry recommending the winning action.
pub fn aggregate_suggested_actions(
    suggestions: &[Option<SuggestedActions>],
) -> Option<SuggestedActions> {
    let candidates: Vec<&SuggestedActions> = suggestions
        .iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .collect();

    let chosen = candidates
        .iter()
        .flat_map(|s| s.repair_actions.iter().copied())
        .max_by_key(|action| priority(*action))?;

    let description = candidates
        .iter()
        .find(|s| s.repair_actions.contains(&chosen))
        .map(|s| s.description.clone())
        .unwrap_or_default();

    Some(SuggestedActions {
        description,
        repair_actions: vec![chosen],
    })
}
