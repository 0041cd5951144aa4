//! Participant scope resolution and double-booking detection.
//!
//! A participant may only be live in one active (`in_progress` or `paused`)
//! activity at a time. `all` scopes are expanded against the roster at call
//! time, so roster changes never require re-saving a scope.

use crate::error::{ConflictingUser, OrchestratorError};
use crate::model::{ParticipantScope, UserRef};
use std::collections::BTreeSet;

/// Resolved participants of one active activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveAssignment {
    pub activity_id: String,
    pub participant_ids: BTreeSet<UserRef>,
}

pub fn resolve(scope: &ParticipantScope, roster: &BTreeSet<UserRef>) -> BTreeSet<UserRef> {
    match scope {
        ParticipantScope::All => roster.clone(),
        ParticipantScope::Custom { participant_ids } => participant_ids.clone(),
    }
}

/// Every participant of `candidate` that is already assigned to another
/// activity in `active`, sorted by user then activity.
pub fn find_conflicts<'a, I>(
    candidate: &BTreeSet<UserRef>,
    excluding: &str,
    active: I,
) -> Vec<ConflictingUser>
where
    I: IntoIterator<Item = &'a ActiveAssignment>,
{
    let mut conflicts: Vec<ConflictingUser> = active
        .into_iter()
        .filter(|assignment| assignment.activity_id != excluding)
        .flat_map(|assignment| {
            candidate
                .intersection(&assignment.participant_ids)
                .map(|user_id| ConflictingUser {
                    user_id: user_id.clone(),
                    activity_id: assignment.activity_id.clone(),
                })
                .collect::<Vec<_>>()
        })
        .collect();
    conflicts.sort();
    conflicts
}

/// `Ok` when no conflicts; otherwise a `ScopeConflict` naming the first
/// activity the candidate collides with.
pub fn check_conflicts<'a, I>(
    candidate: &BTreeSet<UserRef>,
    excluding: &str,
    active: I,
) -> Result<(), OrchestratorError>
where
    I: IntoIterator<Item = &'a ActiveAssignment>,
{
    let conflicting_users = find_conflicts(candidate, excluding, active);
    match conflicting_users.first() {
        None => Ok(()),
        Some(first) => Err(OrchestratorError::ScopeConflict {
            active_activity_id: first.activity_id.clone(),
            conflicting_users,
        }),
    }
}

/// Pairwise check across a set of assignments, used when the roster changes
/// underneath already-active activities.
pub fn check_assignments(assignments: &[ActiveAssignment]) -> Result<(), OrchestratorError> {
    for (i, assignment) in assignments.iter().enumerate() {
        check_conflicts(
            &assignment.participant_ids,
            &assignment.activity_id,
            &assignments[i + 1..],
        )?;
    }
    Ok(())
}
