//! Lifecycle phase and the per-aggregate lifecycle assistant.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateId;
use crate::clock::Clock;
use crate::message::{Message, MessageDraft, MessageOrigin};

/// Coarse state of an aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecyclePhase {
    /// Created but never enabled.
    #[default]
    Uninitialized,
    /// Live.
    Enabled,
    /// Logically destroyed; only an explicit re-enable leaves this phase.
    Destroyed,
}

impl LifecyclePhase {
    /// Returns `true` if the aggregate may move from `self` to `next`.
    ///
    /// Nothing ever returns to `Uninitialized`; `Destroyed -> Enabled` is the
    /// explicit re-enable.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        !matches!(next, Self::Uninitialized) && self != next
    }

    /// Stable textual form, as persisted.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Enabled => "ENABLED",
            Self::Destroyed => "DESTROYED",
        }
    }

    /// Parses the persisted textual form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "UNINITIALIZED" => Some(Self::Uninitialized),
            "ENABLED" => Some(Self::Enabled),
            "DESTROYED" => Some(Self::Destroyed),
            _ => None,
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advances the lifecycle phase and assigns message sequence numbers.
///
/// Owned exclusively by its aggregate. `sequence` is the aggregate's `mn`:
/// the number of messages ever extracted with `flush`. Pending messages are
/// numbered `mn + 1, mn + 2, ...` in emission order, so the numbers they get
/// at emission are final.
#[derive(Debug, Default)]
pub struct LifecycleAssistant {
    phase: LifecyclePhase,
    sequence: i64,
    pending: Vec<Message>,
}

impl LifecycleAssistant {
    /// Restores an assistant from persisted phase and sequence.
    #[must_use]
    pub(crate) fn restore(phase: LifecyclePhase, sequence: i64) -> Self {
        Self {
            phase,
            sequence,
            pending: Vec::new(),
        }
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    /// Number of messages ever flushed (`mn`).
    #[must_use]
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Messages recorded but not yet flushed, in emission order.
    #[must_use]
    pub fn pending(&self) -> &[Message] {
        &self.pending
    }

    #[allow(clippy::cast_possible_wrap)]
    fn next_sequence_number(&self) -> i64 {
        self.sequence + self.pending.len() as i64 + 1
    }

    /// Moves to `next`. Returns `false` when already in `next`.
    pub(crate) fn advance(&mut self, next: LifecyclePhase) -> bool {
        if !self.phase.can_transition_to(next) {
            return false;
        }
        tracing::trace!(from = %self.phase, to = %next, "lifecycle phase advanced");
        self.phase = next;
        true
    }

    /// Stamps `draft` and appends it to the pending buffer.
    pub(crate) fn record(
        &mut self,
        draft: MessageDraft,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
        version: i64,
        clock: &dyn Clock,
    ) {
        let origin = MessageOrigin {
            aggregate_type: aggregate_type.to_owned(),
            aggregate_id: aggregate_id.clone(),
            aggregate_version: version,
            sequence_number: self.next_sequence_number(),
            phase: self.phase,
        };
        self.pending.push(draft.into_message(origin, clock.now()));
    }

    /// Returns the pending messages. With `flush`, the buffer is drained and
    /// `sequence` advances by the number drained.
    ///
    /// Messages recorded before the aggregate had an identity are stamped
    /// with `aggregate_id` on the way out.
    #[allow(clippy::cast_possible_wrap)]
    pub(crate) fn extract(&mut self, aggregate_id: &AggregateId, flush: bool) -> Vec<Message> {
        let mut messages = if flush {
            let drained = std::mem::take(&mut self.pending);
            self.sequence += drained.len() as i64;
            drained
        } else {
            self.pending.clone()
        };
        if !aggregate_id.is_unassigned() {
            for message in messages.iter_mut().filter(|m| m.aggregate_id.is_unassigned()) {
                message.aggregate_id = aggregate_id.clone();
            }
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_never_return_to_uninitialized() {
        assert!(LifecyclePhase::Uninitialized.can_transition_to(LifecyclePhase::Enabled));
        assert!(LifecyclePhase::Uninitialized.can_transition_to(LifecyclePhase::Destroyed));
        assert!(LifecyclePhase::Enabled.can_transition_to(LifecyclePhase::Destroyed));
        assert!(LifecyclePhase::Destroyed.can_transition_to(LifecyclePhase::Enabled));
        assert!(!LifecyclePhase::Enabled.can_transition_to(LifecyclePhase::Uninitialized));
        assert!(!LifecyclePhase::Destroyed.can_transition_to(LifecyclePhase::Destroyed));
    }

    #[test]
    fn test_phase_text_round_trips() {
        for phase in [
            LifecyclePhase::Uninitialized,
            LifecyclePhase::Enabled,
            LifecyclePhase::Destroyed,
        ] {
            assert_eq!(LifecyclePhase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(LifecyclePhase::parse("ARCHIVED"), None);
    }

    #[test]
    fn test_advance_to_current_phase_is_a_no_op() {
        let mut assistant = LifecycleAssistant::restore(LifecyclePhase::Destroyed, 4);

        assert!(!assistant.advance(LifecyclePhase::Destroyed));
        assert_eq!(assistant.phase(), LifecyclePhase::Destroyed);
        assert_eq!(assistant.sequence(), 4);
    }
}
