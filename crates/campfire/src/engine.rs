use crate::model::{
    ChatMessage, CounterState, MessageId, Millis, Participant, SessionSnapshot, UserId,
};
use crate::protocol::ParticipantUpdate;

/// Which slice of session state a mutation touched. Emitted to observers so
/// presentation can re-read just that slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Roster,
    Messages,
    Counter,
    Typing,
}

/// One replica's authoritative view of the session.
///
/// Every mutation is an id-keyed reducer: insert if absent, remove if
/// present, or overwrite. The transport may redeliver any event, so each
/// reducer must leave the state unchanged when applied a second time.
/// Reducers return whether they changed anything; callers use that to decide
/// whether observers need waking.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub participants: Vec<Participant>,
    pub messages: Vec<ChatMessage>,
    pub counter: CounterState,
    pub typing: Vec<UserId>,
}

impl SessionState {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            participants: self.participants.clone(),
            messages: self.messages.clone(),
            counter: self.counter.clone(),
            typing: self.typing.clone(),
        }
    }

    pub fn insert_participant(&mut self, participant: Participant) -> bool {
        if self
            .participants
            .iter()
            .any(|known| known.id == participant.id)
        {
            return false;
        }
        self.participants.push(participant);
        true
    }

    pub fn remove_participant(&mut self, user_id: &UserId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|known| known.id != *user_id);
        before != self.participants.len()
    }

    /// Merges a partial update into the matching roster entry. An update for
    /// an id we have not seen yet is dropped; the full entry arrives later
    /// via a join or sync snapshot.
    pub fn merge_participant(&mut self, update: &ParticipantUpdate) -> bool {
        match self
            .participants
            .iter_mut()
            .find(|known| known.id == update.id)
        {
            Some(entry) => {
                update.apply_to(entry);
                true
            }
            None => false,
        }
    }

    pub fn append_message(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|known| known.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn remove_message(&mut self, message_id: &MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|known| known.id != *message_id);
        before != self.messages.len()
    }

    /// Overwrites the counter with a broadcast absolute value. Last arrival
    /// wins; the timestamp is stamped from this replica's clock, not the
    /// sender's.
    pub fn set_counter(&mut self, value: i64, display_name: &str, now: Millis) {
        self.counter = CounterState {
            value,
            last_updated_by: Some(display_name.to_string()),
            last_updated_at: Some(now),
        };
    }

    pub fn begin_typing(&mut self, user_id: &UserId) -> bool {
        if self.typing.contains(user_id) {
            return false;
        }
        self.typing.push(user_id.clone());
        true
    }

    pub fn end_typing(&mut self, user_id: &UserId) -> bool {
        let before = self.typing.len();
        self.typing.retain(|known| known != user_id);
        before != self.typing.len()
    }

    /// Folds a catch-up snapshot from another replica into local state.
    ///
    /// Roster entries union-merge, keeping the existing entry on conflict.
    /// Messages and counter are adopted only while the local message log is
    /// empty, so the first responder to populate it wins and later replies
    /// cannot clobber history. Typing ids union in, minus self.
    pub fn adopt_snapshot(
        &mut self,
        snapshot: SessionSnapshot,
        self_id: &UserId,
    ) -> Vec<StateChange> {
        let mut changes = Vec::new();

        let mut roster_changed = false;
        for participant in snapshot.participants {
            roster_changed |= self.insert_participant(participant);
        }
        if roster_changed {
            changes.push(StateChange::Roster);
        }

        if self.messages.is_empty() {
            let gained_messages = !snapshot.messages.is_empty();
            let counter_differs = snapshot.counter != self.counter;
            self.messages = snapshot.messages;
            self.counter = snapshot.counter;
            if gained_messages {
                changes.push(StateChange::Messages);
            }
            if counter_differs {
                changes.push(StateChange::Counter);
            }
        }

        let mut typing_changed = false;
        for user_id in snapshot.typing {
            if user_id != *self_id {
                typing_changed |= self.begin_typing(&user_id);
            }
        }
        if typing_changed {
            changes.push(StateChange::Typing);
        }

        changes
    }

    /// Drops participants whose last activity is older than `threshold`.
    /// Self never decays; its entry is refreshed by local intents.
    pub fn sweep_stale_participants(
        &mut self,
        now: Millis,
        threshold: Millis,
        self_id: &UserId,
    ) -> bool {
        let before = self.participants.len();
        self.participants.retain(|known| {
            known.id == *self_id || now.saturating_sub(known.last_activity) < threshold
        });
        before != self.participants.len()
    }

    pub fn sweep_expired_messages(&mut self, now: Millis) -> bool {
        let before = self.messages.len();
        self.messages.retain(|known| !known.is_expired(now));
        before != self.messages.len()
    }
}
