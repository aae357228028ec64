use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, the only clock unit on the wire.
pub type Millis = u64;

/// Conventional session joined by every replica that is not told otherwise.
pub const DEFAULT_SESSION: &str = "campfire-lobby";

const ID_SUFFIX_LEN: usize = 9;
const ID_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Participant considered fully active below this age.
pub const ACTIVE_WITHIN_MS: Millis = 5_000;
/// Participant considered idle below this age, stale at or beyond it.
pub const IDLE_WITHIN_MS: Millis = 60_000;

pub fn now_ms() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as Millis)
        .unwrap_or(0)
}

/// Globally unique id: `<prefix>-<millis>-<random suffix>`. The timestamp
/// orders ids loosely; the suffix keeps same-millisecond ids from colliding
/// across replicas.
pub fn generate_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
        .collect();
    format!("{prefix}-{}-{suffix}", now_ms())
}

/// Identity of one replica (one tab). Fresh on every replica start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(pub String);

impl TabId {
    pub fn generate() -> Self {
        Self(generate_id("tab"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Roster key for a participant, derived from the tab id so a restarted tab
/// shows up as a brand new user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn for_tab(tab_id: &TabId) -> Self {
        Self(format!("user-{}", tab_id.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(generate_id("msg"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broadcast channel identifier. Replicas with different session ids never
/// see each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self(DEFAULT_SESSION.to_string())
    }
}

/// How recently a participant was seen doing something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Active,
    Idle,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub display_name: String,
    pub last_activity: Millis,
    pub tab_id: TabId,
}

impl Participant {
    pub fn touch(&mut self, now: Millis) {
        self.last_activity = now;
    }

    pub fn presence(&self, now: Millis) -> Presence {
        let age = now.saturating_sub(self.last_activity);
        if age < ACTIVE_WITHIN_MS {
            Presence::Active
        } else if age < IDLE_WITHIN_MS {
            Presence::Idle
        } else {
            Presence::Stale
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender: UserId,
    pub sender_name: String,
    pub content: String,
    pub created_at: Millis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Millis>,
}

impl ChatMessage {
    pub fn is_expired(&self, now: Millis) -> bool {
        self.expires_at.map_or(false, |deadline| now >= deadline)
    }
}

/// The shared scalar. `value` is an absolute, not a delta; whichever update
/// arrives last at a replica wins there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterState {
    pub value: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<Millis>,
}

/// Full session view exchanged during late-joiner catch-up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub participants: Vec<Participant>,
    pub messages: Vec<ChatMessage>,
    pub counter: CounterState,
    pub typing: Vec<UserId>,
}

/// Roster in presentation order: self first, then most recently active,
/// ties broken by id so the order is stable across replicas.
pub fn sorted_roster(participants: &[Participant], self_id: &UserId) -> Vec<Participant> {
    let mut roster = participants.to_vec();
    roster.sort_by(|a, b| {
        let a_self = a.id == *self_id;
        let b_self = b.id == *self_id;
        b_self
            .cmp(&a_self)
            .then(b.last_activity.cmp(&a.last_activity))
            .then(a.id.cmp(&b.id))
    });
    roster
}
