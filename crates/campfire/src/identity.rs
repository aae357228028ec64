use rand::Rng;

use crate::model::{Millis, Participant, TabId, UserId};

const FIRST_NAMES: [&str; 4] = ["Alice", "Bob", "Charlie", "Diana"];
const LAST_NAMES: [&str; 4] = ["Smith", "Brown", "Lee", "Johnson"];

/// Who this replica is. Generated once at startup and never changed; there
/// is no persistence, so restarting a tab produces a brand new identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaIdentity {
    pub tab_id: TabId,
    pub user_id: UserId,
    pub display_name: String,
}

impl ReplicaIdentity {
    pub fn generate() -> Self {
        let tab_id = TabId::generate();
        let user_id = UserId::for_tab(&tab_id);
        Self {
            tab_id,
            user_id,
            display_name: random_display_name(),
        }
    }

    /// Roster entry for this replica, stamped with the given activity time.
    pub fn participant(&self, now: Millis) -> Participant {
        Participant {
            id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            last_activity: now,
            tab_id: self.tab_id.clone(),
        }
    }
}

fn random_display_name() -> String {
    let mut rng = rand::thread_rng();
    let first = FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())];
    let last = LAST_NAMES[rng.gen_range(0..LAST_NAMES.len())];
    format!("{first} {last}")
}
