//! Campfire: a serverless session engine shared by every tab of an
//! application on one machine.
//!
//! Responsibilities:
//! - keeping a roster, chat log, shared counter, and typing set converging
//!   across replicas over an unordered at-least-once broadcast bus
//! - catching late joiners up through a request/response snapshot exchange
//! - decaying soft state on timers: silent participants, expired messages,
//!   abandoned typing indicators
//!
//! There is no coordinator. Every replica applies the same idempotent,
//! id-keyed reducers to whatever arrives, in whatever order it arrives.

pub mod config;
pub mod engine;
pub mod identity;
pub mod model;
pub mod protocol;
pub mod replica;
pub mod telemetry;

pub use config::Tuning;
pub use engine::{SessionState, StateChange};
pub use identity::ReplicaIdentity;
pub use model::{
    ChatMessage, CounterState, MessageId, Participant, Presence, SessionId, SessionSnapshot,
    TabId, UserId, DEFAULT_SESSION,
};
pub use protocol::SyncEvent;
pub use replica::{CounterDelta, Replica, ReplicaError, ReplicaHandle};
