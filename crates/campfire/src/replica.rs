use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tab_bus::{Bus, BusFrame};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, trace, warn};

use crate::config::Tuning;
use crate::engine::{SessionState, StateChange};
use crate::identity::ReplicaIdentity;
use crate::model::{
    now_ms, ChatMessage, CounterState, MessageId, Millis, Participant, SessionId, SessionSnapshot,
    UserId,
};
use crate::protocol::{decode_event, encode_event, ParticipantUpdate, SyncEvent};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Direction of a local counter intent. The replica turns it into an
/// absolute value computed from its own current counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterDelta {
    Increment,
    Decrement,
}

impl CounterDelta {
    fn apply(self, value: i64) -> i64 {
        match self {
            CounterDelta::Increment => value.saturating_add(1),
            CounterDelta::Decrement => value.saturating_sub(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("replica already shut down")]
    Stopped,
}

enum Intent {
    SendMessage { message: ChatMessage },
    DeleteMessage { message_id: MessageId },
    AdjustCounter { delta: CounterDelta },
    SetTyping { typing: bool },
    RefreshPresence,
}

/// The engine task behind one replica: applies local intents, folds in
/// broadcasts from sibling replicas, and runs the decay timers. Every state
/// write happens on this task, so reducers never interleave.
pub struct Replica<B: Bus> {
    bus: Arc<B>,
    session: SessionId,
    identity: ReplicaIdentity,
    tuning: Tuning,
    state: Arc<RwLock<SessionState>>,
    updates: broadcast::Sender<StateChange>,
    typing_deadline: Option<Instant>,
}

impl<B: Bus + 'static> Replica<B> {
    /// Subscribes to the session, announces this replica, and starts the
    /// engine loop. The subscription is taken before the task starts, so no
    /// frame published after `spawn` returns can be missed.
    pub fn spawn(
        bus: Arc<B>,
        session: SessionId,
        identity: ReplicaIdentity,
        tuning: Tuning,
    ) -> ReplicaHandle {
        let frames = bus.subscribe(session.as_str());
        let (intent_tx, intent_rx) = mpsc::unbounded_channel();
        let (update_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let state = Arc::new(RwLock::new(SessionState::default()));

        let worker = Replica {
            bus,
            session: session.clone(),
            identity: identity.clone(),
            tuning,
            state: state.clone(),
            updates: update_tx.clone(),
            typing_deadline: None,
        };
        let task = tokio::spawn(worker.run(intent_rx, frames));

        ReplicaHandle {
            identity,
            session,
            state,
            updates: update_tx,
            intents: intent_tx,
            task,
        }
    }

    async fn run(
        mut self,
        mut intents: mpsc::UnboundedReceiver<Intent>,
        mut frames: broadcast::Receiver<BusFrame>,
    ) {
        self.announce();
        let mut presence_sweep = interval(self.tuning.presence_sweep_interval);
        let mut expiry_sweep = interval(self.tuning.expiry_sweep_interval);

        loop {
            let typing_deadline = self.typing_deadline;
            tokio::select! {
                maybe_intent = intents.recv() => {
                    match maybe_intent {
                        Some(intent) => self.handle_intent(intent),
                        // Handle dropped: tear down like a closing tab.
                        None => break,
                    }
                }
                maybe_frame = frames.recv() => {
                    match maybe_frame {
                        Ok(frame) => self.handle_frame(frame),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                target = "campfire.replica",
                                skipped,
                                "bus receiver lagged; dropped frames are not replayed"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = presence_sweep.tick() => self.sweep_presence(),
                _ = expiry_sweep.tick() => self.sweep_expired(),
                _ = deadline_elapsed(typing_deadline) => self.typing_window_elapsed(),
            }
        }

        self.broadcast(SyncEvent::Leave {
            user_id: self.identity.user_id.clone(),
        });
        debug!(
            target = "campfire.replica",
            user = %self.identity.user_id,
            "replica left session"
        );
    }

    fn announce(&mut self) {
        let me = self.identity.participant(now_ms());
        if self.state.write().insert_participant(me.clone()) {
            self.notify(StateChange::Roster);
        }
        debug!(
            target = "campfire.replica",
            session = %self.session,
            user = %self.identity.user_id,
            "replica joined session"
        );
        self.broadcast(SyncEvent::Join(me));
        self.broadcast(SyncEvent::RequestSync {
            requester_id: self.identity.user_id.clone(),
        });
    }

    fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::SendMessage { message } => {
                if self.state.write().append_message(message.clone()) {
                    self.notify(StateChange::Messages);
                }
                self.broadcast(SyncEvent::SendMessage(message));
                self.refresh_own_activity();
            }
            Intent::DeleteMessage { message_id } => {
                if self.state.write().remove_message(&message_id) {
                    self.notify(StateChange::Messages);
                }
                self.broadcast(SyncEvent::RemoveMessage {
                    message_id,
                    user_id: self.identity.user_id.clone(),
                });
            }
            Intent::AdjustCounter { delta } => {
                let value = {
                    let mut state = self.state.write();
                    let next = delta.apply(state.counter.value);
                    state.set_counter(next, &self.identity.display_name, now_ms());
                    next
                };
                self.notify(StateChange::Counter);
                self.broadcast(SyncEvent::UpdateCounter {
                    value,
                    user_id: self.identity.user_id.clone(),
                    display_name: self.identity.display_name.clone(),
                });
                self.refresh_own_activity();
            }
            Intent::SetTyping { typing: true } => {
                self.typing_deadline = Some(Instant::now() + self.tuning.typing_timeout);
                self.broadcast(SyncEvent::BeginTyping {
                    user_id: self.identity.user_id.clone(),
                });
                self.refresh_own_activity();
            }
            Intent::SetTyping { typing: false } => {
                self.typing_deadline = None;
                self.broadcast(SyncEvent::EndTyping {
                    user_id: self.identity.user_id.clone(),
                });
                self.refresh_own_activity();
            }
            Intent::RefreshPresence => self.refresh_own_activity(),
        }
    }

    /// Stamps fresh activity on our roster entry and tells the session.
    /// A receiver that already swept us drops the update; that staleness is
    /// accepted, not repaired.
    fn refresh_own_activity(&mut self) {
        let me = self.identity.participant(now_ms());
        let update = ParticipantUpdate::full(&me);
        if self.state.write().merge_participant(&update) {
            self.notify(StateChange::Roster);
        }
        self.broadcast(SyncEvent::ParticipantUpdate(update));
    }

    fn handle_frame(&mut self, frame: BusFrame) {
        let event = match decode_event(&frame.payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    target = "campfire.replica",
                    error = %err,
                    sender = %frame.sender,
                    "dropping undecodable frame"
                );
                return;
            }
        };

        let own = frame.sender == self.identity.tab_id.as_str();
        if own
            && matches!(
                event,
                SyncEvent::SendMessage(_) | SyncEvent::UpdateCounter { .. }
            )
        {
            // Applied before broadcast; everything else is safe to see
            // again because the reducers are idempotent.
            trace!(
                target = "campfire.replica",
                kind = event.kind(),
                "skipping own echo"
            );
            return;
        }

        self.apply_event(event);
    }

    fn apply_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Join(participant) => {
                if self.state.write().insert_participant(participant) {
                    self.notify(StateChange::Roster);
                }
            }
            SyncEvent::Leave { user_id } => {
                let (left, was_typing) = {
                    let mut state = self.state.write();
                    (
                        state.remove_participant(&user_id),
                        state.end_typing(&user_id),
                    )
                };
                if left {
                    self.notify(StateChange::Roster);
                }
                if was_typing {
                    self.notify(StateChange::Typing);
                }
            }
            SyncEvent::ParticipantUpdate(update) => {
                if self.state.write().merge_participant(&update) {
                    self.notify(StateChange::Roster);
                }
            }
            SyncEvent::SendMessage(message) => {
                if self.state.write().append_message(message) {
                    self.notify(StateChange::Messages);
                }
            }
            SyncEvent::RemoveMessage { message_id, .. } => {
                // The deleting user is advisory; removal applies regardless.
                if self.state.write().remove_message(&message_id) {
                    self.notify(StateChange::Messages);
                }
            }
            SyncEvent::UpdateCounter {
                value,
                display_name,
                ..
            } => {
                self.state
                    .write()
                    .set_counter(value, &display_name, now_ms());
                self.notify(StateChange::Counter);
            }
            SyncEvent::BeginTyping { user_id } => {
                if user_id != self.identity.user_id && self.state.write().begin_typing(&user_id) {
                    self.notify(StateChange::Typing);
                }
            }
            SyncEvent::EndTyping { user_id } => {
                if self.state.write().end_typing(&user_id) {
                    self.notify(StateChange::Typing);
                }
            }
            SyncEvent::RequestSync { requester_id } => {
                if requester_id != self.identity.user_id {
                    let snapshot = self.state.read().snapshot();
                    debug!(
                        target = "campfire.replica",
                        requester = %requester_id,
                        participants = snapshot.participants.len(),
                        messages = snapshot.messages.len(),
                        "answering sync request"
                    );
                    self.broadcast(SyncEvent::SyncState(snapshot));
                }
            }
            SyncEvent::SyncState(snapshot) => {
                let changes = self
                    .state
                    .write()
                    .adopt_snapshot(snapshot, &self.identity.user_id);
                for change in changes {
                    self.notify(change);
                }
            }
            SyncEvent::Unknown => {
                debug!(
                    target = "campfire.replica",
                    "ignoring unrecognised event kind"
                );
            }
        }
    }

    fn sweep_presence(&mut self) {
        let threshold = self.tuning.inactive_threshold.as_millis() as Millis;
        let swept =
            self.state
                .write()
                .sweep_stale_participants(now_ms(), threshold, &self.identity.user_id);
        if swept {
            debug!(
                target = "campfire.replica",
                "presence sweep dropped silent participants"
            );
            self.notify(StateChange::Roster);
        }
    }

    fn sweep_expired(&mut self) {
        if self.state.write().sweep_expired_messages(now_ms()) {
            self.notify(StateChange::Messages);
        }
    }

    fn typing_window_elapsed(&mut self) {
        self.typing_deadline = None;
        self.broadcast(SyncEvent::EndTyping {
            user_id: self.identity.user_id.clone(),
        });
    }

    /// Fire-and-forget: a failed publish is logged and forgotten, the same
    /// as a frame the transport dropped.
    fn broadcast(&self, event: SyncEvent) {
        let payload = match encode_event(&event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    target = "campfire.replica",
                    error = %err,
                    kind = event.kind(),
                    "failed to encode event"
                );
                return;
            }
        };
        if let Err(err) = self.bus.publish(
            self.session.as_str(),
            self.identity.tab_id.as_str(),
            payload,
        ) {
            debug!(
                target = "campfire.replica",
                error = %err,
                kind = event.kind(),
                "broadcast not delivered"
            );
        }
    }

    fn notify(&self, change: StateChange) {
        let _ = self.updates.send(change);
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Presentation-facing handle to a running replica. Reads are snapshots of
/// the current state; intents are queued to the engine task and applied in
/// submission order.
pub struct ReplicaHandle {
    identity: ReplicaIdentity,
    session: SessionId,
    state: Arc<RwLock<SessionState>>,
    updates: broadcast::Sender<StateChange>,
    intents: mpsc::UnboundedSender<Intent>,
    task: JoinHandle<()>,
}

impl ReplicaHandle {
    pub fn identity(&self) -> &ReplicaIdentity {
        &self.identity
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Change notifications. A consumer that lags misses notifications, not
    /// state; it can always re-read the slices it cares about.
    pub fn updates(&self) -> broadcast::Receiver<StateChange> {
        self.updates.subscribe()
    }

    pub fn roster(&self) -> Vec<Participant> {
        self.state.read().participants.clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.read().messages.clone()
    }

    pub fn counter(&self) -> CounterState {
        self.state.read().counter.clone()
    }

    pub fn typing(&self) -> Vec<UserId> {
        self.state.read().typing.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.read().snapshot()
    }

    /// Queues a chat message, optionally with a time-to-live after which
    /// every replica expires it. Returns the message id so the caller can
    /// delete it later.
    pub fn send_message(
        &self,
        content: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<MessageId, ReplicaError> {
        let now = now_ms();
        let message = ChatMessage {
            id: MessageId::generate(),
            sender: self.identity.user_id.clone(),
            sender_name: self.identity.display_name.clone(),
            content: content.into(),
            created_at: now,
            expires_at: ttl.map(|ttl| {
                now.saturating_add(Millis::try_from(ttl.as_millis()).unwrap_or(Millis::MAX))
            }),
        };
        let id = message.id.clone();
        self.submit(Intent::SendMessage { message })?;
        Ok(id)
    }

    pub fn delete_message(&self, message_id: MessageId) -> Result<(), ReplicaError> {
        self.submit(Intent::DeleteMessage { message_id })
    }

    pub fn adjust_counter(&self, delta: CounterDelta) -> Result<(), ReplicaError> {
        self.submit(Intent::AdjustCounter { delta })
    }

    pub fn set_typing(&self, typing: bool) -> Result<(), ReplicaError> {
        self.submit(Intent::SetTyping { typing })
    }

    /// Marks this replica active with no other side effect, e.g. when its
    /// tab regains focus.
    pub fn refresh_presence(&self) -> Result<(), ReplicaError> {
        self.submit(Intent::RefreshPresence)
    }

    fn submit(&self, intent: Intent) -> Result<(), ReplicaError> {
        self.intents.send(intent).map_err(|_| ReplicaError::Stopped)
    }

    /// Stops the engine loop; a best-effort leave is broadcast on the way
    /// out. Resolves once the task has finished.
    pub async fn shutdown(self) {
        let ReplicaHandle { intents, task, .. } = self;
        drop(intents);
        let _ = task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tab_bus::LocalBus;
    use tokio::time::{sleep, timeout};

    fn quick_tuning() -> Tuning {
        Tuning {
            presence_sweep_interval: Duration::from_millis(50),
            inactive_threshold: Duration::from_millis(400),
            expiry_sweep_interval: Duration::from_millis(25),
            typing_timeout: Duration::from_millis(120),
        }
    }

    fn spawn_on(bus: &Arc<LocalBus>, session: &SessionId) -> ReplicaHandle {
        Replica::spawn(
            bus.clone(),
            session.clone(),
            ReplicaIdentity::generate(),
            quick_tuning(),
        )
    }

    async fn next_kind(probe: &mut broadcast::Receiver<BusFrame>) -> String {
        let frame = timeout(Duration::from_secs(2), probe.recv())
            .await
            .expect("frame in time")
            .expect("frame");
        decode_event(&frame.payload)
            .expect("decodable frame")
            .kind()
            .to_string()
    }

    #[tokio::test]
    async fn startup_announces_join_then_sync_request() {
        let bus = Arc::new(LocalBus::new());
        let session = SessionId::generate();
        let mut probe = bus.subscribe(session.as_str());
        let replica = spawn_on(&bus, &session);

        assert_eq!(next_kind(&mut probe).await, "join");
        assert_eq!(next_kind(&mut probe).await, "request_sync");

        let roster = replica.roster();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].id, replica.identity().user_id);
        replica.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_broadcasts_leave() {
        let bus = Arc::new(LocalBus::new());
        let session = SessionId::generate();
        let mut probe = bus.subscribe(session.as_str());
        let replica = spawn_on(&bus, &session);

        assert_eq!(next_kind(&mut probe).await, "join");
        assert_eq!(next_kind(&mut probe).await, "request_sync");
        replica.shutdown().await;
        assert_eq!(next_kind(&mut probe).await, "leave");
    }

    #[tokio::test]
    async fn inbound_frames_never_trigger_a_rebroadcast() {
        let bus = Arc::new(LocalBus::new());
        let session = SessionId::generate();
        let mut probe = bus.subscribe(session.as_str());
        let replica = spawn_on(&bus, &session);
        assert_eq!(next_kind(&mut probe).await, "join");
        assert_eq!(next_kind(&mut probe).await, "request_sync");

        let foreign = SyncEvent::SendMessage(ChatMessage {
            id: MessageId("msg-1-remote".to_string()),
            sender: UserId("user-tab-ghost".to_string()),
            sender_name: "Bob Brown".into(),
            content: "from elsewhere".into(),
            created_at: now_ms(),
            expires_at: None,
        });
        bus.publish(
            session.as_str(),
            "tab-ghost",
            encode_event(&foreign).expect("encode"),
        )
        .expect("publish");

        assert_eq!(next_kind(&mut probe).await, "send_message");
        sleep(Duration::from_millis(120)).await;
        assert!(matches!(
            probe.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(replica.messages().len(), 1);
        replica.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_without_crashing() {
        let bus = Arc::new(LocalBus::new());
        let session = SessionId::generate();
        let replica = spawn_on(&bus, &session);
        sleep(Duration::from_millis(40)).await;

        bus.publish(
            session.as_str(),
            "tab-ghost",
            bytes::Bytes::from_static(b"{{{{ definitely not json"),
        )
        .expect("publish");
        sleep(Duration::from_millis(60)).await;

        assert!(replica.send_message("still alive", None).is_ok());
        sleep(Duration::from_millis(60)).await;
        assert_eq!(replica.messages().len(), 1);
        replica.shutdown().await;
    }

    #[tokio::test]
    async fn updates_channel_reports_touched_slices() {
        let bus = Arc::new(LocalBus::new());
        let session = SessionId::generate();
        let replica = spawn_on(&bus, &session);
        sleep(Duration::from_millis(40)).await;
        let mut updates = replica.updates();

        replica.send_message("hello", None).expect("intent accepted");
        let change = timeout(Duration::from_secs(2), updates.recv())
            .await
            .expect("change in time")
            .expect("change");
        assert_eq!(change, StateChange::Messages);
        replica.shutdown().await;
    }

    #[tokio::test]
    async fn intents_fail_once_the_engine_task_is_gone() {
        let bus = Arc::new(LocalBus::new());
        let session = SessionId::generate();
        let replica = spawn_on(&bus, &session);
        sleep(Duration::from_millis(40)).await;

        replica.task.abort();
        sleep(Duration::from_millis(40)).await;

        let err = replica
            .send_message("too late", None)
            .expect_err("engine is gone");
        assert!(matches!(err, ReplicaError::Stopped));
    }

    #[tokio::test]
    async fn own_broadcast_echoes_are_dropped() {
        let bus = Arc::new(LocalBus::new());
        let session = SessionId::generate();
        let replica = spawn_on(&bus, &session);
        sleep(Duration::from_millis(40)).await;

        // The transport may redeliver our own frames long after the intent
        // was applied; replaying them must not disturb current state.
        let identity = replica.identity().clone();
        bus.publish(
            session.as_str(),
            identity.tab_id.as_str(),
            encode_event(&SyncEvent::UpdateCounter {
                value: 99,
                user_id: identity.user_id.clone(),
                display_name: identity.display_name.clone(),
            })
            .expect("encode"),
        )
        .expect("publish");
        bus.publish(
            session.as_str(),
            identity.tab_id.as_str(),
            encode_event(&SyncEvent::SendMessage(ChatMessage {
                id: MessageId("msg-9-echoed".to_string()),
                sender: identity.user_id.clone(),
                sender_name: identity.display_name.clone(),
                content: "deleted before this echo came back".into(),
                created_at: now_ms(),
                expires_at: None,
            }))
            .expect("encode"),
        )
        .expect("publish");
        sleep(Duration::from_millis(60)).await;

        assert_eq!(
            replica.counter().value,
            0,
            "own update_counter echo must be dropped"
        );
        assert!(
            replica.messages().is_empty(),
            "own send_message echo must be dropped"
        );
        replica.shutdown().await;
    }

    #[tokio::test]
    async fn enormous_ttl_saturates_instead_of_wrapping() {
        let bus = Arc::new(LocalBus::new());
        let session = SessionId::generate();
        let replica = spawn_on(&bus, &session);
        sleep(Duration::from_millis(40)).await;

        replica
            .send_message("kept until the end of time", Some(Duration::MAX))
            .expect("send accepted");
        sleep(Duration::from_millis(100)).await;

        let messages = replica.messages();
        assert_eq!(messages.len(), 1, "saturated deadline must not expire");
        assert_eq!(messages[0].expires_at, Some(Millis::MAX));
        replica.shutdown().await;
    }
}
