use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// One datagram fanned out to every replica subscribed to a session.
///
/// `sender` carries the tab id of the publishing replica. The bus never
/// routes on it; receivers use it to recognise their own echoes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    pub session: String,
    pub sender: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Fan-out broadcast between same-host replicas of a session.
///
/// Delivery is fire-and-forget: a published frame reaches every receiver
/// subscribed to the session at publish time, including any receiver held
/// by the publisher itself. Nothing is buffered for replicas that have not
/// subscribed yet, frames may arrive interleaved in any order relative to
/// other publishers, and a receiver that falls far enough behind loses
/// frames (`RecvError::Lagged`). Consumers are expected to tolerate both
/// loss and duplicate application.
pub trait Bus: Send + Sync {
    fn subscribe(&self, session: &str) -> broadcast::Receiver<BusFrame>;
    fn publish(&self, session: &str, sender: &str, payload: Bytes) -> BusResult<()>;
}

/// In-memory bus, one broadcast channel per session id.
#[derive(Debug, Default)]
pub struct LocalBus {
    sessions: parking_lot::RwLock<std::collections::HashMap<String, broadcast::Sender<BusFrame>>>,
}

const SESSION_CHANNEL_CAPACITY: usize = 128;

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, session: &str) -> broadcast::Sender<BusFrame> {
        let mut guard = self.sessions.write();
        guard
            .entry(session.to_string())
            .or_insert_with(|| broadcast::channel(SESSION_CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, session: &str) -> broadcast::Receiver<BusFrame> {
        self.sender_for(session).subscribe()
    }

    fn publish(&self, session: &str, sender: &str, payload: Bytes) -> BusResult<()> {
        let tx = self.sender_for(session);
        tx.send(BusFrame {
            session: session.to_string(),
            sender: sender.to_string(),
            payload,
        })
        .map(|_| ())
        .map_err(|_| BusError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("lobby");
        bus.publish("lobby", "tab-1", Bytes::from_static(b"ping"))
            .expect("publish ok");
        let frame = sub.recv().await.expect("receive ok");
        assert_eq!(frame.session, "lobby");
        assert_eq!(frame.sender, "tab-1");
        assert_eq!(frame.payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_frame() {
        let bus = LocalBus::new();
        let mut first = bus.subscribe("lobby");
        let mut second = bus.subscribe("lobby");
        bus.publish("lobby", "tab-1", Bytes::from_static(b"hello"))
            .expect("publish ok");
        assert_eq!(
            first.recv().await.expect("first receives").payload,
            Bytes::from_static(b"hello")
        );
        assert_eq!(
            second.recv().await.expect("second receives").payload,
            Bytes::from_static(b"hello")
        );
    }

    #[tokio::test]
    async fn publisher_receives_its_own_frames() {
        let bus = LocalBus::new();
        let mut own = bus.subscribe("lobby");
        bus.publish("lobby", "tab-1", Bytes::from_static(b"echo"))
            .expect("publish ok");
        let frame = own.recv().await.expect("loopback delivered");
        assert_eq!(frame.sender, "tab-1");
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let bus = LocalBus::new();
        let mut lobby = bus.subscribe("lobby");
        let mut other = bus.subscribe("workshop");
        bus.publish("lobby", "tab-1", Bytes::from_static(b"only lobby"))
            .expect("publish ok");
        assert!(lobby.recv().await.is_ok());
        assert!(matches!(
            other.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn publish_without_subscribers_reports_closed() {
        let bus = LocalBus::new();
        let err = bus
            .publish("empty", "tab-1", Bytes::from_static(b"void"))
            .expect_err("no receivers");
        assert!(matches!(err, BusError::Closed));
    }
}
