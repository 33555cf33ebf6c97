//! In-process loopback carrier.
//!
//! [`pair`] builds two transports joined by an in-memory link. Each
//! direction is an unbounded channel drained by a pump task on the tokio
//! runtime, so a send never re-enters the receiving transport on the
//! caller's stack.
//!
//! ```text
//!   client engine ── send_raw ──► mpsc ──► pump ──► server.receive()
//!   client.receive() ◄── pump ◄── mpsc ◄── send_raw ── server engine
//! ```
//!
//! The link can be switched into blackhole mode, where every frame is
//! silently dropped. That is the easiest way to exercise expiry and probe
//! timeouts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::transport::{
    Carrier, CarrierError, Scheduler, TransportConfig, TransportEngine, TransportHandle,
};
use crate::wire::Frame;

/// Protocol name reported by loopback carriers.
pub const LOOPBACK_PROTOCOL: &str = "loopback";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client = 0,
    Server = 1,
}

impl Side {
    fn peer(self) -> Self {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// State shared by both ends of a link.
#[derive(Debug, Default)]
struct Link {
    ends: Mutex<[Option<TransportHandle>; 2]>,
    up: AtomicBool,
    blackhole: AtomicBool,
}

impl Link {
    fn end(&self, side: Side) -> Option<TransportHandle> {
        self.ends.lock()[side as usize].clone()
    }
}

/// One end of a loopback link.
#[derive(Debug)]
pub struct LoopbackCarrier {
    side: Side,
    link: Arc<Link>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl Carrier for LoopbackCarrier {
    fn protocol(&self) -> &str {
        LOOPBACK_PROTOCOL
    }

    fn can_connect(&self) -> bool {
        self.side == Side::Client
    }

    fn can_listen(&self) -> bool {
        self.side == Side::Server
    }

    fn attach(&self, transport: TransportHandle) {
        self.link.ends.lock()[self.side as usize] = Some(transport);
    }

    fn connect(&self) -> Result<(), CarrierError> {
        let (Some(local), Some(peer)) = (self.link.end(self.side), self.link.end(self.side.peer()))
        else {
            return Err(CarrierError::LinkClosed);
        };
        self.link.up.store(true, Ordering::SeqCst);
        debug!(local = %local.name(), peer = %peer.name(), "loopback link up");
        peer.set_connected();
        local.set_connected();
        Ok(())
    }

    fn send_raw(&self, frame: &Frame, _expect_more: bool) -> Result<(), CarrierError> {
        if !self.link.up.load(Ordering::SeqCst) {
            return Err(CarrierError::LinkClosed);
        }
        let bytes = frame
            .serialize()
            .map_err(|err| CarrierError::Rejected(err.to_string()))?;
        if self.link.blackhole.load(Ordering::SeqCst) {
            trace!(%frame, "blackholed");
            return Ok(());
        }
        self.outbound
            .send(bytes)
            .map_err(|_| CarrierError::LinkClosed)
    }

    fn disconnect(&self) {
        if !self.link.up.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("loopback link down");
        let ends = self.link.ends.lock().clone();
        for end in ends.into_iter().flatten() {
            end.set_disconnected();
        }
    }
}

/// Two transports joined by a loopback link.
#[derive(Debug)]
pub struct LoopbackPair {
    /// Connecting end.
    pub client: TransportEngine,
    /// Listening end.
    pub server: TransportEngine,
    link: Arc<Link>,
}

impl LoopbackPair {
    /// Drop (`true`) or deliver (`false`) everything sent over the link.
    pub fn set_blackhole(&self, enabled: bool) {
        debug!(enabled, "loopback blackhole");
        self.link.blackhole.store(enabled, Ordering::SeqCst);
    }

    /// Whether the link is up.
    pub fn is_up(&self) -> bool {
        self.link.up.load(Ordering::SeqCst)
    }
}

/// Build a client and a server transport over a fresh loopback link.
///
/// The pump tasks run on the runtime of the calling context.
pub fn pair(client: TransportConfig, server: TransportConfig) -> LoopbackPair {
    let scheduler = Scheduler::current();
    let link = Arc::new(Link::default());

    let (to_server, from_client) = mpsc::unbounded_channel();
    let (to_client, from_server) = mpsc::unbounded_channel();
    let client_carrier = Arc::new(LoopbackCarrier {
        side: Side::Client,
        link: Arc::clone(&link),
        outbound: to_server,
    });
    let server_carrier = Arc::new(LoopbackCarrier {
        side: Side::Server,
        link: Arc::clone(&link),
        outbound: to_client,
    });

    let client = TransportEngine::with_scheduler(client_carrier, client, scheduler.clone());
    let server = TransportEngine::with_scheduler(server_carrier, server, scheduler.clone());

    scheduler.spawn(pump(Arc::clone(&link), Side::Server, from_client));
    scheduler.spawn(pump(Arc::clone(&link), Side::Client, from_server));

    LoopbackPair {
        client,
        server,
        link,
    }
}

async fn pump(link: Arc<Link>, to: Side, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        let Some(end) = link.end(to) else {
            continue;
        };
        if let Err(err) = end.receive(&bytes) {
            debug!(transport = %end.name(), error = %err, "loopback delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::auth::{AuthContext, AuthError, Authenticator, ContextKey};
    use crate::transport::{
        KeepalivePolicy, TransportConfigBuilder, TransportDelegate, TransportState,
    };
    use crate::wire::{Format, Operation};

    #[derive(Default)]
    struct Inbox {
        frames: Mutex<Vec<Frame>>,
    }

    impl Inbox {
        fn count(&self, op: Operation) -> usize {
            self.frames
                .lock()
                .iter()
                .filter(|f| f.operation() == op)
                .count()
        }
    }

    impl TransportDelegate for Inbox {
        fn frame_received(&self, _transport: &TransportHandle, frame: Frame) {
            self.frames.lock().push(frame);
        }

        fn state_changed(&self, _t: &TransportHandle, _new: TransportState, _old: TransportState) {}

        fn frames_failed(&self, _transport: &TransportHandle, _frames: Vec<Frame>) {}
    }

    /// Signs everything with `T1`; accepts only tokens that answered a
    /// challenge.
    struct ChallengeEverything;

    impl Authenticator for ChallengeEverything {
        fn negotiate_context_keys(
            &self,
            _offered: &HashSet<ContextKey>,
        ) -> Result<HashSet<ContextKey>, AuthError> {
            Ok(HashSet::new())
        }

        fn verify(&self, frame: &Frame, _context: &AuthContext) -> Result<bool, AuthError> {
            Ok(frame.auth() == Some("signed:c1"))
        }

        fn create_challenge(&self, _frame: &Frame, _context: &AuthContext) -> String {
            "c1".to_string()
        }

        fn create_response(
            &self,
            challenge: Option<&Frame>,
            _outgoing: &Frame,
            _context: &AuthContext,
        ) -> String {
            match challenge.and_then(Frame::auth) {
                Some(c) => format!("signed:{c}"),
                None => "T1".to_string(),
            }
        }
    }

    fn config(name: &str) -> TransportConfig {
        TransportConfigBuilder::new().name(name).build()
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn open_pair() -> (LoopbackPair, Arc<Inbox>, Arc<Inbox>) {
        open_pair_with(config("client"), config("server")).await
    }

    async fn open_pair_with(
        client: TransportConfig,
        server: TransportConfig,
    ) -> (LoopbackPair, Arc<Inbox>, Arc<Inbox>) {
        init_tracing();
        let link = pair(client, server);
        let client_inbox = Arc::new(Inbox::default());
        let server_inbox = Arc::new(Inbox::default());
        link.client.set_delegate(&client_inbox);
        link.server.set_delegate(&server_inbox);
        handshake(&link).await;
        (link, client_inbox, server_inbox)
    }

    async fn handshake(link: &LoopbackPair) {
        link.client.connect().unwrap();
        assert_eq!(link.client.state(), TransportState::Connected);
        assert_eq!(link.server.state(), TransportState::Connected);

        link.client.send_control(Frame::new(Operation::Open));
        settle(20).await;
        assert_eq!(link.server.state(), TransportState::Available);
        link.server.send_control(Frame::new(Operation::Opened));
        settle(20).await;
        assert_eq!(link.client.state(), TransportState::Available);
    }

    #[tokio::test]
    async fn test_handshake() {
        let (link, client_inbox, server_inbox) = open_pair().await;
        assert!(link.is_up());
        assert_eq!(server_inbox.count(Operation::Open), 1);
        assert_eq!(client_inbox.count(Operation::Opened), 1);
        assert_eq!(link.client.protocol(), LOOPBACK_PROTOCOL);
    }

    #[tokio::test]
    async fn test_server_end_cannot_connect() {
        let link = pair(config("client"), config("server"));
        let err = link.server.connect().unwrap_err();
        assert!(matches!(err, crate::transport::TransportError::ClientUnsupported));
        assert_eq!(link.server.state(), TransportState::Error);
    }

    #[tokio::test]
    async fn test_bulk_transfer_drains_transit() {
        let (link, _client_inbox, server_inbox) = open_pair().await;
        for id in 1..=1050u32 {
            let frame = Frame::message(1, id, id.to_be_bytes().to_vec()).unwrap();
            link.client.send(frame, id < 1050).unwrap();
        }
        settle(200).await;

        assert_eq!(server_inbox.count(Operation::Message), 1050);
        assert_eq!(link.client.frames_in_transit(), 0);
        let ids: Vec<u32> = server_inbox
            .frames
            .lock()
            .iter()
            .filter(|f| f.operation() == Operation::Message)
            .map(Frame::message_id)
            .collect();
        assert_eq!(ids, (1..=1050).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_challenged_frame_delivered_once() {
        let (link, _client_inbox, server_inbox) = open_pair().await;
        link.client
            .set_authentication(Arc::new(ChallengeEverything))
            .unwrap();
        link.server
            .set_authentication(Arc::new(ChallengeEverything))
            .unwrap();

        let frame = Frame::message(2, 5, b"guarded".to_vec()).unwrap();
        link.client.send(frame, false).unwrap();
        settle(100).await;

        let delivered: Vec<Frame> = server_inbox
            .frames
            .lock()
            .iter()
            .filter(|f| f.operation() == Operation::Message)
            .cloned()
            .collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].auth(), Some("signed:c1"));
        assert_eq!(delivered[0].payload(), b"guarded");
        assert_eq!(link.client.frames_in_transit(), 0);
    }

    #[cfg(feature = "crypto")]
    #[tokio::test]
    async fn test_shared_secret_challenge_round_trip() {
        use crate::auth::SharedSecretAuthentication;

        let (link, _client_inbox, server_inbox) = open_pair().await;
        for end in [&link.client, &link.server] {
            let auth = SharedSecretAuthentication::new(b"relay secret")
                .unwrap()
                .require_challenge(true);
            end.set_authentication(Arc::new(auth)).unwrap();
        }

        link.client
            .send(Frame::message(4, 9, b"sealed".to_vec()).unwrap(), false)
            .unwrap();
        settle(100).await;

        assert_eq!(server_inbox.count(Operation::Message), 1);
        assert_eq!(link.client.frames_in_transit(), 0);
    }

    #[tokio::test]
    async fn test_probe_answered_by_live_peer() {
        let (link, _client_inbox, _server_inbox) = open_pair().await;
        let alive = link
            .client
            .is_alive(Duration::ZERO, true, Duration::from_secs(1))
            .await;
        assert!(alive);
    }

    #[tokio::test]
    async fn test_probe_times_out_over_blackhole() {
        let (link, _client_inbox, _server_inbox) = open_pair().await;
        link.set_blackhole(true);
        let started = Instant::now();
        let alive = link
            .client
            .is_alive(Duration::ZERO, true, Duration::from_millis(200))
            .await;
        assert!(!alive);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_close_handshake() {
        let (link, _client_inbox, _server_inbox) = open_pair().await;
        link.client.disconnect();
        assert_eq!(link.client.state(), TransportState::Disconnecting);
        settle(20).await;
        assert_eq!(link.client.state(), TransportState::Disconnected);
        assert_eq!(link.server.state(), TransportState::Disconnected);
        assert!(!link.is_up());
    }

    #[tokio::test]
    async fn test_reconnect_after_close() {
        let (link, _client_inbox, server_inbox) = open_pair().await;
        link.client.disconnect();
        settle(20).await;
        assert_eq!(link.client.state(), TransportState::Disconnected);
        assert_eq!(link.server.state(), TransportState::Disconnected);

        handshake(&link).await;
        settle(30).await;
        assert_eq!(link.client.state(), TransportState::Available);
        assert_eq!(link.server.state(), TransportState::Available);

        link.client
            .send(Frame::message(1, 1, b"again".to_vec()).unwrap(), false)
            .unwrap();
        settle(20).await;
        assert_eq!(server_inbox.count(Operation::Message), 1);
        assert_eq!(server_inbox.count(Operation::Close), 0);
        assert_eq!(link.client.frames_in_transit(), 0);
    }

    #[tokio::test]
    async fn test_seven_bit_bulk_transfer_drains_transit() {
        let seven_bit = |name: &str| {
            TransportConfigBuilder::new()
                .name(name)
                .format(Format::SevenBit)
                .build()
        };
        let (link, _client_inbox, server_inbox) =
            open_pair_with(seven_bit("client"), seven_bit("server")).await;

        for id in 1..=300u32 {
            let frame = Frame::message(1, id, vec![0xFF, id as u8]).unwrap();
            link.client.send(frame, id < 300).unwrap();
        }
        settle(200).await;

        let frames = server_inbox.frames.lock();
        let messages: Vec<&Frame> = frames
            .iter()
            .filter(|f| f.operation() == Operation::Message)
            .collect();
        assert_eq!(messages.len(), 300);
        assert!(messages.iter().all(|f| f.format() == Format::SevenBit));
        assert_eq!(messages[299].payload(), &[0xFF, 44]);
        drop(frames);
        assert_eq!(link.client.frames_in_transit(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_expiry_over_blackhole() {
        let (link, _client_inbox, _server_inbox) = open_pair().await;
        let keepalive = link.client.keepalive();
        keepalive.set_keepalive_expiry(Duration::from_secs(2));
        keepalive.set_keepalive_interval(KeepalivePolicy::Interval(1));
        link.set_blackhole(true);

        settle(2_500).await;
        assert_eq!(link.client.state(), TransportState::Available);
        assert!(keepalive.has_outstanding_ping());

        settle(1_000).await;
        assert_eq!(link.client.state(), TransportState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_keeps_idle_link_up() {
        let (link, _client_inbox, _server_inbox) = open_pair().await;
        let keepalive = link.client.keepalive();
        keepalive.set_keepalive_expiry(Duration::from_secs(2));
        keepalive.set_keepalive_interval(KeepalivePolicy::Interval(1));

        settle(10_000).await;
        assert_eq!(link.client.state(), TransportState::Available);
        assert_eq!(link.server.state(), TransportState::Available);
    }
}
