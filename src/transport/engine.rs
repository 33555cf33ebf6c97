//! Per-transport reliability engine.
//!
//! A [`TransportEngine`] owns one [`Carrier`] and turns its raw link into a
//! reliable, authenticated frame pipe:
//!
//! ```text
//!   send() ──► stamp auth ──► Carrier::send_raw ──► transit list
//!                                                       ▲
//!   receive() ──► decode ──► dispatch ─┬─► ACK ─────────┘ remove, resend head on gap
//!                                      ├─► PING / PONG ──► keepalive predictor, probes
//!                                      ├─► CHALLENGE ────► re-sign, control queue
//!                                      ├─► OPEN / CLOSE ─► state machine
//!                                      └─► data ─► verify ─► delegate ─► ack batch
//! ```
//!
//! # Locking
//!
//! Data lives behind small `parking_lot` mutexes that are never held while
//! calling a carrier or a delegate. One reentrant lock serializes state
//! transitions, their notifications and the dispatch of received frames,
//! so a delegate may call back into the engine (including feeding it more
//! input) from any notification. The receive buffer is locked only while
//! frames are cut from it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use rand::RngCore;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{
    AckBatch, Carrier, KeepaliveDelegate, KeepalivePredictor, Scheduler, TimerHandle,
    TransitList, TransportConfig, TransportDelegate, TransportError, TransportResult,
    TransportState,
};
use crate::auth::{
    AuthContext, AuthError, Authenticator, ContextKey, ContextValue, NullAuthentication,
};
use crate::core::{
    ACK_FLUSH_DELAY, ConfigError, KEEPALIVE_TOKEN_SIZE, MAX_DIAGNOSTIC_DUMP,
    UNTRACKED_MESSAGE_ID,
};
use crate::wire::{
    AckEntry, Format, Frame, FrameError, KeepaliveKind, KeepalivePayload, Operation,
};

/// Handler for one received operation. Returns whether the frame is
/// forwarded to the delegate.
type Handler = fn(&Inner, &Frame) -> bool;

/// Mutable transport state guarded by one lock.
struct Core {
    state: TransportState,
    transit: TransitList,
    last_alive: Option<Instant>,
    connect_guard: Option<TimerHandle>,
    disconnect_guard: Option<TimerHandle>,
    control_flush: Option<TimerHandle>,
    context_keys: HashSet<ContextKey>,
}

impl Core {
    fn new() -> Self {
        Self {
            state: TransportState::Disconnected,
            transit: TransitList::new(),
            last_alive: None,
            connect_guard: None,
            disconnect_guard: None,
            control_flush: None,
            context_keys: HashSet::new(),
        }
    }
}

/// An outstanding liveness probe.
struct Probe {
    tx: oneshot::Sender<bool>,
    timeout: Option<TimerHandle>,
}

pub(crate) struct Inner {
    me: Weak<Inner>,
    name: Arc<str>,
    carrier: Arc<dyn Carrier>,
    config: Mutex<TransportConfig>,
    core: Mutex<Core>,
    /// Serializes transitions and inbound dispatch. Always taken before any
    /// data mutex.
    transition: ReentrantMutex<()>,
    delegate: Mutex<Option<Weak<dyn TransportDelegate>>>,
    auth: Mutex<Arc<dyn Authenticator>>,
    control: Mutex<VecDeque<Frame>>,
    flushing: Mutex<()>,
    inbox: Mutex<Vec<u8>>,
    acks: Mutex<AckBatch>,
    probes: Mutex<HashMap<Vec<u8>, Probe>>,
    keepalive: KeepalivePredictor,
    scheduler: Scheduler,
}

/// One transport: a carrier plus the state machine, transit tracking,
/// authentication and keepalive logic layered over it.
///
/// Cloning yields another handle to the same transport. Timers and deferred
/// work hold the transport weakly, so dropping the last clone stops them.
#[derive(Clone)]
pub struct TransportEngine {
    inner: Arc<Inner>,
}

impl TransportEngine {
    /// Create a transport on the runtime of the calling context.
    pub fn new(carrier: Arc<dyn Carrier>, config: TransportConfig) -> Self {
        Self::with_scheduler(carrier, config, Scheduler::current())
    }

    /// Create a transport whose timers run on `scheduler`.
    pub fn with_scheduler(
        carrier: Arc<dyn Carrier>,
        config: TransportConfig,
        scheduler: Scheduler,
    ) -> Self {
        let keepalive = KeepalivePredictor::new(scheduler.clone());
        keepalive.set_keepalive_interval(config.keepalive);
        keepalive.set_keepalive_expiry(config.keepalive_expiry);

        let inner = Arc::new_cyclic(move |me: &Weak<Inner>| {
            let ka_delegate: Weak<dyn KeepaliveDelegate> = me.clone();
            keepalive.set_delegate(ka_delegate);
            Inner {
                me: me.clone(),
                name: Arc::from(config.name.as_str()),
                carrier,
                acks: Mutex::new(AckBatch::new(config.format, config.ack_buffer_size)),
                config: Mutex::new(config),
                core: Mutex::new(Core::new()),
                transition: ReentrantMutex::new(()),
                delegate: Mutex::new(None),
                auth: Mutex::new(Arc::new(NullAuthentication)),
                control: Mutex::new(VecDeque::new()),
                flushing: Mutex::new(()),
                inbox: Mutex::new(Vec::new()),
                probes: Mutex::new(HashMap::new()),
                keepalive,
                scheduler,
            }
        });
        inner.carrier.attach(inner.handle());
        debug!(
            transport = %inner.name,
            protocol = inner.carrier.protocol(),
            "transport created"
        );
        Self { inner }
    }

    /// Weak handle for carriers and delegates.
    pub fn handle(&self) -> TransportHandle {
        self.inner.handle()
    }

    /// Transport name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Carrier protocol name.
    pub fn protocol(&self) -> &str {
        self.inner.carrier.protocol()
    }

    /// Current state.
    pub fn state(&self) -> TransportState {
        self.inner.state()
    }

    /// Whether the link is up, handshake or not.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            TransportState::Connected | TransportState::Available
        )
    }

    /// Whether the transport completed the handshake.
    pub fn is_available(&self) -> bool {
        self.state() == TransportState::Available
    }

    /// Snapshot of the configuration.
    pub fn config(&self) -> TransportConfig {
        self.inner.config.lock().clone()
    }

    /// Apply a string option, e.g. from a configuration file.
    ///
    /// Live settings (enabled, priority, format, keepalive) take effect
    /// immediately.
    pub fn configure(&self, key: &str, value: &str) -> TransportResult<()> {
        let mut config = self.config();
        config.configure(key, value)?;

        if config.format != self.format() {
            self.set_format(config.format)?;
        }
        self.set_priority(config.priority);
        self.inner.keepalive.set_keepalive_interval(config.keepalive);
        self.inner
            .keepalive
            .set_keepalive_expiry(config.keepalive_expiry);
        let enabled = config.enabled;
        *self.inner.config.lock() = config;
        self.set_enabled(enabled);
        Ok(())
    }

    /// Whether the transport may connect.
    pub fn is_enabled(&self) -> bool {
        self.inner.config.lock().enabled
    }

    /// Enable or disable the transport. Disabling disconnects a live one.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.config.lock().enabled = enabled;
        if !enabled && !self.state().is_terminal() {
            debug!(transport = %self.inner.name, "transport disabled");
            self.disconnect();
        }
    }

    /// Ranking among an endpoint's transports.
    pub fn priority(&self) -> i32 {
        self.inner.config.lock().priority
    }

    /// Change the ranking.
    pub fn set_priority(&self, priority: i32) {
        self.inner.config.lock().priority = priority;
    }

    /// Wire format of outgoing frames.
    pub fn format(&self) -> Format {
        self.inner.format()
    }

    /// Change the wire format.
    ///
    /// The format is locked once the handshake completed. Until then an
    /// incoming OPEN or OPENED may still switch it to the peer's.
    pub fn set_format(&self, format: Format) -> TransportResult<()> {
        match self.state() {
            TransportState::Available
            | TransportState::Unavailable
            | TransportState::Disconnecting => {
                Err(ConfigError::Locked("format".to_string()).into())
            }
            _ => {
                self.inner.adopt_format(format);
                Ok(())
            }
        }
    }

    /// Set the receiver of transport events. Held weakly.
    pub fn set_delegate<D>(&self, delegate: &Arc<D>)
    where
        D: TransportDelegate + 'static,
    {
        let weak: Weak<D> = Arc::downgrade(delegate);
        let weak: Weak<dyn TransportDelegate> = weak;
        *self.inner.delegate.lock() = Some(weak);
    }

    /// Install an authenticator.
    ///
    /// The authenticator picks the context keys it needs from those this
    /// transport offers. Picking a key that was not offered fails and leaves
    /// the previous authenticator in place.
    pub fn set_authentication(&self, auth: Arc<dyn Authenticator>) -> TransportResult<()> {
        let offered = self.inner.offered_context_keys();
        let accepted = auth.negotiate_context_keys(&offered)?;
        if let Some(key) = accepted.iter().find(|key| !offered.contains(key)) {
            return Err(AuthError::UnsupportedContextKey(*key).into());
        }
        debug!(
            transport = %self.inner.name,
            keys = accepted.len(),
            "authenticator installed"
        );
        self.inner.core.lock().context_keys = accepted;
        *self.inner.auth.lock() = auth;
        Ok(())
    }

    /// Keepalive predictor of this transport.
    pub fn keepalive(&self) -> &KeepalivePredictor {
        &self.inner.keepalive
    }

    /// When data was last received.
    pub fn last_alive(&self) -> Option<Instant> {
        self.inner.core.lock().last_alive
    }

    /// Number of sent frames not yet acknowledged.
    pub fn frames_in_transit(&self) -> usize {
        self.inner.core.lock().transit.len()
    }

    /// Start connecting.
    ///
    /// Only valid from `Disconnected`. A disabled transport, or one whose
    /// carrier cannot or is not configured to connect, moves to `Error`.
    pub fn connect(&self) -> TransportResult<()> {
        self.inner.connect()
    }

    /// Start closing. Does nothing if already closing or closed.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Send a frame.
    ///
    /// The frame is coerced to the transport's format and stamped with a
    /// fresh auth token. Frames with a non-zero message id are tracked until
    /// acknowledged. On failure the frame comes back inside the error.
    pub fn send(&self, frame: Frame, expect_more: bool) -> TransportResult<()> {
        self.inner.send(frame, expect_more)
    }

    /// Queue a control frame. Control frames bypass the send gate and are
    /// flushed as soon as the state allows. Without a session (`Disconnected`
    /// or `Error`) the frame is dropped.
    pub fn send_control(&self, frame: Frame) {
        self.inner.send_control(frame);
    }

    /// Flush queued control frames now.
    pub fn flush(&self) {
        self.inner.flush_control();
    }

    /// Feed raw bytes from the carrier.
    ///
    /// A protocol violation sends END, closes the link and is returned.
    pub fn receive(&self, data: &[u8]) -> TransportResult<()> {
        self.inner.receive(data)
    }

    /// Check whether the peer is alive.
    ///
    /// Resolves `true` at once if data arrived within `within`. Otherwise,
    /// if `active` is set, sends a probe and resolves `true` when it is
    /// answered or `false` after `timeout`.
    pub fn is_alive(&self, within: Duration, active: bool, timeout: Duration) -> LivenessCheck {
        self.inner.is_alive(within, active, timeout)
    }

    /// Move to `Error`.
    pub fn force_error(&self) {
        self.inner.set_state(TransportState::Error);
    }

    /// Return a terminal transport to a fresh `Disconnected` state so it can
    /// connect again. Queues, timers and pending probes are discarded
    /// without notification.
    pub fn reset(&self) -> TransportResult<()> {
        self.inner.reset()
    }
}

impl fmt::Debug for TransportEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEngine")
            .field("name", &self.inner.name)
            .field("protocol", &self.inner.carrier.protocol())
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn handle(&self) -> TransportHandle {
        TransportHandle {
            inner: self.me.clone(),
            name: Arc::clone(&self.name),
        }
    }

    fn state(&self) -> TransportState {
        self.core.lock().state
    }

    fn format(&self) -> Format {
        self.config.lock().format
    }

    fn delegate(&self) -> Option<Arc<dyn TransportDelegate>> {
        self.delegate.lock().as_ref().and_then(Weak::upgrade)
    }

    fn authenticator(&self) -> Arc<dyn Authenticator> {
        Arc::clone(&self.auth.lock())
    }

    fn adopt_format(&self, format: Format) {
        self.config.lock().format = format;
        self.acks.lock().set_format(format);
    }

    // ========================================================================
    // State machine
    // ========================================================================

    /// Single mutation point of the state.
    fn set_state(&self, new: TransportState) {
        let _transition = self.transition.lock();
        let (old, failed, timers) = {
            let mut core = self.core.lock();
            let old = core.state;
            if old == new {
                return;
            }
            if old == TransportState::Error {
                debug!(transport = %self.name, to = %new, "transport in error; reset required");
                return;
            }
            core.state = new;

            let mut timers = Vec::new();
            if matches!(new, TransportState::Available) || new.is_closing() {
                timers.extend(core.connect_guard.take());
            }
            let failed = if new.is_closing() {
                timers.extend(core.disconnect_guard.take());
                core.transit.drain()
            } else {
                Vec::new()
            };
            if new.is_terminal() {
                timers.extend(core.control_flush.take());
            }
            (old, failed, timers)
        };
        for timer in timers {
            timer.cancel();
        }
        if new.is_terminal() {
            self.discard_session_queues();
        }

        debug!(transport = %self.name, from = %old, to = %new, "state change");
        let handle = self.handle();
        let delegate = self.delegate();
        if let Some(delegate) = &delegate {
            delegate.state_changed(&handle, new, old);
        }

        if new == TransportState::Connected {
            self.keepalive.start();
        } else if new.is_closing() {
            self.keepalive.stop();
            if !failed.is_empty() {
                debug!(transport = %self.name, count = failed.len(), "frames in transit failed");
                if let Some(delegate) = &delegate {
                    delegate.frames_failed(&handle, failed);
                }
            }
        }

        if new == TransportState::Connected
            || (new == TransportState::Available && old == TransportState::Unavailable)
        {
            self.schedule_control_flush();
        }
    }

    /// Drop control frames and acks belonging to a session that is over, so
    /// the next connect starts clean.
    fn discard_session_queues(&self) {
        let stale = {
            let mut control = self.control.lock();
            let stale = control.len();
            control.clear();
            stale
        };
        self.acks.lock().reset();
        if stale > 0 {
            debug!(transport = %self.name, count = stale, "stale control frames discarded");
        }
    }

    fn schedule_control_flush(&self) {
        let delay = self.config.lock().control_flush_delay;
        let mut core = self.core.lock();
        if core.control_flush.is_some() {
            return;
        }
        let weak = self.me.clone();
        core.control_flush = self.scheduler.schedule_after(delay, move || {
            if let Some(inner) = weak.upgrade() {
                if let Some(timer) = inner.core.lock().control_flush.take() {
                    timer.disarm();
                }
                inner.flush_control();
            }
        });
    }

    fn connect(&self) -> TransportResult<()> {
        let _transition = self.transition.lock();
        let state = self.state();
        if state != TransportState::Disconnected {
            return Err(TransportError::InvalidState { state, frame: None });
        }

        let config = self.config.lock().clone();
        let refused = if !config.enabled {
            Some(TransportError::Disabled)
        } else if !self.carrier.can_connect() {
            Some(TransportError::ClientUnsupported)
        } else if !self.carrier.is_client_configured(&config) {
            Some(TransportError::NotConfigured(self.name.to_string()))
        } else {
            None
        };
        if let Some(err) = refused {
            warn!(transport = %self.name, error = %err, "connect refused");
            self.set_state(TransportState::Error);
            return Err(err);
        }

        self.set_state(TransportState::Connecting);
        let weak = self.me.clone();
        let guard = self
            .scheduler
            .schedule_after(config.connect_timeout, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.connect_timed_out();
                }
            });
        self.core.lock().connect_guard = guard;

        if let Err(err) = self.carrier.connect() {
            warn!(transport = %self.name, error = %err, "carrier failed to connect");
            self.set_state(TransportState::Error);
            return Err(err.into());
        }
        Ok(())
    }

    fn connect_timed_out(&self) {
        if let Some(timer) = self.core.lock().connect_guard.take() {
            timer.disarm();
        }
        if matches!(
            self.state(),
            TransportState::Connecting | TransportState::Connected
        ) {
            debug!(transport = %self.name, "connect timed out");
            self.disconnect();
        }
    }

    fn disconnect(&self) {
        let _transition = self.transition.lock();
        match self.state() {
            TransportState::Disconnecting
            | TransportState::Disconnected
            | TransportState::Error => return,
            TransportState::Connecting => {
                self.carrier.disconnect();
                if self.state() == TransportState::Connecting {
                    self.set_state(TransportState::Disconnected);
                }
                return;
            }
            _ => {}
        }

        self.flush_control();
        self.set_state(TransportState::Disconnecting);
        self.send_control(Frame::new(Operation::Close));
        self.keepalive.data_sent();

        let weak = self.me.clone();
        let guard = self
            .scheduler
            .schedule_after(self.keepalive.keepalive_expiry(), move || {
                if let Some(inner) = weak.upgrade() {
                    inner.disconnect_timed_out();
                }
            });
        self.core.lock().disconnect_guard = guard;
    }

    fn disconnect_timed_out(&self) {
        if let Some(timer) = self.core.lock().disconnect_guard.take() {
            timer.disarm();
        }
        if self.state() != TransportState::Disconnected {
            debug!(transport = %self.name, "close handshake timed out");
            self.carrier.disconnect();
            self.set_state(TransportState::Error);
        }
    }

    fn carrier_connected(&self) {
        let _transition = self.transition.lock();
        match self.state() {
            TransportState::Disconnected | TransportState::Connecting => {
                self.set_state(TransportState::Connected);
            }
            state => debug!(transport = %self.name, %state, "late connect notification ignored"),
        }
    }

    fn reset(&self) -> TransportResult<()> {
        let _transition = self.transition.lock();
        let timers = {
            let mut core = self.core.lock();
            if !core.state.is_terminal() {
                return Err(TransportError::InvalidState {
                    state: core.state,
                    frame: None,
                });
            }
            core.state = TransportState::Disconnected;
            core.transit.drain();
            core.last_alive = None;
            [
                core.connect_guard.take(),
                core.disconnect_guard.take(),
                core.control_flush.take(),
            ]
        };
        drop(timers);
        self.keepalive.stop();
        self.inbox.lock().clear();
        self.discard_session_queues();
        self.probes.lock().clear();
        debug!(transport = %self.name, "transport reset");
        Ok(())
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn send(&self, mut frame: Frame, expect_more: bool) -> TransportResult<()> {
        let state = self.state();
        if !state.can_send() {
            return Err(TransportError::InvalidState {
                state,
                frame: Some(Box::new(frame)),
            });
        }

        frame.set_format(self.format());
        self.stamp(&mut frame, None);
        trace!(transport = %self.name, %frame, "send");

        if let Err(source) = self.carrier.send_raw(&frame, expect_more) {
            warn!(transport = %self.name, error = %source, "send failed");
            self.set_state(TransportState::Error);
            return Err(TransportError::SendFailed {
                state,
                frames: vec![frame],
                source,
            });
        }

        if frame.message_id() != UNTRACKED_MESSAGE_ID {
            let mut core = self.core.lock();
            if !core.state.can_send() {
                let state = core.state;
                return Err(TransportError::InvalidState {
                    state,
                    frame: Some(Box::new(frame)),
                });
            }
            core.transit.push(frame);
        }
        self.keepalive.data_sent();
        Ok(())
    }

    fn stamp(&self, frame: &mut Frame, challenge: Option<&Frame>) {
        let context = self.auth_context();
        let token = self
            .authenticator()
            .create_response(challenge, frame, &context);
        if let Err(err) = frame.set_auth(Some(token)) {
            warn!(transport = %self.name, error = %err, "unusable auth token; frame sent unsigned");
        }
    }

    fn send_control(&self, mut frame: Frame) {
        let state = self.state();
        if state.is_terminal() {
            trace!(transport = %self.name, %state, %frame, "no session; control frame dropped");
            return;
        }
        frame.set_format(self.format());
        if frame.auth().is_none() {
            self.stamp(&mut frame, None);
        }
        self.control.lock().push_back(frame);
        let weak = self.me.clone();
        self.scheduler.execute(move || {
            if let Some(inner) = weak.upgrade() {
                inner.flush_control();
            }
        });
    }

    fn flush_control(&self) {
        let _flushing = self.flushing.lock();
        while self.state().can_flush_control() {
            let (frame, more) = {
                let mut control = self.control.lock();
                match control.pop_front() {
                    Some(frame) => (frame, !control.is_empty()),
                    None => break,
                }
            };
            match self.carrier.send_raw(&frame, more) {
                Ok(()) => {
                    trace!(transport = %self.name, %frame, "control sent");
                    self.keepalive.data_sent();
                }
                Err(err) => {
                    debug!(transport = %self.name, error = %err, "control send failed; requeued");
                    self.control.lock().push_front(frame);
                    break;
                }
            }
        }
        self.carrier.flush();
    }

    fn send_keepalive(&self, ping: bool, kind: KeepaliveKind, interval: i32, token: &[u8]) {
        let op = if ping { Operation::Ping } else { Operation::Pong };
        let payload = KeepalivePayload::new(kind, interval, token.to_vec()).encode();
        self.send_control(Frame::new(op).with_payload(payload));
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    fn receive(&self, data: &[u8]) -> TransportResult<()> {
        let _transition = self.transition.lock();
        let (frames, violation) = self.cut_frames(data);
        for frame in frames {
            self.dispatch(frame);
        }
        match violation {
            None => Ok(()),
            Some(err) => {
                self.close_on_violation();
                Err(err.into())
            }
        }
    }

    /// Append `data` to the receive buffer and cut every complete frame
    /// from it. Bytes after a violation are discarded.
    fn cut_frames(&self, data: &[u8]) -> (Vec<Frame>, Option<FrameError>) {
        let mut inbox = self.inbox.lock();
        inbox.extend_from_slice(data);

        let mut frames = Vec::new();
        let mut consumed = 0;
        loop {
            match Frame::decode(&inbox[consumed..]) {
                Ok(Some((frame, used))) => {
                    consumed += used;
                    frames.push(frame);
                }
                Ok(None) => {
                    inbox.drain(..consumed);
                    return (frames, None);
                }
                Err(err) => {
                    let end = inbox.len().min(consumed + MAX_DIAGNOSTIC_DUMP);
                    warn!(transport = %self.name, error = %err, "protocol violation; closing");
                    debug!(
                        transport = %self.name,
                        bytes = %hex::encode(&inbox[consumed..end]),
                        "offending input"
                    );
                    inbox.clear();
                    return (frames, Some(err));
                }
            }
        }
    }

    fn deliver(&self, frame: Frame) {
        let _transition = self.transition.lock();
        self.dispatch(frame);
    }

    fn close_on_violation(&self) {
        self.send_control(Frame::new(Operation::End));
        self.flush_control();
        self.carrier.disconnect();
        if !self.state().is_terminal() {
            self.set_state(TransportState::Disconnected);
        }
    }

    /// Handle one decoded frame. Called under the transition lock so frames
    /// are processed in arrival order.
    fn dispatch(&self, frame: Frame) {
        self.core.lock().last_alive = Some(Instant::now());
        self.keepalive.data_received();
        trace!(transport = %self.name, %frame, "received");

        let handler: Handler = match frame.operation() {
            Operation::Open | Operation::Opened => Inner::on_open,
            Operation::Close => Inner::on_close,
            Operation::Challenge => Inner::on_challenge,
            Operation::Ack => Inner::on_ack,
            Operation::Ping => Inner::on_ping,
            Operation::Pong => Inner::on_pong,
            Operation::End
            | Operation::Error
            | Operation::Message
            | Operation::FragmentStart
            | Operation::FragmentEnd
            | Operation::Ok
            | Operation::Transport => Inner::authenticate,
        };
        if !handler(self, &frame) {
            return;
        }

        let entry = AckEntry::new(frame.channel(), frame.message_id());
        if let Some(delegate) = self.delegate() {
            delegate.frame_received(&self.handle(), frame);
        }
        self.acknowledge(entry);
    }

    fn authenticate(&self, frame: &Frame) -> bool {
        let auth = self.authenticator();
        let context = self.auth_context();
        match auth.verify(frame, &context) {
            Ok(true) => true,
            Ok(false) => {
                debug!(transport = %self.name, %frame, "unverified frame; challenging");
                match frame.serialize() {
                    Ok(original) => {
                        let mut challenge = Frame::new(Operation::Challenge).with_payload(original);
                        let token = auth.create_challenge(frame, &context);
                        if let Err(err) = challenge.set_auth(Some(token)) {
                            warn!(transport = %self.name, error = %err, "unusable challenge token");
                        }
                        self.send_control(challenge);
                    }
                    Err(err) => {
                        warn!(transport = %self.name, error = %err, "cannot wrap frame in challenge");
                    }
                }
                false
            }
            Err(err) => {
                warn!(transport = %self.name, error = %err, "authentication failed; disconnecting");
                self.disconnect();
                false
            }
        }
    }

    fn on_open(&self, frame: &Frame) -> bool {
        if !self.authenticate(frame) {
            return false;
        }
        let _transition = self.transition.lock();
        match self.state() {
            TransportState::Connected => {
                if frame.format() != self.format() {
                    debug!(transport = %self.name, format = %frame.format(), "adopting peer format");
                    self.adopt_format(frame.format());
                }
                self.set_state(TransportState::Available);
            }
            TransportState::Unavailable => self.set_state(TransportState::Available),
            TransportState::Available => {}
            state => debug!(transport = %self.name, %state, op = %frame.operation(), "handshake raced"),
        }
        true
    }

    fn on_close(&self, frame: &Frame) -> bool {
        if self.authenticate(frame) {
            self.disconnect();
            self.carrier.disconnect();
            self.set_state(TransportState::Disconnected);
        }
        false
    }

    fn on_challenge(&self, frame: &Frame) -> bool {
        match Frame::decode(frame.payload()) {
            Ok(Some((mut original, _))) => {
                let context = self.auth_context();
                let token = self
                    .authenticator()
                    .create_response(Some(frame), &original, &context);
                match original.set_auth(Some(token)) {
                    Ok(()) => {
                        debug!(transport = %self.name, frame = %original, "answering challenge");
                        self.send_control(original);
                    }
                    Err(err) => {
                        warn!(transport = %self.name, error = %err, "unusable challenge response");
                    }
                }
            }
            Ok(None) => debug!(transport = %self.name, "challenge wraps a truncated frame"),
            Err(err) => debug!(transport = %self.name, error = %err, "challenge wraps a bad frame"),
        }
        false
    }

    fn on_ack(&self, frame: &Frame) -> bool {
        if !self.authenticate(frame) {
            return false;
        }
        match AckEntry::decode_all(frame.payload(), frame.format()) {
            Ok(entries) => {
                for entry in &entries {
                    self.remove_transit(entry, frame.format());
                }
            }
            Err(err) => debug!(transport = %self.name, error = %err, "bad ack payload"),
        }
        false
    }

    fn on_ping(&self, frame: &Frame) -> bool {
        if !self.authenticate(frame) {
            return false;
        }
        if matches!(
            self.state(),
            TransportState::Disconnecting | TransportState::Disconnected
        ) {
            return false;
        }
        match KeepalivePayload::decode(frame.payload()) {
            Ok(ping) if ping.kind == KeepaliveKind::Probe => {
                self.send_keepalive(false, KeepaliveKind::Probe, ping.interval, &ping.token);
            }
            Ok(ping) => {
                self.keepalive
                    .keepalive_received(true, ping.kind, ping.interval, &ping.token);
            }
            Err(err) => debug!(transport = %self.name, error = %err, "bad ping ignored"),
        }
        false
    }

    fn on_pong(&self, frame: &Frame) -> bool {
        if !self.authenticate(frame) {
            return false;
        }
        match KeepalivePayload::decode(frame.payload()) {
            Ok(pong) if pong.kind == KeepaliveKind::Probe => {
                let probe = self.probes.lock().remove(&pong.token);
                match probe {
                    Some(probe) => {
                        let _ = probe.tx.send(true);
                    }
                    None => trace!(transport = %self.name, "late probe answer"),
                }
            }
            Ok(pong) => {
                self.keepalive
                    .keepalive_received(false, pong.kind, pong.interval, &pong.token);
            }
            Err(err) => debug!(transport = %self.name, error = %err, "bad pong ignored"),
        }
        false
    }

    // ========================================================================
    // Transit and acknowledgements
    // ========================================================================

    fn remove_transit(&self, entry: &AckEntry, format: Format) {
        let (acked, resend) = {
            let mut core = self.core.lock();
            let Some(acked) = core.transit.acknowledge(entry, format) else {
                return;
            };
            let resend = if acked.was_head {
                None
            } else {
                core.transit.head().cloned()
            };
            (acked, resend)
        };
        if let Some(head) = resend {
            debug!(transport = %self.name, frame = %head, "acknowledgement gap; resending head");
            self.send_control(head);
        }
        if let Some(delegate) = self.delegate() {
            delegate.frame_sent(&self.handle(), acked.frame);
        }
    }

    fn acknowledge(&self, entry: AckEntry) {
        if entry.message_id == UNTRACKED_MESSAGE_ID {
            return;
        }
        let now = Instant::now();
        let mut batch = self.acks.lock();
        if batch.is_full() {
            if let Some(payload) = batch.take(now) {
                self.send_ack(payload);
            }
        }
        batch.push(entry);

        if batch.recently_flushed(now) {
            if !batch.has_pending() {
                let weak = self.me.clone();
                batch.set_pending(self.scheduler.schedule_after(ACK_FLUSH_DELAY, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.flush_acks();
                    }
                }));
            }
            return;
        }
        if let Some(payload) = batch.take(now) {
            self.send_ack(payload);
        }
    }

    fn flush_acks(&self) {
        let mut batch = self.acks.lock();
        batch.clear_pending();
        if let Some(payload) = batch.take(Instant::now()) {
            self.send_ack(payload);
        }
    }

    fn send_ack(&self, payload: Vec<u8>) {
        self.send_control(Frame::new(Operation::Ack).with_payload(payload));
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    fn is_alive(&self, within: Duration, active: bool, timeout: Duration) -> LivenessCheck {
        let (tx, rx) = oneshot::channel();
        let check = LivenessCheck { rx };

        let recent = self
            .core
            .lock()
            .last_alive
            .is_some_and(|at| at.elapsed() < within);
        if recent || !active {
            let _ = tx.send(recent);
            return check;
        }

        let mut token = vec![0u8; KEEPALIVE_TOKEN_SIZE];
        rand::thread_rng().fill_bytes(&mut token);
        self.probes.lock().insert(
            token.clone(),
            Probe {
                tx,
                timeout: None,
            },
        );

        let weak = self.me.clone();
        let key = token.clone();
        let timer = self.scheduler.schedule_after(timeout, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let probe = inner.probes.lock().remove(&key);
            if let Some(probe) = probe {
                trace!(transport = %inner.name, "probe timed out");
                if let Some(own) = probe.timeout {
                    own.disarm();
                }
                let _ = probe.tx.send(false);
            }
        });
        if let Some(probe) = self.probes.lock().get_mut(&token) {
            probe.timeout = timer;
        }

        trace!(transport = %self.name, "probing peer");
        self.send_keepalive(true, KeepaliveKind::Probe, 0, &token);
        check
    }

    // ========================================================================
    // Authentication context
    // ========================================================================

    fn offered_context_keys(&self) -> HashSet<ContextKey> {
        let has_options = !self.config.lock().options.is_empty();
        ContextKey::ALL
            .into_iter()
            .filter(|key| *key != ContextKey::Configuration || has_options)
            .collect()
    }

    fn auth_context(&self) -> AuthContext {
        let (keys, state, last_alive) = {
            let core = self.core.lock();
            (core.context_keys.clone(), core.state, core.last_alive)
        };
        let mut context = AuthContext::new();
        for key in keys {
            let value = match key {
                ContextKey::Transport => ContextValue::Text(self.name.to_string()),
                ContextKey::Protocol => ContextValue::Text(self.carrier.protocol().to_string()),
                ContextKey::State => ContextValue::Text(state.as_str().to_string()),
                ContextKey::LastAlive => ContextValue::Elapsed(last_alive.map(|at| at.elapsed())),
                ContextKey::Format => ContextValue::Format(self.format()),
                ContextKey::Priority => {
                    ContextValue::Integer(i64::from(self.config.lock().priority))
                }
                ContextKey::Configuration => {
                    ContextValue::Text(self.config.lock().options_string())
                }
            };
            context.insert(key, value);
        }
        context
    }
}

impl KeepaliveDelegate for Inner {
    fn predicted_keepalive_expired(&self, overdue: Duration) {
        warn!(
            transport = %self.name,
            overdue_ms = overdue.as_millis() as u64,
            "keepalive expired; peer presumed gone"
        );
        self.carrier.disconnect();
        self.set_state(TransportState::Disconnected);
    }

    fn should_send_keepalive(&self, ping: bool, kind: KeepaliveKind, interval: i32, token: &[u8]) {
        self.send_keepalive(ping, kind, interval, token);
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Weak reference to a transport, given to carriers and delegates.
///
/// Every method is a no-op (or returns `None`) once the transport is gone.
#[derive(Clone)]
pub struct TransportHandle {
    inner: Weak<Inner>,
    name: Arc<str>,
}

impl TransportHandle {
    /// Name of the transport.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The transport, if it still exists.
    pub fn engine(&self) -> Option<TransportEngine> {
        self.inner.upgrade().map(|inner| TransportEngine { inner })
    }

    /// Current state of the transport.
    pub fn state(&self) -> Option<TransportState> {
        self.inner.upgrade().map(|inner| inner.state())
    }

    /// Report the link as up.
    pub fn set_connected(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.carrier_connected();
        }
    }

    /// Report the link as down.
    pub fn set_disconnected(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.set_state(TransportState::Disconnected);
        }
    }

    /// Report a link failure.
    pub fn set_error(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.set_state(TransportState::Error);
        }
    }

    /// Feed raw bytes to the transport.
    pub fn receive(&self, data: &[u8]) -> TransportResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.receive(data),
            None => Ok(()),
        }
    }

    /// Hand an already decoded frame to the transport.
    pub fn deliver(&self, frame: Frame) {
        if let Some(inner) = self.inner.upgrade() {
            inner.deliver(frame);
        }
    }

    /// Ask the delegate to relay a frame over another transport.
    pub fn request_relay(&self, frame: Frame) {
        if let Some(inner) = self.inner.upgrade() {
            match inner.delegate() {
                Some(delegate) => delegate.needs_relay(self, frame),
                None => debug!(transport = %self.name, %frame, "no delegate; relay dropped"),
            }
        }
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("name", &self.name)
            .field("attached", &(self.inner.strong_count() > 0))
            .finish()
    }
}

// ============================================================================
// Liveness check
// ============================================================================

/// Pending answer of [`TransportEngine::is_alive`].
///
/// Resolves to `false` if the transport is reset or dropped first.
#[derive(Debug)]
pub struct LivenessCheck {
    rx: oneshot::Receiver<bool>,
}

impl LivenessCheck {
    /// The answer, if already known.
    pub fn try_result(&mut self) -> Option<bool> {
        match self.rx.try_recv() {
            Ok(alive) => Some(alive),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(false),
        }
    }
}

impl Future for LivenessCheck {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.rx).poll(cx).map(|res| res.unwrap_or(false))
    }
}
