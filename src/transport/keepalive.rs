//! Keepalive prediction.
//!
//! The predictor decides when a transport should ping its peer and when an
//! unanswered ping means the peer is gone. It knows nothing about carriers:
//! pings are sent and expiry is acted on through a [`KeepaliveDelegate`].
//!
//! The next ping is due `interval` seconds after the *older* of the last
//! data sent and the last data received, so a link that only sends (or only
//! receives) is still validated in both directions. While a ping is
//! outstanding no other ping is sent; the peer then has `expiry` to answer.

use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::timer::{Scheduler, TimerHandle};
use crate::core::{
    DEFAULT_KEEPALIVE_EXPIRY, DEFAULT_KEEPALIVE_INTERVAL, KEEPALIVE_DUE_WINDOW,
    KEEPALIVE_RESCHEDULE_TOLERANCE, KEEPALIVE_TOKEN_SIZE, MAX_AUTO_KEEPALIVE_INTERVAL,
    MAX_KEEPALIVE_INTERVAL, MIN_AUTO_KEEPALIVE_INTERVAL, MIN_KEEPALIVE_INTERVAL,
    MIN_KEEPALIVE_WAKEUP,
};
use crate::wire::KeepaliveKind;

/// Configured keepalive interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeepalivePolicy {
    /// No keepalives.
    Disabled,
    /// Built-in default interval.
    #[default]
    Default,
    /// Explicit interval in seconds.
    Interval(u32),
}

impl KeepalivePolicy {
    /// Wire value meaning "disabled".
    pub const DISABLED: i32 = -1;
    /// Wire value meaning "default".
    pub const DEFAULT: i32 = 0;

    /// Interpret a wire interval.
    pub fn from_secs(secs: i32) -> Self {
        match secs {
            Self::DISABLED => Self::Disabled,
            s if s <= Self::DEFAULT => Self::Default,
            s => Self::Interval(s.unsigned_abs()),
        }
    }

    /// Wire value of this policy.
    pub fn as_secs(self) -> i32 {
        match self {
            Self::Disabled => Self::DISABLED,
            Self::Default => Self::DEFAULT,
            Self::Interval(s) => i32::try_from(s).unwrap_or(i32::MAX),
        }
    }
}

impl FromStr for KeepalivePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(Self::Disabled),
            "default" => Ok(Self::Default),
            other => other
                .parse::<i32>()
                .map(Self::from_secs)
                .map_err(|_| other.to_string()),
        }
    }
}

/// Receiver of keepalive decisions.
pub trait KeepaliveDelegate: Send + Sync {
    /// The outstanding ping went unanswered for at least the expiry period.
    fn predicted_keepalive_expired(&self, overdue: Duration);

    /// Transmit a ping (`ping == true`) or pong with this payload.
    fn should_send_keepalive(&self, ping: bool, kind: KeepaliveKind, interval: i32, token: &[u8]);
}

#[derive(Debug)]
struct Outstanding {
    token: Vec<u8>,
    sent_at: Instant,
}

#[derive(Debug)]
struct PredictorState {
    policy: KeepalivePolicy,
    /// Active interval in seconds; non-positive when disabled.
    next_interval: i32,
    min_interval: u32,
    max_interval: u32,
    min_auto_interval: u32,
    max_auto_interval: u32,
    expiry: Duration,
    last_sent: Instant,
    last_received: Instant,
    outstanding: Option<Outstanding>,
    started: bool,
    wakeup: Option<TimerHandle>,
    /// Bumped each time a wakeup is armed; a callback carrying an older
    /// value was superseded and must not touch the slot.
    generation: u64,
}

impl PredictorState {
    fn apply_policy(&mut self, policy: KeepalivePolicy) {
        self.policy = policy;
        self.next_interval = match policy {
            KeepalivePolicy::Disabled => KeepalivePolicy::DISABLED,
            KeepalivePolicy::Default => DEFAULT_KEEPALIVE_INTERVAL as i32,
            KeepalivePolicy::Interval(s) if (self.min_interval..=self.max_interval).contains(&s) => {
                s as i32
            }
            KeepalivePolicy::Interval(s) => {
                debug!(
                    interval = s,
                    min = self.min_interval,
                    max = self.max_interval,
                    "keepalive interval out of bounds; using default"
                );
                DEFAULT_KEEPALIVE_INTERVAL as i32
            }
        };
    }

    fn ping_kind(&self) -> KeepaliveKind {
        match self.policy {
            KeepalivePolicy::Interval(_) => KeepaliveKind::Renegotiate,
            _ => KeepaliveKind::Fixed,
        }
    }

    fn send_deadline(&self) -> Option<Instant> {
        if self.next_interval <= 0 || self.outstanding.is_some() {
            return None;
        }
        let base = self.last_sent.min(self.last_received);
        Some(base + Duration::from_secs(self.next_interval.unsigned_abs().into()))
    }

    fn receive_deadline(&self) -> Option<Instant> {
        self.outstanding.as_ref().map(|o| o.sent_at + self.expiry)
    }
}

enum Wakeup {
    Idle,
    Expired(Duration),
    Ping {
        kind: KeepaliveKind,
        interval: i32,
        token: Vec<u8>,
    },
}

struct Shared {
    state: Mutex<PredictorState>,
    delegate: Mutex<Option<Weak<dyn KeepaliveDelegate>>>,
    scheduler: Scheduler,
}

/// Per-transport keepalive timer engine.
///
/// Cloning yields another handle to the same predictor.
#[derive(Clone)]
pub struct KeepalivePredictor {
    shared: Arc<Shared>,
}

impl KeepalivePredictor {
    /// Create a stopped predictor. Keepalives are disabled until an interval
    /// policy is set.
    pub fn new(scheduler: Scheduler) -> Self {
        let now = Instant::now();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PredictorState {
                    policy: KeepalivePolicy::Disabled,
                    next_interval: KeepalivePolicy::DISABLED,
                    min_interval: MIN_KEEPALIVE_INTERVAL,
                    max_interval: MAX_KEEPALIVE_INTERVAL,
                    min_auto_interval: MIN_AUTO_KEEPALIVE_INTERVAL,
                    max_auto_interval: MAX_AUTO_KEEPALIVE_INTERVAL,
                    expiry: DEFAULT_KEEPALIVE_EXPIRY,
                    last_sent: now,
                    last_received: now,
                    outstanding: None,
                    started: false,
                    wakeup: None,
                    generation: 0,
                }),
                delegate: Mutex::new(None),
                scheduler,
            }),
        }
    }

    /// Set the receiver of pings and expiry notices. Held weakly.
    pub fn set_delegate(&self, delegate: Weak<dyn KeepaliveDelegate>) {
        *self.shared.delegate.lock() = Some(delegate);
    }

    fn delegate(&self) -> Option<Arc<dyn KeepaliveDelegate>> {
        self.shared.delegate.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Set the interval policy. Reschedules a running predictor.
    pub fn set_keepalive_interval(&self, policy: KeepalivePolicy) {
        let started = {
            let mut st = self.shared.state.lock();
            st.apply_policy(policy);
            st.started
        };
        if started {
            self.schedule();
        }
    }

    /// Configured interval policy.
    pub fn keepalive_interval(&self) -> KeepalivePolicy {
        self.shared.state.lock().policy
    }

    /// Interval currently in effect, in seconds. Negative when disabled.
    pub fn next_interval(&self) -> i32 {
        self.shared.state.lock().next_interval
    }

    /// Set the grace period for an unanswered ping.
    pub fn set_keepalive_expiry(&self, expiry: Duration) {
        let started = {
            let mut st = self.shared.state.lock();
            st.expiry = expiry;
            st.started
        };
        if started {
            self.schedule();
        }
    }

    /// Grace period for an unanswered ping.
    pub fn keepalive_expiry(&self) -> Duration {
        self.shared.state.lock().expiry
    }

    /// Set the hard interval bounds, in seconds.
    pub fn set_bounds(&self, min: u32, max: u32) {
        let mut st = self.shared.state.lock();
        st.min_interval = min.max(1);
        st.max_interval = max.clamp(st.min_interval, MAX_KEEPALIVE_INTERVAL);
        let policy = st.policy;
        st.apply_policy(policy);
    }

    /// Hard interval bounds, in seconds.
    pub fn bounds(&self) -> (u32, u32) {
        let st = self.shared.state.lock();
        (st.min_interval, st.max_interval)
    }

    /// Set the auto-tune bounds, in seconds.
    pub fn set_auto_bounds(&self, min: u32, max: u32) {
        let mut st = self.shared.state.lock();
        st.min_auto_interval = min.max(1);
        st.max_auto_interval = max.max(st.min_auto_interval);
    }

    /// Auto-tune bounds, in seconds.
    pub fn auto_bounds(&self) -> (u32, u32) {
        let st = self.shared.state.lock();
        (st.min_auto_interval, st.max_auto_interval)
    }

    /// Whether the predictor is running.
    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    /// Whether a ping is awaiting its pong.
    pub fn has_outstanding_ping(&self) -> bool {
        self.shared.state.lock().outstanding.is_some()
    }

    /// Start predicting. Does nothing when keepalives are disabled.
    pub fn start(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.policy == KeepalivePolicy::Disabled {
                trace!("keepalives disabled; predictor not started");
                return;
            }
            let now = Instant::now();
            st.started = true;
            st.outstanding = None;
            st.last_sent = now;
            st.last_received = now;
        }
        self.schedule();
    }

    /// Stop predicting and cancel the pending wakeup.
    pub fn stop(&self) {
        let wakeup = {
            let mut st = self.shared.state.lock();
            st.started = false;
            st.outstanding = None;
            st.wakeup.take()
        };
        if let Some(wakeup) = wakeup {
            wakeup.cancel();
        }
    }

    /// Record outbound traffic.
    pub fn data_sent(&self) {
        self.shared.state.lock().last_sent = Instant::now();
    }

    /// Record inbound traffic.
    pub fn data_received(&self) {
        self.shared.state.lock().last_received = Instant::now();
    }

    /// Time until the next ping is due; `None` while one is outstanding or
    /// keepalives are off. Zero when overdue.
    pub fn next_keepalive_send(&self) -> Option<Duration> {
        let st = self.shared.state.lock();
        st.send_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Time since the outstanding ping was sent, if there is one.
    pub fn outstanding_for(&self) -> Option<Duration> {
        let st = self.shared.state.lock();
        st.outstanding
            .as_ref()
            .map(|o| Instant::now().saturating_duration_since(o.sent_at))
    }

    /// Handle a PING (`ping == true`) or PONG from the peer.
    pub fn keepalive_received(&self, ping: bool, kind: KeepaliveKind, interval: i32, token: &[u8]) {
        trace!(ping, ?kind, interval, token = %String::from_utf8_lossy(token), "keepalive received");
        if ping {
            let reply_kind = {
                let mut st = self.shared.state.lock();
                if kind == KeepaliveKind::Renegotiate {
                    st.apply_policy(KeepalivePolicy::from_secs(interval));
                }
                st.ping_kind()
            };
            if kind == KeepaliveKind::Renegotiate {
                self.schedule();
            }
            if let Some(delegate) = self.delegate() {
                delegate.should_send_keepalive(false, reply_kind, interval, token);
            }
            return;
        }

        {
            let mut st = self.shared.state.lock();
            match &st.outstanding {
                Some(o) if o.token == token => st.outstanding = None,
                Some(_) => {
                    trace!("pong does not match outstanding ping; ignored");
                    return;
                }
                None => {
                    trace!("no ping outstanding; pong ignored");
                    return;
                }
            }
            if kind == KeepaliveKind::Renegotiate {
                st.apply_policy(KeepalivePolicy::from_secs(interval));
            }
        }
        self.schedule();
    }

    /// Re-arm the wakeup for the earliest deadline.
    ///
    /// An armed wakeup is kept when it fires no more than the tolerance
    /// after the new deadline.
    pub fn schedule(&self) {
        let mut st = self.shared.state.lock();
        if !st.started {
            return;
        }
        let now = Instant::now();
        let deadline = match [st.send_deadline(), st.receive_deadline()]
            .into_iter()
            .flatten()
            .min()
        {
            Some(d) => d.max(now + MIN_KEEPALIVE_WAKEUP),
            None => {
                st.wakeup = None;
                return;
            }
        };

        if let Some(armed) = &st.wakeup {
            let at = armed.deadline();
            if at > now && at <= deadline + KEEPALIVE_RESCHEDULE_TOLERANCE {
                return;
            }
        }

        st.generation = st.generation.wrapping_add(1);
        let generation = st.generation;
        let weak = Arc::downgrade(&self.shared);
        st.wakeup = self.shared.scheduler.schedule_at(deadline, move || {
            if let Some(shared) = weak.upgrade() {
                KeepalivePredictor { shared }.wake(generation);
            }
        });
    }

    fn wake(&self, generation: u64) {
        let action = {
            let mut st = self.shared.state.lock();
            if st.generation != generation {
                trace!("superseded keepalive wakeup");
                return;
            }
            if let Some(own) = st.wakeup.take() {
                own.disarm();
            }
            if !st.started {
                return;
            }
            let now = Instant::now();
            match &st.outstanding {
                Some(o) => {
                    let overdue = now.saturating_duration_since(o.sent_at);
                    if overdue >= st.expiry {
                        st.outstanding = None;
                        Wakeup::Expired(overdue)
                    } else {
                        Wakeup::Idle
                    }
                }
                None => match st.send_deadline() {
                    Some(due) if due <= now + KEEPALIVE_DUE_WINDOW => {
                        let token = new_token();
                        st.outstanding = Some(Outstanding {
                            token: token.clone(),
                            sent_at: now,
                        });
                        Wakeup::Ping {
                            kind: st.ping_kind(),
                            interval: st.next_interval,
                            token,
                        }
                    }
                    _ => Wakeup::Idle,
                },
            }
        };

        match action {
            Wakeup::Expired(overdue) => {
                debug!(overdue_ms = overdue.as_millis() as u64, "keepalive expired");
                if let Some(delegate) = self.delegate() {
                    delegate.predicted_keepalive_expired(overdue);
                }
                return;
            }
            Wakeup::Ping {
                kind,
                interval,
                token,
            } => {
                trace!(interval, "keepalive due; sending ping");
                if let Some(delegate) = self.delegate() {
                    delegate.should_send_keepalive(true, kind, interval, &token);
                }
            }
            Wakeup::Idle => {}
        }
        self.schedule();
    }
}

impl std::fmt::Debug for KeepalivePredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("KeepalivePredictor")
            .field("policy", &st.policy)
            .field("next_interval", &st.next_interval)
            .field("expiry", &st.expiry)
            .field("started", &st.started)
            .field("outstanding", &st.outstanding.is_some())
            .finish()
    }
}

fn new_token() -> Vec<u8> {
    let mut raw = [0u8; KEEPALIVE_TOKEN_SIZE];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw).into_bytes()
}
