//! Collaborator interfaces of a transport.

use tracing::warn;

use super::{CarrierError, TransportConfig, TransportHandle, TransportState};
use crate::wire::Frame;

/// Raw link primitives a transport drives.
///
/// A carrier moves bytes (or whole frames) over one concrete link: a
/// socket, an HTTP exchange, an in-process channel. It reports link events
/// back through the [`TransportHandle`] passed to [`attach`](Self::attach).
///
/// Carriers are called without any transport lock held and may call back
/// into the handle synchronously.
pub trait Carrier: Send + Sync {
    /// Protocol name, e.g. `"loopback"` or `"socket"`.
    fn protocol(&self) -> &str;

    /// Whether this carrier can initiate connections.
    fn can_connect(&self) -> bool;

    /// Whether this carrier accepts incoming connections.
    fn can_listen(&self) -> bool {
        false
    }

    /// Whether `config` holds everything needed to connect.
    fn is_client_configured(&self, config: &TransportConfig) -> bool {
        let _ = config;
        true
    }

    /// Receive the handle of the owning transport.
    fn attach(&self, transport: TransportHandle) {
        let _ = transport;
    }

    /// Start bringing the link up. Completion is reported with
    /// [`TransportHandle::set_connected`].
    fn connect(&self) -> Result<(), CarrierError>;

    /// Write one frame. `expect_more` hints that another frame follows.
    fn send_raw(&self, frame: &Frame, expect_more: bool) -> Result<(), CarrierError>;

    /// Tear the link down. Completion is reported with
    /// [`TransportHandle::set_disconnected`].
    fn disconnect(&self);

    /// Push out anything the carrier buffered.
    fn flush(&self) {}
}

/// Receiver of transport events, normally the owning endpoint.
///
/// Transports hold their delegate weakly.
pub trait TransportDelegate: Send + Sync {
    /// An authenticated frame arrived.
    fn frame_received(&self, transport: &TransportHandle, frame: Frame);

    /// The transport changed state.
    fn state_changed(&self, transport: &TransportHandle, new: TransportState, old: TransportState);

    /// Frames in transit were dropped when the transport left the connected
    /// states. They may be resent on another transport.
    fn frames_failed(&self, transport: &TransportHandle, frames: Vec<Frame>);

    /// The peer acknowledged a frame.
    fn frame_sent(&self, transport: &TransportHandle, frame: Frame) {
        let _ = (transport, frame);
    }

    /// The carrier cannot deliver this frame itself and asks for it to be
    /// relayed over another transport.
    fn needs_relay(&self, transport: &TransportHandle, frame: Frame) {
        warn!(
            transport = %transport.name(),
            frame = %frame,
            "frame needs relay but no relay is available; dropped"
        );
    }
}
