//! Delivery bookkeeping: frames awaiting acknowledgement, and the outgoing
//! ack batch.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::timer::TimerHandle;
use crate::core::{ACK_COALESCE_WINDOW, UNTRACKED_MESSAGE_ID};
use crate::wire::{AckEntry, Format, Frame};

/// A frame removed from the transit list by an acknowledgement.
#[derive(Debug)]
pub struct Acknowledged {
    /// The delivered frame.
    pub frame: Frame,
    /// Whether it was the oldest unacknowledged frame.
    pub was_head: bool,
}

/// Frames handed to the carrier and not yet acknowledged, oldest first.
#[derive(Debug, Default)]
pub struct TransitList {
    frames: VecDeque<Frame>,
}

impl TransitList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a sent frame. Untracked frames (id 0) are ignored.
    pub fn push(&mut self, frame: Frame) {
        if frame.message_id() != UNTRACKED_MESSAGE_ID {
            self.frames.push_back(frame);
        }
    }

    /// Remove the first frame matching `entry`.
    pub fn acknowledge(&mut self, entry: &AckEntry, format: Format) -> Option<Acknowledged> {
        if entry.message_id == UNTRACKED_MESSAGE_ID {
            return None;
        }
        let pos = self
            .frames
            .iter()
            .position(|f| entry.matches(format, f.channel(), f.message_id()))?;
        let frame = self.frames.remove(pos)?;
        Some(Acknowledged {
            frame,
            was_head: pos == 0,
        })
    }

    /// Oldest unacknowledged frame.
    pub fn head(&self) -> Option<&Frame> {
        self.frames.front()
    }

    /// Remove and return every frame, oldest first.
    pub fn drain(&mut self) -> Vec<Frame> {
        self.frames.drain(..).collect()
    }

    /// Number of frames in transit.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing is in transit.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Rolling buffer of ack entries waiting to go out in one ACK frame.
#[derive(Debug)]
pub struct AckBatch {
    format: Format,
    capacity: usize,
    buf: Vec<u8>,
    last_flush: Option<Instant>,
    pending: Option<TimerHandle>,
}

impl AckBatch {
    /// Create a batch holding up to `capacity` payload bytes.
    pub fn new(format: Format, capacity: usize) -> Self {
        Self {
            format,
            capacity: capacity.max(AckEntry::encoded_len(format)),
            buf: Vec::with_capacity(capacity),
            last_flush: None,
            pending: None,
        }
    }

    /// Entry encoding in use.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Switch entry encoding. Only meaningful while the batch is empty.
    pub fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    /// Whether another entry would not fit.
    pub fn is_full(&self) -> bool {
        self.capacity - self.buf.len() < AckEntry::encoded_len(self.format)
    }

    /// Whether no entries are buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append an entry.
    pub fn push(&mut self, entry: AckEntry) {
        entry.encode_into(self.format, &mut self.buf);
    }

    /// Whether the last flush is recent enough to defer this one.
    pub fn recently_flushed(&self, now: Instant) -> bool {
        self.last_flush
            .is_some_and(|at| now.saturating_duration_since(at) < ACK_COALESCE_WINDOW)
    }

    /// Take the buffered payload and record the flush time.
    pub fn take(&mut self, now: Instant) -> Option<Vec<u8>> {
        self.last_flush = Some(now);
        if self.buf.is_empty() {
            return None;
        }
        Some(std::mem::replace(
            &mut self.buf,
            Vec::with_capacity(self.capacity),
        ))
    }

    /// Whether a deferred flush is armed.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Arm a deferred flush.
    pub fn set_pending(&mut self, timer: Option<TimerHandle>) {
        self.pending = timer;
    }

    /// Release the deferred flush slot from inside its own callback.
    pub fn clear_pending(&mut self) {
        if let Some(timer) = self.pending.take() {
            timer.disarm();
        }
    }

    /// Drop buffered entries and cancel any deferred flush.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.last_flush = None;
        self.pending = None;
    }

    /// Time since the last flush.
    pub fn since_last_flush(&self, now: Instant) -> Option<Duration> {
        self.last_flush.map(|at| now.saturating_duration_since(at))
    }
}
