//! Per-connection state shared between a client's own task and the fanout path.
//!
//! The socket itself is owned by the connection's writer task. Everyone else
//! reaches it through a bounded queue, so a slow client can only ever fill
//! its own queue and never stall the sender of a broadcast.

use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::sync::mpsc;

pub type ConnectionId = u64;

/// Placeholder for a peer address or display name that is not known.
pub const UNKNOWN: &str = "unknown";

/// A frame queued for delivery to one client.
///
/// Payloads are reference counted so one inbound message can be queued for
/// every recipient without copying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Arc<str>),
    Binary(Arc<[u8]>),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection is closed")]
    Closed,
    #[error("outbound queue is full")]
    Full,
}

pub struct Connection {
    id: ConnectionId,
    peer: String,
    display_name: OnceLock<String>,
    outbound: mpsc::Sender<Frame>,
    closed: AtomicBool,
    dropped: AtomicU64,
    connected_at: Instant,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, peer: String, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id,
            peer,
            display_name: OnceLock::new(),
            outbound,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address captured at accept time, or [`UNKNOWN`].
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.get().map(String::as_str)
    }

    pub fn name_or_unknown(&self) -> &str {
        self.display_name().unwrap_or(UNKNOWN)
    }

    /// Sets the display name. Only the first call has an effect; returns
    /// `false` when a name was already present.
    pub fn set_display_name(&self, name: String) -> bool {
        self.display_name.set(name).is_ok()
    }

    /// Queues a frame without waiting.
    ///
    /// Fails when the connection has been closed, its writer has gone away,
    /// or the queue is full. Every failure is counted in [`Connection::dropped`].
    pub fn send(&self, frame: Frame) -> Result<(), DeliveryError> {
        let result = if !self.is_writable() {
            Err(DeliveryError::Closed)
        } else {
            self.outbound.try_send(frame).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
                mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
            })
        };

        if result.is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// `false` once the connection is closed or its writer has gone away.
    pub fn is_writable(&self) -> bool {
        !self.is_closed() && !self.outbound.is_closed()
    }

    /// Marks the connection as no longer writable. Returns `true` only for
    /// the call that performed the transition.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Number of frames that could not be queued for this client.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("display_name", &self.display_name())
            .field("closed", &self.is_closed())
            .finish()
    }
}
