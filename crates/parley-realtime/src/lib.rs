//! Realtime protocol client.
//!
//! The outbound half is the [`RealtimeTransport`] trait: fire-and-forget
//! queueing of [`ClientEvent`]s. The inbound half is a channel of
//! [`InboundEvent`]s, each stamped with the turn [`Epoch`] that was current
//! when the frame was read, so stale audio can be recognised downstream.

use async_trait::async_trait;

use parley_core::error::Result;
use parley_core::protocol::{ClientEvent, ServerEvent};
use parley_core::types::Epoch;

pub mod client;
pub mod memory;

pub use client::{ConnectOptions, RealtimeClient};
pub use memory::{MemoryRemote, MemoryTransport};

/// Outbound side of a realtime connection.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Queue an event for sending. Never waits on the network.
    fn send(&self, event: ClientEvent) -> Result<()>;

    /// Close the connection and stop the reader.
    async fn close(&self) -> Result<()>;
}

/// What the connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The handshake completed; outbound events now reach the service.
    Opened,
    Server(ServerEvent),
    /// A text frame that is not a valid server event.
    Malformed { raw: String, error: String },
    /// The remote closed the connection.
    Closed { reason: Option<String> },
    /// Connecting, sending, or reading failed. The connection is gone.
    Failed(String),
}

/// A transport event tagged with the epoch current at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub epoch: Epoch,
    pub event: TransportEvent,
}
