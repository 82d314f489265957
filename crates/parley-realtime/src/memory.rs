//! In-process transport for driving sessions without a network.
//!
//! [`MemoryTransport`] is handed to the session; the paired [`MemoryRemote`]
//! plays the service: it injects server events and inspects what was sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use parley_core::error::{ParleyError, Result};
use parley_core::protocol::{ClientEvent, ServerEvent};
use parley_core::types::EpochGate;

use crate::{InboundEvent, RealtimeTransport, TransportEvent};

#[derive(Default)]
struct Shared {
    sent: Mutex<Vec<ClientEvent>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

pub struct MemoryTransport {
    shared: Arc<Shared>,
}

/// The service side of a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryRemote {
    shared: Arc<Shared>,
    gate: EpochGate,
    tx: mpsc::UnboundedSender<InboundEvent>,
}

impl MemoryTransport {
    pub fn new(gate: EpochGate) -> (Self, MemoryRemote, mpsc::UnboundedReceiver<InboundEvent>) {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let remote = MemoryRemote {
            shared: shared.clone(),
            gate,
            tx,
        };
        (Self { shared }, remote, rx)
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    fn send(&self, event: ClientEvent) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ParleyError::Transport("connection closed".into()));
        }
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(ParleyError::Transport("send failed".into()));
        }
        self.shared
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl MemoryRemote {
    /// Deliver a transport event stamped with the current epoch.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(InboundEvent {
            epoch: self.gate.current(),
            event,
        });
    }

    pub fn open(&self) {
        self.emit(TransportEvent::Opened);
    }

    pub fn push(&self, event: ServerEvent) {
        self.emit(TransportEvent::Server(event));
    }

    /// Every event the session has sent so far.
    pub fn sent(&self) -> Vec<ClientEvent> {
        self.shared
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wire names of everything sent so far.
    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent().iter().map(|e| e.kind()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn clear_sent(&self) {
        self.shared
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Make every subsequent send fail.
    pub fn fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_sent_events_until_closed() {
        let (transport, remote, _rx) = MemoryTransport::new(EpochGate::new());
        transport.send(ClientEvent::InputAudioBufferCommit).unwrap();
        transport.send(ClientEvent::ResponseCreate).unwrap();
        assert_eq!(
            remote.sent_kinds(),
            vec!["input_audio_buffer.commit", "response.create"]
        );

        transport.close().await.unwrap();
        assert!(remote.is_closed());
        assert!(transport.send(ClientEvent::ResponseCancel).is_err());
        assert_eq!(remote.count("response.cancel"), 0);
    }

    #[tokio::test]
    async fn test_inbound_events_carry_epoch() {
        let gate = EpochGate::new();
        let (_transport, remote, mut rx) = MemoryTransport::new(gate.clone());
        remote.open();
        let next = gate.advance();
        remote.push(ServerEvent::Unknown);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event, TransportEvent::Opened);
        assert_ne!(first.epoch, next);
        assert_eq!(second.epoch, next);
    }
}
