//! Transport boundary for member remoting.
//!
//! A [`MessageHandler`] moves [`RemoteMessage`]s between nodes and owns the
//! codec that turns them into bytes. [`MemoryBus`] links handlers inside one
//! process, which is what the tests and the CLI demo run on.

use crate::cancel::{with_cancellation, Cancellation};
use crate::error::{RemoteError, RemoteResult};
use crate::message::RemoteMessage;
use async_trait::async_trait;
use encore_core::RemotingMode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::broadcast;

const DEFAULT_INBOUND_CAPACITY: usize = 256;

/// Serializes messages to and from a transport-neutral byte form.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, message: &RemoteMessage) -> RemoteResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> RemoteResult<RemoteMessage>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, message: &RemoteMessage) -> RemoteResult<Vec<u8>> {
        serde_json::to_vec(message).map_err(|err| RemoteError::Codec {
            message: err.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> RemoteResult<RemoteMessage> {
        serde_json::from_slice(bytes).map_err(|err| RemoteError::Codec {
            message: err.to_string(),
        })
    }
}

/// Transport contract used by member remotes and the proxies built on them.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Role(s) this node plays.
    fn mode(&self) -> RemotingMode;

    fn codec(&self) -> &dyn MessageCodec;

    /// Idempotent; called before every send.
    async fn ensure_connected(&self) -> RemoteResult<()>;

    async fn send(&self, message: RemoteMessage, cancel: Option<&Cancellation>) -> RemoteResult<()>;

    /// Sends bytes already produced by [`codec`](Self::codec).
    async fn send_raw(&self, bytes: Vec<u8>, cancel: Option<&Cancellation>) -> RemoteResult<()>;

    /// Stream of decoded inbound messages.
    fn subscribe(&self) -> broadcast::Receiver<RemoteMessage>;

    /// Number of other nodes reachable through this handler, when known.
    ///
    /// This counts nodes on the transport, not remotes sharing an id: a
    /// transport carrying several remote ids reports every node on it.
    fn linked_peers(&self) -> Option<usize> {
        None
    }
}

static DEFAULT_HANDLER: RwLock<Option<Arc<dyn MessageHandler>>> = RwLock::new(None);

/// Registers the handler used by member remotes attached without one.
pub fn set_default_handler(handler: Arc<dyn MessageHandler>) {
    *DEFAULT_HANDLER
        .write()
        .unwrap_or_else(PoisonError::into_inner) = Some(handler);
}

pub fn default_handler() -> Option<Arc<dyn MessageHandler>> {
    DEFAULT_HANDLER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub fn clear_default_handler() -> Option<Arc<dyn MessageHandler>> {
    DEFAULT_HANDLER
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
}

struct Peer {
    node: u64,
    codec: Arc<dyn MessageCodec>,
    inbound: broadcast::Sender<RemoteMessage>,
}

#[derive(Default)]
struct BusState {
    next_node: u64,
    peers: Vec<Peer>,
}

/// In-process message bus. Every send reaches every other connected handler,
/// decoded with the receiving handler's codec.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self, mode: RemotingMode) -> Arc<MemoryHandler> {
        self.handler_with(mode, Arc::new(JsonCodec), DEFAULT_INBOUND_CAPACITY)
    }

    pub fn handler_with(
        &self,
        mode: RemotingMode,
        codec: Arc<dyn MessageCodec>,
        capacity: usize,
    ) -> Arc<MemoryHandler> {
        let node = {
            let mut state = self.lock();
            state.next_node += 1;
            state.next_node
        };
        let (inbound, _) = broadcast::channel(capacity.max(1));
        Arc::new(MemoryHandler {
            bus: self.clone(),
            node,
            mode,
            codec,
            inbound,
            connected: AtomicBool::new(false),
            sent: AtomicU64::new(0),
        })
    }

    /// Number of connected handlers.
    pub fn connected(&self) -> usize {
        self.lock().peers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(&self, peer: Peer) {
        let mut state = self.lock();
        if state.peers.iter().all(|p| p.node != peer.node) {
            state.peers.push(peer);
        }
    }

    fn leave(&self, node: u64) {
        self.lock().peers.retain(|p| p.node != node);
    }

    /// Hands `bytes` to every peer except `origin`; returns how many received it.
    /// A peer whose codec rejects the bytes is skipped.
    fn deliver(&self, origin: u64, bytes: &[u8]) -> usize {
        let targets: Vec<(u64, Arc<dyn MessageCodec>, broadcast::Sender<RemoteMessage>)> = self
            .lock()
            .peers
            .iter()
            .filter(|p| p.node != origin)
            .map(|p| (p.node, Arc::clone(&p.codec), p.inbound.clone()))
            .collect();

        let mut delivered = 0;
        for (node, codec, inbound) in targets {
            let message = match codec.decode(bytes) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(origin, node, error = %err, "peer could not decode message, skipped");
                    continue;
                }
            };
            // No subscribers means nobody on that node is listening yet.
            if inbound.send(message).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// One node's endpoint on a [`MemoryBus`].
pub struct MemoryHandler {
    bus: MemoryBus,
    node: u64,
    mode: RemotingMode,
    codec: Arc<dyn MessageCodec>,
    inbound: broadcast::Sender<RemoteMessage>,
    connected: AtomicBool,
    sent: AtomicU64,
}

impl MemoryHandler {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Messages sent through this handler so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.bus.leave(self.node);
            tracing::debug!(node = self.node, "memory handler left bus");
        }
    }
}

impl Drop for MemoryHandler {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[async_trait]
impl MessageHandler for MemoryHandler {
    fn mode(&self) -> RemotingMode {
        self.mode
    }

    fn codec(&self) -> &dyn MessageCodec {
        self.codec.as_ref()
    }

    async fn ensure_connected(&self) -> RemoteResult<()> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.bus.join(Peer {
                node: self.node,
                codec: Arc::clone(&self.codec),
                inbound: self.inbound.clone(),
            });
            tracing::debug!(node = self.node, mode = ?self.mode, "memory handler joined bus");
        }
        Ok(())
    }

    async fn send(&self, message: RemoteMessage, cancel: Option<&Cancellation>) -> RemoteResult<()> {
        let bytes = self.codec.encode(&message)?;
        self.send_raw(bytes, cancel).await
    }

    async fn send_raw(&self, bytes: Vec<u8>, cancel: Option<&Cancellation>) -> RemoteResult<()> {
        if !self.is_connected() {
            return Err(RemoteError::NotConnected);
        }
        let delivered = with_cancellation(cancel, async { self.bus.deliver(self.node, &bytes) }).await?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(node = self.node, bytes = bytes.len(), delivered, "message delivered");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteMessage> {
        self.inbound.subscribe()
    }

    fn linked_peers(&self) -> Option<usize> {
        Some(self.bus.connected().saturating_sub(usize::from(self.is_connected())))
    }
}
