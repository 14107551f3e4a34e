//! Actor message bus.
//!
//! Routes [`ActorMsg`]s between registered actors. Each endpoint owns a
//! bounded tokio channel; sends use `try_send` and never block. Delivery is
//! FIFO per (source, destination) pair.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::actor::ActorMsg;
use crate::config::EngineConfig;
use crate::error::{Result, VmError};
use crate::types::ActorId;

/// A message in transit.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Bus-assigned sequence number.
    pub seq: u64,
    /// Sending actor.
    pub source: ActorId,
    /// Receiving actor.
    pub destination: ActorId,
    /// Payload.
    pub payload: ActorMsg,
}

/// Outcome of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Placed in the destination's queue.
    Delivered,
    /// Destination not registered or its endpoint was dropped.
    NotFound,
    /// Destination queue full.
    QueueFull,
}

/// Receipt for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Sequence number assigned to the message.
    pub seq: u64,
    /// Sending actor.
    pub source: ActorId,
    /// Receiving actor.
    pub destination: ActorId,
    /// Delivery status.
    pub status: DeliveryStatus,
}

impl DeliveryReceipt {
    /// Turn a failed delivery into an error.
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            DeliveryStatus::Delivered => Ok(self),
            DeliveryStatus::NotFound => Err(VmError::BusError(format!(
                "{} -> {}: destination not registered",
                self.source, self.destination
            ))),
            DeliveryStatus::QueueFull => Err(VmError::BusError(format!(
                "{} -> {}: destination queue full",
                self.source, self.destination
            ))),
        }
    }
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Capacity of each endpoint queue.
    pub max_pending_messages: usize,
    /// Log every delivery at debug level.
    pub debug_mode: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: 1024,
            debug_mode: false,
        }
    }
}

impl From<&EngineConfig> for BusConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_pending_messages: config.bus_max_pending,
            debug_mode: config.debug_mode,
        }
    }
}

/// Receiving side of a registered actor.
pub struct ActorEndpoint {
    actor: ActorId,
    receiver: mpsc::Receiver<BusMessage>,
    bus: Arc<ActorMsgBus>,
}

impl ActorEndpoint {
    /// Owning actor.
    pub fn actor_id(&self) -> ActorId {
        self.actor
    }

    /// Wait for the next message. `None` once the actor is unregistered.
    pub async fn receive(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Next message, if one is queued.
    pub fn try_receive(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }

    /// Send from this actor.
    pub fn send(&self, destination: ActorId, payload: ActorMsg) -> DeliveryReceipt {
        self.bus.send(self.actor, destination, payload)
    }

    /// The bus.
    pub fn bus(&self) -> &Arc<ActorMsgBus> {
        &self.bus
    }
}

impl fmt::Debug for ActorEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorEndpoint")
            .field("actor", &self.actor)
            .finish()
    }
}

/// Message router between actors.
pub struct ActorMsgBus {
    config: BusConfig,
    endpoints: RwLock<HashMap<ActorId, mpsc::Sender<BusMessage>>>,
    next_seq: AtomicU64,
    delivered: AtomicU64,
    rejected: AtomicU64,
}

impl ActorMsgBus {
    /// Create a bus.
    pub fn new(config: BusConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            endpoints: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Register an actor and return its endpoint.
    ///
    /// Registering an id again replaces the previous endpoint.
    pub fn register(self: &Arc<Self>, actor: ActorId) -> ActorEndpoint {
        let (sender, receiver) = mpsc::channel(self.config.max_pending_messages.max(1));
        if self.endpoints.write().insert(actor, sender).is_some() {
            warn!(%actor, "actor re-registered, previous endpoint closed");
        }
        ActorEndpoint {
            actor,
            receiver,
            bus: Arc::clone(self),
        }
    }

    /// Remove an actor. Its endpoint sees the end of the stream.
    pub fn unregister(&self, actor: ActorId) -> bool {
        self.endpoints.write().remove(&actor).is_some()
    }

    /// Whether an actor is registered.
    pub fn is_registered(&self, actor: ActorId) -> bool {
        self.endpoints.read().contains_key(&actor)
    }

    /// Registered actors.
    pub fn registered_actors(&self) -> Vec<ActorId> {
        let mut actors: Vec<_> = self.endpoints.read().keys().copied().collect();
        actors.sort();
        actors
    }

    /// Send without blocking.
    pub fn send(&self, source: ActorId, destination: ActorId, payload: ActorMsg) -> DeliveryReceipt {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let kind = payload.kind();
        let message = BusMessage {
            seq,
            source,
            destination,
            payload,
        };

        let status = match self.endpoints.read().get(&destination) {
            Some(sender) => match sender.try_send(message) {
                Ok(()) => DeliveryStatus::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => DeliveryStatus::QueueFull,
                Err(mpsc::error::TrySendError::Closed(_)) => DeliveryStatus::NotFound,
            },
            None => DeliveryStatus::NotFound,
        };

        if status == DeliveryStatus::Delivered {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            if self.config.debug_mode {
                debug!(seq, %source, %destination, kind, "route");
            } else {
                trace!(seq, %source, %destination, kind, "route");
            }
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(seq, %source, %destination, kind, ?status, "delivery failed");
        }

        DeliveryReceipt {
            seq,
            source,
            destination,
            status,
        }
    }

    /// Statistics.
    pub fn stats(&self) -> BusStats {
        BusStats {
            registered_endpoints: self.endpoints.read().len(),
            messages_delivered: self.delivered.load(Ordering::Relaxed),
            messages_rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ActorMsgBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorMsgBus")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Bus statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Registered endpoints.
    pub registered_endpoints: usize,
    /// Messages placed in a queue.
    pub messages_delivered: u64,
    /// Messages that could not be delivered.
    pub messages_rejected: u64,
}

/// Builder for [`ActorMsgBus`].
#[derive(Debug, Default)]
pub struct ActorMsgBusBuilder {
    config: BusConfig,
}

impl ActorMsgBusBuilder {
    /// Builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint queue capacity.
    pub fn max_pending_messages(mut self, count: usize) -> Self {
        self.config.max_pending_messages = count;
        self
    }

    /// Log deliveries at debug level.
    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    /// Build the bus.
    pub fn build(self) -> Arc<ActorMsgBus> {
        ActorMsgBus::new(self.config)
    }
}
