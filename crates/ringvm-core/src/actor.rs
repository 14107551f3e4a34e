//! Register-flow actors.
//!
//! Producers and consumers exchange registers (shared tensor buffers)
//! through the [`ActorMsgBus`]:
//!
//! 1. A producer acts, writes its output registers, and sends
//!    [`ActorMsg::RegisterReady`] to every consumer of each output.
//! 2. A consumer queues incoming registers and acts while its queue is
//!    non-empty and every one of its own output slots is writable.
//! 3. After acting, the consumer acknowledges the consumed register to its
//!    producer with [`ActorMsg::RegisterAck`] and pops it.
//! 4. A producer's output slot becomes writable again once every consumer
//!    has acknowledged it.
//!
//! The last step bounds how far a producer may run ahead of its consumers.
//!
//! An act counts only once every consumer was notified. When a notification
//! cannot be delivered, the output slot waits for the acks of the consumers
//! that did receive it, and the input stays queued so the act is retried.
//! A consumed register whose ack cannot be delivered is kept and returned on
//! the next attempt, so a producer is never left without its register.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::bus::{ActorEndpoint, ActorMsgBus};
use crate::config::EngineConfig;
use crate::error::{Result, VmError};
use crate::memory::DeviceContext;
use crate::object::EagerBlobObject;
use crate::types::{ActorId, RegisterDescId};

/// A buffer owned by a producing actor and lent to its consumers.
#[derive(Debug)]
pub struct Register {
    desc_id: RegisterDescId,
    producer: ActorId,
    blob: Arc<EagerBlobObject>,
}

/// Shared handle to a register.
pub type RegisterHandle = Arc<Register>;

impl Register {
    /// Create a register.
    pub fn new(desc_id: RegisterDescId, producer: ActorId, blob: Arc<EagerBlobObject>) -> RegisterHandle {
        Arc::new(Self {
            desc_id,
            producer,
            blob,
        })
    }

    /// Descriptor id.
    pub fn desc_id(&self) -> RegisterDescId {
        self.desc_id
    }

    /// Actor that owns and writes this register.
    pub fn producer(&self) -> ActorId {
        self.producer
    }

    /// Backing blob.
    pub fn blob(&self) -> &Arc<EagerBlobObject> {
        &self.blob
    }
}

fn address_of(register: &RegisterHandle) -> usize {
    Arc::as_ptr(register) as usize
}

/// Register-flow protocol messages.
#[derive(Debug, Clone)]
pub enum ActorMsg {
    /// A producer finished writing a register.
    RegisterReady {
        /// The register.
        register: RegisterHandle,
    },
    /// A consumer is done with a register.
    RegisterAck {
        /// Descriptor of the returned register.
        desc_id: RegisterDescId,
        /// Raw address of the returned register.
        address: usize,
    },
    /// Stop the receiving actor's run loop.
    Halt,
}

impl ActorMsg {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ActorMsg::RegisterReady { .. } => "register_ready",
            ActorMsg::RegisterAck { .. } => "register_ack",
            ActorMsg::Halt => "halt",
        }
    }
}

/// One output of an actor.
#[derive(Debug)]
pub struct OutputSlot {
    register: RegisterHandle,
    consumers: Vec<ActorId>,
    pending_acks: usize,
}

impl OutputSlot {
    /// The output register.
    pub fn register(&self) -> &RegisterHandle {
        &self.register
    }

    /// Consumers notified after each act.
    pub fn consumers(&self) -> &[ActorId] {
        &self.consumers
    }

    /// No consumer still holds the register.
    pub fn is_writable(&self) -> bool {
        self.pending_acks == 0
    }
}

/// Computation an actor performs each time it acts.
pub trait ActorKernel: Send {
    /// Fill the output registers, optionally reading the incoming head.
    fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()>;
}

/// View of an actor's registers while it acts.
pub struct ActContext<'a> {
    actor: ActorId,
    outputs: &'a [OutputSlot],
    incoming_head: Option<&'a RegisterHandle>,
    device: &'a dyn DeviceContext,
}

impl<'a> ActContext<'a> {
    /// Acting actor.
    pub fn actor_id(&self) -> ActorId {
        self.actor
    }

    /// Device context of the actor.
    pub fn device(&self) -> &dyn DeviceContext {
        self.device
    }

    /// Head of the incoming queue, if any.
    pub fn input(&self) -> Option<&'a RegisterHandle> {
        self.incoming_head
    }

    /// Output register by position.
    pub fn output(&self, index: usize) -> Option<&'a RegisterHandle> {
        self.outputs.get(index).map(|slot| &slot.register)
    }

    /// Resolve an operand by descriptor id.
    ///
    /// Matches either one of the actor's own writable output slots or the
    /// head of the incoming queue.
    ///
    /// # Panics
    ///
    /// Panics when neither or both match.
    pub fn resolve(&self, desc_id: RegisterDescId) -> &'a RegisterHandle {
        let own = self
            .outputs
            .iter()
            .find(|slot| slot.register.desc_id == desc_id && slot.is_writable())
            .map(|slot| &slot.register);
        let incoming = self.incoming_head.filter(|head| head.desc_id == desc_id);
        match (own, incoming) {
            (Some(register), None) | (None, Some(register)) => register,
            (Some(_), Some(_)) => {
                error!(actor = %self.actor, %desc_id, "register matches own slot and incoming head");
                panic!("{}: ambiguous register {}", self.actor, desc_id);
            }
            (None, None) => {
                error!(actor = %self.actor, %desc_id, "register not found");
                panic!("{}: no register {} to resolve", self.actor, desc_id);
            }
        }
    }
}

/// Copies the incoming register's bytes into the first output register.
#[derive(Debug, Default)]
pub struct CopyKernel;

impl ActorKernel for CopyKernel {
    fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
        let input = ctx.input().ok_or_else(|| VmError::InvalidState {
            expected: "incoming register".to_string(),
            actual: "empty queue".to_string(),
        })?;
        let output = ctx.output(0).ok_or_else(|| VmError::InvalidState {
            expected: "output register".to_string(),
            actual: "no output slots".to_string(),
        })?;
        let src = ctx.resolve(input.desc_id());
        let dst = ctx.resolve(output.desc_id());

        dst.blob().try_allocate_body(ctx.device())?;
        let len = src.blob().byte_size_of_body()?.min(dst.blob().byte_size_of_body()?);
        let mut staging = vec![0u8; len];
        if len > 0 {
            src.blob()
                .tensor_storage()
                .with_buffer(|buf| buf.copy_to_host(0, &mut staging))
                .ok_or_else(|| VmError::InvalidState {
                    expected: "allocated source register".to_string(),
                    actual: format!("{} has no body", src.desc_id()),
                })??;
            dst.blob()
                .tensor_storage()
                .with_buffer_mut(|buf| buf.copy_from_host(0, &staging))
                .ok_or_else(|| VmError::AllocatorUnavailable(dst.desc_id().to_string()))??;
        }
        trace!(actor = %ctx.actor_id(), src = %src.desc_id(), dst = %dst.desc_id(), len, "copy");
        Ok(())
    }
}

/// Actor implementing the register-flow protocol around a kernel.
pub struct RegisterFlowActor<K: ActorKernel> {
    id: ActorId,
    kernel: K,
    bus: Arc<ActorMsgBus>,
    device: Arc<dyn DeviceContext>,
    incoming: VecDeque<RegisterHandle>,
    returns: VecDeque<RegisterHandle>,
    capacity: usize,
    outputs: Vec<OutputSlot>,
    source_budget: Option<u64>,
    acts: u64,
    debug_mode: bool,
}

impl<K: ActorKernel> RegisterFlowActor<K> {
    /// Create an actor with an incoming queue of `capacity` registers.
    pub fn new(
        id: ActorId,
        kernel: K,
        bus: Arc<ActorMsgBus>,
        device: Arc<dyn DeviceContext>,
        capacity: usize,
    ) -> Self {
        Self {
            id,
            kernel,
            bus,
            device,
            incoming: VecDeque::with_capacity(capacity),
            returns: VecDeque::new(),
            capacity: capacity.max(1),
            outputs: Vec::new(),
            source_budget: None,
            acts: 0,
            debug_mode: false,
        }
    }

    /// Create an actor sized and logged per the engine configuration.
    pub fn from_config(
        id: ActorId,
        kernel: K,
        bus: Arc<ActorMsgBus>,
        device: Arc<dyn DeviceContext>,
        config: &EngineConfig,
    ) -> Self {
        Self::new(id, kernel, bus, device, config.actor_queue_capacity)
            .with_debug_mode(config.debug_mode)
    }

    /// Add an output register consumed by `consumers`.
    pub fn with_output(mut self, register: RegisterHandle, consumers: Vec<ActorId>) -> Self {
        debug_assert_eq!(register.producer(), self.id);
        self.outputs.push(OutputSlot {
            register,
            consumers,
            pending_acks: 0,
        });
        self
    }

    /// Act without input, at most `acts` times.
    pub fn as_source(mut self, acts: u64) -> Self {
        self.source_budget = Some(acts);
        self
    }

    /// Log protocol traffic at debug level.
    pub fn with_debug_mode(mut self, enabled: bool) -> Self {
        self.debug_mode = enabled;
        self
    }

    /// Actor id.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// The kernel.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Times this actor has acted.
    pub fn acts(&self) -> u64 {
        self.acts
    }

    /// Registers waiting to be consumed.
    pub fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    /// Consumed registers whose ack has not been delivered yet.
    pub fn pending_returns(&self) -> usize {
        self.returns.len()
    }

    /// Output slots.
    pub fn outputs(&self) -> &[OutputSlot] {
        &self.outputs
    }

    /// Every output slot is writable.
    pub fn is_write_ready(&self) -> bool {
        self.outputs.iter().all(OutputSlot::is_writable)
    }

    fn has_input(&self) -> bool {
        match self.source_budget {
            Some(budget) => budget > 0,
            None => !self.incoming.is_empty(),
        }
    }

    /// Handle one message, then act as often as possible.
    ///
    /// Returns how many times the actor acted.
    pub fn process_msg(&mut self, msg: ActorMsg) -> Result<usize> {
        match msg {
            ActorMsg::RegisterReady { register } => {
                if self.incoming.len() >= self.capacity {
                    warn!(
                        actor = %self.id,
                        desc_id = %register.desc_id(),
                        capacity = self.capacity,
                        "incoming queue full, returning register"
                    );
                    self.returns.push_back(register);
                    if let Err(e) = self.flush_returns() {
                        warn!(actor = %self.id, error = %e, "register return deferred");
                    }
                    return Err(VmError::QueueFull {
                        capacity: self.capacity,
                    });
                }
                self.log_route("register ready", register.desc_id());
                self.incoming.push_back(register);
            }
            ActorMsg::RegisterAck { desc_id, address } => {
                let Some(slot) = self
                    .outputs
                    .iter_mut()
                    .find(|slot| slot.register.desc_id == desc_id && address_of(&slot.register) == address)
                else {
                    error!(actor = %self.id, %desc_id, address, "ack for unknown register");
                    panic!("{}: ack for register {} it does not own", self.id, desc_id);
                };
                if slot.pending_acks == 0 {
                    error!(actor = %self.id, %desc_id, "ack for register not in use");
                    panic!("{}: unexpected ack for {}", self.id, desc_id);
                }
                slot.pending_acks -= 1;
                self.log_route("register ack", desc_id);
            }
            ActorMsg::Halt => return Ok(0),
        }
        self.act_while_ready()
    }

    /// Act as long as input is available and outputs are writable.
    pub fn act_while_ready(&mut self) -> Result<usize> {
        let mut acted = 0;
        while self.try_act()? {
            acted += 1;
        }
        Ok(acted)
    }

    /// Act once if input is available and every output is writable.
    ///
    /// Undelivered acks from earlier acts are retried first. An act whose
    /// notifications fail is not counted and leaves its input in place.
    pub fn try_act(&mut self) -> Result<bool> {
        self.flush_returns()?;
        if !self.has_input() || !self.is_write_ready() {
            return Ok(false);
        }

        let is_source = self.source_budget.is_some();
        {
            let mut ctx = ActContext {
                actor: self.id,
                outputs: &self.outputs,
                incoming_head: if is_source { None } else { self.incoming.front() },
                device: self.device.as_ref(),
            };
            self.kernel.act(&mut ctx)?;
        }
        self.notify_consumers()?;
        self.acts += 1;

        if let Some(budget) = self.source_budget.as_mut() {
            *budget -= 1;
        } else if let Some(consumed) = self.incoming.pop_front() {
            self.returns.push_back(consumed);
            self.flush_returns()?;
        }
        Ok(true)
    }

    /// Send every output to its consumers.
    ///
    /// A slot waits only for acks of consumers that received it.
    fn notify_consumers(&mut self) -> Result<()> {
        let mut first_error = None;
        for slot in &mut self.outputs {
            slot.pending_acks = 0;
            for consumer in &slot.consumers {
                let receipt = self.bus.send(
                    self.id,
                    *consumer,
                    ActorMsg::RegisterReady {
                        register: Arc::clone(&slot.register),
                    },
                );
                match receipt.into_result() {
                    Ok(_) => slot.pending_acks += 1,
                    Err(e) => {
                        warn!(
                            actor = %self.id,
                            %consumer,
                            desc_id = %slot.register.desc_id(),
                            error = %e,
                            "register ready not delivered"
                        );
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ack consumed registers to their producers, oldest first.
    fn flush_returns(&mut self) -> Result<()> {
        while let Some(consumed) = self.returns.front() {
            self.bus
                .send(
                    self.id,
                    consumed.producer(),
                    ActorMsg::RegisterAck {
                        desc_id: consumed.desc_id(),
                        address: address_of(consumed),
                    },
                )
                .into_result()?;
            self.returns.pop_front();
        }
        Ok(())
    }

    /// Receive and process messages until halted or unregistered.
    pub async fn run(mut self, mut endpoint: ActorEndpoint) -> Result<Self> {
        debug_assert_eq!(endpoint.actor_id(), self.id);
        self.act_while_ready()?;
        while let Some(message) = endpoint.receive().await {
            if matches!(message.payload, ActorMsg::Halt) {
                break;
            }
            self.process_msg(message.payload)?;
        }
        debug!(actor = %self.id, acts = self.acts, "actor stopped");
        Ok(self)
    }

    fn log_route(&self, what: &'static str, desc_id: RegisterDescId) {
        if self.debug_mode {
            debug!(actor = %self.id, %desc_id, what);
        } else {
            trace!(actor = %self.id, %desc_id, what);
        }
    }
}

impl<K: ActorKernel> fmt::Debug for RegisterFlowActor<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterFlowActor")
            .field("id", &self.id)
            .field("incoming", &self.incoming.len())
            .field("returns", &self.returns.len())
            .field("outputs", &self.outputs.len())
            .field("acts", &self.acts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ActorMsgBusBuilder;
    use crate::memory::{HostDeviceContext, ShutdownFlag};
    use crate::types::{DataType, MemoryCase, Shape};

    fn blob() -> Arc<EagerBlobObject> {
        Arc::new(EagerBlobObject::with_new_storage(
            MemoryCase::host(),
            Shape::from([4]),
            DataType::UInt8,
        ))
    }

    fn device() -> Arc<dyn DeviceContext> {
        Arc::new(HostDeviceContext::new(ShutdownFlag::new()))
    }

    /// Writes an increasing counter into its output.
    struct CounterKernel(u8);

    impl ActorKernel for CounterKernel {
        fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
            self.0 += 1;
            let out = ctx.resolve(RegisterDescId(1));
            out.blob().try_allocate_body(ctx.device())?;
            let value = self.0;
            out.blob()
                .tensor_storage()
                .with_buffer_mut(|buf| buf.copy_from_host(0, &[value; 4]))
                .unwrap_or(Ok(()))
        }
    }

    /// Records the first byte of every incoming register.
    #[derive(Default)]
    struct SinkKernel(Vec<u8>);

    impl ActorKernel for SinkKernel {
        fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
            let input = ctx.resolve(RegisterDescId(2));
            let mut byte = [0u8; 1];
            input
                .blob()
                .tensor_storage()
                .with_buffer(|buf| buf.copy_to_host(0, &mut byte))
                .unwrap_or(Ok(()))?;
            self.0.push(byte[0]);
            Ok(())
        }
    }

    fn pump<K: ActorKernel>(endpoint: &mut ActorEndpoint, actor: &mut RegisterFlowActor<K>) -> usize {
        let mut handled = 0;
        while let Some(msg) = endpoint.try_receive() {
            actor.process_msg(msg.payload).unwrap();
            handled += 1;
        }
        handled
    }

    #[test]
    fn test_pipeline_with_backpressure() {
        let bus = ActorMsgBusBuilder::new().build();
        let (src_id, copy_id, sink_id) = (ActorId(1), ActorId(2), ActorId(3));
        let mut src_ep = bus.register(src_id);
        let mut copy_ep = bus.register(copy_id);
        let mut sink_ep = bus.register(sink_id);

        let mut source = RegisterFlowActor::new(src_id, CounterKernel(0), Arc::clone(&bus), device(), 2)
            .with_output(Register::new(RegisterDescId(1), src_id, blob()), vec![copy_id])
            .as_source(3);
        let mut copy = RegisterFlowActor::new(copy_id, CopyKernel, Arc::clone(&bus), device(), 2)
            .with_output(Register::new(RegisterDescId(2), copy_id, blob()), vec![sink_id]);
        let mut sink = RegisterFlowActor::new(sink_id, SinkKernel::default(), Arc::clone(&bus), device(), 2);

        // Source acts once, then waits for the copy actor's ack.
        assert_eq!(source.act_while_ready().unwrap(), 1);
        assert!(!source.is_write_ready());
        assert_eq!(source.act_while_ready().unwrap(), 0);

        for _ in 0..10 {
            pump(&mut copy_ep, &mut copy);
            pump(&mut sink_ep, &mut sink);
            pump(&mut src_ep, &mut source);
        }

        assert_eq!(source.acts(), 3);
        assert_eq!(copy.acts(), 3);
        assert_eq!(sink.kernel().0, vec![1, 2, 3]);
        assert!(source.is_write_ready());
        assert!(copy.is_write_ready());
        assert_eq!(copy.incoming_len(), 0);
    }

    #[test]
    fn test_consumer_waits_for_writable_output() {
        let bus = ActorMsgBusBuilder::new().build();
        let (a, b, c) = (ActorId(10), ActorId(11), ActorId(12));
        let _a_ep = bus.register(a);
        let mut c_ep = bus.register(c);

        let input = Register::new(RegisterDescId(1), a, blob());
        input.blob().try_allocate_body(device().as_ref()).unwrap();
        let mut copy = RegisterFlowActor::new(b, CopyKernel, Arc::clone(&bus), device(), 4)
            .with_output(Register::new(RegisterDescId(2), b, blob()), vec![c]);

        let ready = || ActorMsg::RegisterReady {
            register: Arc::clone(&input),
        };
        assert_eq!(copy.process_msg(ready()).unwrap(), 1);
        // Output still held by `c`: the second register queues.
        assert_eq!(copy.process_msg(ready()).unwrap(), 0);
        assert_eq!(copy.incoming_len(), 1);

        let msg = c_ep.try_receive().unwrap();
        let ActorMsg::RegisterReady { register } = msg.payload else {
            panic!("expected register ready");
        };
        let ack = ActorMsg::RegisterAck {
            desc_id: register.desc_id(),
            address: address_of(&register),
        };
        assert_eq!(copy.process_msg(ack).unwrap(), 1);
        assert_eq!(copy.incoming_len(), 0);
    }

    #[test]
    fn test_incoming_queue_bounded() {
        let bus = ActorMsgBusBuilder::new().build();
        let (a, b, c) = (ActorId(20), ActorId(21), ActorId(22));
        let mut a_ep = bus.register(a);
        let _c_ep = bus.register(c);
        let input = Register::new(RegisterDescId(1), a, blob());
        input.blob().try_allocate_body(device().as_ref()).unwrap();
        let mut copy = RegisterFlowActor::new(b, CopyKernel, Arc::clone(&bus), device(), 1)
            .with_output(Register::new(RegisterDescId(2), b, blob()), vec![c]);

        let ready = || ActorMsg::RegisterReady {
            register: Arc::clone(&input),
        };
        copy.process_msg(ready()).unwrap();
        copy.process_msg(ready()).unwrap();
        let err = copy.process_msg(ready()).unwrap_err();
        assert_eq!(err, VmError::QueueFull { capacity: 1 });

        // One ack for the consumed register, one for the rejected one.
        let mut acks = 0;
        while let Some(msg) = a_ep.try_receive() {
            assert!(matches!(msg.payload, ActorMsg::RegisterAck { .. }));
            acks += 1;
        }
        assert_eq!(acks, 2);
        assert_eq!(copy.incoming_len(), 1);
        assert_eq!(copy.pending_returns(), 0);
    }

    #[test]
    fn test_undelivered_ready_is_retried() {
        let bus = ActorMsgBusBuilder::new().build();
        let (src_id, consumer) = (ActorId(60), ActorId(61));
        let _src_ep = bus.register(src_id);
        let mut source = RegisterFlowActor::new(src_id, CounterKernel(0), Arc::clone(&bus), device(), 2)
            .with_output(Register::new(RegisterDescId(1), src_id, blob()), vec![consumer])
            .as_source(1);

        let err = source.try_act().unwrap_err();
        assert!(matches!(err, VmError::BusError(_)));
        assert_eq!(source.acts(), 0);
        assert!(source.is_write_ready());

        let mut consumer_ep = bus.register(consumer);
        assert!(source.try_act().unwrap());
        assert_eq!(source.acts(), 1);
        assert!(!source.is_write_ready());
        let msg = consumer_ep.try_receive().unwrap();
        assert!(matches!(msg.payload, ActorMsg::RegisterReady { .. }));
        // Budget spent on the delivered act only.
        assert!(!source.try_act().unwrap());
    }

    #[test]
    fn test_undelivered_ack_is_retried() {
        let bus = ActorMsgBusBuilder::new().build();
        let (producer, b) = (ActorId(70), ActorId(71));
        let mut sink = RegisterFlowActor::new(b, SinkKernel::default(), Arc::clone(&bus), device(), 2);

        let register = Register::new(RegisterDescId(2), producer, blob());
        register.blob().try_allocate_body(device().as_ref()).unwrap();
        let err = sink
            .process_msg(ActorMsg::RegisterReady {
                register: Arc::clone(&register),
            })
            .unwrap_err();
        assert!(matches!(err, VmError::BusError(_)));
        assert_eq!(sink.acts(), 1);
        assert_eq!(sink.incoming_len(), 0);
        assert_eq!(sink.pending_returns(), 1);

        let mut producer_ep = bus.register(producer);
        assert_eq!(sink.act_while_ready().unwrap(), 0);
        assert_eq!(sink.pending_returns(), 0);
        let ack = producer_ep.try_receive().unwrap();
        assert!(matches!(ack.payload, ActorMsg::RegisterAck { address, .. } if address == address_of(&register)));
        assert_eq!(sink.kernel().0, vec![0]);
    }

    #[test]
    fn test_from_config_uses_queue_capacity() {
        let config = EngineConfig::minimal();
        let bus = ActorMsgBusBuilder::new().build();
        let (a, b, c) = (ActorId(80), ActorId(81), ActorId(82));
        let _a_ep = bus.register(a);
        // `c` never acks, so after the first act inputs pile up.
        let _c_ep = bus.register(c);
        let input = Register::new(RegisterDescId(1), a, blob());
        input.blob().try_allocate_body(device().as_ref()).unwrap();
        let mut actor = RegisterFlowActor::from_config(b, CopyKernel, Arc::clone(&bus), device(), &config)
            .with_output(Register::new(RegisterDescId(2), b, blob()), vec![c]);

        let err = loop {
            if let Err(e) = actor.process_msg(ActorMsg::RegisterReady {
                register: Arc::clone(&input),
            }) {
                break e;
            }
        };
        assert_eq!(
            err,
            VmError::QueueFull {
                capacity: config.actor_queue_capacity
            }
        );
        assert_eq!(actor.incoming_len(), config.actor_queue_capacity);
        assert_eq!(actor.acts(), 1);
    }

    #[test]
    #[should_panic(expected = "ambiguous register")]
    fn test_ambiguous_forward_panics() {
        let bus = ActorMsgBusBuilder::new().build();
        let (a, b) = (ActorId(30), ActorId(31));
        let _ep = bus.register(a);

        struct Forward;
        impl ActorKernel for Forward {
            fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
                ctx.resolve(RegisterDescId(5));
                Ok(())
            }
        }

        let mut actor = RegisterFlowActor::new(b, Forward, Arc::clone(&bus), device(), 2)
            .with_output(Register::new(RegisterDescId(5), b, blob()), Vec::new());
        let _ = actor.process_msg(ActorMsg::RegisterReady {
            register: Register::new(RegisterDescId(5), a, blob()),
        });
    }

    #[test]
    #[should_panic(expected = "no register")]
    fn test_unresolvable_forward_panics() {
        let bus = ActorMsgBusBuilder::new().build();
        let (a, b) = (ActorId(40), ActorId(41));
        let _ep = bus.register(a);

        struct Forward;
        impl ActorKernel for Forward {
            fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
                ctx.resolve(RegisterDescId(9));
                Ok(())
            }
        }

        let mut actor = RegisterFlowActor::new(b, Forward, Arc::clone(&bus), device(), 2);
        let _ = actor.process_msg(ActorMsg::RegisterReady {
            register: Register::new(RegisterDescId(5), a, blob()),
        });
    }

    #[tokio::test]
    async fn test_run_until_halt() {
        let bus = ActorMsgBusBuilder::new().build();
        let (a, b) = (ActorId(50), ActorId(51));
        let mut a_ep = bus.register(a);
        let b_ep = bus.register(b);

        let sink = RegisterFlowActor::new(b, SinkKernel::default(), Arc::clone(&bus), device(), 4);
        let handle = tokio::spawn(sink.run(b_ep));

        let register = Register::new(RegisterDescId(2), a, blob());
        register.blob().try_allocate_body(device().as_ref()).unwrap();
        bus.send(a, b, ActorMsg::RegisterReady { register: Arc::clone(&register) })
            .into_result()
            .unwrap();

        let ack = a_ep.receive().await.unwrap();
        assert!(matches!(ack.payload, ActorMsg::RegisterAck { address, .. } if address == address_of(&register)));

        bus.send(a, b, ActorMsg::Halt);
        let sink = handle.await.unwrap().unwrap();
        assert_eq!(sink.kernel().0, vec![0]);
    }
}
