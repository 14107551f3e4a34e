//! Register-flow pipelines on tokio tasks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ringvm::prelude::*;

/// Writes 0, 1, 2, ... into its output register.
struct Counter {
    next: f32,
}

impl ActorKernel for Counter {
    fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
        let out = ctx.output(0).ok_or(VmError::InvalidState {
            expected: "output register".to_string(),
            actual: "none".to_string(),
        })?;
        out.blob().try_allocate_body(ctx.device())?;
        write_elements(out.blob(), &[self.next])?;
        self.next += 1.0;
        Ok(())
    }
}

/// Records every value it consumes.
struct Collect {
    seen: Arc<Mutex<Vec<f32>>>,
}

impl ActorKernel for Collect {
    fn act(&mut self, ctx: &mut ActContext<'_>) -> Result<()> {
        let input = ctx.input().ok_or(VmError::InvalidState {
            expected: "incoming register".to_string(),
            actual: "none".to_string(),
        })?;
        let values = read_elements::<f32>(input.blob())?;
        self.seen.lock().extend(values);
        Ok(())
    }
}

fn scalar_register(desc: u64, producer: ActorId) -> RegisterHandle {
    Register::new(
        RegisterDescId(desc),
        producer,
        Arc::new(EagerBlobObject::with_new_storage(
            MemoryCase::host(),
            Shape::from([1]),
            DataType::Float32,
        )),
    )
}

/// Source -> copy -> sink with one register per hop. A producer may not
/// overwrite its register before every consumer acknowledged it, so the sink
/// must observe every value in order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_respects_backpressure() {
    const ROUNDS: u64 = 32;

    let vm = RingVm::builder().mode(ExecutionMode::Inline).build().unwrap();
    let bus = Arc::clone(vm.engine().bus());
    let device: Arc<dyn DeviceContext> = vm.runtime().host().clone();
    let config = vm.engine().config();

    let (source_id, copy_id, sink_id) = (ActorId(1), ActorId(2), ActorId(3));
    let source_ep = bus.register(source_id);
    let copy_ep = bus.register(copy_id);
    let sink_ep = bus.register(sink_id);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let source = RegisterFlowActor::from_config(source_id, Counter { next: 0.0 }, Arc::clone(&bus), Arc::clone(&device), config)
        .with_output(scalar_register(1, source_id), vec![copy_id])
        .as_source(ROUNDS);
    let copier = RegisterFlowActor::from_config(copy_id, CopyKernel, Arc::clone(&bus), Arc::clone(&device), config)
        .with_output(scalar_register(2, copy_id), vec![sink_id]);
    let sink = RegisterFlowActor::from_config(
        sink_id,
        Collect {
            seen: Arc::clone(&seen),
        },
        Arc::clone(&bus),
        device,
        config,
    );

    let source = tokio::spawn(source.run(source_ep));
    let copier = tokio::spawn(copier.run(copy_ep));
    let sink = tokio::spawn(sink.run(sink_ep));

    tokio::time::timeout(Duration::from_secs(10), async {
        while seen.lock().len() < ROUNDS as usize {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("pipeline stalled");

    // Let the final ack reach the copier before halting.
    tokio::time::sleep(Duration::from_millis(20)).await;
    for id in [source_id, copy_id, sink_id] {
        bus.send(ActorId(0), id, ActorMsg::Halt).into_result().unwrap();
    }

    let source = source.await.unwrap().unwrap();
    let copier = copier.await.unwrap().unwrap();
    let sink = sink.await.unwrap().unwrap();

    let expected: Vec<f32> = (0..ROUNDS).map(|v| v as f32).collect();
    assert_eq!(*seen.lock(), expected);
    assert_eq!(source.acts(), ROUNDS);
    assert_eq!(copier.acts(), ROUNDS);
    assert_eq!(sink.acts(), ROUNDS);
    assert!(source.is_write_ready());
    assert!(copier.is_write_ready());
    assert_eq!(sink.incoming_len(), 0);
    assert!(bus.stats().messages_delivered >= ROUNDS * 4);
}

#[tokio::test]
async fn test_unregistered_consumer_fails_send() {
    let bus = ActorMsgBusBuilder::new().max_pending_messages(4).build();
    let device: Arc<dyn DeviceContext> = Arc::new(HostDeviceContext::new(ShutdownFlag::new()));
    let producer = ActorId(10);
    let _endpoint = bus.register(producer);

    let mut actor = RegisterFlowActor::new(producer, Counter { next: 0.0 }, Arc::clone(&bus), device, 1)
        .with_output(scalar_register(1, producer), vec![ActorId(11)])
        .as_source(1);
    let err = actor.try_act().unwrap_err();
    assert!(matches!(err, VmError::BusError(_)));
    assert_eq!(actor.acts(), 0);

    // Once the consumer exists the same act goes through.
    let mut consumer = bus.register(ActorId(11));
    assert!(actor.try_act().unwrap());
    assert_eq!(actor.acts(), 1);
    assert!(consumer.try_receive().is_some());
}
