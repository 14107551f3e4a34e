//! Master and worker engines exchanging cluster instructions.

mod common;

use std::sync::Arc;
use std::thread;

use common::fill;
use ringvm::prelude::*;

#[test]
fn test_master_drives_worker_session() {
    let planes = LocalControlPlane::cluster(2);
    let master_plane = Arc::clone(&planes[0]);
    let worker_plane = Arc::clone(&planes[1]);
    let desc = StreamDesc::compute(DeviceType::Cpu, 0);

    // Both engines address the same object so the master can name it.
    let shared = Arc::new(EagerBlobObject::with_new_storage(
        MemoryCase::host(),
        Shape::from([4]),
        DataType::Float32,
    ));

    let worker = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || -> Result<Vec<&'static str>> {
            let mut vm = RingVm::builder()
                .control_plane(worker_plane)
                .stream(desc)
                .build()?;
            vm.engine_mut().register_object(&shared);
            let mut received = Vec::new();

            loop {
                let cluster = vm.engine().cluster().ok_or(VmError::InvalidState {
                    expected: "cluster engine".to_string(),
                    actual: "standalone".to_string(),
                })?;
                let instruction = cluster.worker_receive_instruction()?;
                received.push(instruction.kind());
                match instruction {
                    ClusterInstruction::SessionStart => cluster.new_session_barrier()?,
                    ClusterInstruction::EagerInstruction(msgs) => {
                        for msg in msgs {
                            vm.engine_mut().submit(msg)?;
                        }
                        vm.engine_mut().scheduler_mut().run_until_idle()?;
                        let cluster = vm.engine().cluster().ok_or(VmError::ShuttingDown)?;
                        cluster.eager_sync_barrier()?;
                        // Meets the master's drain barrier ahead of its halt.
                        vm.engine_mut().barrier()?;
                    }
                    ClusterInstruction::Halt => {
                        cluster.halt_barrier()?;
                        break;
                    }
                    ClusterInstruction::Abort => break,
                }
            }
            vm.shutdown()?;
            Ok(received)
        })
    };

    let mut master = RingVm::builder()
        .control_plane(Arc::clone(&master_plane) as Arc<dyn ControlPlane>)
        .build()
        .unwrap();
    {
        let cluster = master.engine().cluster().unwrap();
        assert!(cluster.plane().is_master());
        cluster.master_send_session_start().unwrap();
        cluster
            .master_send_eager_instruction(vec![fill(desc, &shared, 4.0)])
            .unwrap();
        cluster.eager_sync_barrier().unwrap();
    }
    master.engine_mut().halt().unwrap();

    let received = worker.join().unwrap().unwrap();
    assert_eq!(received, vec!["session_start", "eager_instruction", "halt"]);
    assert_eq!(read_elements::<f32>(&shared).unwrap(), vec![4.0; 4]);
    // The second instruction key triggered a flush of obsolete keys.
    assert!(master_plane.cleared_keys() >= 1);
    master.shutdown().unwrap();
}

#[test]
fn test_single_process_barrier() {
    let plane = LocalControlPlane::single();
    let desc = StreamDesc::compute(DeviceType::Cpu, 0);
    let mut vm = RingVm::builder()
        .control_plane(plane)
        .stream(desc)
        .build()
        .unwrap();
    let x = vm
        .engine_mut()
        .new_object(MemoryCase::host(), Shape::from([2]), DataType::Float32);
    vm.engine_mut().submit(fill(desc, &x, 9.0)).unwrap();
    vm.engine_mut().barrier().unwrap();
    vm.engine_mut().halt().unwrap();
    assert_eq!(read_elements::<f32>(&x).unwrap(), vec![9.0; 2]);
    vm.shutdown().unwrap();
}
