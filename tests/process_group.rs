//! Multi-rank integration tests: every rank runs as a thread over one
//! shared in-process mesh device and hash store.

use cohort::{
    accel, AllreduceCoalescedOptions, AllreduceOptions, BroadcastOptions, CohortError, DataType,
    Device, GatherOptions, GroupOptions, HashStore, MeshDevice, ProcessGroup, ReduceOp,
    ReduceOptions, ScatterOptions, Store, Tensor, Work,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn run_group_with_timeout<F>(size: u32, contexts: usize, timeout: Duration, f: F)
where
    F: Fn(Arc<ProcessGroup>) + Send + Sync + 'static,
{
    let store: Arc<dyn Store> = Arc::new(HashStore::new());
    let device = MeshDevice::new();
    let f = Arc::new(f);

    let handles: Vec<_> = (0..size)
        .map(|rank| {
            let store = Arc::clone(&store);
            let device = Arc::clone(&device);
            let f = Arc::clone(&f);
            thread::spawn(move || {
                let options = GroupOptions {
                    devices: (0..contexts).map(|_| Arc::clone(&device)).collect(),
                    timeout,
                    threads: 2,
                };
                let group = ProcessGroup::new(store, rank, size, options).unwrap();
                f(Arc::new(group));
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

fn run_group<F>(size: u32, contexts: usize, f: F)
where
    F: Fn(Arc<ProcessGroup>) + Send + Sync + 'static,
{
    run_group_with_timeout(size, contexts, Duration::from_secs(5), f)
}

fn sparse_1d(indices: &[i64], values: &[f32], dim: usize, device: Device) -> Tensor {
    let idx = Tensor::from_vec_on(indices, &[1, indices.len()], device);
    let val = Tensor::from_vec_on(values, &[values.len()], device);
    Tensor::sparse_coo(&idx, &val, &[dim]).unwrap()
}

// ============================================================================
// Dense collectives
// ============================================================================

#[test]
fn test_allreduce_sum_f32_size4() {
    // Inputs per rank r: [r, r+1]. Expected everywhere: [6.0, 10.0].
    run_group(4, 1, |group| {
        let r = group.rank() as f32;
        let t = Tensor::from_vec(&[r, r + 1.0], &[2]);
        group
            .allreduce(vec![t.clone()], AllreduceOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![6.0, 10.0]);
    });
}

#[test]
fn test_allreduce_dtype_coverage() {
    run_group(3, 1, |group| {
        let scale = (group.rank() + 1) as i64;

        let t64 = Tensor::from_vec(&[2i64 * scale], &[1]);
        group
            .allreduce(vec![t64.clone()], AllreduceOptions { op: ReduceOp::Sum })
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(t64.to_vec::<i64>().unwrap(), vec![12]);

        let tf64 = Tensor::from_vec(&[scale as f64], &[1]);
        group
            .allreduce(vec![tf64.clone()], AllreduceOptions { op: ReduceOp::Prod })
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(tf64.to_vec::<f64>().unwrap(), vec![6.0]);

        let ti32 = Tensor::from_vec(&[scale as i32, -(scale as i32)], &[2]);
        group
            .allreduce(vec![ti32.clone()], AllreduceOptions { op: ReduceOp::Min })
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(ti32.to_vec::<i32>().unwrap(), vec![1, -3]);

        let tu8 = Tensor::from_vec(&[scale as u8], &[1]);
        group
            .allreduce(vec![tu8.clone()], AllreduceOptions { op: ReduceOp::Max })
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(tu8.to_vec::<u8>().unwrap(), vec![3]);

        let th = Tensor::from_vec(&[half::f16::from_f32(scale as f32)], &[1]);
        group
            .allreduce(vec![th.clone()], AllreduceOptions { op: ReduceOp::Sum })
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(th.to_vec::<half::f16>().unwrap()[0].to_f32(), 6.0);
    });
}

#[test]
fn test_allreduce_multi_tensor_copies_first_result() {
    // Only the first entry's reduction is published; the engine copies it
    // into every other entry of the local list.
    run_group(2, 1, |group| {
        let first = Tensor::from_vec(&[(group.rank() + 1) as f32], &[1]);
        let second = Tensor::from_vec(&[100.0f32], &[1]);
        group
            .allreduce(
                vec![first.clone(), second.clone()],
                AllreduceOptions::default(),
            )
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(first.to_vec::<f32>().unwrap(), vec![3.0]);
        assert_eq!(second.to_vec::<f32>().unwrap(), vec![3.0]);
    });
}

#[test]
fn test_broadcast_i64_root1_size3() {
    // Rank 1 broadcasts [7,8,9]; every entry of every rank's list ends up
    // equal to it.
    run_group(3, 1, |group| {
        let (a, b) = if group.rank() == 1 {
            (
                Tensor::from_vec(&[7i64, 8, 9], &[3]),
                Tensor::from_vec(&[0i64, 0, 0], &[3]),
            )
        } else {
            (
                Tensor::from_vec(&[0i64, 0, 0], &[3]),
                Tensor::from_vec(&[0i64, 0, 0], &[3]),
            )
        };
        group
            .broadcast(
                vec![a.clone(), b.clone()],
                BroadcastOptions {
                    root_rank: 1,
                    root_tensor: 0,
                },
            )
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(a.to_vec::<i64>().unwrap(), vec![7, 8, 9]);
        assert_eq!(b.to_vec::<i64>().unwrap(), vec![7, 8, 9]);
    });
}

#[test]
fn test_reduce_sum_to_root2() {
    run_group(3, 1, |group| {
        let t = Tensor::from_vec(&[(group.rank() + 1) as f32; 4], &[4]);
        group
            .reduce(
                vec![t.clone()],
                ReduceOptions {
                    root_rank: 2,
                    root_tensor: 0,
                    op: ReduceOp::Sum,
                },
            )
            .unwrap()
            .wait()
            .unwrap();
        if group.rank() == 2 {
            assert_eq!(t.to_vec::<f32>().unwrap(), vec![6.0; 4]);
        }
    });
}

#[test]
fn test_gather_i32_root0_size3() {
    // Rank r contributes [r, r+10]; rank 0 collects [[0,10],[1,11],[2,12]].
    run_group(3, 1, |group| {
        let input = Tensor::from_vec(&[group.rank() as i32, group.rank() as i32 + 10], &[2]);
        let outputs = if group.rank() == 0 {
            vec![(0..3).map(|_| Tensor::zeros(&[2], DataType::I32)).collect()]
        } else {
            Vec::new()
        };
        let work = group
            .gather(
                outputs.clone(),
                vec![input],
                GatherOptions { root_rank: 0 },
            )
            .unwrap();
        work.wait().unwrap();

        if group.rank() == 0 {
            for (r, out) in outputs[0].iter().enumerate() {
                assert_eq!(
                    out.to_vec::<i32>().unwrap(),
                    vec![r as i32, r as i32 + 10]
                );
            }
        }
    });
}

#[test]
fn test_scatter_root1_size3() {
    run_group(3, 1, |group| {
        let inputs = if group.rank() == 1 {
            vec![
                (0..3)
                    .map(|r| Tensor::from_vec(&[r as f32, r as f32 * 2.0], &[2]))
                    .collect(),
            ]
        } else {
            Vec::new()
        };
        let output = Tensor::zeros(&[2], DataType::F32);
        group
            .scatter(
                vec![output.clone()],
                inputs,
                ScatterOptions { root_rank: 1 },
            )
            .unwrap()
            .wait()
            .unwrap();
        let r = group.rank() as f32;
        assert_eq!(output.to_vec::<f32>().unwrap(), vec![r, r * 2.0]);
    });
}

#[test]
fn test_allgather_two_inputs_per_rank() {
    run_group(2, 1, |group| {
        let r = group.rank() as i32;
        let inputs = vec![
            Tensor::from_vec(&[r], &[1]),
            Tensor::from_vec(&[r + 10], &[1]),
        ];
        let outputs: Vec<Vec<Tensor>> = (0..2)
            .map(|_| (0..4).map(|_| Tensor::zeros(&[1], DataType::I32)).collect())
            .collect();
        group
            .allgather(outputs.clone(), inputs)
            .unwrap()
            .wait()
            .unwrap();

        // Row j holds rank j/2's input j%2.
        for list in &outputs {
            let collected: Vec<i32> = list
                .iter()
                .map(|t| t.to_vec::<i32>().unwrap()[0])
                .collect();
            assert_eq!(collected, vec![0, 10, 1, 11]);
        }
    });
}

#[test]
fn test_allreduce_coalesced_max() {
    // Two tensors of different shapes reduced in one flattened exchange.
    run_group(2, 1, |group| {
        let (t1, t2) = if group.rank() == 0 {
            (
                Tensor::from_vec(&[1.0f32, 5.0], &[2]),
                Tensor::from_vec(&[0.0f32, 9.0, 3.0, 1.0], &[2, 2]),
            )
        } else {
            (
                Tensor::from_vec(&[4.0f32, 2.0], &[2]),
                Tensor::from_vec(&[2.0f32, 8.0, 3.0, 4.0], &[2, 2]),
            )
        };
        group
            .allreduce_coalesced(
                vec![t1.clone(), t2.clone()],
                AllreduceCoalescedOptions { op: ReduceOp::Max },
            )
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(t1.to_vec::<f32>().unwrap(), vec![4.0, 5.0]);
        assert_eq!(t2.to_vec::<f32>().unwrap(), vec![2.0, 9.0, 3.0, 4.0]);
        assert_eq!(t2.shape(), &[2, 2]);
    });
}

// ============================================================================
// Sparse allreduce
// ============================================================================

#[test]
fn test_sparse_allreduce_sum_size2() {
    // Rank 0: {0: 1.0, 2: 3.0}; rank 1: {2: 5.0, 3: 7.0}; shape [4].
    // Expected dense sum everywhere: [1.0, 0.0, 8.0, 7.0].
    run_group(2, 1, |group| {
        let input = if group.rank() == 0 {
            sparse_1d(&[0, 2], &[1.0, 3.0], 4, Device::Cpu)
        } else {
            sparse_1d(&[2, 3], &[5.0, 7.0], 4, Device::Cpu)
        };
        let work = group
            .allreduce(vec![input], AllreduceOptions::default())
            .unwrap();
        work.wait().unwrap();

        let outputs = work.result().unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].is_coalesced());
        assert_eq!(
            outputs[0].to_dense().unwrap().to_vec::<f32>().unwrap(),
            vec![1.0, 0.0, 8.0, 7.0]
        );
    });
}

#[test]
fn test_sparse_allreduce_local_presum() {
    // Multiple local inputs are summed before the exchange; the result is
    // cloned once per input.
    run_group(2, 1, |group| {
        let (a, b) = if group.rank() == 0 {
            (
                sparse_1d(&[0], &[1.0], 4, Device::Cpu),
                sparse_1d(&[1], &[2.0], 4, Device::Cpu),
            )
        } else {
            (
                sparse_1d(&[1], &[10.0], 4, Device::Cpu),
                sparse_1d(&[3], &[20.0], 4, Device::Cpu),
            )
        };
        let work = group
            .allreduce(vec![a, b], AllreduceOptions::default())
            .unwrap();
        work.wait().unwrap();

        let outputs = work.result().unwrap();
        assert_eq!(outputs.len(), 2);
        for out in &outputs {
            assert_eq!(
                out.to_dense().unwrap().to_vec::<f32>().unwrap(),
                vec![1.0, 12.0, 0.0, 20.0]
            );
        }
    });
}

#[test]
fn test_sparse_allreduce_empty_rank_contributes_zero() {
    run_group(2, 1, |group| {
        let input = if group.rank() == 0 {
            sparse_1d(&[], &[], 4, Device::Cpu)
        } else {
            sparse_1d(&[1], &[5.0], 4, Device::Cpu)
        };
        let work = group
            .allreduce(vec![input], AllreduceOptions::default())
            .unwrap();
        work.wait().unwrap();
        assert_eq!(
            work.result().unwrap()[0]
                .to_dense()
                .unwrap()
                .to_vec::<f32>()
                .unwrap(),
            vec![0.0, 5.0, 0.0, 0.0]
        );
    });
}

#[test]
fn test_sparse_allreduce_rejects_non_sum() {
    run_group(2, 1, |group| {
        let input = sparse_1d(&[0], &[1.0], 4, Device::Cpu);
        let err = group
            .allreduce(vec![input], AllreduceOptions { op: ReduceOp::Max })
            .unwrap_err();
        assert!(matches!(err, CohortError::InvalidArgument { .. }));
    });
}

#[test]
fn test_sparse_allreduce_dimension_mismatch_fails_at_wait() {
    run_group(2, 1, |group| {
        let dim = if group.rank() == 0 { 4 } else { 5 };
        let input = sparse_1d(&[0], &[1.0], dim, Device::Cpu);
        let work = group
            .allreduce(vec![input], AllreduceOptions::default())
            .unwrap();
        let err = work.wait().unwrap_err();
        assert!(matches!(err, CohortError::DimensionMismatch { .. }));
    });
}

// ============================================================================
// Point-to-point
// ============================================================================

#[test]
fn test_send_recv_roundtrip() {
    run_group(2, 1, |group| {
        if group.rank() == 0 {
            let payload = Tensor::from_vec(&[1i32, 2, 3, 4], &[4]);
            group.send(vec![payload], 1, 11).unwrap().wait().unwrap();
        } else {
            let sink = Tensor::zeros(&[4], DataType::I32);
            let work = group.recv(vec![sink.clone()], 0, 11).unwrap();
            work.wait().unwrap();
            assert_eq!(sink.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4]);
        }
    });
}

#[test]
fn test_recv_anysource_reports_sender() {
    run_group(2, 1, |group| {
        if group.rank() == 0 {
            let payload = Tensor::from_vec(&[42.0f32, 43.0], &[2]);
            group.send(vec![payload], 1, 17).unwrap().wait().unwrap();
        } else {
            let sink = Tensor::zeros(&[2], DataType::F32);
            let work = group.recv_anysource(vec![sink.clone()], 17).unwrap();
            work.wait().unwrap();
            assert_eq!(work.source_rank(), Some(0));
            assert_eq!(sink.to_vec::<f32>().unwrap(), vec![42.0, 43.0]);
        }
    });
}

#[test]
fn test_recv_with_no_sender_times_out() {
    run_group_with_timeout(2, 1, Duration::from_millis(300), |group| {
        if group.rank() == 0 {
            let sink = Tensor::zeros(&[1], DataType::U8);
            let work = group.recv(vec![sink], 1, 23).unwrap();
            let err = work.wait().unwrap_err();
            assert!(matches!(err, CohortError::Timeout { .. }));
        }
    });
}

#[test]
fn test_send_rejects_sparse_and_bad_ranks() {
    run_group(2, 1, |group| {
        let sparse = sparse_1d(&[0], &[1.0], 4, Device::Cpu);
        assert!(group.send(vec![sparse], 1, 0).is_err());

        let dense = Tensor::zeros(&[1], DataType::F32);
        assert!(matches!(
            group.send(vec![dense], 2, 0).unwrap_err(),
            CohortError::InvalidRank { .. }
        ));
    });
}

// ============================================================================
// Barrier and ordering
// ============================================================================

#[test]
fn test_barrier_waits_for_prior_work() {
    run_group(2, 1, |group| {
        let tensors: Vec<Tensor> = (0..8)
            .map(|i| Tensor::from_vec(&[(group.rank() + 1) as f32 * (i + 1) as f32], &[1]))
            .collect();
        let works: Vec<_> = tensors
            .iter()
            .map(|t| {
                group
                    .allreduce(vec![t.clone()], AllreduceOptions::default())
                    .unwrap()
            })
            .collect();

        group.barrier().unwrap().wait().unwrap();

        // Every prior run has completed by the time the barrier returns,
        // so the outputs are final without waiting the handles.
        for (i, t) in tensors.iter().enumerate() {
            assert_eq!(t.to_vec::<f32>().unwrap(), vec![3.0 * (i + 1) as f32]);
        }
        for work in works {
            work.wait().unwrap();
        }
    });
}

#[test]
fn test_many_queued_collectives_drain_in_order() {
    run_group(2, 2, |group| {
        let tensors: Vec<Tensor> = (0..32)
            .map(|i| Tensor::from_vec(&[(group.rank() as i64) + i], &[1]))
            .collect();
        let works: Vec<_> = tensors
            .iter()
            .map(|t| {
                group
                    .allreduce(vec![t.clone()], AllreduceOptions::default())
                    .unwrap()
            })
            .collect();
        for work in &works {
            work.wait().unwrap();
        }
        for (i, t) in tensors.iter().enumerate() {
            assert_eq!(t.to_vec::<i64>().unwrap(), vec![1 + 2 * i as i64]);
        }
    });
}

#[test]
fn test_multiple_contexts_same_issue_order() {
    // Three contexts; tags route consecutive collectives onto different
    // contexts and everything still matches because issue order agrees.
    run_group(3, 3, |group| {
        for round in 0..6 {
            let t = Tensor::from_vec(&[(group.rank() + 1) as i32 * (round + 1)], &[1]);
            group
                .allreduce(vec![t.clone()], AllreduceOptions::default())
                .unwrap()
                .wait()
                .unwrap();
            assert_eq!(t.to_vec::<i32>().unwrap(), vec![6 * (round + 1)]);
        }
    });
}

// ============================================================================
// Accelerator staging
// ============================================================================

#[test]
fn test_staged_allreduce_on_accelerator() {
    run_group(2, 1, |group| {
        let r = group.rank() as f32;
        let t = Tensor::from_vec_on(&[r, r + 1.0], &[2], Device::Accel(0));
        group
            .allreduce(vec![t.clone()], AllreduceOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        accel::synchronize_all();
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 3.0]);
    });
}

#[test]
fn test_staged_broadcast_on_accelerator() {
    run_group(2, 1, |group| {
        let t = if group.rank() == 0 {
            Tensor::from_vec_on(&[5i32, 6], &[2], Device::Accel(0))
        } else {
            Tensor::zeros_on(&[2], DataType::I32, Device::Accel(0))
        };
        group
            .broadcast(vec![t.clone()], BroadcastOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        accel::synchronize_all();
        assert_eq!(t.to_vec::<i32>().unwrap(), vec![5, 6]);
    });
}

#[test]
fn test_staged_gather_on_accelerator() {
    run_group(2, 1, |group| {
        let input = Tensor::from_vec_on(&[group.rank() as i64], &[1], Device::Accel(0));
        let outputs = if group.rank() == 0 {
            vec![
                (0..2)
                    .map(|_| Tensor::zeros_on(&[1], DataType::I64, Device::Accel(0)))
                    .collect(),
            ]
        } else {
            Vec::new()
        };
        group
            .gather(outputs.clone(), vec![input], GatherOptions { root_rank: 0 })
            .unwrap()
            .wait()
            .unwrap();
        accel::synchronize_all();
        if group.rank() == 0 {
            assert_eq!(outputs[0][0].to_vec::<i64>().unwrap(), vec![0]);
            assert_eq!(outputs[0][1].to_vec::<i64>().unwrap(), vec![1]);
        }
    });
}

#[test]
fn test_staged_sparse_allreduce_on_accelerator() {
    run_group(2, 1, |group| {
        let input = if group.rank() == 0 {
            sparse_1d(&[0, 2], &[1.0, 3.0], 4, Device::Accel(0))
        } else {
            sparse_1d(&[2, 3], &[5.0, 7.0], 4, Device::Accel(0))
        };
        let work = group
            .allreduce(vec![input], AllreduceOptions::default())
            .unwrap();
        work.wait().unwrap();
        accel::synchronize_all();

        let outputs = work.result().unwrap();
        assert_eq!(outputs[0].device(), Device::Accel(0));
        assert!(outputs[0].is_coalesced());
        assert_eq!(
            outputs[0].to_dense().unwrap().to_vec::<f32>().unwrap(),
            vec![1.0, 0.0, 8.0, 7.0]
        );
    });
}

// ============================================================================
// Validation and unsupported surface
// ============================================================================

#[test]
fn test_entrypoint_validation_fails_synchronously() {
    run_group(2, 1, |group| {
        let t = Tensor::zeros(&[2], DataType::F32);

        // Root rank out of bounds.
        assert!(group
            .broadcast(
                vec![t.clone()],
                BroadcastOptions {
                    root_rank: 2,
                    root_tensor: 0
                }
            )
            .is_err());

        // Mismatched shapes in one list.
        let other = Tensor::zeros(&[3], DataType::F32);
        assert!(group
            .allreduce(vec![t.clone(), other], AllreduceOptions::default())
            .is_err());

        // Reduce takes a single tensor.
        assert!(group
            .reduce(vec![t.clone(), t.clone()], ReduceOptions::default())
            .is_err());

        // Gather wants empty outputs off-root.
        if group.rank() != 0 {
            let outputs = vec![vec![Tensor::zeros(&[2], DataType::F32); 2]];
            assert!(group
                .gather(outputs, vec![t.clone()], GatherOptions { root_rank: 0 })
                .is_err());
        }

        // A later, well-formed collective still matches across ranks,
        // which means rejected calls did not advance the tag counter.
        let ok = Tensor::from_vec(&[(group.rank() + 1) as f32], &[1]);
        group
            .allreduce(vec![ok.clone()], AllreduceOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(ok.to_vec::<f32>().unwrap(), vec![3.0]);
    });
}

#[test]
fn test_reduce_scatter_always_unsupported() {
    run_group(2, 1, |group| {
        let err = group.reduce_scatter(Vec::new(), Vec::new()).unwrap_err();
        assert!(matches!(err, CohortError::Unsupported(_)));
    });
}
