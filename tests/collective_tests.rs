//! Multi-rank tests for allreduce, gather, all_gather and barrier

mod common;

use common::{create_temp_dir, run_ranks, test_config, unique_name};
use half::{bf16, f16};
use proptest::prelude::*;
use shmforge::{
    shm_all_gather, shm_allreduce, shm_barrier, shm_gather, shm_stats, DType, HostTensor,
    ShmForgeError,
};

fn rank_values(rank: i64, n: usize) -> Vec<f32> {
    (0..n).map(|i| (rank as f32 + 1.0) * 0.5 + i as f32).collect()
}

#[test]
fn test_two_rank_allreduce_scenario() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("ar-scenario");
    let results = run_ranks(2, &name, test_config(&dir), |h, rank| {
        let mut t = if rank == 0 {
            HostTensor::from_1d(&[1.0f32, 2.0])
        } else {
            HostTensor::from_1d(&[3.0f32, 4.0])
        };
        shm_allreduce(h, &mut t).unwrap();
        t.to_vec::<f32>().unwrap()
    });
    assert_eq!(results, vec![vec![4.0, 6.0], vec![4.0, 6.0]]);
}

#[test]
fn test_allreduce_group_and_payload_sizes() {
    // 1000 f32 is four 1 KiB slots, so the last case runs in chunks
    for group_size in [1i64, 2, 4, 8] {
        for n in [0usize, 1, 7, 1000] {
            let dir = create_temp_dir().unwrap();
            let name = unique_name("ar-grid");
            let results = run_ranks(group_size, &name, test_config(&dir), |h, rank| {
                let mut t = HostTensor::from_1d(&rank_values(rank, n));
                shm_allreduce(h, &mut t).unwrap();
                t.to_vec::<f32>().unwrap()
            });

            let mut expected = vec![0.0f32; n];
            for rank in 0..group_size {
                for (e, v) in expected.iter_mut().zip(rank_values(rank, n)) {
                    *e += v;
                }
            }
            for (rank, got) in results.iter().enumerate() {
                assert_eq!(got, &expected, "group {} n {} rank {}", group_size, n, rank);
            }
        }
    }
}

#[test]
fn test_allreduce_results_are_bitwise_identical_across_ranks() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("ar-bits");
    let results = run_ranks(4, &name, test_config(&dir), |h, rank| {
        let values: Vec<f64> = (0..513)
            .map(|i| 1.0 / (i as f64 + 1.0) + rank as f64 * 1e-9)
            .collect();
        let mut t = HostTensor::from_1d(&values);
        shm_allreduce(h, &mut t).unwrap();
        t.as_bytes().to_vec()
    });
    for other in &results[1..] {
        assert_eq!(other, &results[0]);
    }
}

#[test]
fn test_allreduce_half_precision() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("ar-half");
    let results = run_ranks(3, &name, test_config(&dir), |h, rank| {
        let mut a = HostTensor::from_1d(&vec![f16::from_f32(rank as f32 + 0.5); 600]);
        let mut b = HostTensor::from_1d(&vec![bf16::from_f32(rank as f32 * 2.0); 10]);
        shm_allreduce(h, &mut a).unwrap();
        shm_allreduce(h, &mut b).unwrap();
        (a.to_vec::<f16>().unwrap(), b.to_vec::<bf16>().unwrap())
    });
    for (a, b) in results {
        assert!(a.iter().all(|v| v.to_f32() == 4.5));
        assert!(b.iter().all(|v| v.to_f32() == 6.0));
    }
}

#[test]
fn test_allreduce_integers_and_shapes() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("ar-int");
    let results = run_ranks(4, &name, test_config(&dir), |h, rank| {
        let values: Vec<i64> = (0..12).map(|i| i * 10 + rank).collect();
        let mut t = HostTensor::from_vec(&[3, 4], values).unwrap();
        shm_allreduce(h, &mut t).unwrap();
        t
    });
    let expected: Vec<i64> = (0..12).map(|i| i * 40 + 6).collect();
    for t in results {
        assert_eq!(t.shape(), &[3, 4]);
        assert_eq!(t.to_vec::<i64>().unwrap(), expected);
    }
}

#[test]
fn test_gather_populates_only_destination() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("gather");
    let results = run_ranks(4, &name, test_config(&dir), |h, rank| {
        // 300 i32 per rank spans two slots
        let data = HostTensor::from_1d(&vec![rank as i32 + 100; 300]);
        let mut outs: Vec<HostTensor> = (0..4).map(|_| HostTensor::from_1d(&[-1i32; 300])).collect();
        shm_gather(h, &data, Some(outs.as_mut_slice()), 2).unwrap();
        outs
    });

    for (rank, outs) in results.iter().enumerate() {
        for (src, out) in outs.iter().enumerate() {
            let values = out.to_vec::<i32>().unwrap();
            if rank == 2 {
                assert_eq!(values, vec![src as i32 + 100; 300]);
            } else {
                assert_eq!(values, vec![-1; 300], "rank {} outputs were modified", rank);
            }
        }
    }
}

#[test]
fn test_gather_without_outputs_on_non_destination() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("gather-none");
    let results = run_ranks(3, &name, test_config(&dir), |h, rank| {
        let data = HostTensor::from_1d(&[rank as f64; 5]);
        if rank == 0 {
            let mut outs: Vec<HostTensor> = (0..3).map(|_| HostTensor::zeros(DType::F64, &[5])).collect();
            shm_gather(h, &data, Some(outs.as_mut_slice()), 0).unwrap();
            Some(outs)
        } else {
            shm_gather(h, &data, None, 0).unwrap();
            None
        }
    });
    let outs = results[0].as_ref().unwrap();
    for (src, out) in outs.iter().enumerate() {
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![src as f64; 5]);
    }
}

#[test]
fn test_gather_rejects_bad_destination_outputs() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("gather-bad");
    run_ranks(1, &name, test_config(&dir), |h, _| {
        let data = HostTensor::from_1d(&[1.0f32; 4]);
        let mut short = vec![HostTensor::zeros(DType::F32, &[3])];
        assert!(matches!(
            shm_gather(h, &data, Some(short.as_mut_slice()), 0),
            Err(ShmForgeError::SizeMismatch { .. })
        ));
        let mut wrong_dtype = vec![HostTensor::zeros(DType::I32, &[4])];
        assert!(matches!(
            shm_gather(h, &data, Some(wrong_dtype.as_mut_slice()), 0),
            Err(ShmForgeError::DtypeMismatch { .. })
        ));
        assert!(matches!(
            shm_gather(h, &data, None, 1),
            Err(ShmForgeError::InvalidRank { rank: 1, .. })
        ));
    });
}

#[test]
fn test_all_gather_is_rank_ordered_concatenation() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("allgather");
    let n = 700usize;
    let results = run_ranks(4, &name, test_config(&dir), |h, rank| {
        let data: Vec<u8> = (0..n).map(|i| (i as i64 * 7 + rank) as u8).collect();
        let mut out = HostTensor::zeros(DType::U8, &[4 * n]);
        shm_all_gather(h, &HostTensor::from_1d(&data), &mut out).unwrap();
        out.as_bytes().to_vec()
    });

    let expected: Vec<u8> = (0..4i64)
        .flat_map(|r| (0..n).map(move |i| (i as i64 * 7 + r) as u8))
        .collect();
    for out in results {
        assert_eq!(out, expected);
    }
}

#[test]
fn test_all_gather_output_size_checked() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("allgather-size");
    run_ranks(2, &name, test_config(&dir), |h, _| {
        let data = HostTensor::from_1d(&[1i32, 2, 3]);
        let mut out = HostTensor::zeros(DType::I32, &[5]);
        assert!(matches!(
            shm_all_gather(h, &data, &mut out),
            Err(ShmForgeError::SizeMismatch {
                expected: 6,
                actual: 5
            })
        ));
    });
}

#[test]
fn test_mixed_collective_sequence() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("mixed");
    let results = run_ranks(3, &name, test_config(&dir), |h, rank| {
        let mut checks = Vec::new();
        for iter in 0..20i64 {
            let mut t = HostTensor::from_1d(&[rank + iter; 33]);
            shm_allreduce(h, &mut t).unwrap();
            checks.push(t.to_vec::<i64>().unwrap()[0] == 3 + 3 * iter);

            let mut all = HostTensor::zeros(DType::I64, &[3]);
            shm_all_gather(h, &HostTensor::from_1d(&[rank * iter]), &mut all).unwrap();
            checks.push(all.to_vec::<i64>().unwrap() == vec![0, iter, 2 * iter]);

            let dst = iter % 3;
            let data = HostTensor::from_1d(&[rank]);
            if rank == dst {
                let mut outs: Vec<HostTensor> = (0..3).map(|_| HostTensor::zeros(DType::I64, &[1])).collect();
                shm_gather(h, &data, Some(outs.as_mut_slice()), dst).unwrap();
                checks.push(outs.iter().enumerate().all(|(i, o)| o.to_vec::<i64>().unwrap() == vec![i as i64]));
            } else {
                shm_gather(h, &data, None, dst).unwrap();
            }
            shm_barrier(h).unwrap();
        }
        (checks, shm_stats(h).unwrap())
    });

    for (checks, stats) in results {
        assert!(checks.iter().all(|&ok| ok));
        assert_eq!(stats.allreduce_calls, 20);
        assert_eq!(stats.gather_calls, 20);
        assert_eq!(stats.barrier_calls, 20);
    }
}

#[test]
fn test_mismatched_lengths_are_reported() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("mismatch");
    let results = run_ranks(2, &name, test_config(&dir), |h, rank| {
        let mut t = HostTensor::from_1d(&vec![1.0f32; 4 + rank as usize]);
        shm_allreduce(h, &mut t)
    });
    for result in results {
        assert!(matches!(result, Err(ShmForgeError::CollectiveMismatch { .. })));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_allreduce_matches_serial_sum(
        group_size in 1i64..5,
        rows in prop::collection::vec(prop::collection::vec(-1_000_000i32..1_000_000, 0..400), 4),
    ) {
        let n = rows.iter().map(|r| r.len()).min().unwrap_or(0);
        let dir = create_temp_dir().unwrap();
        let name = unique_name("prop-ar");
        let results = run_ranks(group_size, &name, test_config(&dir), |h, rank| {
            let mut t = HostTensor::from_1d(&rows[rank as usize][..n]);
            shm_allreduce(h, &mut t).unwrap();
            t.to_vec::<i32>().unwrap()
        });
        let expected: Vec<i32> = (0..n)
            .map(|i| (0..group_size as usize).map(|r| rows[r][i]).sum())
            .collect();
        for got in results {
            prop_assert_eq!(&got, &expected);
        }
    }
}
