//! Point-to-point tensor-list tests

mod common;

use common::{create_temp_dir, run_ranks, test_config, unique_name};
use shmforge::{
    init_shm_manager_with_config, join_shm_manager, release_shm_manager, shm_allreduce,
    shm_barrier, shm_recv_tensor_list, shm_send_tensor_list, DType, HostTensor, ShmForgeError,
};

fn varied_list(seed: i64) -> Vec<HostTensor> {
    vec![
        HostTensor::from_1d(&[seed as f32, seed as f32 + 0.25]),
        HostTensor::zeros(DType::I64, &[0]),
        HostTensor::from_vec(&[2, 3], (0..6).map(|i| (i + seed) as i32).collect::<Vec<_>>()).unwrap(),
        // 2 KiB of payload crosses several 512-byte channel chunks
        HostTensor::from_1d(&(0..2048).map(|i| (i as i64 + seed) as u8).collect::<Vec<_>>()),
        HostTensor::zeros(DType::BF16, &[4, 1, 2]),
    ]
}

#[test]
fn test_three_rank_scenario() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("p2p-scenario");
    let results = run_ranks(3, &name, test_config(&dir), |h, rank| {
        if rank == 2 {
            let mut received = Vec::new();
            for src in 0..2 {
                received.push(shm_recv_tensor_list(h, src).unwrap());
            }
            received
        } else {
            let list = vec![
                HostTensor::from_1d(&[1.0f32, 2.0]),
                HostTensor::from_1d(&[3.0f32]),
            ];
            shm_send_tensor_list(h, &list, 2).unwrap();
            Vec::new()
        }
    });

    for list in &results[2] {
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(list[0].nbytes(), 8);
        assert_eq!(list[1].to_vec::<f32>().unwrap(), vec![3.0]);
        assert_eq!(list[1].nbytes(), 4);
    }
    assert_eq!(results[2].len(), 2);
}

#[test]
fn test_empty_single_and_many_element_lists() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("p2p-sizes");
    let lists = vec![
        Vec::new(),
        vec![HostTensor::from_1d(&[42i64])],
        varied_list(7),
    ];
    let results = run_ranks(2, &name, test_config(&dir), |h, rank| {
        let mut received = Vec::new();
        for list in &lists {
            if rank == 0 {
                shm_send_tensor_list(h, list, 1).unwrap();
            } else {
                received.push(shm_recv_tensor_list(h, 0).unwrap());
            }
        }
        received
    });
    assert_eq!(results[1], lists);
}

#[test]
fn test_messages_arrive_in_send_order() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("p2p-order");
    let results = run_ranks(2, &name, test_config(&dir), |h, rank| {
        if rank == 0 {
            for i in 0..50i32 {
                let list = vec![HostTensor::from_1d(&vec![i; (i as usize * 13) % 300])];
                shm_send_tensor_list(h, &list, 1).unwrap();
            }
            Vec::new()
        } else {
            (0..50)
                .map(|_| shm_recv_tensor_list(h, 0).unwrap())
                .collect::<Vec<_>>()
        }
    });

    for (i, list) in results[1].iter().enumerate() {
        let values = list[0].to_vec::<i32>().unwrap();
        assert_eq!(values.len(), (i * 13) % 300);
        assert!(values.iter().all(|&v| v == i as i32));
    }
}

#[test]
fn test_all_pairs_exchange() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("p2p-pairs");
    let g = 4i64;
    let results = run_ranks(g, &name, test_config(&dir), |h, rank| {
        // Single-chunk sends complete without waiting for the receiver
        for dst in 0..g {
            if dst != rank {
                let list = vec![HostTensor::from_1d(&[rank * 10 + dst])];
                shm_send_tensor_list(h, &list, dst).unwrap();
            }
        }
        let mut got = Vec::new();
        for src in 0..g {
            if src != rank {
                let list = shm_recv_tensor_list(h, src).unwrap();
                got.push(list[0].to_vec::<i64>().unwrap()[0]);
            }
        }
        got
    });

    for (rank, got) in results.iter().enumerate() {
        let expected: Vec<i64> = (0..g)
            .filter(|&src| src != rank as i64)
            .map(|src| src * 10 + rank as i64)
            .collect();
        assert_eq!(got, &expected);
    }
}

#[test]
fn test_p2p_interleaved_with_collectives() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("p2p-mixed");
    let results = run_ranks(2, &name, test_config(&dir), |h, rank| {
        let mut ok = true;
        for iter in 0..10i64 {
            let mut t = HostTensor::from_1d(&vec![rank + 1; 100]);
            shm_allreduce(h, &mut t).unwrap();
            ok &= t.to_vec::<i64>().unwrap().iter().all(|&v| v == 3);

            if rank == 0 {
                shm_send_tensor_list(h, &varied_list(iter), 1).unwrap();
            } else {
                ok &= shm_recv_tensor_list(h, 0).unwrap() == varied_list(iter);
            }
            shm_barrier(h).unwrap();
        }
        ok
    });
    assert_eq!(results, vec![true, true]);
}

#[test]
fn test_send_to_self_and_bad_peer_rejected() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("p2p-self");
    run_ranks(2, &name, test_config(&dir), |h, rank| {
        let list = vec![HostTensor::from_1d(&[1.0f32])];
        assert!(matches!(
            shm_send_tensor_list(h, &list, rank),
            Err(ShmForgeError::InvalidArgument(_))
        ));
        assert!(matches!(
            shm_recv_tensor_list(h, rank),
            Err(ShmForgeError::InvalidArgument(_))
        ));
        assert!(matches!(
            shm_send_tensor_list(h, &list, 5),
            Err(ShmForgeError::InvalidRank { rank: 5, .. })
        ));
        assert!(matches!(
            shm_recv_tensor_list(h, -1),
            Err(ShmForgeError::InvalidRank { rank: -1, .. })
        ));
    });
}

#[test]
fn test_join_after_peer_sent_and_released() {
    let dir = create_temp_dir().unwrap();
    let name = unique_name("p2p-early-peer");
    let h0 = init_shm_manager_with_config(&name, 2, 0, test_config(&dir)).unwrap();
    let h1 = init_shm_manager_with_config(&name, 2, 1, test_config(&dir)).unwrap();

    // Rank 1 finishes its whole lifetime before rank 0 joins
    assert_eq!(join_shm_manager(h1, &name).unwrap(), name);
    let list = vec![HostTensor::from_1d(&[1.0f32, 2.0])];
    shm_send_tensor_list(h1, &list, 0).unwrap();
    release_shm_manager(h1).unwrap();

    assert_eq!(join_shm_manager(h0, &name).unwrap(), name);
    assert_eq!(shm_recv_tensor_list(h0, 1).unwrap(), list);
    release_shm_manager(h0).unwrap();
}
