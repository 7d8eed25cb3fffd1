use std::thread;

use crate::parallel::{self, SerialCommunicator, StaticDist, ThreadCommunicator};

#[test]
fn test_parallel_static_dist_covers_all_items() {
    let dist = StaticDist::new(10, 3);
    assert_eq!(dist.range(0), 0..4);
    assert_eq!(dist.range(1), 4..7);
    assert_eq!(dist.range(2), 7..10);
    assert_eq!(dist.owner(0), 0);
    assert_eq!(dist.owner(5), 1);
    assert_eq!(dist.owner(9), 2);

    let dist = StaticDist::new(2, 4);
    assert_eq!(dist.range(0), 0..1);
    assert_eq!(dist.range(1), 1..2);
    assert!(dist.range(2).is_empty());
    assert!(dist.range(3).is_empty());
}

#[test]
fn test_parallel_serial_allreduce_is_identity() {
    let comm = SerialCommunicator::handle();
    let mut buf = vec![1.0, 2.0, 3.0];
    comm.allreduce_sum(&mut buf).unwrap();
    assert_eq!(buf, vec![1.0, 2.0, 3.0]);
    assert!(comm.is_root());
    assert_eq!(comm.size(), 1);
}

#[test]
fn test_parallel_thread_allreduce_sums_over_ranks() {
    let comms = ThreadCommunicator::group(3).unwrap();
    let results = thread::scope(|s| {
        let handles = comms
            .iter()
            .map(|comm| {
                s.spawn(move || {
                    let mut out = vec![];
                    for round in 0..3 {
                        let r = comm.rank() as f64;
                        let mut buf = vec![r, 10.0 * r + round as f64];
                        comm.allreduce_sum(&mut buf).unwrap();
                        out.push(buf);
                    }
                    out
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });
    for per_rank in results.iter() {
        for (round, buf) in per_rank.iter().enumerate() {
            assert_eq!(buf[0], 3.0);
            assert_eq!(buf[1], 30.0 + 3.0 * round as f64);
        }
    }
}

#[test]
fn test_parallel_world_without_mpi_environment_is_serial() {
    let comm = parallel::world();
    assert_eq!(comm.size(), 1);
    assert_eq!(comm.rank(), 0);
    let mut buf = vec![2.5];
    comm.allreduce_sum(&mut buf).unwrap();
    assert_eq!(buf, vec![2.5]);
}

#[test]
fn test_parallel_serial_all_to_all_returns_own_message() {
    let comm = SerialCommunicator::handle();
    let got = comm.all_to_all_u64(&[vec![4, 5]]).unwrap();
    assert_eq!(got, vec![vec![4, 5]]);
    assert!(comm.all_to_all_f64(&[vec![1.0], vec![2.0]]).is_err());
}

#[test]
fn test_parallel_thread_all_to_all_routes_messages() {
    let comms = ThreadCommunicator::group(3).unwrap();
    let results = thread::scope(|s| {
        let handles = comms
            .iter()
            .map(|comm| {
                s.spawn(move || {
                    let me = comm.rank();
                    let mut out = vec![];
                    for round in 0..2 {
                        // Rank `me` sends `to + 1` copies of `10 * me + to + 100 * round` to rank `to`.
                        let send = (0..3)
                            .map(|to| vec![(10 * me + to + 100 * round) as f64; to + 1])
                            .collect::<Vec<_>>();
                        out.push(comm.all_to_all_f64(&send).unwrap());
                    }
                    let idx = comm
                        .all_to_all_u64(&(0..3).map(|to| vec![(me * 3 + to) as u64]).collect::<Vec<_>>())
                        .unwrap();
                    (me, out, idx)
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });
    for (me, rounds, idx) in results {
        for (round, recv) in rounds.iter().enumerate() {
            assert_eq!(recv.len(), 3);
            for (from, msg) in recv.iter().enumerate() {
                assert_eq!(msg.len(), me + 1);
                assert!(msg
                    .iter()
                    .all(|&v| v == (10 * from + me + 100 * round) as f64));
            }
        }
        let expected = (0..3).map(|from| vec![(from * 3 + me) as u64]).collect::<Vec<_>>();
        assert_eq!(idx, expected);
    }
}
