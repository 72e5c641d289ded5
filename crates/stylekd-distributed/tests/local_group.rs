//! Multi-rank reduction through the in-process group.

use std::thread;

use mlx_rs::Array;
use stylekd_distributed::{DistributedContext, LocalGroup, LossDict, ReduceBackend};

#[test]
fn test_all_reduce_sums_across_ranks() {
    let handles = LocalGroup::new(4).unwrap();
    let workers: Vec<_> = handles
        .into_iter()
        .map(|group| {
            thread::spawn(move || {
                let rank = group.rank() as f32;
                let mut buffer = vec![rank, 1.0];
                group.all_reduce_sum(&mut buffer).unwrap();
                // Second collective reuses the cleared buffer.
                let mut again = vec![2.0];
                group.all_reduce_sum(&mut again).unwrap();
                (buffer, again)
            })
        })
        .collect();

    for worker in workers {
        let (buffer, again) = worker.join().unwrap();
        assert_eq!(buffer, vec![6.0, 4.0]);
        assert_eq!(again, vec![8.0]);
    }
}

#[test]
fn test_loss_dict_is_averaged() {
    let handles = LocalGroup::new(2).unwrap();
    let workers: Vec<_> = handles
        .into_iter()
        .map(|group| {
            thread::spawn(move || {
                let rank = group.rank() as f32;
                let ctx = DistributedContext::new(Box::new(group));
                let mut losses = LossDict::new();
                losses.insert("d".to_string(), Array::from_f32(rank));
                losses.insert("g".to_string(), Array::from_f32(10.0 * (rank + 1.0)));
                let reduced = ctx.reduce_loss_dict(&losses).unwrap();
                let path_mean = ctx.reduce_mean_scalar(rank + 1.0).unwrap();
                (reduced, path_mean)
            })
        })
        .collect();

    for worker in workers {
        let (reduced, path_mean) = worker.join().unwrap();
        assert!((reduced["d"] - 0.5).abs() < 1e-6);
        assert!((reduced["g"] - 15.0).abs() < 1e-6);
        assert!((path_mean - 1.5).abs() < 1e-6);
    }
}

#[test]
fn test_mismatched_lengths_are_reported() {
    let handles = LocalGroup::new(2).unwrap();
    let workers: Vec<_> = handles
        .into_iter()
        .map(|group| {
            thread::spawn(move || {
                // Rank 1 waits so rank 0 establishes the length.
                if group.rank() == 1 {
                    thread::sleep(std::time::Duration::from_millis(50));
                }
                let mut buffer = vec![1.0; group.rank() + 1];
                group.all_reduce_sum(&mut buffer).is_err()
            })
        })
        .collect();
    let failed: Vec<bool> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(failed, vec![false, true]);
}
