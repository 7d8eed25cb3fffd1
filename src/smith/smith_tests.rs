use std::thread;

use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use ndarray_einsum_beta::einsum;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::civec::SubspaceVector;
use crate::parallel::{CommHandle, SerialCommunicator, ThreadCommunicator};
use crate::smith::{
    ContractionTask, IndexRange, LinearRM, MultiTensor, Queue, ResetTask, Tensor, TensorId,
    TensorStore,
};

fn random_array(shape: &[usize], seed: u64) -> ArrayD<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    ArrayD::from_shape_fn(IxDyn(shape), |_| rng.gen_range(-1.0..1.0))
}

fn ranges() -> (IndexRange, IndexRange) {
    (
        IndexRange::new("i", 5, 2, 0).unwrap(),
        IndexRange::new("v", 4, 3, 5).unwrap(),
    )
}

fn assert_arrays_close(a: &ArrayD<f64>, b: &ArrayD<f64>, eps: f64) {
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = eps);
    }
}

#[test]
fn test_smith_index_range_blocks() {
    let range = IndexRange::new("x", 7, 3, 2).unwrap();
    assert_eq!(range.nblock(), 3);
    let sizes = range.blocks().iter().map(|b| b.size()).collect::<Vec<_>>();
    assert_eq!(sizes, vec![3, 2, 2]);
    assert_eq!(range.block(2).range(), 5..7);
    assert_eq!(range.range(), 2..9);
    assert_eq!(IndexRange::new("e", 0, 3, 0).unwrap().nblock(), 0);
    assert!(IndexRange::new("z", 4, 0, 0).is_err());
}

#[test]
fn test_smith_tensor_blocks_match_dense_array() {
    let (i, v) = ranges();
    let mut dense = random_array(&[4, 5, 5], 1);
    dense
        .slice_each_axis_mut(|ax| match ax.axis.index() {
            0 => ndarray::Slice::from(0..3),
            _ => ndarray::Slice::from(0..2),
        })
        .fill(0.0);
    let t = Tensor::from_array(vec![v.clone(), i.clone(), i.clone()], dense.view()).unwrap();
    assert!(!t.is_allocated(&[0, 0, 0]));
    assert_eq!(t.allocated_blocks(), 2 * 3 * 3 - 1);
    assert_arrays_close(&t.to_array(), &dense, 0.0);

    let other = random_array(&[4, 5, 5], 2);
    let u = Tensor::from_array(vec![v.clone(), i.clone(), i.clone()], other.view()).unwrap();
    assert_abs_diff_eq!(t.dot(&u).unwrap(), (&dense * &other).sum(), epsilon = 1e-12);
    let mut w = t.clone();
    w.ax_plus_y(-0.5, &u).unwrap();
    assert_arrays_close(&w.to_array(), &(&dense - &(&other * 0.5)), 1e-14);
    assert_eq!(w.size(), 100);
    assert!(t.dot(&Tensor::new(vec![i.clone(), v, i])).is_err());
}

#[test]
fn test_smith_contraction_matches_dense_einsum() {
    let (i, v) = ranges();
    let gamma = random_array(&[5, 5, 5, 5], 3);
    let amp = random_array(&[4, 4, 5, 5], 4);
    let mut store = TensorStore::new();
    let g = store.insert(
        "gamma",
        Tensor::from_array(vec![i.clone(); 4], gamma.view()).unwrap(),
    );
    let t = store.insert(
        "t",
        Tensor::from_array(vec![v.clone(), v.clone(), i.clone(), i.clone()], amp.view()).unwrap(),
    );
    let r = store.declare("r", vec![v.clone(), v, i.clone(), i]);
    let mut queue = Queue::new();
    queue
        .add_task(
            Box::new(ContractionTask::new("direct", "xpyq,abpq->abxy", r, &[g, t], 2.0, &store).unwrap()),
            &[],
        )
        .unwrap();
    queue
        .add_task(
            Box::new(ContractionTask::new("exchange", "xqyp,bapq->abxy", r, &[g, t], 1.0, &store).unwrap()),
            &[],
        )
        .unwrap();
    queue.run(&mut store, &SerialCommunicator::handle()).unwrap();

    let direct = einsum("xpyq,abpq->abxy", &[&gamma, &amp]).unwrap();
    let exchange = einsum("xqyp,bapq->abxy", &[&gamma, &amp]).unwrap();
    let expected = direct * 2.0 + exchange;
    assert_arrays_close(&store.get(r).unwrap().to_array(), &expected, 1e-12);
}

#[test]
fn test_smith_contraction_construction_errors() {
    let (i, v) = ranges();
    let mut store = TensorStore::new();
    let a = store.insert("a", Tensor::new(vec![v.clone(), i.clone()]));
    let b = store.insert("b", Tensor::new(vec![i.clone(), i.clone()]));
    let out = store.declare("out", vec![v.clone(), i.clone()]);
    assert!(ContractionTask::new("alias", "ap,pq->aq", a, &[a, b], 1.0, &store).is_err());
    assert!(ContractionTask::new("rank", "apx,pq->aq", out, &[a, b], 1.0, &store).is_err());
    assert!(ContractionTask::new("ranges", "ap,ap->ap", out, &[a, b], 1.0, &store).is_err());
    assert!(ContractionTask::new("letters", "ap,pq->az", out, &[a, b], 1.0, &store).is_err());
    assert!(ContractionTask::new("count", "ap->ap", out, &[a, b], 1.0, &store).is_err());
    assert!(ContractionTask::new("ok", "ap,pq->aq", out, &[a, b], 1.0, &store).is_ok());
}

/// `x = a b`, `y = x c`, `z = y + 2 a c + x` accumulated by three tasks.
fn chain_queue(seed: Option<u64>) -> (TensorStore, Queue, TensorId) {
    let r = IndexRange::new("r", 6, 2, 0).unwrap();
    let mut store = TensorStore::new();
    let a = store.insert(
        "a",
        Tensor::from_array(vec![r.clone(); 2], random_array(&[6, 6], 5).view()).unwrap(),
    );
    let b = store.insert(
        "b",
        Tensor::from_array(vec![r.clone(); 2], random_array(&[6, 6], 6).view()).unwrap(),
    );
    let c = store.insert(
        "c",
        Tensor::from_array(vec![r.clone(); 2], random_array(&[6, 6], 7).view()).unwrap(),
    );
    let x = store.declare("x", vec![r.clone(); 2]);
    let y = store.declare("y", vec![r.clone(); 2]);
    let z = store.declare("z", vec![r; 2]);
    let mut queue = Queue::with_shuffle(seed);
    let tasks = vec![
        ContractionTask::new("z += y", "pq->pq", z, &[y], 1.0, &store).unwrap(),
        ContractionTask::new("y = xc", "pr,rq->pq", y, &[x, c], 1.0, &store).unwrap(),
        ContractionTask::new("z += 2ac", "pr,rq->pq", z, &[a, c], 2.0, &store).unwrap(),
        ContractionTask::new("x = ab", "pr,rq->pq", x, &[a, b], 1.0, &store).unwrap(),
        ContractionTask::new("z += x", "pq->pq", z, &[x], 1.0, &store).unwrap(),
    ];
    for task in tasks {
        queue.add_task(Box::new(task), &[]).unwrap();
    }
    (store, queue, z)
}

#[test]
fn test_smith_queue_order_independence() {
    let comm = SerialCommunicator::handle();
    let (mut store, mut queue, z) = chain_queue(None);
    queue.run(&mut store, &comm).unwrap();
    let reference = store.get(z).unwrap().to_array();

    let a = random_array(&[6, 6], 5).into_dimensionality::<ndarray::Ix2>().unwrap();
    let b = random_array(&[6, 6], 6).into_dimensionality::<ndarray::Ix2>().unwrap();
    let c = random_array(&[6, 6], 7).into_dimensionality::<ndarray::Ix2>().unwrap();
    let x = a.dot(&b);
    let expected = x.dot(&c) + a.dot(&c) * 2.0 + &x;
    assert_arrays_close(&reference, &expected.into_dyn(), 1e-12);

    for seed in 0..8 {
        let (mut store, mut queue, z) = chain_queue(Some(seed));
        assert_eq!(queue.len(), 5);
        queue.run(&mut store, &comm).unwrap();
        assert!(queue.done());
        assert_arrays_close(&store.get(z).unwrap().to_array(), &reference, 1e-13);
    }
}

#[test]
fn test_smith_queue_fails_fast_without_ready_task() {
    let comm = SerialCommunicator::handle();
    let r = IndexRange::new("r", 3, 2, 0).unwrap();

    let mut store = TensorStore::new();
    let x = store.declare("x", vec![r.clone(); 2]);
    let y = store.declare("y", vec![r.clone(); 2]);
    let mut queue = Queue::new();
    queue
        .add_task(Box::new(ContractionTask::new("y", "pq->pq", y, &[x], 1.0, &store).unwrap()), &[])
        .unwrap();
    queue
        .add_task(Box::new(ContractionTask::new("x", "pq->pq", x, &[y], 1.0, &store).unwrap()), &[])
        .unwrap();
    assert!(queue.run(&mut store, &comm).is_err());
    assert_eq!(queue.len(), 2);

    let mut store = TensorStore::new();
    let missing = store.declare("missing", vec![r.clone(); 2]);
    let out = store.declare("out", vec![r; 2]);
    let mut queue = Queue::new();
    queue
        .add_task(
            Box::new(ContractionTask::new("out", "pq->qp", out, &[missing], 1.0, &store).unwrap()),
            &[],
        )
        .unwrap();
    assert!(queue.next_compute(&mut store, &comm).is_err());

    let mut other = Queue::new();
    let handle = other
        .add_task(Box::new(ResetTask::new(out)), &[])
        .unwrap();
    assert!(Queue::new()
        .add_task(Box::new(ResetTask::new(out)), &[handle])
        .is_err());
}

#[test]
fn test_smith_reset_before_accumulation() {
    let comm = SerialCommunicator::handle();
    let r = IndexRange::new("r", 4, 3, 0).unwrap();
    let data = random_array(&[4, 4], 8);
    let mut store = TensorStore::new();
    let src = store.insert("src", Tensor::from_array(vec![r.clone(); 2], data.view()).unwrap());
    let acc = store.insert(
        "acc",
        Tensor::from_array(vec![r.clone(); 2], random_array(&[4, 4], 9).view()).unwrap(),
    );
    let mut queue = Queue::with_shuffle(Some(3));
    let reset = queue.add_task(Box::new(ResetTask::new(acc)), &[]).unwrap();
    queue
        .add_task(
            Box::new(ContractionTask::new("acc += src", "pq->pq", acc, &[src], 1.0, &store).unwrap()),
            &[reset],
        )
        .unwrap();
    queue.run(&mut store, &comm).unwrap();
    assert_arrays_close(&store.get(acc).unwrap().to_array(), &data, 0.0);

    let mut queue = Queue::new();
    queue
        .add_task(
            Box::new(
                ContractionTask::new("acc = -src^T", "pq->qp", acc, &[src], -1.0, &store)
                    .unwrap()
                    .with_reset(),
            ),
            &[],
        )
        .unwrap();
    queue.run(&mut store, &comm).unwrap();
    let expected = data.t().mapv(|v| -v);
    assert_arrays_close(&store.get(acc).unwrap().to_array(), &expected, 0.0);
}

#[test]
fn test_smith_distributed_queue_matches_serial() {
    let (mut store, mut queue, z) = chain_queue(None);
    queue.run(&mut store, &SerialCommunicator::handle()).unwrap();
    let serial = store.get(z).unwrap().to_array();

    let comms = ThreadCommunicator::group(3).unwrap();
    let results = thread::scope(|s| {
        let handles = comms
            .iter()
            .map(|comm: &CommHandle| {
                s.spawn(move || {
                    let (mut store, mut queue, z) = chain_queue(Some(11));
                    queue.run(&mut store, comm).unwrap();
                    store.get(z).unwrap().to_array()
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });
    for result in results.iter() {
        assert_arrays_close(result, &serial, 1e-12);
    }
}

#[test]
fn test_smith_multitensor_vector_operations() {
    let (i, v) = ranges();
    let shape = [4, 5];
    let a0 = random_array(&shape, 12);
    let a1 = random_array(&shape, 13);
    let ranges = vec![v, i];
    let mut m = MultiTensor::new(vec![
        Tensor::from_array(ranges.clone(), a0.view()).unwrap(),
        Tensor::from_array(ranges.clone(), a1.view()).unwrap(),
    ]);
    let zeros = MultiTensor::zeros(&ranges, 2);
    assert_eq!(zeros.at(1).allocated_blocks(), 0);
    assert_abs_diff_eq!(
        m.dot(&m).unwrap(),
        (&a0 * &a0).sum() + (&a1 * &a1).sum(),
        epsilon = 1e-12
    );
    assert_eq!(m.size(), 40);
    m.ax_plus_y(1.0, &zeros).unwrap();
    m.scale(0.0);
    assert_abs_diff_eq!(m.norm().unwrap(), 0.0);
    assert!(m.dot(&MultiTensor::zeros(&ranges, 3)).is_err());
}

#[test]
fn test_smith_linear_rm_solves_symmetric_system() {
    let n = 10;
    let mut rng = StdRng::seed_from_u64(21);
    let mut a = Array2::<f64>::zeros((n, n));
    for p in 0..n {
        a[(p, p)] = 2.0 + p as f64;
        for q in 0..p {
            let v = 0.2 * rng.gen_range(-1.0..1.0);
            a[(p, q)] = v;
            a[(q, p)] = v;
        }
    }
    let source = Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0));
    let diag = a.diag().to_owned();
    let precondition = |r: &Array1<f64>| -r / &diag;

    for max_subspace in [30, 3] {
        let mut solver = LinearRM::new(max_subspace, source.clone(), 1e-12).unwrap();
        let mut trial = precondition(&source);
        let mut converged = false;
        for _ in 0..60 {
            let Some(c) = solver.orthonormalize(trial).unwrap() else {
                break;
            };
            let sigma = a.dot(&c);
            let residual = solver.compute_residual(c, sigma).unwrap();
            assert!(solver.len() <= max_subspace);
            if residual.norm().unwrap() < 1e-10 {
                converged = true;
                break;
            }
            trial = precondition(&residual);
        }
        assert!(converged);
        let t = solver.civec().unwrap();
        let check = a.dot(&t) + &source;
        assert!(check.iter().all(|x| x.abs() < 1e-9));
    }
}
