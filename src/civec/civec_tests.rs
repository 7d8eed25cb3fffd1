use std::sync::Arc;
use std::thread;

use approx::assert_abs_diff_eq;
use ndarray::{array, Array1, Array2};

use crate::civec::{Civec, CivecData, DistCivec, SubspaceVector};
use crate::determinant::Determinants;
use crate::parallel::{SerialCommunicator, ThreadCommunicator};

fn sample_civec() -> Civec {
    let det = Arc::new(Determinants::new(3, 1, 1).unwrap());
    #[rustfmt::skip]
    let data = array![
        [0.5, 0.1, 0.2],
        [0.1, 0.3, -0.2],
        [0.0, -0.2, 0.4],
    ];
    Civec::from_array(det, data).unwrap()
}

#[test]
fn test_civec_basic_algebra() {
    let mut cc = sample_civec();
    let dd = cc.clone();
    assert_abs_diff_eq!(cc.dot(&dd).unwrap(), 0.64, epsilon = 1e-14);
    cc.ax_plus_y(-1.0, &dd).unwrap();
    assert_abs_diff_eq!(cc.norm().unwrap(), 0.0, epsilon = 1e-14);

    let mut ee = dd.clone();
    let norm = ee.normalize().unwrap();
    assert_abs_diff_eq!(norm, 0.8, epsilon = 1e-14);
    assert_abs_diff_eq!(ee.norm().unwrap(), 1.0, epsilon = 1e-14);
    assert_abs_diff_eq!(ee.rms().unwrap(), 1.0 / 3.0, epsilon = 1e-14);

    let mut zero = dd.clone();
    zero.zero();
    assert!(zero.normalize().is_err());
}

#[test]
fn test_civec_shape_is_checked() {
    let det = Arc::new(Determinants::new(3, 1, 1).unwrap());
    assert!(Civec::from_array(det, Array2::zeros((2, 3))).is_err());

    let other = Civec::zeros(Arc::new(Determinants::new(3, 2, 1).unwrap()));
    assert!(sample_civec().dot(&other).is_err());
}

#[test]
fn test_civec_project_out_and_spin_flip() {
    let mut basis = sample_civec();
    basis.normalize().unwrap();
    let mut cc = sample_civec().spin_flip().unwrap();
    cc.data_mut()[(0, 1)] += 1.0;
    cc.project_out(&[basis.clone()]).unwrap();
    assert_abs_diff_eq!(cc.dot(&basis).unwrap(), 0.0, epsilon = 1e-14);
}

#[test]
fn test_civec_embed_preserves_coefficients() {
    let cc = sample_civec();
    let embedded = cc.embed(2).unwrap();
    assert_eq!(embedded.det().norb(), 5);
    assert_eq!(embedded.det().nelea(), 3);
    assert_abs_diff_eq!(embedded.dot(&embedded).unwrap(), 0.64, epsilon = 1e-14);
    let ia = embedded.det().alpha().rank(0b00111);
    let ib = embedded.det().beta().rank(0b01011);
    assert_abs_diff_eq!(embedded.data()[(ia, ib)], 0.1, epsilon = 1e-14);
}

#[test]
fn test_civec_checkpoint_snapshot_roundtrip() {
    let cc = sample_civec();
    let snapshot = CivecData::from(&cc);
    let restored = snapshot.restore(cc.det().clone()).unwrap();
    assert_eq!(restored.data(), cc.data());
    let wrong = Arc::new(Determinants::new(3, 2, 1).unwrap());
    assert!(snapshot.restore(wrong).is_err());
}

#[test]
fn test_civec_dist_serial_matches_replicated() {
    let cc = sample_civec();
    let dist = DistCivec::from_civec(&cc, SerialCommunicator::handle());
    assert_abs_diff_eq!(dist.dot(&dist).unwrap(), 0.64, epsilon = 1e-14);
    assert_eq!(dist.to_civec().unwrap().data(), cc.data());
}

#[test]
fn test_civec_dist_accumulate_then_flush() {
    let det = Arc::new(Determinants::new(4, 1, 1).unwrap());
    let comms = ThreadCommunicator::group(2).unwrap();
    let gathered = thread::scope(|s| {
        let handles = comms
            .iter()
            .map(|comm| {
                let det = det.clone();
                s.spawn(move || {
                    let mut cc = DistCivec::zeros(det, comm.clone());
                    // Every rank adds its rank+1 into every row, local or not.
                    let buf = Array1::from_elem(4, comm.rank() as f64 + 1.0);
                    for ia in 0..4 {
                        cc.accumulate_bstring_buf(buf.view(), ia).unwrap();
                    }
                    cc.flush().unwrap();
                    let norm2 = cc.dot(&cc).unwrap();
                    (cc.to_civec().unwrap(), norm2)
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });
    for (full, norm2) in gathered {
        assert!(full.data().iter().all(|&v| (v - 3.0).abs() < 1e-14));
        assert_abs_diff_eq!(norm2, 16.0 * 9.0, epsilon = 1e-12);
    }
}

#[test]
fn test_civec_dist_stores_only_owned_and_touched_rows() {
    let det = Arc::new(Determinants::new(6, 1, 1).unwrap());
    let mut full = Civec::zeros(det.clone());
    full.data_mut()
        .indexed_iter_mut()
        .for_each(|((ia, ib), v)| *v = (10 * ia + ib) as f64);
    let comms = ThreadCommunicator::group(3).unwrap();
    let results = thread::scope(|s| {
        let handles = comms
            .iter()
            .map(|comm| {
                let full = &full;
                s.spawn(move || {
                    let mut cc = DistCivec::from_civec(full, comm.clone());
                    let owned = cc.local().nrows();

                    // Touch one remote row, the row after this rank's block.
                    let target = (cc.local_range().end) % 6;
                    let buf = Array1::from_elem(6, 1.0);
                    cc.accumulate_bstring_buf(buf.view(), target).unwrap();
                    let pending = cc.pending_rows();
                    cc.flush().unwrap();
                    let after = cc.pending_rows();

                    // Rank r asks for row 5 - 2r and one of its own rows.
                    let wanted = [5 - 2 * comm.rank(), cc.local_range().start];
                    let fetched = cc.fetch_rows(&wanted).unwrap();
                    (comm.rank(), owned, pending, after, fetched, cc.to_civec().unwrap())
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });
    for (rank, owned, pending, after, fetched, gathered) in results {
        assert_eq!(owned, 2);
        assert_eq!(pending, 1);
        assert_eq!(after, 0);
        assert_eq!(fetched.len(), 2);
        let remote = 5 - 2 * rank;
        // Rows are fetched after the flush, so each block's first row carries one extra unit.
        let bump = |ia: usize| if ia % 2 == 0 { 1.0 } else { 0.0 };
        for (ia, row) in fetched.iter() {
            assert!(*ia == remote || *ia == 2 * rank);
            for (ib, v) in row.iter().enumerate() {
                assert_abs_diff_eq!(*v, (10 * ia + ib) as f64 + bump(*ia), epsilon = 1e-14);
            }
        }
        for ((ia, ib), v) in gathered.data().indexed_iter() {
            assert_abs_diff_eq!(*v, (10 * ia + ib) as f64 + bump(ia), epsilon = 1e-14);
        }
    }
}
