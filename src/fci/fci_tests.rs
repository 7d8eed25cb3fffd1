use std::sync::Arc;
use std::thread;

use approx::assert_abs_diff_eq;
use ndarray::Array2;

use crate::auxiliary::linalg::symmetric_eigh;
use crate::civec::{Civec, DistCivec, SubspaceVector};
use crate::determinant::Determinants;
use crate::fci::sigma::{diagonal, sigma, sigma_distributed, sigma_distributed_batched};
use crate::fci::{Fci, FciParams};
use crate::integrals::test_models::{molecule_like, two_orbital_ground_energy, two_orbital_model};
use crate::integrals::{IntegralProvider, MOFile};
use crate::parallel::ThreadCommunicator;

fn molecule_mofile(n: usize, seed: u64) -> MOFile {
    let dense = molecule_like(n, seed);
    let mo = dense.mo_integrals(Array2::<f64>::eye(n).view()).unwrap();
    MOFile::new(&mo, 0, n).unwrap()
}

fn explicit_hamiltonian(det: &Arc<Determinants>, mofile: &MOFile) -> Array2<f64> {
    let (lena, lenb) = (det.lena(), det.lenb());
    let size = det.size();
    let mut ham = Array2::<f64>::zeros((size, size));
    for j in 0..size {
        let mut unit = Civec::zeros(det.clone());
        unit.data_mut()[(j / lenb, j % lenb)] = 1.0;
        let s = sigma(&unit, mofile).unwrap();
        for ia in 0..lena {
            for ib in 0..lenb {
                ham[(ia * lenb + ib, j)] = s.data()[(ia, ib)];
            }
        }
    }
    ham
}

#[test]
fn test_fci_two_orbital_model_energy() {
    let (e0, e1, u0, u1, j, k) = (-1.0, 0.5, 0.7, 0.6, 0.5, 0.1);
    let dense = two_orbital_model(e0, e1, u0, u1, j, k).to_dense().unwrap();
    let mo = dense.mo_integrals(Array2::<f64>::eye(2).view()).unwrap();
    let mofile = MOFile::new(&mo, 0, 2).unwrap();
    let det = Arc::new(Determinants::new(2, 1, 1).unwrap());
    let params = FciParams::builder().print_iterations(false).build().unwrap();
    let fci = Fci::new(det, &mofile, &params).unwrap();
    let result = fci.compute(None).unwrap();
    assert!(result.converged);
    assert_abs_diff_eq!(
        result.energies[0],
        two_orbital_ground_energy(e0, e1, u0, u1, k),
        epsilon = 1e-10
    );
}

#[test]
fn test_fci_sigma_is_symmetric_with_consistent_diagonal() {
    let mofile = molecule_mofile(4, 5);
    for (na, nb) in [(2, 2), (2, 1), (3, 1)] {
        let det = Arc::new(Determinants::new(4, na, nb).unwrap());
        let ham = explicit_hamiltonian(&det, &mofile);
        let diag = diagonal(&det, &mofile);
        for i in 0..det.size() {
            assert_abs_diff_eq!(
                ham[(i, i)],
                diag[(i / det.lenb(), i % det.lenb())],
                epsilon = 1e-12
            );
            for j in 0..i {
                assert_abs_diff_eq!(ham[(i, j)], ham[(j, i)], epsilon = 1e-12);
            }
        }
    }
}

#[test]
fn test_fci_energy_is_an_exact_eigenvalue() {
    let mofile = molecule_mofile(4, 9);
    let det = Arc::new(Determinants::new(4, 2, 2).unwrap());
    let (exact, _) = symmetric_eigh(&explicit_hamiltonian(&det, &mofile)).unwrap();
    let params = FciParams::builder()
        .nstate(2)
        .print_iterations(false)
        .build()
        .unwrap();
    let fci = Fci::new(det, &mofile, &params).unwrap();
    let result = fci.compute(None).unwrap();
    assert!(result.converged);
    for e in result.energies.iter() {
        let closest = exact
            .iter()
            .map(|x| (x - e).abs())
            .fold(f64::INFINITY, f64::min);
        assert!(closest < 1e-8);
    }
    assert!(result.energies[0] <= result.energies[1]);
    assert_abs_diff_eq!(
        result.civecs[0].dot(&result.civecs[1]).unwrap(),
        0.0,
        epsilon = 1e-10
    );
}

#[test]
fn test_fci_guesses_are_spin_flip_symmetric() {
    let mofile = molecule_mofile(4, 2);
    let det = Arc::new(Determinants::new(4, 2, 2).unwrap());
    let params = FciParams::default();
    let fci = Fci::new(det, &mofile, &params).unwrap();
    let guesses = fci.generate_guess(6).unwrap();
    assert_eq!(guesses.len(), 6);
    for g in guesses.iter() {
        assert_eq!(g.data(), g.spin_flip().unwrap().data());
        assert_abs_diff_eq!(g.norm().unwrap(), 1.0, epsilon = 1e-14);
    }
}

#[test]
fn test_fci_distributed_sigma_matches_serial() {
    let mofile = molecule_mofile(4, 13);
    for (na, nb) in [(2, 2), (3, 1)] {
        let det = Arc::new(Determinants::new(4, na, nb).unwrap());
        let mut cc = Civec::zeros(det.clone());
        cc.data_mut()
            .indexed_iter_mut()
            .for_each(|((ia, ib), v)| *v = ((ia * 7 + ib * 3) % 5) as f64 - 2.0);
        let reference = sigma(&cc, &mofile).unwrap();

        let comms = ThreadCommunicator::group(3).unwrap();
        let results = thread::scope(|s| {
            let handles = comms
                .iter()
                .map(|comm| {
                    let cc = &cc;
                    let mofile = &mofile;
                    s.spawn(move || {
                        let dist = DistCivec::from_civec(cc, comm.clone());
                        sigma_distributed(&dist, mofile)
                            .unwrap()
                            .to_civec()
                            .unwrap()
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        for full in results {
            let mut diff = full.clone();
            diff.ax_plus_y(-1.0, &reference).unwrap();
            assert!(diff.norm().unwrap() < 1e-12);
        }
    }
}

#[test]
fn test_fci_distributed_sigma_in_small_batches_matches_serial() {
    let mofile = molecule_mofile(5, 29);
    let det = Arc::new(Determinants::new(5, 2, 2).unwrap());
    let mut cc = Civec::zeros(det.clone());
    cc.data_mut()
        .indexed_iter_mut()
        .for_each(|((ia, ib), v)| *v = ((ia * 5 + ib * 11) % 7) as f64 - 3.0);
    let reference = sigma(&cc, &mofile).unwrap();

    // Ranks own 4, 3 and 3 alpha strings, so the rounds are uneven across ranks.
    let comms = ThreadCommunicator::group(3).unwrap();
    for batch in [1, 2, 5] {
        let results = thread::scope(|s| {
            let handles = comms
                .iter()
                .map(|comm| {
                    let cc = &cc;
                    let mofile = &mofile;
                    s.spawn(move || {
                        let dist = DistCivec::from_civec(cc, comm.clone());
                        let out = sigma_distributed_batched(&dist, mofile, batch).unwrap();
                        assert_eq!(out.pending_rows(), 0);
                        assert_eq!(out.local().nrows(), dist.local().nrows());
                        out.to_civec().unwrap()
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        for full in results {
            let mut diff = full.clone();
            diff.ax_plus_y(-1.0, &reference).unwrap();
            assert!(diff.norm().unwrap() < 1e-12);
        }
    }
}

#[test]
fn test_fci_distributed_solver_matches_serial() {
    let mofile = molecule_mofile(4, 21);
    let det = Arc::new(Determinants::new(4, 2, 2).unwrap());
    let params = FciParams::builder().print_iterations(false).build().unwrap();
    let serial = Fci::new(det.clone(), &mofile, &params)
        .unwrap()
        .compute(None)
        .unwrap();

    let comms = ThreadCommunicator::group(2).unwrap();
    let energies = thread::scope(|s| {
        let handles = comms
            .iter()
            .map(|comm| {
                let (det, mofile, params) = (det.clone(), &mofile, &params);
                s.spawn(move || {
                    Fci::new(det, mofile, params)
                        .unwrap()
                        .compute_distributed(comm.clone(), None)
                        .unwrap()
                        .energies[0]
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });
    for e in energies {
        assert_abs_diff_eq!(e, serial.energies[0], epsilon = 1e-9);
    }
}

#[test]
fn test_fci_params_validation() {
    assert!(FciParams::builder()
        .nstate(2)
        .weights(Some(vec![1.0]))
        .build()
        .is_err());
    assert!(FciParams::builder()
        .nstate(2)
        .weights(Some(vec![1.5, -0.5]))
        .build()
        .is_err());
    let params = FciParams::builder().nstate(4).build().unwrap();
    assert_eq!(params.state_weights(), vec![0.25; 4]);
}
