use std::sync::Arc;

use approx::assert_abs_diff_eq;
use ndarray::{array, s, Array1, Array2};
use serial_test::serial;

use crate::auxiliary::linalg::exp_antisymmetric;
use crate::casscf::fock::semicanonical_rotation;
use crate::casscf::superci::{
    rotation_gradient, superci_denominators, superci_gradient, superci_normalisation,
    to_rotation_space,
};
use crate::casscf::{
    BfgsOptimizer, Casscf, CasscfParams, CasscfResult, FockMatrices, OptimizerKind,
    OrbitalOptimizer, RotFile, SuperCiOptimizer,
};
use crate::civec::SubspaceVector;
use crate::determinant::Determinants;
use crate::fci::{Fci, FciParams};
use crate::integrals::test_models::{molecule_like, two_orbital_ground_energy, two_orbital_model};
use crate::integrals::{DenseIntegrals, IntegralProvider, MOFile};
use crate::rdm::Rdms;

fn quiet_fci() -> FciParams {
    FciParams::builder()
        .print_iterations(false)
        .thresh(1e-10)
        .build()
        .unwrap()
}

fn casci_energy(dense: &DenseIntegrals, coeff: &Array2<f64>, nclosed: usize, nact: usize) -> f64 {
    let mo = dense.mo_integrals(coeff.view()).unwrap();
    let mofile = MOFile::new(&mo, nclosed, nact).unwrap();
    let det = Arc::new(Determinants::new(nact, 1, 1).unwrap());
    let fci_params = quiet_fci();
    Fci::new(det, &mofile, &fci_params)
        .unwrap()
        .compute(None)
        .unwrap()
        .energies[0]
}

/// Ground-state CASCI densities and Fock matrices for `molecule_like(5)` with one closed and two
/// active orbitals, optionally in the natural-orbital basis.
fn casci_fock(dense: &DenseIntegrals, natural: bool) -> (FockMatrices, Array1<f64>) {
    let mut coeff = Array2::<f64>::eye(5);
    let mo = dense.mo_integrals(coeff.view()).unwrap();
    let mofile = MOFile::new(&mo, 1, 2).unwrap();
    let det = Arc::new(Determinants::new(2, 1, 1).unwrap());
    let fci_params = quiet_fci();
    let roots = Fci::new(det, &mofile, &fci_params)
        .unwrap()
        .compute(None)
        .unwrap();
    let mut rdms = Rdms::compute(&roots.civecs[0], &roots.civecs[0]).unwrap();
    let (occ, u) = rdms.natural_orbitals().unwrap();
    if natural {
        let rotated = coeff.slice(s![.., 1..3]).dot(&u);
        coeff.slice_mut(s![.., 1..3]).assign(&rotated);
        rdms = rdms.transform(&u).unwrap();
    }
    let mo = dense.mo_integrals(coeff.view()).unwrap();
    let fock = FockMatrices::compute(&mo, 1, &rdms.rdm1, &rdms.rdm2).unwrap();
    (fock, occ)
}

fn run_casscf(dense: &DenseIntegrals, params: &CasscfParams) -> CasscfResult {
    let fci_params = quiet_fci();
    Casscf::new(dense, params, &fci_params)
        .unwrap()
        .compute(Array2::eye(dense.nbasis()))
        .unwrap()
}

#[test]
fn test_casscf_rotfile_unpack_is_antisymmetric_and_packs_back() {
    let mut rot = RotFile::zeros(2, 2, 3);
    rot.data_mut()
        .iter_mut()
        .enumerate()
        .for_each(|(i, v)| *v = 0.1 * (i as f64 + 1.0));
    let a = rot.unpack();
    assert_eq!(a.dim(), (7, 7));
    for ((i, j), v) in a.indexed_iter() {
        assert_abs_diff_eq!(*v, -a[(j, i)], epsilon = 1e-15);
    }
    assert_abs_diff_eq!(a[(4, 0)], rot.ele_vc(0, 0));
    assert_abs_diff_eq!(a[(6, 3)], rot.ele_va(2, 1));
    assert_abs_diff_eq!(a[(3, 1)], rot.ele_ca(1, 1));
    assert_abs_diff_eq!(a[(2, 3)], 0.0);
    assert_eq!(RotFile::from_matrix(&a, 2, 2).unwrap(), rot);
}

#[test]
fn test_casscf_rotfile_active_rotation_matches_generator_transform() {
    let mut rot = RotFile::zeros(1, 2, 2);
    rot.data_mut()
        .iter_mut()
        .enumerate()
        .for_each(|(i, v)| *v = (i as f64 - 3.0) * 0.07);
    let theta: f64 = 0.3;
    let u = array![[theta.cos(), -theta.sin()], [theta.sin(), theta.cos()]];
    let mut full = Array2::<f64>::eye(5);
    full.slice_mut(s![1..3, 1..3]).assign(&u);
    let transformed = full.t().dot(&rot.unpack()).dot(&full);
    let expected = RotFile::from_matrix(&transformed, 1, 2).unwrap();
    let rotated = rot.rotate_active(&u).unwrap();
    for (x, y) in rotated.data().iter().zip(expected.data().iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-14);
    }
    assert!(rot.rotate_active(&Array2::eye(3)).is_err());
}

#[test]
fn test_casscf_rotfile_divide_skips_zero_divisors() {
    let mut num = RotFile::zeros(1, 1, 1);
    num.data_mut().assign(&array![1.0, 2.0, 3.0]);
    let mut den = RotFile::zeros(1, 1, 1);
    den.data_mut().assign(&array![2.0, 0.0, -3.0]);
    assert_eq!(num.divide(&den).unwrap().data(), &array![0.5, 0.0, -1.0]);
    assert!(num.divide(&RotFile::zeros(1, 2, 1)).is_err());
}

#[test]
fn test_casscf_superci_gradient_respects_occupation_guard() {
    let dense = molecule_like(5, 3);
    let (fock, _) = casci_fock(&dense, false);
    let occ = array![2.0, 0.0];
    let sigma = superci_gradient(&fock, &occ, 1e-10);
    for a in 0..2 {
        assert_eq!(sigma.ele_va(a, 1), 0.0);
        assert_abs_diff_eq!(
            sigma.ele_va(a, 0),
            fock.fact[(3 + a, 0)] / 2.0_f64.sqrt(),
            epsilon = 1e-14
        );
    }
    assert_eq!(sigma.ele_ca(0, 0), 0.0);
    let norm = superci_normalisation(1, 2, &occ, 1e-10);
    let denom = superci_denominators(&fock, &occ);
    let (grad, hess) = to_rotation_space(&sigma, &denom, &norm, 1e-2);
    assert_eq!(grad.ele_va(0, 1), 0.0);
    assert_eq!(hess.ele_va(0, 1), 1.0);
    assert_eq!(hess.ele_ca(0, 0), 1.0);
}

#[test]
fn test_casscf_normalised_gradient_matches_rotation_gradient() {
    let dense = molecule_like(5, 3);
    let (fock, occ) = casci_fock(&dense, true);
    let sigma = superci_gradient(&fock, &occ, 1e-10);
    let norm = superci_normalisation(1, 2, &occ, 1e-10);
    let denom = superci_denominators(&fock, &occ);
    let (grad, hess) = to_rotation_space(&sigma, &denom, &norm, 1e-2);
    let expected = rotation_gradient(&fock);
    for (x, y) in grad.data().iter().zip(expected.data().iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
    }
    assert!(hess.data().iter().all(|h| *h > 0.0));
}

#[test]
fn test_casscf_rotation_gradient_matches_finite_difference() {
    let dense = molecule_like(5, 3);
    let (fock, _) = casci_fock(&dense, false);
    let grad = rotation_gradient(&fock);
    let h = 1e-4;
    for idx in 0..grad.size() {
        let energy_at = |x: f64| {
            let mut kappa = RotFile::zeros(1, 2, 2);
            kappa.data_mut()[idx] = x;
            let coeff = exp_antisymmetric(&kappa.unpack()).unwrap();
            casci_energy(&dense, &coeff, 1, 2)
        };
        let fd = (energy_at(h) - energy_at(-h)) / (2.0 * h);
        assert_abs_diff_eq!(fd, grad.data()[idx], epsilon = 1e-6);
    }
}

#[test]
fn test_casscf_semicanonical_rotation_diagonalises_inactive_blocks() {
    let dense = molecule_like(6, 8);
    let mo = dense.mo_integrals(Array2::<f64>::eye(6).view()).unwrap();
    let fock = mo.core_fock(2);
    let u = semicanonical_rotation(&fock, 2, 2).unwrap();
    let rotated = u.t().dot(&fock).dot(&u);
    assert_abs_diff_eq!(rotated[(0, 1)], 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(rotated[(4, 5)], 0.0, epsilon = 1e-12);
    assert!(rotated[(0, 0)] <= rotated[(1, 1)]);
    for ((i, j), v) in u.slice(s![2..4, 2..4]).indexed_iter() {
        assert_abs_diff_eq!(*v, if i == j { 1.0 } else { 0.0 });
    }
}

#[test]
fn test_casscf_superci_step_is_capped() {
    let mut grad = RotFile::zeros(1, 1, 1);
    grad.data_mut().assign(&array![2.0, -0.1, 0.0]);
    let mut hess = RotFile::zeros(1, 1, 1);
    hess.data_mut().fill(1.0);
    let mut optimizer = SuperCiOptimizer::new(0.5);
    let step = optimizer.step(&grad, &hess).unwrap();
    assert_abs_diff_eq!(step.data()[0], -0.5, epsilon = 1e-15);
    assert_abs_diff_eq!(step.data()[1], 0.025, epsilon = 1e-15);
    assert_eq!(optimizer.kind(), OptimizerKind::SuperCi);
}

#[test]
fn test_casscf_bfgs_minimises_a_quadratic() {
    let hmat = array![[2.0, 0.3, 0.1], [0.3, 1.0, -0.2], [0.1, -0.2, 1.5]];
    let b = array![1.0, -0.5, 0.25];
    let diag = hmat.diag().to_owned();
    let mut x = RotFile::zeros(1, 1, 1);
    let mut hess = RotFile::zeros(1, 1, 1);
    hess.data_mut().assign(&diag);
    let mut optimizer = BfgsOptimizer::new(10.0, 5);
    for _ in 0..30 {
        let mut grad = x.clone();
        grad.data_mut().assign(&(hmat.dot(x.data()) - &b));
        if grad.norm().unwrap() < 1e-10 {
            break;
        }
        let step = optimizer.step(&grad, &hess).unwrap();
        x.ax_plus_y(1.0, &step).unwrap();
    }
    let residual = hmat.dot(x.data()) - &b;
    assert!(residual.iter().all(|r| r.abs() < 1e-8));
    assert!(optimizer.history_len() > 0);

    let snapshot = optimizer.snapshot();
    let mut restored = BfgsOptimizer::new(10.0, 5);
    restored.restore(snapshot.clone()).unwrap();
    assert_eq!(restored.snapshot(), snapshot);
    assert!(SuperCiOptimizer::new(1.0).restore(snapshot).is_err());
}

#[test]
fn test_casscf_params_validation() {
    assert!(CasscfParams::builder()
        .nclosed(1)
        .nact(2)
        .nelea(3)
        .neleb(1)
        .build()
        .is_err());
    assert!(CasscfParams::builder()
        .nclosed(1)
        .nact(2)
        .nelea(1)
        .neleb(1)
        .max_step(0.0)
        .build()
        .is_err());
    let params = CasscfParams::builder()
        .nclosed(4)
        .nact(2)
        .nelea(1)
        .neleb(1)
        .build()
        .unwrap();
    let dense = molecule_like(5, 3);
    let fci_params = quiet_fci();
    assert!(Casscf::new(&dense, &params, &fci_params).is_err());
}

#[test]
fn test_casscf_two_electron_two_orbital_model() {
    let (e0, e1, u0, u1, j, k) = (-1.0, 0.5, 0.7, 0.6, 0.5, 0.1);
    let dense = two_orbital_model(e0, e1, u0, u1, j, k).to_dense().unwrap();
    let params = CasscfParams::builder()
        .nclosed(0)
        .nact(2)
        .nelea(1)
        .neleb(1)
        .build()
        .unwrap();
    let result = run_casscf(&dense, &params);
    assert!(result.converged);
    assert!(result.iterations <= 10);
    assert_abs_diff_eq!(
        result.energies[0],
        two_orbital_ground_energy(e0, e1, u0, u1, k),
        epsilon = 1e-8
    );
    assert_abs_diff_eq!(result.occupations.sum(), 2.0, epsilon = 1e-10);
}

#[test]
fn test_casscf_optimisers_agree_and_bracket_energies() {
    let dense = molecule_like(5, 3);
    let mut results = vec![];
    for optimizer in [OptimizerKind::SuperCi, OptimizerKind::Bfgs] {
        let params = CasscfParams::builder()
            .nclosed(1)
            .nact(2)
            .nelea(1)
            .neleb(1)
            .optimizer(optimizer)
            .max_iter(100)
            .thresh(1e-6)
            .build()
            .unwrap();
        let result = run_casscf(&dense, &params);
        assert!(result.converged, "{optimizer} did not converge");
        results.push(result);
    }
    assert_abs_diff_eq!(results[0].energies[0], results[1].energies[0], epsilon = 1e-8);

    let initial = casci_energy(&dense, &Array2::eye(5), 1, 2);
    let mo = dense.mo_integrals(Array2::<f64>::eye(5).view()).unwrap();
    let mofile = MOFile::new(&mo, 0, 5).unwrap();
    let det = Arc::new(Determinants::new(5, 2, 2).unwrap());
    let fci_params = quiet_fci();
    let fci = Fci::new(det, &mofile, &fci_params)
        .unwrap()
        .compute(None)
        .unwrap()
        .energies[0];
    let casscf = results[0].energies[0];
    assert!(fci <= casscf + 1e-10);
    assert!(casscf <= initial + 1e-10);

    // The returned densities reproduce the energy in the returned orbitals.
    let result = &results[0];
    let mo = dense.mo_integrals(result.coeff.view()).unwrap();
    let mofile = MOFile::new(&mo, 1, 2).unwrap();
    assert_abs_diff_eq!(
        mofile.energy(&result.rdms.rdm1, &result.rdms.rdm2),
        result.averaged_energy(),
        epsilon = 1e-9
    );
    for r in 0..2 {
        for t in 0..r {
            assert_abs_diff_eq!(result.rdms.rdm1[(r, t)], 0.0, epsilon = 1e-8);
        }
    }
}

#[test]
#[serial]
fn test_casscf_checkpoint_restart_is_seamless() {
    let dense = molecule_like(5, 3);
    let stem = std::env::temp_dir()
        .join("casmr_casscf_restart_test")
        .to_string_lossy()
        .to_string();
    let builder = || {
        let mut builder = CasscfParams::builder();
        builder
            .nclosed(1)
            .nact(2)
            .nelea(1)
            .neleb(1)
            .optimizer(OptimizerKind::Bfgs)
            .thresh(1e-14);
        builder
    };

    let straight = run_casscf(&dense, &builder().max_iter(6).build().unwrap());

    let first = run_casscf(
        &dense,
        &builder()
            .max_iter(3)
            .checkpoint(Some(stem.clone()))
            .build()
            .unwrap(),
    );
    assert!(!first.converged);
    let chk = crate::casscf::read_checkpoint(&stem).unwrap();
    assert_eq!(chk.iteration, 3);
    assert!(!chk.optimizer.history.is_empty() || chk.optimizer.previous.is_some());

    let resumed = run_casscf(
        &dense,
        &builder()
            .max_iter(6)
            .restart(Some(stem.clone()))
            .build()
            .unwrap(),
    );
    assert_eq!(resumed.iterations, straight.iterations);
    assert_abs_diff_eq!(resumed.energies[0], straight.energies[0], epsilon = 1e-10);
    for (x, y) in resumed.coeff.iter().zip(straight.coeff.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-8);
    }
    let _ = std::fs::remove_file(crate::io::CasmrFileType::Chk.path(&stem));
}
