//! Small model Hamiltonians and vectors shared by the unit tests.

use std::sync::Arc;

use ndarray::{Array2, Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::civec::Civec;
use crate::determinant::Determinants;
use crate::integrals::{DenseIntegrals, IntegralProvider, MOFile, ModelHamiltonian};

/// Two orbitals with $`h = \mathrm{diag}(\epsilon_0, \epsilon_1)`$, on-site repulsions
/// `u0`/`u1`, Coulomb coupling `j` and exchange coupling `k`.
pub(crate) fn two_orbital_model(e0: f64, e1: f64, u0: f64, u1: f64, j: f64, k: f64) -> ModelHamiltonian {
    ModelHamiltonian {
        constant_energy: 0.0,
        one_body: vec![vec![e0, 0.0], vec![0.0, e1]],
        two_body: vec![
            (0, 0, 0, 0, u0),
            (1, 1, 1, 1, u1),
            (0, 0, 1, 1, j),
            (0, 1, 0, 1, k),
        ],
    }
}

/// The exact singlet ground-state energy of [`two_orbital_model`] with one electron of each
/// spin, valid when the closed-shell configurations lie lowest.
pub(crate) fn two_orbital_ground_energy(e0: f64, e1: f64, u0: f64, u1: f64, k: f64) -> f64 {
    let a = 2.0 * e0 + u0;
    let b = 2.0 * e1 + u1;
    0.5 * (a + b) - ((0.5 * (a - b)).powi(2) + k * k).sqrt()
}

/// Random symmetric three-index factors $`B^P_{pq}`$, seeded.
pub(crate) fn random_factors(naux: usize, n: usize, scale: f64, seed: u64) -> Array3<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut b = Array3::<f64>::zeros((naux, n, n));
    for x in 0..naux {
        for p in 0..n {
            for q in 0..=p {
                let v = scale * rng.gen_range(-1.0..1.0);
                b[(x, p, q)] = v;
                b[(x, q, p)] = v;
            }
        }
    }
    b
}

/// A molecule-like dense Hamiltonian: increasing orbital energies, weak one-electron couplings
/// and a positive semidefinite two-electron tensor built from [`random_factors`] plus a
/// diagonal Coulomb part.
pub(crate) fn molecule_like(n: usize, seed: u64) -> DenseIntegrals {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(17));
    let mut h = Array2::<f64>::zeros((n, n));
    for p in 0..n {
        h[(p, p)] = -2.0 + 0.6 * p as f64;
        for q in 0..p {
            let v = 0.05 * rng.gen_range(-1.0..1.0);
            h[(p, q)] = v;
            h[(q, p)] = v;
        }
    }
    let naux = 2 * n;
    let mut b = random_factors(naux, n, 0.15, seed);
    for p in 0..n {
        b[(naux - 1, p, p)] += 0.6;
    }
    let mut eri = Array4::<f64>::zeros((n, n, n, n));
    for x in 0..naux {
        for ((p, q, r, s), v) in eri.indexed_iter_mut() {
            *v += b[(x, p, q)] * b[(x, r, s)];
        }
    }
    DenseIntegrals::new(0.0, h, eri).unwrap()
}

/// The active-space Hamiltonian of [`molecule_like`] with every orbital active.
pub(crate) fn molecule_like_mofile(n: usize, seed: u64) -> MOFile {
    let dense = molecule_like(n, seed);
    let mo = dense.mo_integrals(Array2::<f64>::eye(n).view()).unwrap();
    MOFile::new(&mo, 0, n).unwrap()
}

/// A normalised CI vector with seeded random coefficients.
pub(crate) fn random_civec(det: &Arc<Determinants>, seed: u64) -> Civec {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = Array2::from_shape_fn((det.lena(), det.lenb()), |_| rng.gen_range(-1.0..1.0));
    let mut cc = Civec::from_array(det.clone(), data).unwrap();
    cc.normalize().unwrap();
    cc
}
