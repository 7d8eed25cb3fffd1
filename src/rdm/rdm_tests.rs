use std::sync::Arc;

use approx::assert_abs_diff_eq;
use ndarray::{Array, Array1, Array2, Axis, Ix6, RemoveAxis};

use crate::civec::Civec;
use crate::determinant::Determinants;
use crate::fci::{Fci, FciParams};
use crate::integrals::test_models::{molecule_like_mofile, random_civec};
use crate::rdm::{
    frdm3, frdm3_deriv, frdm4_deriv, rdm12, rdm1_deriv, rdm2_deriv, rdm3, rdm4, rdmk, Rdms,
};

fn flat(cc: &Civec) -> Array1<f64> {
    cc.data().iter().copied().collect()
}

fn contract_bra<D: RemoveAxis>(t: &Array<f64, D>, bra: &Array1<f64>) -> Array<f64, D::Smaller> {
    let mut acc = Array::zeros(t.raw_dim().remove_axis(Axis(0)));
    for (d, c) in t.axis_iter(Axis(0)).zip(bra.iter()) {
        acc.scaled_add(*c, &d);
    }
    acc
}

fn assert_close(a: impl IntoIterator<Item = f64>, b: impl IntoIterator<Item = f64>, eps: f64) {
    for (x, y) in a.into_iter().zip(b) {
        assert_abs_diff_eq!(x, y, epsilon = eps);
    }
}

#[test]
fn test_rdm_trace_and_partial_trace() {
    let det = Arc::new(Determinants::new(4, 2, 1).unwrap());
    let cc = random_civec(&det, 3);
    let (rdm1, rdm2) = rdm12(&cc, &cc).unwrap();
    assert_abs_diff_eq!(rdm1.diag().sum(), 3.0, epsilon = 1e-12);
    for i in 0..4 {
        for j in 0..4 {
            let partial = (0..4).map(|k| rdm2[(i, j, k, k)]).sum::<f64>();
            assert_abs_diff_eq!(partial, 2.0 * rdm1[(i, j)], epsilon = 1e-12);
        }
    }
}

#[test]
fn test_rdm_state_densities_are_symmetric() {
    let det = Arc::new(Determinants::new(4, 2, 2).unwrap());
    let cc = random_civec(&det, 11);
    let (rdm1, rdm2) = rdm12(&cc, &cc).unwrap();
    assert_close(rdm1.iter().copied(), rdm1.t().iter().copied(), 1e-13);
    for ((i, j, k, l), v) in rdm2.indexed_iter() {
        assert_abs_diff_eq!(*v, rdm2[(k, l, i, j)], epsilon = 1e-12);
        assert_abs_diff_eq!(*v, rdm2[(j, i, l, k)], epsilon = 1e-12);
    }
}

#[test]
fn test_rdm_transition_densities_swap_under_adjoint() {
    let det = Arc::new(Determinants::new(4, 2, 2).unwrap());
    let bra = random_civec(&det, 1);
    let ket = random_civec(&det, 2);
    let (g_bk, d_bk) = rdm12(&bra, &ket).unwrap();
    let (g_kb, d_kb) = rdm12(&ket, &bra).unwrap();
    assert_close(g_bk.iter().copied(), g_kb.t().iter().copied(), 1e-12);
    for ((i, j, k, l), v) in d_bk.indexed_iter() {
        assert_abs_diff_eq!(*v, d_kb[(j, i, l, k)], epsilon = 1e-12);
    }
}

#[test]
fn test_rdm_excitation_lists_agree_with_hole_vectors() {
    let det = Arc::new(Determinants::new(4, 3, 2).unwrap());
    let bra = random_civec(&det, 5);
    let ket = random_civec(&det, 6);
    let (rdm1, rdm2) = rdm12(&bra, &ket).unwrap();
    let h1 = rdmk(&bra, &ket, 1).unwrap();
    let h2 = rdmk(&bra, &ket, 2).unwrap();
    assert_close(rdm1.iter().copied(), h1.iter().copied(), 1e-12);
    assert_close(rdm2.iter().copied(), h2.iter().copied(), 1e-12);
}

#[test]
fn test_rdm3_and_rdm4_partial_traces() {
    let det = Arc::new(Determinants::new(4, 2, 2).unwrap());
    let bra = random_civec(&det, 8);
    let ket = random_civec(&det, 9);
    let (_, rdm2) = rdm12(&bra, &ket).unwrap();
    let rdm3 = rdm3(&bra, &ket).unwrap();
    for ((i, j, k, l), v) in rdm2.indexed_iter() {
        let partial = (0..4).map(|m| rdm3[[i, j, k, l, m, m]]).sum::<f64>();
        assert_abs_diff_eq!(partial, 2.0 * v, epsilon = 1e-12);
    }
    let rdm4 = rdm4(&bra, &ket).unwrap();
    for (idx, v) in rdm3.indexed_iter() {
        let (i, j, k, l, m, n) = idx;
        let partial = (0..4)
            .map(|o| rdm4[[i, j, k, l, m, n, o, o].as_slice()])
            .sum::<f64>();
        assert_abs_diff_eq!(partial, *v, epsilon = 1e-12);
    }
}

#[test]
fn test_rdm_energy_reproduces_fci_energy() {
    let mofile = molecule_like_mofile(4, 31);
    let det = Arc::new(Determinants::new(4, 2, 2).unwrap());
    let params = FciParams::builder().print_iterations(false).build().unwrap();
    let result = Fci::new(det, &mofile, &params)
        .unwrap()
        .compute(None)
        .unwrap();
    let rdms = Rdms::compute(&result.civecs[0], &result.civecs[0]).unwrap();
    assert_abs_diff_eq!(rdms.nelectrons(), 4.0, epsilon = 1e-12);
    assert_abs_diff_eq!(
        mofile.energy(&rdms.rdm1, &rdms.rdm2),
        result.energies[0],
        epsilon = 1e-9
    );
}

#[test]
fn test_rdm_fock_contracted_three_particle_density() {
    let mofile = molecule_like_mofile(4, 4);
    let fock = mofile.h1().clone();
    let det = Arc::new(Determinants::new(4, 2, 1).unwrap());
    let bra = random_civec(&det, 12);
    let ket = random_civec(&det, 13);
    let rdm3 = rdm3(&bra, &ket).unwrap();
    let f3 = frdm3(&bra, &ket, &fock).unwrap();
    for ((i, j, k, l), v) in f3.indexed_iter() {
        let reference = (0..4)
            .flat_map(|m| (0..4).map(move |n| (m, n)))
            .map(|(m, n)| fock[(m, n)] * rdm3[[i, j, k, l, m, n]])
            .sum::<f64>();
        assert_abs_diff_eq!(*v, reference, epsilon = 1e-12);
    }
}

#[test]
fn test_rdm_derivatives_contract_to_densities() {
    let mofile = molecule_like_mofile(4, 7);
    let fock = mofile.h1().clone();
    let det = Arc::new(Determinants::new(4, 2, 2).unwrap());
    let bra = random_civec(&det, 21);
    let ket = random_civec(&det, 22);
    let cbra = flat(&bra);
    let (rdm1, rdm2) = rdm12(&bra, &ket).unwrap();

    let d1 = rdm1_deriv(&ket).unwrap();
    let c1 = contract_bra(&d1, &cbra);
    assert_close(c1.iter().copied(), rdm1.iter().copied(), 1e-12);

    let d2 = rdm2_deriv(&ket).unwrap();
    let c2 = contract_bra(&d2, &cbra);
    assert_close(c2.iter().copied(), rdm2.iter().copied(), 1e-12);

    let df3 = frdm3_deriv(&ket, &fock).unwrap();
    let f3 = frdm3(&bra, &ket, &fock).unwrap();
    let c3 = contract_bra(&df3, &cbra);
    assert_close(c3.iter().copied(), f3.iter().copied(), 1e-12);

    let df4 = frdm4_deriv(&ket, &fock).unwrap();
    let rdm4 = rdm4(&bra, &ket).unwrap();
    let c4 = contract_bra(&df4, &cbra)
        .into_dimensionality::<Ix6>()
        .unwrap();
    for ((i, j, k, l, m, n), v) in c4.indexed_iter() {
        let reference = (0..4)
            .flat_map(|o| (0..4).map(move |p| (o, p)))
            .map(|(o, p)| fock[(o, p)] * rdm4[[i, j, k, l, m, n, o, p].as_slice()])
            .sum::<f64>();
        assert_abs_diff_eq!(*v, reference, epsilon = 1e-11);
    }
}

#[test]
fn test_rdm_state_average_is_linear() {
    let det = Arc::new(Determinants::new(4, 2, 2).unwrap());
    let civecs = (0..3).map(|s| random_civec(&det, 40 + s)).collect::<Vec<_>>();
    let states = Rdms::compute_states(&civecs).unwrap();
    let weights = [0.5, 0.3, 0.2];
    let sa = Rdms::averaged(&states, &weights).unwrap();
    for ((i, j), v) in sa.rdm1.indexed_iter() {
        let reference = (0..3)
            .map(|s| weights[s] * states[s].rdm1[(i, j)])
            .sum::<f64>();
        assert_abs_diff_eq!(*v, reference, epsilon = 1e-14);
    }
    for ((i, j, k, l), v) in sa.rdm2.indexed_iter() {
        let reference = (0..3)
            .map(|s| weights[s] * states[s].rdm2[(i, j, k, l)])
            .sum::<f64>();
        assert_abs_diff_eq!(*v, reference, epsilon = 1e-14);
    }
    assert!(Rdms::averaged(&states, &[0.5, 0.5]).is_err());
}

#[test]
fn test_rdm_natural_orbitals_diagonalise_density() {
    let det = Arc::new(Determinants::new(4, 2, 2).unwrap());
    let rdms = Rdms::compute_states(&[random_civec(&det, 77)])
        .unwrap()
        .remove(0);
    let (occ, u) = rdms.natural_orbitals().unwrap();
    assert_abs_diff_eq!(occ.sum(), 4.0, epsilon = 1e-12);
    assert!(occ.windows(2).into_iter().all(|w| w[0] >= w[1]));
    let utu = u.t().dot(&u);
    assert_close(utu.iter().copied(), Array2::<f64>::eye(4).iter().copied(), 1e-12);

    let rotated = rdms.transform(&u).unwrap();
    for ((i, j), v) in rotated.rdm1.indexed_iter() {
        let expected = if i == j { occ[i] } else { 0.0 };
        assert_abs_diff_eq!(*v, expected, epsilon = 1e-12);
    }
    assert_abs_diff_eq!(
        (0..4)
            .map(|i| (0..4).map(|k| rotated.rdm2[(i, i, k, k)]).sum::<f64>())
            .sum::<f64>(),
        12.0,
        epsilon = 1e-10
    );
}
