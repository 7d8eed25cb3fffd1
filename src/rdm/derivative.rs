//! Derivatives of transition densities with respect to the bra CI coefficients.
//!
//! Each tensor carries the determinant index `I = Iα * lenb + Iβ` on its leading axis, so that
//! contracting it with a bra vector reproduces the corresponding transition density.

use std::sync::Arc;

use anyhow::{self, format_err};
use ndarray::{Array2, Array3, Array5, ArrayD, Axis, IxDyn};

use crate::civec::Civec;
use crate::determinant::Determinants;
use crate::fci::sigma::excitation_intermediate;
use crate::rdm::holes::{apply_one_body, create_into, hole_set, spin_patterns, Spin};

/// $`\partial \gamma_{ij} / \partial c_I = \langle I | \hat{E}_{ij} | \mathrm{ket} \rangle`$,
/// indexed `[I, i, j]`.
pub fn rdm1_deriv(ket: &Civec) -> Result<Array3<f64>, anyhow::Error> {
    let n = ket.det().norb();
    let size = ket.det().size();
    excitation_intermediate(ket)
        .into_shape((n * n, size))
        .map_err(|err| format_err!(err))?
        .reversed_axes()
        .as_standard_layout()
        .into_owned()
        .into_shape((size, n, n))
        .map_err(|err| format_err!(err))
}

/// $`\partial \Gamma_{ijkl} / \partial c_I = \langle I | \hat{E}_{ij}\hat{E}_{kl} | \mathrm{ket}
/// \rangle - \delta_{jk} \langle I | \hat{E}_{il} | \mathrm{ket} \rangle`$, indexed
/// `[I, i, j, k, l]`.
pub fn rdm2_deriv(ket: &Civec) -> Result<Array5<f64>, anyhow::Error> {
    let det = ket.det().clone();
    let n = det.norb();
    let n2 = n * n;
    let size = det.size();
    let d = excitation_intermediate(ket);
    let mut out = Array2::<f64>::zeros((size, n2 * n2));
    for kl in 0..n2 {
        let dkl = Civec::from_array(det.clone(), d.index_axis(Axis(0), kl).to_owned())?;
        let ddkl = excitation_intermediate(&dkl)
            .into_shape((n2, size))
            .map_err(|err| format_err!(err))?;
        for ij in 0..n2 {
            out.column_mut(ij * n2 + kl).assign(&ddkl.row(ij));
        }
    }
    let mut out = out
        .into_shape((size, n, n, n, n))
        .map_err(|err| format_err!(err))?;
    let d = d
        .into_shape((n, n, size))
        .map_err(|err| format_err!(err))?;
    for i in 0..n {
        for j in 0..n {
            for l in 0..n {
                let dil = d.slice(ndarray::s![i, l, ..]);
                out.slice_mut(ndarray::s![.., i, j, j, l]).scaled_add(-1.0, &dil);
            }
        }
    }
    Ok(out)
}

/// Applies the creators for `orbitals` and `spins` (both in annihilation order) in reverse
/// order, nesting them around the annihilators that produced `v`.
fn recreate(
    v: &Civec,
    orbitals: &[usize],
    spins: &[Spin],
    spaces: &[Arc<Determinants>],
) -> Result<Civec, anyhow::Error> {
    let mut w = v.clone();
    for ((&p, &spin), space) in orbitals.iter().zip(spins).zip(spaces).rev() {
        w = create_into(&w, p, spin, space)?;
    }
    Ok(w)
}

/// Fock-contracted density derivative of order `k + 1`:
/// ```math
///     \sum_{pq} f_{pq} \langle I | \hat{a}^\dagger_{i_1} \cdots \hat{a}^\dagger_{i_k}
///         \hat{a}^\dagger_{p} \hat{a}_{q} \hat{a}_{j_k} \cdots \hat{a}_{j_1} | \mathrm{ket} \rangle,
/// ```
/// indexed `[I, i1, j1, ..., ik, jk]`.
fn fock_contracted_deriv(
    ket: &Civec,
    fock: &Array2<f64>,
    k: usize,
) -> Result<ArrayD<f64>, anyhow::Error> {
    let det = ket.det().clone();
    let n = det.norb();
    let size = det.size();
    let nk = n.pow(k as u32);
    let mut out = Array2::<f64>::zeros((size, nk * nk));
    for spins in spin_patterns(k) {
        let Some(holes) = hole_set(ket, &spins)? else {
            continue;
        };
        // Spaces reached after each creator, innermost first.
        let mut spaces = vec![det.clone()];
        let mut current = det.clone();
        for &spin in spins.iter().take(k - 1) {
            let next = match spin {
                Spin::Alpha => current.remove_alpha(),
                Spin::Beta => current.remove_beta(),
            }
            .ok_or_else(|| format_err!("Hole space exhausted."))??;
            current = Arc::new(next);
            spaces.push(current.clone());
        }
        for (jflat, v) in holes.vectors.iter().enumerate() {
            let fv = apply_one_body(v, fock)?;
            for iflat in 0..nk {
                let orbitals = (0..k)
                    .map(|m| (iflat / n.pow((k - 1 - m) as u32)) % n)
                    .collect::<Vec<_>>();
                let w = recreate(&fv, &orbitals, &spins, &spaces)?;
                out.column_mut(iflat * nk + jflat)
                    .iter_mut()
                    .zip(w.data().iter())
                    .for_each(|(o, x)| *o += x);
            }
        }
    }
    let mut shape = vec![size];
    shape.extend(vec![n; 2 * k]);
    let tensor = out
        .into_shape(IxDyn(&shape))
        .map_err(|err| format_err!(err))?;
    let mut axes = vec![0];
    axes.extend((0..k).flat_map(|m| [1 + m, 1 + m + k]));
    Ok(tensor
        .permuted_axes(IxDyn(&axes))
        .as_standard_layout()
        .into_owned())
}

/// Fock-contracted 3-particle density derivative
/// $`\sum_{mn} f_{mn} \partial \Gamma^{(3)}_{ijklmn} / \partial c_I`$, indexed `[I, i, j, k, l]`.
pub fn frdm3_deriv(ket: &Civec, fock: &Array2<f64>) -> Result<Array5<f64>, anyhow::Error> {
    fock_contracted_deriv(ket, fock, 2)?
        .into_dimensionality()
        .map_err(|err| format_err!(err))
}

/// Fock-contracted 4-particle density derivative
/// $`\sum_{op} f_{op} \partial \Gamma^{(4)}_{ijklmnop} / \partial c_I`$, indexed
/// `[I, i, j, k, l, m, n]`.
pub fn frdm4_deriv(ket: &Civec, fock: &Array2<f64>) -> Result<ArrayD<f64>, anyhow::Error> {
    fock_contracted_deriv(ket, fock, 3)
}
