//! Higher-order densities evaluated through hole vectors.
//!
//! With $`|h^{\mathrm{ket}}_{j_1 \dots j_k}\rangle = \hat{a}_{j_k} \cdots \hat{a}_{j_1} |\mathrm{ket}\rangle`$
//! and the analogous bra holes,
//! ```math
//!     \Gamma^{(k)}_{i_1 j_1 \dots i_k j_k}
//!         = \sum_{\sigma_1 \dots \sigma_k}
//!         \langle h^{\mathrm{bra}}_{i_1 \dots i_k} | h^{\mathrm{ket}}_{j_1 \dots j_k} \rangle
//!         = \sum \langle \hat{a}^\dagger_{i_1} \cdots \hat{a}^\dagger_{i_k}
//!             \hat{a}_{j_k} \cdots \hat{a}_{j_1} \rangle.
//! ```
//! Annihilators and creators are always applied in nested pairs of equal spin, so the sign from
//! moving a beta operator past the alpha string cancels and is omitted.

use std::sync::Arc;

use anyhow::{self, ensure, format_err};
use itertools::Itertools;
use ndarray::{Array2, ArrayD, IxDyn};

use crate::civec::Civec;
use crate::determinant::string_space::{annihilate, create};
use crate::determinant::Determinants;
use crate::fci::sigma::excitation_intermediate;

/// The spin of a single creation or annihilation operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Spin {
    Alpha,
    Beta,
}

/// Applies $`\hat{a}_{p\sigma}`$ to `cc`, or returns `None` if no electron of that spin is left.
pub fn annihilate_vector(cc: &Civec, p: usize, spin: Spin) -> Result<Option<Civec>, anyhow::Error> {
    let det = cc.det();
    let target = match spin {
        Spin::Alpha => det.remove_alpha(),
        Spin::Beta => det.remove_beta(),
    };
    let Some(target) = target else {
        return Ok(None);
    };
    let target = Arc::new(target?);
    Ok(Some(annihilate_into(cc, p, spin, &target)))
}

fn annihilate_into(cc: &Civec, p: usize, spin: Spin, target: &Arc<Determinants>) -> Civec {
    let det = cc.det();
    let mut out = Civec::zeros(target.clone());
    match spin {
        Spin::Alpha => {
            for (ia, &s) in det.alpha().strings().iter().enumerate() {
                if let Some((t, sign)) = annihilate(s, p) {
                    let it = target.alpha().rank(t);
                    out.data_mut().row_mut(it).scaled_add(sign, &cc.row(ia));
                }
            }
        }
        Spin::Beta => {
            for (ib, &s) in det.beta().strings().iter().enumerate() {
                if let Some((t, sign)) = annihilate(s, p) {
                    let it = target.beta().rank(t);
                    out.data_mut()
                        .column_mut(it)
                        .scaled_add(sign, &cc.data().column(ib));
                }
            }
        }
    }
    out
}

/// Applies $`\hat{a}^\dagger_{p\sigma}`$ to `cc`, landing in `target`.
pub(crate) fn create_into(
    cc: &Civec,
    p: usize,
    spin: Spin,
    target: &Arc<Determinants>,
) -> Result<Civec, anyhow::Error> {
    let det = cc.det();
    let (da, db) = match spin {
        Spin::Alpha => (1, 0),
        Spin::Beta => (0, 1),
    };
    ensure!(
        target.nelea() == det.nelea() + da && target.neleb() == det.neleb() + db,
        "Creation target space does not have one more electron of the requested spin."
    );
    let mut out = Civec::zeros(target.clone());
    match spin {
        Spin::Alpha => {
            for (ia, &s) in det.alpha().strings().iter().enumerate() {
                if let Some((t, sign)) = create(s, p) {
                    let it = target.alpha().rank(t);
                    out.data_mut().row_mut(it).scaled_add(sign, &cc.row(ia));
                }
            }
        }
        Spin::Beta => {
            for (ib, &s) in det.beta().strings().iter().enumerate() {
                if let Some((t, sign)) = create(s, p) {
                    let it = target.beta().rank(t);
                    out.data_mut()
                        .column_mut(it)
                        .scaled_add(sign, &cc.data().column(ib));
                }
            }
        }
    }
    Ok(out)
}

/// Applies the spin-summed one-body operator $`\hat{F} = \sum_{pq} f_{pq}\hat{E}_{pq}`$.
pub fn apply_one_body(cc: &Civec, fock: &Array2<f64>) -> Result<Civec, anyhow::Error> {
    let n = cc.det().norb();
    ensure!(
        fock.dim() == (n, n),
        "One-body operator of shape {:?} does not match {n} orbitals.",
        fock.dim()
    );
    let d = excitation_intermediate(cc);
    let (lena, lenb) = (cc.det().lena(), cc.det().lenb());
    let dflat = d
        .into_shape((n * n, lena * lenb))
        .map_err(|err| format_err!(err))?;
    let f = fock
        .as_standard_layout()
        .into_owned()
        .into_shape(n * n)
        .map_err(|err| format_err!(err))?;
    let out = f
        .dot(&dflat)
        .into_shape((lena, lenb))
        .map_err(|err| format_err!(err))?;
    Civec::from_array(cc.det().clone(), out)
}

/// Hole vectors for one spin pattern, one row per orbital tuple in application order.
#[derive(Clone, Debug)]
pub(crate) struct HoleSet {
    /// Flattened vectors, row `((p1 * n + p2) * n + ...)` holding `a_pk ... a_p1 |c>`.
    pub vectors: Vec<Civec>,
}

/// Builds the hole vectors of `cc` for the spin pattern `spins`, applied left to right, or
/// `None` if the pattern removes more electrons of one spin than are present.
pub(crate) fn hole_set(cc: &Civec, spins: &[Spin]) -> Result<Option<HoleSet>, anyhow::Error> {
    let n = cc.det().norb();
    let mut det = cc.det().clone();
    let mut vectors = vec![cc.clone()];
    for &spin in spins {
        let target = match spin {
            Spin::Alpha => det.remove_alpha(),
            Spin::Beta => det.remove_beta(),
        };
        let Some(target) = target else {
            return Ok(None);
        };
        let target = Arc::new(target?);
        vectors = vectors
            .iter()
            .flat_map(|v| (0..n).map(|p| annihilate_into(v, p, spin, &target)).collect_vec())
            .collect();
        det = target;
    }
    Ok(Some(HoleSet { vectors }))
}

/// Stacks hole vectors as rows of a matrix.
pub(crate) fn stack(vectors: &[Civec]) -> Array2<f64> {
    let size = vectors.first().map(|v| v.det().size()).unwrap_or(0);
    let mut out = Array2::<f64>::zeros((vectors.len(), size));
    for (mut row, v) in out.rows_mut().into_iter().zip(vectors.iter()) {
        row.iter_mut()
            .zip(v.data().iter())
            .for_each(|(r, c)| *r = *c);
    }
    out
}

/// All spin patterns of length `k`.
pub(crate) fn spin_patterns(k: usize) -> Vec<Vec<Spin>> {
    (0..k)
        .map(|_| [Spin::Alpha, Spin::Beta])
        .multi_cartesian_product()
        .collect()
}

/// Reorders a `(n^k, n^k)` matrix indexed `[(i1..ik), (j1..jk)]` into the rank-`2k` tensor
/// indexed `[i1, j1, i2, j2, ...]`.
pub(crate) fn interleave(mat: Array2<f64>, n: usize, k: usize) -> Result<ArrayD<f64>, anyhow::Error> {
    let shape = vec![n; 2 * k];
    let tensor = mat
        .into_shape(IxDyn(&shape))
        .map_err(|err| format_err!(err))?;
    let axes = (0..k).flat_map(|m| [m, m + k]).collect_vec();
    Ok(tensor
        .permuted_axes(IxDyn(&axes))
        .as_standard_layout()
        .into_owned())
}

/// The spin-summed transition $`k`$-particle density
/// $`\Gamma^{(k)}_{i_1 j_1 \dots i_k j_k} = \sum \langle \mathrm{bra} | \hat{a}^\dagger_{i_1}
/// \cdots \hat{a}^\dagger_{i_k} \hat{a}_{j_k} \cdots \hat{a}_{j_1} | \mathrm{ket} \rangle`$.
pub fn rdmk(bra: &Civec, ket: &Civec, k: usize) -> Result<ArrayD<f64>, anyhow::Error> {
    ensure!(
        bra.det().is_same_space(ket.det()),
        "Bra and ket belong to different determinant spaces."
    );
    ensure!(k > 0, "Density order must be positive.");
    let n = bra.det().norb();
    let nk = n.pow(k as u32);
    let mut mat = Array2::<f64>::zeros((nk, nk));
    for spins in spin_patterns(k) {
        let (Some(hb), Some(hk)) = (hole_set(bra, &spins)?, hole_set(ket, &spins)?) else {
            continue;
        };
        mat += &stack(&hb.vectors).dot(&stack(&hk.vectors).t());
    }
    interleave(mat, n, k)
}

/// The Fock-contracted transition 3-particle density
/// ```math
///     F^{(3)}_{ijkl} = \sum_{mn} f_{mn} \Gamma^{(3)}_{ijklmn}
///         = \sum \langle \hat{a}_k \hat{a}_i \mathrm{bra} | \hat{F} |
///             \hat{a}_l \hat{a}_j \mathrm{ket} \rangle.
/// ```
pub fn frdm3(bra: &Civec, ket: &Civec, fock: &Array2<f64>) -> Result<ndarray::Array4<f64>, anyhow::Error> {
    ensure!(
        bra.det().is_same_space(ket.det()),
        "Bra and ket belong to different determinant spaces."
    );
    let n = bra.det().norb();
    let mut mat = Array2::<f64>::zeros((n * n, n * n));
    for spins in spin_patterns(2) {
        let (Some(hb), Some(hk)) = (hole_set(bra, &spins)?, hole_set(ket, &spins)?) else {
            continue;
        };
        let fk = hk
            .vectors
            .iter()
            .map(|v| apply_one_body(v, fock))
            .collect::<Result<Vec<_>, _>>()?;
        mat += &stack(&hb.vectors).dot(&stack(&fk).t());
    }
    interleave(mat, n, 2)?
        .into_dimensionality::<ndarray::Ix4>()
        .map_err(|err| format_err!(err))
}

/// Applies $`\hat{a}_{p\sigma}`$ for every orbital `p` to each of `vectors`, which share one
/// determinant space. Entry `p * vectors.len() + i` holds $`\hat{a}_{p\sigma}|v_i\rangle`$, and
/// `None` is returned if no electron of that spin is left.
pub(crate) fn annihilate_each(vectors: &[Civec], spin: Spin) -> Result<Option<Vec<Civec>>, anyhow::Error> {
    let Some(first) = vectors.first() else {
        return Ok(Some(vec![]));
    };
    let det = first.det();
    ensure!(
        vectors.iter().all(|v| v.det().is_same_space(det)),
        "Vectors to annihilate from belong to different determinant spaces."
    );
    let target = match spin {
        Spin::Alpha => det.remove_alpha(),
        Spin::Beta => det.remove_beta(),
    };
    let Some(target) = target else {
        return Ok(None);
    };
    let target = Arc::new(target?);
    let mut out = Vec::with_capacity(det.norb() * vectors.len());
    for p in 0..det.norb() {
        out.extend(vectors.iter().map(|v| annihilate_into(v, p, spin, &target)));
    }
    Ok(Some(out))
}

/// Every spin-summed replacement $`\hat{E}_{kl}|\mathbf{c}\rangle`$ as a separate vector, entry
/// `k * n + l`.
pub(crate) fn replacements(cc: &Civec) -> Result<Vec<Civec>, anyhow::Error> {
    excitation_intermediate(cc)
        .outer_iter()
        .map(|d| Civec::from_array(cc.det().clone(), d.to_owned()))
        .collect()
}
