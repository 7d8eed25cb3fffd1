//! Reduced density matrices of CI vectors and their CI-coefficient derivatives.
//!
//! All densities are spin-summed and real. The conventions are
//! ```math
//!     \gamma_{ij} = \langle \mathrm{bra} | \hat{E}_{ij} | \mathrm{ket} \rangle, \qquad
//!     \Gamma_{ijkl} = \sum_{\sigma\tau} \langle \mathrm{bra} |
//!         \hat{a}^\dagger_{i\sigma} \hat{a}^\dagger_{k\tau} \hat{a}_{l\tau} \hat{a}_{j\sigma}
//!         | \mathrm{ket} \rangle,
//! ```
//! so that $`E = \sum h_{ij}\gamma_{ij} + \frac{1}{2}\sum (ij|kl)\Gamma_{ijkl}`$.

use std::fmt;

use anyhow::{self, ensure, format_err};
use itertools::Itertools;
use ndarray::{Array1, Array2, Array4, Array6, ArrayD, Axis};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::auxiliary::linalg::{symmetric_eigh, transform4};
use crate::civec::Civec;
use crate::fci::sigma::excitation_intermediate;
use crate::io::format::write_title;

pub mod derivative;
pub mod holes;

pub use derivative::{frdm3_deriv, frdm4_deriv, rdm1_deriv, rdm2_deriv};
pub use holes::{frdm3, rdmk, Spin};

#[cfg(test)]
#[path = "rdm_tests.rs"]
mod rdm_tests;

// =========
// Functions
// =========

/// The transition 1-particle density $`\gamma_{ij} = \langle \mathrm{bra} | \hat{E}_{ij} |
/// \mathrm{ket} \rangle`$.
pub fn rdm1(bra: &Civec, ket: &Civec) -> Result<Array2<f64>, anyhow::Error> {
    Ok(rdm12(bra, ket)?.0)
}

/// The transition 1- and 2-particle densities, evaluated from the single-replacement
/// intermediates $`\hat{E}_{ji}|\mathrm{bra}\rangle`$ and $`\hat{E}_{kl}|\mathrm{ket}\rangle`$:
/// ```math
///     \Gamma_{ijkl} = \langle \hat{E}_{ji} \mathrm{bra} | \hat{E}_{kl} \mathrm{ket} \rangle
///         - \delta_{jk} \gamma_{il}.
/// ```
pub fn rdm12(bra: &Civec, ket: &Civec) -> Result<(Array2<f64>, Array4<f64>), anyhow::Error> {
    ensure!(
        bra.det().is_same_space(ket.det()),
        "Bra and ket belong to different determinant spaces."
    );
    let n = ket.det().norb();
    let n2 = n * n;
    let size = ket.det().size();
    let dket = excitation_intermediate(ket)
        .into_shape((n2, size))
        .map_err(|err| format_err!(err))?;
    let bra_flat = bra
        .data()
        .to_owned()
        .into_shape(size)
        .map_err(|err| format_err!(err))?;
    let rdm1 = dket
        .dot(&bra_flat)
        .into_shape((n, n))
        .map_err(|err| format_err!(err))?;

    let same = std::ptr::eq(bra, ket);
    let dbra = if same {
        dket.clone()
    } else {
        excitation_intermediate(bra)
            .into_shape((n2, size))
            .map_err(|err| format_err!(err))?
    };
    let overlap = dbra.dot(&dket.t());
    let mut rdm2 = Array4::from_shape_fn((n, n, n, n), |(i, j, k, l)| {
        overlap[(j * n + i, k * n + l)]
    });
    for i in 0..n {
        for j in 0..n {
            for l in 0..n {
                rdm2[(i, j, j, l)] -= rdm1[(i, l)];
            }
        }
    }
    Ok((rdm1, rdm2))
}

/// The transition 3-particle density
/// $`\Gamma_{ijklmn} = \sum \langle \hat{a}^\dagger_i \hat{a}^\dagger_k \hat{a}^\dagger_m
/// \hat{a}_n \hat{a}_l \hat{a}_j \rangle`$.
pub fn rdm3(bra: &Civec, ket: &Civec) -> Result<Array6<f64>, anyhow::Error> {
    rdmk(bra, ket, 3)?
        .into_dimensionality()
        .map_err(|err| format_err!(err))
}

/// The transition 4-particle density, indexed `[i, j, k, l, m, n, o, p]` with creators on the
/// first index of each pair.
pub fn rdm4(bra: &Civec, ket: &Civec) -> Result<ArrayD<f64>, anyhow::Error> {
    rdmk(bra, ket, 4)
}

// ==================
// Struct definitions
// ==================

/// One- and two-particle densities of one state or one state pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rdms {
    /// The 1-particle density $`\gamma_{ij}`$.
    pub rdm1: Array2<f64>,

    /// The 2-particle density $`\Gamma_{ijkl}`$.
    pub rdm2: Array4<f64>,
}

impl Rdms {
    /// Computes the densities between `bra` and `ket`.
    pub fn compute(bra: &Civec, ket: &Civec) -> Result<Self, anyhow::Error> {
        let (rdm1, rdm2) = rdm12(bra, ket)?;
        Ok(Self { rdm1, rdm2 })
    }

    /// Computes the state-specific densities of every vector in `civecs`.
    pub fn compute_states(civecs: &[Civec]) -> Result<Vec<Self>, anyhow::Error> {
        civecs.iter().map(|cc| Self::compute(cc, cc)).collect()
    }

    /// The number of orbitals.
    pub fn norb(&self) -> usize {
        self.rdm1.nrows()
    }

    /// The weighted sum $`\sum_i w_i \mathbf{D}_i`$. The weights are assumed to sum to one.
    ///
    /// # Errors
    ///
    /// Errors if the numbers of states and weights differ, or if the densities disagree in
    /// orbital count.
    pub fn averaged(states: &[Rdms], weights: &[f64]) -> Result<Self, anyhow::Error> {
        ensure!(
            !states.is_empty() && states.len() == weights.len(),
            "{} state densities but {} weights.",
            states.len(),
            weights.len()
        );
        let n = states[0].norb();
        ensure!(
            states.iter().all(|s| s.norb() == n),
            "State densities have inconsistent orbital counts."
        );
        let mut rdm1 = Array2::<f64>::zeros((n, n));
        let mut rdm2 = Array4::<f64>::zeros((n, n, n, n));
        for (state, &w) in states.iter().zip(weights.iter()) {
            rdm1.scaled_add(w, &state.rdm1);
            rdm2.scaled_add(w, &state.rdm2);
        }
        Ok(Self { rdm1, rdm2 })
    }

    /// Natural occupations in descending order together with the natural orbitals as columns.
    /// Each column is phased so that its largest component is positive.
    pub fn natural_orbitals(&self) -> Result<(Array1<f64>, Array2<f64>), anyhow::Error> {
        let (occ, vecs) = symmetric_eigh(&self.rdm1)?;
        let order = (0..occ.len())
            .sorted_by_key(|&i| (OrderedFloat(-occ[i]), i))
            .collect_vec();
        let occ = order.iter().map(|&i| occ[i]).collect::<Array1<f64>>();
        let mut u = vecs.select(Axis(1), &order);
        for mut col in u.columns_mut() {
            let lead = col
                .iter()
                .copied()
                .max_by_key(|v| OrderedFloat(v.abs()))
                .unwrap_or(1.0);
            if lead < 0.0 {
                col.mapv_inplace(|v| -v);
            }
        }
        Ok((occ, u))
    }

    /// Re-expresses the densities in the rotated orbital basis $`\mathbf{C}' = \mathbf{C}
    /// \mathbf{U}`$.
    pub fn transform(&self, u: &Array2<f64>) -> Result<Self, anyhow::Error> {
        ensure!(
            u.dim() == (self.norb(), self.norb()),
            "Rotation of shape {:?} does not match {} orbitals.",
            u.dim(),
            self.norb()
        );
        let rdm1 = u.t().dot(&self.rdm1).dot(u);
        let rdm2 = transform4(&self.rdm2, u.view(), u.view(), u.view(), u.view())?;
        Ok(Self { rdm1, rdm2 })
    }

    /// The trace of the 1-particle density, the electron count for state densities.
    pub fn nelectrons(&self) -> f64 {
        self.rdm1.diag().sum()
    }
}

impl fmt::Display for Rdms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_title(f, "One-particle density")?;
        writeln!(f)?;
        for row in self.rdm1.rows() {
            writeln!(f, "  {}", row.iter().map(|v| format!("{v:>+12.8}")).join(" "))?;
        }
        Ok(())
    }
}
