//! Molecular-orbital integrals supplied to the CI, CASSCF and CASPT2 machinery.
//!
//! Integral evaluation itself is external: an [`IntegralProvider`] transforms its own one- and
//! two-electron integrals into any orbital basis on request. Two in-memory providers are
//! available, [`DenseIntegrals`] and [`density_fitting::DensityFittedIntegrals`].

use std::fmt;

use anyhow::{self, ensure, format_err};
use ndarray::{s, Array2, Array4, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::auxiliary::linalg::transform4;

pub mod density_fitting;
pub mod mofile;

pub use density_fitting::{DenseDensityFitting, DensityFittedIntegrals, DensityFitting};
pub use mofile::MOFile;

#[cfg(test)]
pub(crate) mod test_models;


// =================
// Trait definitions
// =================

/// Trait for external collaborators supplying integrals in a molecular-orbital basis.
pub trait IntegralProvider: Send + Sync {
    /// The number of basis functions.
    fn nbasis(&self) -> usize;

    /// The constant energy contribution (*e.g.* nuclear repulsion).
    fn constant_energy(&self) -> f64;

    /// The one-electron integrals $`h_{pq}`$ in the orbital basis given by the columns of `coeff`.
    fn one_body(&self, coeff: ArrayView2<'_, f64>) -> Result<Array2<f64>, anyhow::Error>;

    /// The two-electron integrals $`(pq|rs)`$ in chemists' notation, where each index runs over
    /// the columns of the corresponding coefficient matrix.
    fn two_body(
        &self,
        c1: ArrayView2<'_, f64>,
        c2: ArrayView2<'_, f64>,
        c3: ArrayView2<'_, f64>,
        c4: ArrayView2<'_, f64>,
    ) -> Result<Array4<f64>, anyhow::Error>;

    /// All integrals over the orbitals given by the columns of `coeff`.
    fn mo_integrals(&self, coeff: ArrayView2<'_, f64>) -> Result<MOIntegrals, anyhow::Error> {
        ensure!(
            coeff.nrows() == self.nbasis(),
            "Coefficient matrix has {} rows but the basis has {} functions.",
            coeff.nrows(),
            self.nbasis()
        );
        Ok(MOIntegrals {
            constant_energy: self.constant_energy(),
            one_body: self.one_body(coeff)?,
            two_body: self.two_body(coeff, coeff, coeff, coeff)?,
        })
    }
}

// ==================
// Struct definitions
// ==================

/// One- and two-electron integrals over a set of molecular orbitals.
#[derive(Clone, Debug)]
pub struct MOIntegrals {
    /// The constant energy contribution.
    pub constant_energy: f64,

    /// The one-electron integrals $`h_{pq}`$.
    pub one_body: Array2<f64>,

    /// The two-electron integrals $`(pq|rs)`$.
    pub two_body: Array4<f64>,
}

impl MOIntegrals {
    /// The number of orbitals.
    pub fn norb(&self) -> usize {
        self.one_body.nrows()
    }

    /// The closed-shell Fock matrix
    /// ```math
    ///     f^{\mathrm{c}}_{pq} = h_{pq} + \sum_{i}^{\mathrm{closed}} \left[2(pq|ii) - (pi|iq)\right]
    /// ```
    /// over all orbitals, with the first `nclosed` orbitals doubly occupied.
    pub fn core_fock(&self, nclosed: usize) -> Array2<f64> {
        let n = self.norb();
        let mut fock = self.one_body.clone();
        for i in 0..nclosed {
            for p in 0..n {
                for q in 0..n {
                    fock[(p, q)] += 2.0 * self.two_body[(p, q, i, i)] - self.two_body[(p, i, i, q)];
                }
            }
        }
        fock
    }

    /// The energy of the doubly occupied closed orbitals plus the constant energy,
    /// $`E_{\mathrm{c}} = E_0 + \sum_i (h_{ii} + f^{\mathrm{c}}_{ii})`$.
    pub fn core_energy(&self, nclosed: usize, core_fock: &Array2<f64>) -> f64 {
        self.constant_energy
            + (0..nclosed)
                .map(|i| self.one_body[(i, i)] + core_fock[(i, i)])
                .sum::<f64>()
    }

    /// The two-electron integrals restricted to orbitals `start..end`.
    pub fn two_body_block(&self, start: usize, end: usize) -> Array4<f64> {
        self.two_body
            .slice(s![start..end, start..end, start..end, start..end])
            .to_owned()
    }
}

// ----------------
// Dense integrals
// ----------------

/// Integrals held in full over an orthonormal basis.
#[derive(Clone, Debug)]
pub struct DenseIntegrals {
    constant_energy: f64,
    one_body: Array2<f64>,
    two_body: Array4<f64>,
}

impl DenseIntegrals {
    /// Creates a dense integral provider.
    ///
    /// # Errors
    ///
    /// Errors if the array dimensions are inconsistent.
    pub fn new(
        constant_energy: f64,
        one_body: Array2<f64>,
        two_body: Array4<f64>,
    ) -> Result<Self, anyhow::Error> {
        let n = one_body.nrows();
        ensure!(one_body.is_square(), "One-electron integrals must be square.");
        ensure!(
            two_body.dim() == (n, n, n, n),
            "Two-electron integrals of shape {:?} do not match {n} basis functions.",
            two_body.dim()
        );
        Ok(Self {
            constant_energy,
            one_body,
            two_body,
        })
    }
}

impl IntegralProvider for DenseIntegrals {
    fn nbasis(&self) -> usize {
        self.one_body.nrows()
    }

    fn constant_energy(&self) -> f64 {
        self.constant_energy
    }

    fn one_body(&self, coeff: ArrayView2<'_, f64>) -> Result<Array2<f64>, anyhow::Error> {
        Ok(coeff.t().dot(&self.one_body).dot(&coeff))
    }

    fn two_body(
        &self,
        c1: ArrayView2<'_, f64>,
        c2: ArrayView2<'_, f64>,
        c3: ArrayView2<'_, f64>,
        c4: ArrayView2<'_, f64>,
    ) -> Result<Array4<f64>, anyhow::Error> {
        transform4(&self.two_body, c1, c2, c3, c4)
    }
}

// ------------------
// Model Hamiltonians
// ------------------

/// A model Hamiltonian specified in an orthonormal basis, as read from an input file.
///
/// Two-electron integrals are listed once per permutational class as `[p, q, r, s, value]` and
/// expanded with the eight-fold symmetry of real orbitals.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelHamiltonian {
    /// The constant energy contribution.
    #[serde(rename = "core_energy", default)]
    pub constant_energy: f64,

    /// The one-electron integrals as rows.
    pub one_body: Vec<Vec<f64>>,

    /// The unique two-electron integrals in chemists' notation.
    #[serde(default)]
    pub two_body: Vec<(usize, usize, usize, usize, f64)>,
}

impl ModelHamiltonian {
    /// The number of basis functions.
    pub fn nbasis(&self) -> usize {
        self.one_body.len()
    }

    /// Expands the model into a dense integral provider.
    pub fn to_dense(&self) -> Result<DenseIntegrals, anyhow::Error> {
        let n = self.nbasis();
        ensure!(
            self.one_body.iter().all(|row| row.len() == n),
            "One-electron integral rows must all have length {n}."
        );
        let h = Array2::from_shape_fn((n, n), |(p, q)| self.one_body[p][q]);
        ensure!(
            crate::auxiliary::linalg::matrix_rms(&(&h - &h.t())) < 1e-12,
            "One-electron integrals must be symmetric."
        );
        let mut eri = Array4::<f64>::zeros((n, n, n, n));
        for &(p, q, r, s, v) in self.two_body.iter() {
            ensure!(
                p < n && q < n && r < n && s < n,
                "Two-electron integral index ({p}, {q}, {r}, {s}) out of range for {n} functions."
            );
            for (a, b, c, d) in [
                (p, q, r, s),
                (q, p, r, s),
                (p, q, s, r),
                (q, p, s, r),
                (r, s, p, q),
                (s, r, p, q),
                (r, s, q, p),
                (s, r, q, p),
            ] {
                eri[(a, b, c, d)] = v;
            }
        }
        DenseIntegrals::new(self.constant_energy, h, eri)
    }
}

/// The source of integrals described in an input file. The variant is recognised from the
/// fields present.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HamiltonianSource {
    /// Integrals approximated by density fitting.
    DensityFitted(density_fitting::DensityFittedModel),

    /// Integrals given explicitly in an orthonormal basis.
    Model(ModelHamiltonian),
}

impl HamiltonianSource {
    /// Builds the integral provider.
    pub fn provider(&self) -> Result<Box<dyn IntegralProvider>, anyhow::Error> {
        match self {
            HamiltonianSource::Model(model) => Ok(Box::new(model.to_dense()?)),
            HamiltonianSource::DensityFitted(model) => Ok(Box::new(model.to_provider()?)),
        }
    }

    /// The number of basis functions.
    pub fn nbasis(&self) -> usize {
        match self {
            HamiltonianSource::Model(model) => model.nbasis(),
            HamiltonianSource::DensityFitted(model) => model.one_body.len(),
        }
    }
}

impl fmt::Display for HamiltonianSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HamiltonianSource::Model(model) => {
                writeln!(f, "Integral source: model Hamiltonian")?;
                writeln!(f, "Number of basis functions: {}", model.nbasis())?;
                writeln!(
                    f,
                    "Unique two-electron integrals: {}",
                    model.two_body.len()
                )?;
            }
            HamiltonianSource::DensityFitted(model) => {
                writeln!(f, "Integral source: density-fitted model")?;
                writeln!(f, "Number of basis functions: {}", model.one_body.len())?;
                writeln!(
                    f,
                    "Number of auxiliary functions: {}",
                    model.three_index.len()
                )?;
            }
        }
        Ok(())
    }
}

/// Checks that the columns of `coeff` are orthonormal to within `thresh`.
pub fn check_orthonormal(coeff: ArrayView2<'_, f64>, thresh: f64) -> Result<(), anyhow::Error> {
    let ovl = coeff.t().dot(&coeff);
    let eye = Array2::<f64>::eye(ovl.nrows());
    if ovl
        .iter()
        .zip(eye.iter())
        .all(|(s, i)| approx::abs_diff_eq!(*s, *i, epsilon = thresh))
    {
        Ok(())
    } else {
        let max = (&ovl - &eye).iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        Err(format_err!(
            "Orbital coefficients deviate from orthonormality by {max:.3e}."
        ))
    }
}
