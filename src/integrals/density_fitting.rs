//! Density-fitted two-electron integrals.
//!
//! With three-index integrals $`(P|pq)`$ and the auxiliary metric $`J_{PQ} = (P|Q)`$,
//! ```math
//!     (pq|rs) \approx \sum_{PQ} (pq|P) [\mathbf{J}^{-1}]_{PQ} (Q|rs)
//!         = \sum_R B^R_{pq} B^R_{rs},
//!     \qquad B^R_{pq} = \sum_P [\mathbf{J}^{-1/2}]_{RP} (P|pq).
//! ```
//! Transformations proceed as half transform, second transform, application of
//! $`\mathbf{J}^{-1/2}`$, then assembly of four-index integrals.

use anyhow::{self, ensure};
use ndarray::{Array2, Array3, Array4, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::auxiliary::linalg::{contract4, symmetric_eigh};
use crate::integrals::IntegralProvider;

/// Auxiliary metric eigenvalues below this are discarded when forming $`\mathbf{J}^{-1/2}`$.
const METRIC_EIGENVALUE_THRESHOLD: f64 = 1.0e-10;

// =================
// Trait definitions
// =================

/// Trait for sources of three-index integrals $`(P|pq)`$ over an auxiliary basis.
pub trait DensityFitting: Send + Sync {
    /// The number of auxiliary functions.
    fn naux(&self) -> usize;

    /// The number of basis functions.
    fn nbasis(&self) -> usize;

    /// Transforms the first orbital index, giving $`(P|iq) = \sum_p C_{pi} (P|pq)`$.
    fn half_transform(&self, c1: ArrayView2<'_, f64>) -> Result<DFHalf, anyhow::Error>;

    /// The inverse square root of the auxiliary metric.
    fn metric_inverse_sqrt(&self) -> Result<Array2<f64>, anyhow::Error>;
}

// ==================
// Struct definitions
// ==================

/// Half-transformed three-index integrals $`(P|iq)`$, stored as `[P, i, q]`.
#[derive(Clone, Debug)]
pub struct DFHalf {
    data: Array3<f64>,
}

impl DFHalf {
    /// Transforms the second orbital index, giving $`(P|ij)`$.
    pub fn transform_second(&self, c2: ArrayView2<'_, f64>) -> Result<DFFull, anyhow::Error> {
        ensure!(
            c2.nrows() == self.data.len_of(Axis(2)),
            "Second coefficient matrix has {} rows, expected {}.",
            c2.nrows(),
            self.data.len_of(Axis(2))
        );
        let (naux, ni, _) = self.data.dim();
        let mut data = Array3::<f64>::zeros((naux, ni, c2.ncols()));
        data.outer_iter_mut()
            .zip(self.data.outer_iter())
            .for_each(|(mut out, half)| out.assign(&half.dot(&c2)));
        Ok(DFFull { data })
    }
}

/// Fully transformed three-index integrals $`(P|ij)`$, stored as `[P, i, j]`.
#[derive(Clone, Debug)]
pub struct DFFull {
    data: Array3<f64>,
}

impl DFFull {
    /// The underlying `[P, i, j]` array.
    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    /// Contracts the auxiliary index with a square matrix, $`B^R_{ij} = \sum_P M_{RP} (P|ij)`$.
    pub fn apply_j(&self, jmat: &Array2<f64>) -> Result<DFFull, anyhow::Error> {
        let (naux, ni, nj) = self.data.dim();
        ensure!(
            jmat.dim() == (naux, naux),
            "Metric of shape {:?} does not match {naux} auxiliary functions.",
            jmat.dim()
        );
        let flat = self
            .data
            .view()
            .into_shape((naux, ni * nj))
            .map_err(|err| anyhow::format_err!(err))?;
        let data = jmat
            .dot(&flat)
            .into_shape((naux, ni, nj))
            .map_err(|err| anyhow::format_err!(err))?;
        Ok(DFFull { data })
    }

    /// Assembles $`(ij|kl) = \sum_R B^R_{ij} B^R_{kl}`$ with `other` supplying the $`kl`$ pair.
    pub fn form_4index(&self, other: &DFFull) -> Result<Array4<f64>, anyhow::Error> {
        ensure!(
            self.data.len_of(Axis(0)) == other.data.len_of(Axis(0)),
            "Auxiliary dimensions differ in four-index assembly."
        );
        contract4("Pij,Pkl->ijkl", &[&self.data, &other.data])
    }
}

// ----------------------------
// In-memory three-index source
// ----------------------------

/// Three-index integrals and the auxiliary metric held in memory.
#[derive(Clone, Debug)]
pub struct DenseDensityFitting {
    three_index: Array3<f64>,
    metric: Array2<f64>,
}

impl DenseDensityFitting {
    /// Creates an in-memory density-fitting source from $`(P|pq)`$ as `[P, p, q]` and
    /// $`(P|Q)`$.
    pub fn new(three_index: Array3<f64>, metric: Array2<f64>) -> Result<Self, anyhow::Error> {
        let (naux, n1, n2) = three_index.dim();
        ensure!(n1 == n2, "Three-index integrals must be square in the orbital indices.");
        ensure!(
            metric.dim() == (naux, naux),
            "Auxiliary metric of shape {:?} does not match {naux} auxiliary functions.",
            metric.dim()
        );
        Ok(Self {
            three_index,
            metric,
        })
    }
}

impl DensityFitting for DenseDensityFitting {
    fn naux(&self) -> usize {
        self.three_index.len_of(Axis(0))
    }

    fn nbasis(&self) -> usize {
        self.three_index.len_of(Axis(1))
    }

    fn half_transform(&self, c1: ArrayView2<'_, f64>) -> Result<DFHalf, anyhow::Error> {
        ensure!(
            c1.nrows() == self.nbasis(),
            "First coefficient matrix has {} rows, expected {}.",
            c1.nrows(),
            self.nbasis()
        );
        let (naux, _, nq) = self.three_index.dim();
        let mut data = Array3::<f64>::zeros((naux, c1.ncols(), nq));
        data.outer_iter_mut()
            .zip(self.three_index.outer_iter())
            .for_each(|(mut out, pq)| out.assign(&c1.t().dot(&pq)));
        Ok(DFHalf { data })
    }

    fn metric_inverse_sqrt(&self) -> Result<Array2<f64>, anyhow::Error> {
        let (vals, vecs) = symmetric_eigh(&self.metric)?;
        let scale = vals.mapv(|v| {
            if v > METRIC_EIGENVALUE_THRESHOLD {
                1.0 / v.sqrt()
            } else {
                0.0
            }
        });
        Ok((&vecs * &scale.insert_axis(Axis(0))).dot(&vecs.t()))
    }
}

// ------------------------------
// Integral provider from fitting
// ------------------------------

/// An integral provider whose two-electron integrals come from a [`DensityFitting`] source.
pub struct DensityFittedIntegrals<D: DensityFitting> {
    constant_energy: f64,
    one_body: Array2<f64>,
    df: D,
    jinvhalf: Array2<f64>,
}

impl<D: DensityFitting> DensityFittedIntegrals<D> {
    /// Wraps a density-fitting source with the one-electron integrals of the same basis.
    pub fn new(constant_energy: f64, one_body: Array2<f64>, df: D) -> Result<Self, anyhow::Error> {
        ensure!(
            one_body.dim() == (df.nbasis(), df.nbasis()),
            "One-electron integrals of shape {:?} do not match {} basis functions.",
            one_body.dim(),
            df.nbasis()
        );
        let jinvhalf = df.metric_inverse_sqrt()?;
        Ok(Self {
            constant_energy,
            one_body,
            df,
            jinvhalf,
        })
    }

    /// Fitted three-index integrals $`B^R_{ij}`$ between two orbital sets.
    pub fn fitted(
        &self,
        c1: ArrayView2<'_, f64>,
        c2: ArrayView2<'_, f64>,
    ) -> Result<DFFull, anyhow::Error> {
        self.df
            .half_transform(c1)?
            .transform_second(c2)?
            .apply_j(&self.jinvhalf)
    }
}

impl<D: DensityFitting> IntegralProvider for DensityFittedIntegrals<D> {
    fn nbasis(&self) -> usize {
        self.df.nbasis()
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
        let left = self.fitted(c1, c2)?;
        let right = self.fitted(c3, c4)?;
        left.form_4index(&right)
    }
}

/// A density-fitted model Hamiltonian as read from an input file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DensityFittedModel {
    /// The constant energy contribution.
    #[serde(rename = "core_energy", default)]
    pub constant_energy: f64,

    /// The one-electron integrals as rows.
    pub one_body: Vec<Vec<f64>>,

    /// The three-index integrals $`(P|pq)`$, one matrix per auxiliary function.
    pub three_index: Vec<Vec<Vec<f64>>>,

    /// The auxiliary metric $`(P|Q)`$.
    pub metric: Vec<Vec<f64>>,
}

impl DensityFittedModel {
    /// Builds the integral provider.
    pub fn to_provider(
        &self,
    ) -> Result<DensityFittedIntegrals<DenseDensityFitting>, anyhow::Error> {
        let n = self.one_body.len();
        let naux = self.three_index.len();
        ensure!(
            self.one_body.iter().all(|row| row.len() == n),
            "One-electron integral rows must all have length {n}."
        );
        ensure!(
            self.three_index
                .iter()
                .all(|mat| mat.len() == n && mat.iter().all(|row| row.len() == n)),
            "Every three-index matrix must be {n} x {n}."
        );
        ensure!(
            self.metric.len() == naux && self.metric.iter().all(|row| row.len() == naux),
            "The auxiliary metric must be {naux} x {naux}."
        );
        let h = Array2::from_shape_fn((n, n), |(p, q)| self.one_body[p][q]);
        let b = Array3::from_shape_fn((naux, n, n), |(x, p, q)| self.three_index[x][p][q]);
        let j = Array2::from_shape_fn((naux, naux), |(x, y)| self.metric[x][y]);
        DensityFittedIntegrals::new(self.constant_energy, h, DenseDensityFitting::new(b, j)?)
    }
}
