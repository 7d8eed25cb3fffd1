//! Configuration-interaction coefficient vectors.

use std::fmt;
use std::sync::Arc;

use anyhow::{self, ensure, format_err};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut2, Zip};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::determinant::Determinants;

mod dist_civec;

pub use dist_civec::DistCivec;

#[cfg(test)]
#[path = "civec_tests.rs"]
mod civec_tests;

// =================
// Trait definitions
// =================

/// Trait for vectors that can span the iterative subspaces of the Davidson and linear
/// subspace solvers.
pub trait SubspaceVector: Clone {
    /// Computes the dot product with `other`. Distributed vectors reduce over all ranks.
    fn dot(&self, other: &Self) -> Result<f64, anyhow::Error>;

    /// Performs `self += a * x`.
    fn ax_plus_y(&mut self, a: f64, x: &Self) -> Result<(), anyhow::Error>;

    /// Multiplies every element by `a`.
    fn scale(&mut self, a: f64);

    /// Sets every element to zero.
    fn zero(&mut self);

    /// The total number of elements.
    fn size(&self) -> usize;

    /// The Euclidean norm.
    fn norm(&self) -> Result<f64, anyhow::Error> {
        Ok(self.dot(self)?.sqrt())
    }

    /// The root-mean-square of the elements.
    fn rms(&self) -> Result<f64, anyhow::Error> {
        let n = self.size().max(1) as f64;
        Ok((self.dot(self)? / n).sqrt())
    }
}

// ==================
// Struct definitions
// ==================

/// A dense CI vector over the `(alpha rank, beta rank)` pairs of one determinant space.
#[derive(Clone, Debug)]
pub struct Civec {
    /// The determinant space.
    det: Arc<Determinants>,

    /// The coefficients with alpha strings along rows and beta strings along columns.
    data: Array2<f64>,
}

impl Civec {
    /// Creates a zero vector.
    pub fn zeros(det: Arc<Determinants>) -> Self {
        let data = Array2::zeros((det.lena(), det.lenb()));
        Self { det, data }
    }

    /// Wraps an existing coefficient array.
    pub fn from_array(det: Arc<Determinants>, data: Array2<f64>) -> Result<Self, anyhow::Error> {
        ensure!(
            data.dim() == (det.lena(), det.lenb()),
            "Coefficient array of shape {:?} does not match the determinant space ({}, {}).",
            data.dim(),
            det.lena(),
            det.lenb()
        );
        Ok(Self { det, data })
    }

    /// The determinant space.
    pub fn det(&self) -> &Arc<Determinants> {
        &self.det
    }

    /// The coefficients.
    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Mutable access to the coefficients.
    pub fn data_mut(&mut self) -> ArrayViewMut2<'_, f64> {
        self.data.view_mut()
    }

    /// Consumes the vector, returning its coefficients.
    pub fn into_array(self) -> Array2<f64> {
        self.data
    }

    /// The coefficients of the beta strings paired with alpha string `ia`.
    pub fn row(&self, ia: usize) -> ArrayView1<'_, f64> {
        self.data.row(ia)
    }

    /// Normalises the vector in place, returning the norm before normalisation.
    pub fn normalize(&mut self) -> Result<f64, anyhow::Error> {
        let norm = self.norm()?;
        ensure!(norm > 0.0, "Cannot normalise a zero CI vector.");
        self.scale(1.0 / norm);
        Ok(norm)
    }

    /// Projects out the components along each of `others`, which are assumed orthonormal.
    pub fn project_out(&mut self, others: &[Civec]) -> Result<(), anyhow::Error> {
        for other in others {
            let overlap = other.dot(self)?;
            self.ax_plus_y(-overlap, other)?;
        }
        Ok(())
    }

    /// Returns the vector with the roles of alpha and beta strings exchanged. Requires equal
    /// numbers of alpha and beta electrons.
    pub fn spin_flip(&self) -> Result<Civec, anyhow::Error> {
        ensure!(
            self.det.nelea() == self.det.neleb(),
            "Spin flip requires equal numbers of alpha and beta electrons."
        );
        Ok(Self {
            det: self.det.clone(),
            data: self.data.t().to_owned(),
        })
    }

    /// Re-expresses the vector in the space with `nclosed` doubly occupied orbitals prepended.
    pub fn embed(&self, nclosed: usize) -> Result<Civec, anyhow::Error> {
        let det = Arc::new(self.det.embed(nclosed)?);
        let closed = (1u64 << nclosed) - 1;
        let map_a = self
            .det
            .alpha()
            .strings()
            .iter()
            .map(|&s| det.alpha().rank((s << nclosed) | closed))
            .collect_vec();
        let map_b = self
            .det
            .beta()
            .strings()
            .iter()
            .map(|&s| det.beta().rank((s << nclosed) | closed))
            .collect_vec();
        let mut out = Civec::zeros(det);
        for (ia, &ja) in map_a.iter().enumerate() {
            for (ib, &jb) in map_b.iter().enumerate() {
                out.data[(ja, jb)] = self.data[(ia, ib)];
            }
        }
        Ok(out)
    }

    /// The determinants with the largest absolute coefficients above `thresh`, as
    /// `(label, coefficient)` pairs in descending order of magnitude.
    pub fn leading_determinants(&self, thresh: f64) -> Vec<(String, f64)> {
        self.data
            .indexed_iter()
            .filter(|(_, c)| c.abs() > thresh)
            .sorted_by_key(|(_, c)| OrderedFloat(-c.abs()))
            .map(|((ia, ib), c)| (self.det.occupation_label(ia, ib), *c))
            .collect()
    }

    fn check_same_space(&self, other: &Civec) -> Result<(), anyhow::Error> {
        ensure!(
            self.det.is_same_space(&other.det),
            "CI vectors belong to different determinant spaces."
        );
        Ok(())
    }
}

impl SubspaceVector for Civec {
    fn dot(&self, other: &Self) -> Result<f64, anyhow::Error> {
        self.check_same_space(other)?;
        Ok(Zip::from(&self.data)
            .and(&other.data)
            .fold(0.0, |acc, a, b| acc + a * b))
    }

    fn ax_plus_y(&mut self, a: f64, x: &Self) -> Result<(), anyhow::Error> {
        self.check_same_space(x)?;
        self.data.scaled_add(a, &x.data);
        Ok(())
    }

    fn scale(&mut self, a: f64) {
        self.data.mapv_inplace(|v| v * a);
    }

    fn zero(&mut self) {
        self.data.fill(0.0);
    }

    fn size(&self) -> usize {
        self.data.len()
    }
}

impl SubspaceVector for Array1<f64> {
    fn dot(&self, other: &Self) -> Result<f64, anyhow::Error> {
        ensure!(
            self.len() == other.len(),
            "Vector lengths {} and {} differ.",
            self.len(),
            other.len()
        );
        Ok(ndarray::linalg::Dot::dot(self, other))
    }

    fn ax_plus_y(&mut self, a: f64, x: &Self) -> Result<(), anyhow::Error> {
        ensure!(
            self.len() == x.len(),
            "Vector lengths {} and {} differ.",
            self.len(),
            x.len()
        );
        self.scaled_add(a, x);
        Ok(())
    }

    fn scale(&mut self, a: f64) {
        self.mapv_inplace(|v| v * a);
    }

    fn zero(&mut self) {
        self.fill(0.0);
    }

    fn size(&self) -> usize {
        self.len()
    }
}

impl fmt::Display for Civec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, c) in self.leading_determinants(0.05) {
            writeln!(f, "  {label:>width$} {c:>+14.8}", width = self.det.norb())?;
        }
        Ok(())
    }
}

// ----------------
// Serialised state
// ----------------

/// Plain-data snapshot of a [`Civec`] for checkpoint files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CivecData {
    /// The number of orbitals.
    pub norb: usize,

    /// The number of alpha electrons.
    pub nelea: usize,

    /// The number of beta electrons.
    pub neleb: usize,

    /// The coefficients.
    pub data: Array2<f64>,
}

impl From<&Civec> for CivecData {
    fn from(cc: &Civec) -> Self {
        Self {
            norb: cc.det.norb(),
            nelea: cc.det.nelea(),
            neleb: cc.det.neleb(),
            data: cc.data.clone(),
        }
    }
}

impl CivecData {
    /// Restores the CI vector in the given determinant space.
    pub fn restore(&self, det: Arc<Determinants>) -> Result<Civec, anyhow::Error> {
        ensure!(
            det.norb() == self.norb && det.nelea() == self.nelea && det.neleb() == self.neleb,
            "Checkpointed CI vector does not match the requested determinant space."
        );
        Civec::from_array(det, self.data.clone())
            .map_err(|err| format_err!("Corrupted checkpointed CI vector: {err}"))
    }
}
