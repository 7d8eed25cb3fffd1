//! Orbital-rotation parameters over the closed, active and virtual blocks.

use anyhow::{self, ensure};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::civec::SubspaceVector;

/// The non-redundant orbital rotations of a CASSCF wavefunction, stored as three contiguous
/// blocks: virtual–closed, virtual–active and closed–active. Element `(x, y)` of a block is the
/// rotation between the higher orbital `x` and the lower orbital `y`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RotFile {
    nclosed: usize,
    nact: usize,
    nvirt: usize,
    data: Array1<f64>,
}

impl RotFile {
    /// Creates a zero rotation.
    pub fn zeros(nclosed: usize, nact: usize, nvirt: usize) -> Self {
        let size = nvirt * nclosed + nvirt * nact + nclosed * nact;
        Self {
            nclosed,
            nact,
            nvirt,
            data: Array1::zeros(size),
        }
    }

    /// The number of closed orbitals.
    pub fn nclosed(&self) -> usize {
        self.nclosed
    }

    /// The number of active orbitals.
    pub fn nact(&self) -> usize {
        self.nact
    }

    /// The number of virtual orbitals.
    pub fn nvirt(&self) -> usize {
        self.nvirt
    }

    /// The total number of orbitals.
    pub fn norb(&self) -> usize {
        self.nclosed + self.nact + self.nvirt
    }

    /// The flat parameter vector.
    pub fn data(&self) -> &Array1<f64> {
        &self.data
    }

    /// Mutable access to the flat parameter vector.
    pub fn data_mut(&mut self) -> &mut Array1<f64> {
        &mut self.data
    }

    fn vc_index(&self, a: usize, i: usize) -> usize {
        a + i * self.nvirt
    }

    fn va_index(&self, a: usize, r: usize) -> usize {
        self.nvirt * self.nclosed + a + r * self.nvirt
    }

    fn ca_index(&self, i: usize, r: usize) -> usize {
        self.nvirt * (self.nclosed + self.nact) + i + r * self.nclosed
    }

    /// Virtual `a`, closed `i`.
    pub fn ele_vc(&self, a: usize, i: usize) -> f64 {
        self.data[self.vc_index(a, i)]
    }

    pub fn ele_vc_mut(&mut self, a: usize, i: usize) -> &mut f64 {
        let idx = self.vc_index(a, i);
        &mut self.data[idx]
    }

    /// Virtual `a`, active `r`.
    pub fn ele_va(&self, a: usize, r: usize) -> f64 {
        self.data[self.va_index(a, r)]
    }

    pub fn ele_va_mut(&mut self, a: usize, r: usize) -> &mut f64 {
        let idx = self.va_index(a, r);
        &mut self.data[idx]
    }

    /// Closed `i`, active `r`.
    pub fn ele_ca(&self, i: usize, r: usize) -> f64 {
        self.data[self.ca_index(i, r)]
    }

    pub fn ele_ca_mut(&mut self, i: usize, r: usize) -> &mut f64 {
        let idx = self.ca_index(i, r);
        &mut self.data[idx]
    }

    /// Unpacks into the antisymmetric generator $`\mathbf{A}`$ over all orbitals, with
    /// $`A_{xy} = \kappa_{xy} = -A_{yx}`$ for the higher orbital `x`.
    pub fn unpack(&self) -> Array2<f64> {
        let (nclosed, nact, nvirt) = (self.nclosed, self.nact, self.nvirt);
        let nocc = nclosed + nact;
        let mut a = Array2::<f64>::zeros((self.norb(), self.norb()));
        for i in 0..nclosed {
            for v in 0..nvirt {
                a[(nocc + v, i)] = self.ele_vc(v, i);
            }
        }
        for r in 0..nact {
            for v in 0..nvirt {
                a[(nocc + v, nclosed + r)] = self.ele_va(v, r);
            }
            for i in 0..nclosed {
                a[(nclosed + r, i)] = self.ele_ca(i, r);
            }
        }
        &a - &a.t()
    }

    /// Packs the lower-triangular non-redundant blocks of `mat`.
    pub fn from_matrix(mat: &Array2<f64>, nclosed: usize, nact: usize) -> Result<Self, anyhow::Error> {
        ensure!(
            mat.is_square() && mat.nrows() >= nclosed + nact,
            "Matrix of shape {:?} cannot hold {nclosed} closed and {nact} active orbitals.",
            mat.dim()
        );
        let nocc = nclosed + nact;
        let nvirt = mat.nrows() - nocc;
        let mut out = Self::zeros(nclosed, nact, nvirt);
        for i in 0..nclosed {
            for v in 0..nvirt {
                *out.ele_vc_mut(v, i) = mat[(nocc + v, i)];
            }
        }
        for r in 0..nact {
            for v in 0..nvirt {
                *out.ele_va_mut(v, r) = mat[(nocc + v, nclosed + r)];
            }
            for i in 0..nclosed {
                *out.ele_ca_mut(i, r) = mat[(nclosed + r, i)];
            }
        }
        Ok(out)
    }

    /// Re-expresses the parameters after the active orbitals are rotated by `u`
    /// ($`\phi'_r = \sum_s \phi_s u_{sr}`$).
    pub fn rotate_active(&self, u: &Array2<f64>) -> Result<Self, anyhow::Error> {
        ensure!(
            u.dim() == (self.nact, self.nact),
            "Active rotation of shape {:?} does not match {} active orbitals.",
            u.dim(),
            self.nact
        );
        let mut out = self.clone();
        let (nclosed, nact, nvirt) = (self.nclosed, self.nact, self.nvirt);
        let va = Array2::from_shape_fn((nvirt, nact), |(a, r)| self.ele_va(a, r)).dot(u);
        let ca = Array2::from_shape_fn((nclosed, nact), |(i, r)| self.ele_ca(i, r)).dot(u);
        for r in 0..nact {
            for a in 0..nvirt {
                *out.ele_va_mut(a, r) = va[(a, r)];
            }
            for i in 0..nclosed {
                *out.ele_ca_mut(i, r) = ca[(i, r)];
            }
        }
        Ok(out)
    }

    /// The largest absolute parameter.
    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()))
    }

    /// Elementwise `self / other`, with zero wherever `other` vanishes.
    pub fn divide(&self, other: &RotFile) -> Result<Self, anyhow::Error> {
        self.check_same_shape(other)?;
        let mut out = self.clone();
        out.data
            .iter_mut()
            .zip(other.data.iter())
            .for_each(|(x, d)| *x = if *d == 0.0 { 0.0 } else { *x / d });
        Ok(out)
    }

    fn check_same_shape(&self, other: &RotFile) -> Result<(), anyhow::Error> {
        ensure!(
            (self.nclosed, self.nact, self.nvirt) == (other.nclosed, other.nact, other.nvirt),
            "Rotation parameters over different orbital partitions."
        );
        Ok(())
    }
}

impl SubspaceVector for RotFile {
    fn dot(&self, other: &Self) -> Result<f64, anyhow::Error> {
        self.check_same_shape(other)?;
        Ok(self.data.dot(&other.data))
    }

    fn ax_plus_y(&mut self, a: f64, x: &Self) -> Result<(), anyhow::Error> {
        self.check_same_shape(x)?;
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
