//! The active-space Hamiltonian seen by the CI solvers.

use anyhow::{self, ensure};
use ndarray::{s, Array2, Array4};

use crate::integrals::MOIntegrals;

/// Active-space integrals with the closed orbitals folded into a constant and an effective
/// one-electron operator.
#[derive(Clone, Debug)]
pub struct MOFile {
    /// Number of closed orbitals folded into the core.
    nclosed: usize,

    /// Core energy $`E_0 + \sum_i (h_{ii} + f^{\mathrm{c}}_{ii})`$.
    core_energy: f64,

    /// Active block of the core Fock matrix.
    h1: Array2<f64>,

    /// The compressed one-electron operator
    /// $`h'_{kl} = f^{\mathrm{c}}_{kl} - \frac{1}{2}\sum_j (kj|jl)`$ over active orbitals.
    h1_compressed: Array2<f64>,

    /// Active two-electron integrals $`(xy|zw)`$.
    eri: Array4<f64>,
}

impl MOFile {
    /// Builds the active-space Hamiltonian from integrals over all orbitals, ordered closed,
    /// active, virtual.
    pub fn new(mo: &MOIntegrals, nclosed: usize, nact: usize) -> Result<Self, anyhow::Error> {
        ensure!(
            nclosed + nact <= mo.norb(),
            "{nclosed} closed and {nact} active orbitals exceed the {} available.",
            mo.norb()
        );
        let cfock = mo.core_fock(nclosed);
        let core_energy = mo.core_energy(nclosed, &cfock);
        let act = nclosed..nclosed + nact;
        let h1 = cfock.slice(s![act.clone(), act.clone()]).to_owned();
        let eri = mo.two_body_block(act.start, act.end);
        Ok(Self::from_parts(nclosed, core_energy, h1, eri))
    }

    /// Builds the active-space Hamiltonian directly from its parts.
    pub fn from_parts(nclosed: usize, core_energy: f64, h1: Array2<f64>, eri: Array4<f64>) -> Self {
        let n = h1.nrows();
        let h1_compressed = Array2::from_shape_fn((n, n), |(k, l)| {
            h1[(k, l)] - 0.5 * (0..n).map(|j| eri[(k, j, j, l)]).sum::<f64>()
        });
        Self {
            nclosed,
            core_energy,
            h1,
            h1_compressed,
            eri,
        }
    }

    /// The number of active orbitals.
    pub fn nact(&self) -> usize {
        self.h1.nrows()
    }

    /// The number of closed orbitals folded into the core.
    pub fn nclosed(&self) -> usize {
        self.nclosed
    }

    /// The core energy.
    pub fn core_energy(&self) -> f64 {
        self.core_energy
    }

    /// The active one-electron operator including the closed-shell mean field.
    pub fn h1(&self) -> &Array2<f64> {
        &self.h1
    }

    /// The compressed one-electron operator used by the sigma build.
    pub fn h1_compressed(&self) -> &Array2<f64> {
        &self.h1_compressed
    }

    /// The active two-electron integrals.
    pub fn eri(&self) -> &Array4<f64> {
        &self.eri
    }

    /// Evaluates $`E = E_{\mathrm{core}} + \sum_{xy} h_{xy}\gamma_{xy}
    /// + \frac{1}{2}\sum_{xyzw} (xy|zw)\Gamma_{xyzw}`$ for given active-space densities.
    pub fn energy(&self, rdm1: &Array2<f64>, rdm2: &Array4<f64>) -> f64 {
        let one = (&self.h1 * rdm1).sum();
        let two = (&self.eri * rdm2).sum();
        self.core_energy + one + 0.5 * two
    }
}
