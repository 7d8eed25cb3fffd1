//! Fock-like matrices over all orbitals for a CASSCF reference.

use anyhow::{self, ensure};
use ndarray::{s, Array2, Array4};

use crate::auxiliary::linalg::{contract2, symmetric_eigh};
use crate::integrals::MOIntegrals;

/// The Fock-like matrices entering the orbital gradient, all in the current orbital basis.
#[derive(Clone, Debug)]
pub struct FockMatrices {
    /// Number of closed orbitals.
    pub nclosed: usize,

    /// Number of active orbitals.
    pub nact: usize,

    /// The closed-shell Fock matrix $`f^{\mathrm{c}}`$.
    pub cfock: Array2<f64>,

    /// The active Fock matrix
    /// $`f^{\mathrm{a}}_{pq} = \sum_{tu} \gamma_{tu}\left[(pq|tu) - \frac{1}{2}(pt|uq)\right]`$.
    pub afock: Array2<f64>,

    /// The total Fock matrix $`f = f^{\mathrm{c}} + f^{\mathrm{a}}`$.
    pub fock: Array2<f64>,

    /// The active columns of the generalised Fock matrix,
    /// $`f^{\mathrm{act}}_{pr} = \sum_t f^{\mathrm{c}}_{pt}\gamma_{rt} + Q_{pr}`$, of shape
    /// `(norb, nact)`.
    pub fact: Array2<f64>,
}

impl FockMatrices {
    /// Builds every Fock-like matrix from integrals over all orbitals and the active densities.
    pub fn compute(
        mo: &MOIntegrals,
        nclosed: usize,
        rdm1: &Array2<f64>,
        rdm2: &Array4<f64>,
    ) -> Result<Self, anyhow::Error> {
        let nact = rdm1.nrows();
        ensure!(
            nclosed + nact <= mo.norb(),
            "{nclosed} closed and {nact} active orbitals exceed the {} available.",
            mo.norb()
        );
        let cfock = mo.core_fock(nclosed);
        let afock = active_fock(mo, nclosed, rdm1)?;
        let fock = &cfock + &afock;
        let q = qvec(mo, nclosed, rdm2)?;
        let act = nclosed..nclosed + nact;
        let fact = cfock.slice(s![.., act]).dot(&rdm1.t()) + q;
        Ok(Self {
            nclosed,
            nact,
            cfock,
            afock,
            fock,
            fact,
        })
    }

    /// The number of orbitals.
    pub fn norb(&self) -> usize {
        self.fock.nrows()
    }

    /// The number of virtual orbitals.
    pub fn nvirt(&self) -> usize {
        self.norb() - self.nclosed - self.nact
    }
}

/// The active Fock matrix over all orbitals.
pub fn active_fock(
    mo: &MOIntegrals,
    nclosed: usize,
    rdm1: &Array2<f64>,
) -> Result<Array2<f64>, anyhow::Error> {
    let act = nclosed..nclosed + rdm1.nrows();
    let coulomb = contract2(
        "pqtu,tu->pq",
        &[&mo.two_body.slice(s![.., .., act.clone(), act.clone()]), rdm1],
    )?;
    let exchange = contract2(
        "ptuq,tu->pq",
        &[&mo.two_body.slice(s![.., act.clone(), act, ..]), rdm1],
    )?;
    Ok(coulomb - exchange * 0.5)
}

/// The two-electron part of the generalised Fock matrix,
/// $`Q_{pr} = \sum_{tuv} (pt|uv)\Gamma_{rtuv}`$, of shape `(norb, nact)`.
pub fn qvec(mo: &MOIntegrals, nclosed: usize, rdm2: &Array4<f64>) -> Result<Array2<f64>, anyhow::Error> {
    let act = nclosed..nclosed + rdm2.dim().0;
    contract2(
        "ptuv,rtuv->pr",
        &[
            &mo.two_body.slice(s![.., act.clone(), act.clone(), act]),
            rdm2,
        ],
    )
}

/// The rotation that diagonalises the closed–closed and virtual–virtual blocks of `fock`,
/// leaving the active block untouched. Eigenvalues within each block are ascending.
pub fn semicanonical_rotation(
    fock: &Array2<f64>,
    nclosed: usize,
    nact: usize,
) -> Result<Array2<f64>, anyhow::Error> {
    let norb = fock.nrows();
    let nocc = nclosed + nact;
    let mut u = Array2::<f64>::eye(norb);
    for range in [0..nclosed, nocc..norb] {
        if range.is_empty() {
            continue;
        }
        let block = fock.slice(s![range.clone(), range.clone()]).to_owned();
        let (_, vecs) = symmetric_eigh(&block)?;
        u.slice_mut(s![range.clone(), range]).assign(&vecs);
    }
    Ok(u)
}
