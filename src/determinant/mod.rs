//! Slater-determinant spaces built from alpha and beta occupation strings.

use std::fmt;
use std::sync::Arc;

use anyhow::{self, ensure};
use serde::{Deserialize, Serialize};

pub mod string_space;

pub use string_space::{Excitation, StringSpace};


// ==================
// Struct definitions
// ==================

/// A determinant space defined by a number of orbitals and fixed numbers of alpha and beta
/// electrons.
///
/// Determinants are addressed by the pair `(alpha rank, beta rank)`. The second-quantised
/// ordering convention is
/// ```math
///     |I_\alpha I_\beta\rangle = \hat{A}^\dagger(I_\alpha) \hat{B}^\dagger(I_\beta) |\mathrm{vac}\rangle,
/// ```
/// with creators inside each string applied in ascending orbital order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Determinants {
    /// The number of orbitals.
    norb: usize,

    /// The alpha string space.
    alpha: Arc<StringSpace>,

    /// The beta string space.
    beta: Arc<StringSpace>,
}

impl Determinants {
    /// Constructs the determinant space for `norb` orbitals, `nelea` alpha electrons and `neleb`
    /// beta electrons.
    ///
    /// # Errors
    ///
    /// Errors if either electron count exceeds the orbital count or if more than 64 orbitals are
    /// requested.
    pub fn new(norb: usize, nelea: usize, neleb: usize) -> Result<Self, anyhow::Error> {
        ensure!(
            nelea <= norb && neleb <= norb,
            "Inconsistent determinant space: {nelea} alpha and {neleb} beta electrons in {norb} orbitals."
        );
        let alpha = Arc::new(StringSpace::new(norb, nelea)?);
        let beta = if nelea == neleb {
            alpha.clone()
        } else {
            Arc::new(StringSpace::new(norb, neleb)?)
        };
        Ok(Self { norb, alpha, beta })
    }

    /// The number of orbitals.
    pub fn norb(&self) -> usize {
        self.norb
    }

    /// The number of alpha electrons.
    pub fn nelea(&self) -> usize {
        self.alpha.nele()
    }

    /// The number of beta electrons.
    pub fn neleb(&self) -> usize {
        self.beta.nele()
    }

    /// The number of alpha strings.
    pub fn lena(&self) -> usize {
        self.alpha.len()
    }

    /// The number of beta strings.
    pub fn lenb(&self) -> usize {
        self.beta.len()
    }

    /// The total number of determinants.
    pub fn size(&self) -> usize {
        self.lena() * self.lenb()
    }

    /// The alpha string space.
    pub fn alpha(&self) -> &StringSpace {
        &self.alpha
    }

    /// The beta string space.
    pub fn beta(&self) -> &StringSpace {
        &self.beta
    }

    /// Returns `true` if `other` describes the same space.
    pub fn is_same_space(&self, other: &Determinants) -> bool {
        self.norb == other.norb
            && self.nelea() == other.nelea()
            && self.neleb() == other.neleb()
    }

    /// The space obtained by removing one alpha electron, or `None` if there is none to remove.
    pub fn remove_alpha(&self) -> Option<Result<Determinants, anyhow::Error>> {
        (self.nelea() > 0).then(|| Determinants::new(self.norb, self.nelea() - 1, self.neleb()))
    }

    /// The space obtained by removing one beta electron, or `None` if there is none to remove.
    pub fn remove_beta(&self) -> Option<Result<Determinants, anyhow::Error>> {
        (self.neleb() > 0).then(|| Determinants::new(self.norb, self.nelea(), self.neleb() - 1))
    }

    /// The space with `nclosed` doubly occupied orbitals prepended below the current orbitals.
    pub fn embed(&self, nclosed: usize) -> Result<Determinants, anyhow::Error> {
        Determinants::new(
            self.norb + nclosed,
            self.nelea() + nclosed,
            self.neleb() + nclosed,
        )
    }

    /// Returns a compact occupation label such as `2ab.` for the determinant `(ia, ib)`.
    pub fn occupation_label(&self, ia: usize, ib: usize) -> String {
        let sa = self.alpha.string(ia);
        let sb = self.beta.string(ib);
        (0..self.norb)
            .map(|p| match ((sa >> p) & 1, (sb >> p) & 1) {
                (1, 1) => '2',
                (1, 0) => 'a',
                (0, 1) => 'b',
                _ => '.',
            })
            .collect()
    }
}

impl fmt::Display for Determinants {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Number of orbitals: {}", self.norb)?;
        writeln!(
            f,
            "Number of electrons (α, β): ({}, {})",
            self.nelea(),
            self.neleb()
        )?;
        writeln!(
            f,
            "Number of strings (α, β): ({}, {})",
            self.lena(),
            self.lenb()
        )?;
        writeln!(f, "Number of determinants: {}", self.size())?;
        Ok(())
    }
}
