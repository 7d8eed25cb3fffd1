//! Occupation strings of a single spin with lexical ranking and excitation lists.

use anyhow::{self, ensure};
use serde::{Deserialize, Serialize};

/// A single replacement $`\hat{E}_{ij} = \hat{a}^\dagger_i \hat{a}_j`$ connecting a source string
/// to a target string.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Excitation {
    /// Rank of the source string.
    pub source: usize,

    /// Rank of the target string.
    pub target: usize,

    /// Fermionic sign of the replacement.
    pub sign: f64,

    /// Compound index `i * norb + j` of the replaced orbital pair.
    pub ij: usize,
}

/// All strings of `nele` electrons in `norb` orbitals, ranked lexically.
///
/// The rank of a string with occupied orbitals $`p_1 < p_2 < \dots < p_k`$ is
/// ```math
///     r = \sum_{m=1}^{k} \binom{p_m}{m},
/// ```
/// which is a bijection onto $`[0, \binom{n}{k})`$.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StringSpace {
    norb: usize,
    nele: usize,

    /// Strings indexed by rank.
    strings: Vec<u64>,

    /// Binomial table `binom[n][k]` for `n, k <= norb`.
    binom: Vec<Vec<usize>>,

    /// Excitations grouped by source rank.
    phi: Vec<Vec<Excitation>>,

    /// Excitations grouped by compound orbital pair `ij`.
    phi_ij: Vec<Vec<Excitation>>,
}

impl StringSpace {
    /// Builds the string space, its ranking, and its single-excitation lists.
    pub fn new(norb: usize, nele: usize) -> Result<Self, anyhow::Error> {
        ensure!(
            norb <= 64,
            "At most 64 orbitals can be represented in an occupation string, {norb} requested."
        );
        ensure!(
            nele <= norb,
            "Cannot place {nele} electrons in {norb} orbitals."
        );
        let binom = (0..=norb)
            .map(|n| {
                (0..=norb)
                    .map(|k| num::integer::binomial(n, k))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let len = binom[norb][nele];
        let mut space = Self {
            norb,
            nele,
            strings: vec![0; len],
            binom,
            phi: vec![],
            phi_ij: vec![vec![]; norb * norb],
        };
        let strings = (0..len).map(|r| space.unrank(r)).collect::<Vec<_>>();
        space.strings = strings;
        space.build_phi();
        Ok(space)
    }

    fn build_phi(&mut self) {
        let norb = self.norb;
        let phi = self
            .strings
            .iter()
            .enumerate()
            .map(|(source, &bits)| {
                let mut exc = vec![];
                for j in (0..norb).filter(|&j| (bits >> j) & 1 == 1) {
                    for i in 0..norb {
                        if i != j && (bits >> i) & 1 == 1 {
                            continue;
                        }
                        let target_bits = (bits & !(1u64 << j)) | (1u64 << i);
                        exc.push(Excitation {
                            source,
                            target: self.rank(target_bits),
                            sign: excitation_sign(bits, i, j),
                            ij: i * norb + j,
                        });
                    }
                }
                exc
            })
            .collect::<Vec<_>>();
        phi.iter().flatten().for_each(|e| self.phi_ij[e.ij].push(*e));
        self.phi = phi;
    }

    /// The number of orbitals.
    pub fn norb(&self) -> usize {
        self.norb
    }

    /// The number of electrons.
    pub fn nele(&self) -> usize {
        self.nele
    }

    /// The number of strings.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Returns `true` if the space has no strings.
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// The string of a given rank.
    pub fn string(&self, rank: usize) -> u64 {
        self.strings[rank]
    }

    /// All strings in rank order.
    pub fn strings(&self) -> &[u64] {
        &self.strings
    }

    /// The lexical rank of a string. The formula is independent of the electron count, so this
    /// also ranks strings of neighbouring spaces with the same orbital count.
    pub fn rank(&self, bits: u64) -> usize {
        let mut rank = 0;
        let mut m = 0;
        for p in 0..self.norb {
            if (bits >> p) & 1 == 1 {
                m += 1;
                rank += self.binom[p][m];
            }
        }
        rank
    }

    fn unrank(&self, mut rank: usize) -> u64 {
        let mut bits = 0u64;
        let mut top = self.norb;
        for m in (1..=self.nele).rev() {
            let p = (m - 1..top)
                .rev()
                .find(|&p| self.binom[p][m] <= rank)
                .unwrap_or(m - 1);
            rank -= self.binom[p][m];
            bits |= 1u64 << p;
            top = p;
        }
        bits
    }

    /// Single excitations originating from the string of rank `source`, including the diagonal
    /// number operators $`\hat{E}_{jj}`$.
    pub fn phi(&self, source: usize) -> &[Excitation] {
        &self.phi[source]
    }

    /// All single excitations with compound orbital pair `ij = i * norb + j`.
    pub fn phi_ij(&self, ij: usize) -> &[Excitation] {
        &self.phi_ij[ij]
    }
}

/// The sign of $`\hat{a}^\dagger_i \hat{a}_j`$ acting on `bits` (with `j` occupied): the parity of
/// the number of occupied orbitals strictly between `i` and `j`.
pub fn excitation_sign(bits: u64, i: usize, j: usize) -> f64 {
    if i == j {
        return 1.0;
    }
    let (lo, hi) = if i < j { (i, j) } else { (j, i) };
    let mask = ((1u64 << hi) - 1) & !((1u64 << (lo + 1)) - 1);
    if (bits & mask).count_ones() % 2 == 0 {
        1.0
    } else {
        -1.0
    }
}

/// Removes orbital `p` from `bits`, returning the new string and the sign
/// $`(-1)^{n_{<p}}`$, or `None` if `p` is empty.
pub fn annihilate(bits: u64, p: usize) -> Option<(u64, f64)> {
    if (bits >> p) & 1 == 0 {
        return None;
    }
    let below = (bits & ((1u64 << p) - 1)).count_ones();
    Some((bits & !(1u64 << p), if below % 2 == 0 { 1.0 } else { -1.0 }))
}

/// Adds orbital `p` to `bits`, returning the new string and the sign $`(-1)^{n_{<p}}`$, or `None`
/// if `p` is already occupied.
pub fn create(bits: u64, p: usize) -> Option<(u64, f64)> {
    if (bits >> p) & 1 == 1 {
        return None;
    }
    let below = (bits & ((1u64 << p) - 1)).count_ones();
    Some((bits | (1u64 << p), if below % 2 == 0 { 1.0 } else { -1.0 }))
}
