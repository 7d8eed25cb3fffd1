//! Internal-space densities coupling the internally contracted first-order functions.
//!
//! For a reference $`|j\rangle`$ embedded in the internal (closed plus active) orbitals, the
//! singly external and internal functions are built from
//! ```math
//!     |\phi^\sigma_{pqr}\rangle = \hat{a}_{p\sigma}\hat{E}_{qr}|j\rangle, \qquad
//!     |\psi_{pqrs}\rangle = \hat{Q}\hat{E}_{pq}\hat{E}_{rs}|j\rangle,
//! ```
//! where $`\hat{Q}`$ removes every determinant whose closed orbitals are all doubly occupied.
//! Each density below is an overlap of such vectors between a bra and a ket reference, with the
//! internal Fock operator, an annihilator or the internal Hamiltonian in between.

use anyhow::{self, format_err};
use log;
use ndarray::{Array2, Array4, ArrayD, IxDyn};

use crate::civec::Civec;
use crate::fci::sigma::sigma;
use crate::integrals::MOFile;
use crate::rdm::holes::{
    annihilate_each, apply_one_body, hole_set, replacements, spin_patterns, stack, Spin,
};
use crate::rdm::{frdm3, rdm12};

/// Densities indexed `[bra][ket]`, present only for the pairs that are needed.
pub(crate) type PairTable<T> = Vec<Vec<Option<T>>>;

/// Internal-space transition densities between pairs of reference states.
#[derive(Clone, Debug)]
pub(crate) struct PairDensities {
    /// $`\Gamma^{j'j}_{xpyq}`$.
    pub(crate) gamma: PairTable<Array4<f64>>,

    /// Fock-contracted three-body densities $`\sum_{mn} f_{mn}\Gamma^{j'j}_{xpyqmn}`$.
    pub(crate) f3: PairTable<Array4<f64>>,

    /// $`\sum_\sigma\langle\phi^\sigma_{xyz}|\phi^\sigma_{pqr}\rangle`$, indexed `[x,y,z,p,q,r]`.
    pub(crate) g1: PairTable<ArrayD<f64>>,

    /// As [`Self::g1`] with the internal Fock operator applied to the ket.
    pub(crate) g1f: PairTable<ArrayD<f64>>,

    /// $`\langle\psi_{xyzw}|\psi_{pqrs}\rangle`$, indexed `[x,y,z,w,p,q,r,s]`.
    pub(crate) g0: PairTable<ArrayD<f64>>,

    /// As [`Self::g0`] with the internal Fock operator applied to the ket.
    pub(crate) g0f: PairTable<ArrayD<f64>>,

    /// $`\sum_{\sigma\tau}\langle\hat{a}_{y\tau}\hat{a}_{x\sigma}j'|\hat{a}_{u\tau}\phi^\sigma_{pqr}\rangle`$,
    /// indexed `[x,y,u,p,q,r]`.
    pub(crate) k: PairTable<ArrayD<f64>>,

    /// $`\sum_\sigma\langle\phi^\sigma_{xyz}|\hat{a}_{u\sigma}\psi_{pqrs}\rangle`$, indexed
    /// `[x,y,z,u,p,q,r,s]`.
    pub(crate) l: PairTable<ArrayD<f64>>,

    /// $`\sum_\sigma\langle\phi^\sigma_{xyz}|\hat{a}_{u\sigma}j\rangle`$, indexed `[x,y,z,u]`.
    pub(crate) a1: PairTable<ArrayD<f64>>,

    /// $`\sum_\sigma\langle\phi^\sigma_{xyz}|\hat{E}_{vw}\hat{a}_{u\sigma}j\rangle`$, indexed
    /// `[x,y,z,u,v,w]`.
    pub(crate) a2: PairTable<ArrayD<f64>>,

    /// $`\langle\psi_{xyzw}|\hat{H}_{\mathrm{int}}|j\rangle`$, indexed `[x,y,z,w]`.
    pub(crate) vi: PairTable<ArrayD<f64>>,
}

/// The intermediate vectors of one reference state.
struct InternalVectors {
    cc: Civec,
    /// $`\phi^\sigma`$ for each spin with an electron to remove, entry `p * n^2 + q * n + r`.
    phi: Vec<(Spin, Vec<Civec>)>,
    fphi: Vec<(Spin, Vec<Civec>)>,
    /// $`\hat{a}_{u\sigma}|j\rangle`$, entry `u`.
    holes: Vec<(Spin, Vec<Civec>)>,
    /// $`\hat{a}_{u\sigma}\psi_{pqrs}`$, entry `u * n^4 + pqrs`.
    psi_holes: Vec<(Spin, Vec<Civec>)>,
    psi: Vec<Civec>,
    fpsi: Vec<Civec>,
}

fn by_spin(vectors: &[(Spin, Vec<Civec>)], spin: Spin) -> Option<&[Civec]> {
    vectors
        .iter()
        .find(|(s, _)| *s == spin)
        .map(|(_, v)| v.as_slice())
}

fn per_spin(
    vectors: &[Civec],
) -> Result<Vec<(Spin, Vec<Civec>)>, anyhow::Error> {
    let mut out = vec![];
    for spin in [Spin::Alpha, Spin::Beta] {
        if let Some(v) = annihilate_each(vectors, spin)? {
            out.push((spin, v));
        }
    }
    Ok(out)
}

fn fock_applied(
    vectors: &[(Spin, Vec<Civec>)],
    fock: &Array2<f64>,
) -> Result<Vec<(Spin, Vec<Civec>)>, anyhow::Error> {
    vectors
        .iter()
        .map(|(spin, v)| {
            v.iter()
                .map(|w| apply_one_body(w, fock))
                .collect::<Result<Vec<_>, _>>()
                .map(|fv| (*spin, fv))
        })
        .collect()
}

/// Zeroes every determinant with all `nclosed` lowest orbitals doubly occupied.
fn project_out_cas(cc: &mut Civec, nclosed: usize) {
    let mask = 1u64.checked_shl(nclosed as u32).map_or(u64::MAX, |m| m - 1);
    let det = cc.det().clone();
    let alpha = det.alpha().strings();
    let beta = det.beta().strings();
    for ((ia, ib), v) in cc.data_mut().indexed_iter_mut() {
        if alpha[ia] & mask == mask && beta[ib] & mask == mask {
            *v = 0.0;
        }
    }
}

impl InternalVectors {
    fn new(cc: &Civec, nclosed: usize, fock: &Array2<f64>) -> Result<Self, anyhow::Error> {
        let n2 = cc.det().norb() * cc.det().norb();
        let singles = replacements(cc)?;
        let phi = per_spin(&singles)?;
        let fphi = fock_applied(&phi, fock)?;
        let holes = per_spin(std::slice::from_ref(cc))?;

        // doubles[rs][pq] = E_pq E_rs |j>
        let doubles = singles
            .iter()
            .map(replacements)
            .collect::<Result<Vec<_>, _>>()?;
        let mut psi = Vec::with_capacity(n2 * n2);
        for pq in 0..n2 {
            for d in doubles.iter() {
                let mut v = d[pq].clone();
                project_out_cas(&mut v, nclosed);
                psi.push(v);
            }
        }
        let fpsi = psi
            .iter()
            .map(|v| apply_one_body(v, fock))
            .collect::<Result<Vec<_>, _>>()?;
        let psi_holes = per_spin(&psi)?;
        Ok(Self {
            cc: cc.clone(),
            phi,
            fphi,
            holes,
            psi_holes,
            psi,
            fpsi,
        })
    }
}

fn overlap(bra: &[Civec], ket: &[Civec]) -> Array2<f64> {
    stack(bra).dot(&stack(ket).t())
}

fn to_rank(mat: Array2<f64>, n: usize, rank: usize) -> Result<ArrayD<f64>, anyhow::Error> {
    mat.into_shape(IxDyn(&vec![n; rank]))
        .map_err(|err| format_err!(err))
}

/// Sums `<bra(spin)|ket(spin)>` over the spins present in both.
fn spin_summed(
    bra: &[(Spin, Vec<Civec>)],
    ket: &[(Spin, Vec<Civec>)],
    shape: (usize, usize),
) -> Array2<f64> {
    let mut mat = Array2::<f64>::zeros(shape);
    for spin in [Spin::Alpha, Spin::Beta] {
        if let (Some(b), Some(k)) = (by_spin(bra, spin), by_spin(ket, spin)) {
            mat += &overlap(b, k);
        }
    }
    mat
}

impl PairDensities {
    /// Computes the densities between embedded references.
    ///
    /// # Arguments
    ///
    /// * `civecs` - The references over the internal orbitals, closed orbitals first.
    /// * `nclosed` - The number of closed orbitals.
    /// * `fock` - The internal block of the Fock matrix.
    /// * `hint` - The Hamiltonian over the internal orbitals without a frozen core.
    /// * `all_coupled` - Whether every pair enters the amplitude equations, rather than only the
    ///   diagonal ones.
    /// * `all_sourced` - Whether every pair enters a source vector, rather than only the
    ///   diagonal ones.
    pub(crate) fn compute(
        civecs: &[Civec],
        nclosed: usize,
        fock: &Array2<f64>,
        hint: &MOFile,
        all_coupled: bool,
        all_sourced: bool,
    ) -> Result<Self, anyhow::Error> {
        let nstate = civecs.len();
        let n = fock.nrows();
        let (n2, n3, n4) = (n * n, n * n * n, n * n * n * n);
        let vectors = civecs
            .iter()
            .map(|cc| InternalVectors::new(cc, nclosed, fock))
            .collect::<Result<Vec<_>, _>>()?;
        let hvecs = civecs
            .iter()
            .map(|cc| sigma(cc, hint))
            .collect::<Result<Vec<_>, _>>()?;

        let table = || -> PairTable<ArrayD<f64>> { vec![vec![None; nstate]; nstate] };
        let mut out = Self {
            gamma: vec![vec![None; nstate]; nstate],
            f3: vec![vec![None; nstate]; nstate],
            g1: table(),
            g1f: table(),
            g0: table(),
            g0f: table(),
            k: table(),
            l: table(),
            a1: table(),
            a2: table(),
            vi: table(),
        };
        for (bra, vb) in vectors.iter().enumerate() {
            for (ket, vk) in vectors.iter().enumerate() {
                if all_sourced || bra == ket {
                    out.gamma[bra][ket] = Some(rdm12(&vb.cc, &vk.cc)?.1);
                    out.a1[bra][ket] =
                        Some(to_rank(spin_summed(&vb.phi, &vk.holes, (n3, n)), n, 4)?);
                    let mut a2 = Array2::<f64>::zeros((n3, n3));
                    for (spin, holes) in vk.holes.iter() {
                        let Some(b) = by_spin(&vb.phi, *spin) else {
                            continue;
                        };
                        let ket_vectors = holes
                            .iter()
                            .map(replacements)
                            .collect::<Result<Vec<_>, _>>()?
                            .concat();
                        a2 += &overlap(b, &ket_vectors);
                    }
                    out.a2[bra][ket] = Some(to_rank(a2, n, 6)?);
                    out.vi[bra][ket] = Some(to_rank(
                        overlap(&vb.psi, std::slice::from_ref(&hvecs[ket])),
                        n,
                        4,
                    )?);
                }
                if all_coupled || bra == ket {
                    out.f3[bra][ket] = Some(frdm3(&vb.cc, &vk.cc, fock)?);
                    out.g1[bra][ket] = Some(to_rank(spin_summed(&vb.phi, &vk.phi, (n3, n3)), n, 6)?);
                    out.g1f[bra][ket] =
                        Some(to_rank(spin_summed(&vb.phi, &vk.fphi, (n3, n3)), n, 6)?);
                    out.g0[bra][ket] = Some(to_rank(overlap(&vb.psi, &vk.psi), n, 8)?);
                    out.g0f[bra][ket] = Some(to_rank(overlap(&vb.psi, &vk.fpsi), n, 8)?);
                    out.l[bra][ket] =
                        Some(to_rank(spin_summed(&vb.phi, &vk.psi_holes, (n3, n * n4)), n, 8)?);

                    let mut k = Array2::<f64>::zeros((n2, n * n3));
                    for spins in spin_patterns(2) {
                        let (Some(hb), Some(phi)) = (hole_set(&vb.cc, &spins)?, by_spin(&vk.phi, spins[0]))
                        else {
                            continue;
                        };
                        let Some(ket_vectors) = annihilate_each(phi, spins[1])? else {
                            continue;
                        };
                        k += &overlap(&hb.vectors, &ket_vectors);
                    }
                    out.k[bra][ket] = Some(to_rank(k, n, 6)?);
                }
            }
        }
        log::debug!("CASPT2 internal densities formed for {nstate} reference state(s) over {n} orbitals.");
        Ok(out)
    }
}
