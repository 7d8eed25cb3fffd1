//! Sigma-vector construction $`\boldsymbol{\sigma} = \hat{H}\mathbf{c}`$ for the active-space
//! Hamiltonian
//! ```math
//!     \hat{H} = \sum_{kl} h'_{kl} \hat{E}_{kl}
//!         + \frac{1}{2} \sum_{ijkl} (ij|kl) \hat{E}_{ij} \hat{E}_{kl},
//! ```
//! where $`h'`$ is the compressed one-electron operator of [`MOFile`].

use std::collections::BTreeMap;

use anyhow::{self, ensure, format_err};
use itertools::Itertools;
use ndarray::{Array1, Array2, Array3, ArrayView1, Axis};
use rayon::prelude::*;

use crate::civec::{Civec, DistCivec};
use crate::determinant::string_space::create;
use crate::determinant::{Determinants, StringSpace};
use crate::integrals::MOFile;
use crate::parallel::StaticDist;

/// Applies every spin-summed replacement $`\hat{E}_{kl}`$ to `cc`, giving the intermediate
/// $`D_{kl, I} = \langle I | \hat{E}_{kl} | \mathbf{c} \rangle`$ stored as `[kl, Iα, Iβ]`.
pub fn excitation_intermediate(cc: &Civec) -> Array3<f64> {
    let det = cc.det();
    let n2 = det.norb() * det.norb();
    let (lena, lenb) = (det.lena(), det.lenb());
    let data = cc.data();
    let mut d = Array3::<f64>::zeros((n2, lena, lenb));
    for ia in 0..lena {
        for e in det.alpha().phi(ia) {
            let mut row = d.slice_mut(ndarray::s![e.ij, e.target, ..]);
            row.scaled_add(e.sign, &data.row(ia));
        }
    }
    // Beta replacements commute with the alpha string, so only the beta sign enters.
    d.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(kl, mut dkl)| {
            for e in det.beta().phi_ij(kl) {
                let mut col = dkl.column_mut(e.target);
                col.scaled_add(e.sign, &data.column(e.source));
            }
        });
    d
}

/// Serial Knowles-Handy sigma build.
pub fn sigma(cc: &Civec, mo: &MOFile) -> Result<Civec, anyhow::Error> {
    let det = cc.det().clone();
    let n = det.norb();
    let n2 = n * n;
    let (lena, lenb) = (det.lena(), det.lenb());
    let d = excitation_intermediate(cc);
    let dflat = d
        .view()
        .into_shape((n2, lena * lenb))
        .map_err(|err| format_err!(err))?;
    let eri = mo
        .eri()
        .view()
        .into_shape((n2, n2))
        .map_err(|err| format_err!(err))?;
    let hflat = mo
        .h1_compressed()
        .view()
        .into_shape(n2)
        .map_err(|err| format_err!(err))?;

    let g = eri.dot(&dflat) * 0.5;
    let g = g
        .into_shape((n2, lena, lenb))
        .map_err(|err| format_err!(err))?;
    let mut out = hflat
        .dot(&dflat)
        .into_shape((lena, lenb))
        .map_err(|err| format_err!(err))?;

    for ia in 0..lena {
        for e in det.alpha().phi(ia) {
            out.row_mut(e.target)
                .scaled_add(e.sign, &g.slice(ndarray::s![e.ij, ia, ..]));
        }
    }
    for kl in 0..n2 {
        let gkl = g.index_axis(Axis(0), kl);
        for e in det.beta().phi_ij(kl) {
            out.column_mut(e.target)
                .scaled_add(e.sign, &gkl.column(e.source));
        }
    }
    Civec::from_array(det, out)
}

/// The diagonal Hamiltonian elements $`H_{II}`$ (without the core energy), used as Davidson
/// denominators:
/// ```math
///     H_{II} = \sum_i h_{ii} n_i + \frac{1}{2}\sum_{ij} (ii|jj) n_i n_j
///         - \frac{1}{2}\sum_{ij} (ij|ji) (n^\alpha_i n^\alpha_j + n^\beta_i n^\beta_j).
/// ```
pub fn diagonal(det: &Determinants, mo: &MOFile) -> Array2<f64> {
    let n = det.norb();
    let h = mo.h1();
    let eri = mo.eri();
    let occ = |bits: u64| (0..n).map(|p| ((bits >> p) & 1) as f64).collect::<Vec<_>>();
    let exchange = |na: &[f64]| {
        (0..n)
            .flat_map(|i| (0..n).map(move |j| (i, j)))
            .map(|(i, j)| eri[(i, j, j, i)] * na[i] * na[j])
            .sum::<f64>()
    };
    let alpha = det.alpha().strings().iter().map(|&s| occ(s)).collect::<Vec<_>>();
    let beta = det.beta().strings().iter().map(|&s| occ(s)).collect::<Vec<_>>();
    let kalpha = alpha.iter().map(|na| exchange(na)).collect::<Vec<_>>();
    let kbeta = beta.iter().map(|nb| exchange(nb)).collect::<Vec<_>>();
    Array2::from_shape_fn((det.lena(), det.lenb()), |(ia, ib)| {
        let nt = (0..n).map(|p| alpha[ia][p] + beta[ib][p]).collect::<Vec<_>>();
        let one = (0..n).map(|p| h[(p, p)] * nt[p]).sum::<f64>();
        let coulomb = (0..n)
            .flat_map(|i| (0..n).map(move |j| (i, j)))
            .map(|(i, j)| eri[(i, i, j, j)] * nt[i] * nt[j])
            .sum::<f64>();
        one + 0.5 * coulomb - 0.5 * (kalpha[ia] + kbeta[ib])
    })
}

// -----------
// Distributed
// -----------

/// The nonzero elements $`\langle t | \hat{H}_{\sigma\sigma} | s \rangle`$ of the same-spin
/// Hamiltonian for target string `t`, as `(source, value)` pairs.
fn same_spin_row(space: &StringSpace, target: usize, mo: &MOFile) -> Vec<(usize, f64)> {
    let h = mo.h1_compressed();
    let eri = mo.eri();
    let n = mo.nact();
    let mut row = vec![];
    // <t|E_ij E_kl|s> = sum_m <E_ji t|m><m|E_kl s>, and the integrals are real-symmetric.
    for e1 in space.phi(target) {
        let (i, j) = (e1.ij / n, e1.ij % n);
        row.push((e1.target, e1.sign * h[(i, j)]));
        for e2 in space.phi(e1.target) {
            let (k, l) = (e2.ij / n, e2.ij % n);
            row.push((e2.target, 0.5 * e1.sign * e2.sign * eri[(i, j, k, l)]));
        }
    }
    row
}

/// Alpha rows handled per round of remote fetches in [`sigma_distributed`].
const ROW_BATCH: usize = 64;

/// Distributed sigma build. Same-spin terms are pulled into the locally owned alpha rows;
/// alpha-beta terms are pushed from the alpha strings with one electron removed and shipped to
/// their owners with a collective flush.
///
/// Only the rows a batch couples to are fetched from other ranks, so no rank ever holds the full
/// vector. Collective: every rank of `cc.comm()` must call this.
pub fn sigma_distributed(cc: &DistCivec, mo: &MOFile) -> Result<DistCivec, anyhow::Error> {
    sigma_distributed_batched(cc, mo, ROW_BATCH)
}

pub(crate) fn sigma_distributed_batched(
    cc: &DistCivec,
    mo: &MOFile,
    batch: usize,
) -> Result<DistCivec, anyhow::Error> {
    ensure!(batch > 0, "The row batch size must be positive.");
    let det = cc.det().clone();
    let n = det.norb();
    let lenb = det.lenb();
    let comm = cc.comm().clone();
    let mut out = DistCivec::zeros(det.clone(), comm.clone());

    // Same-spin contributions to local rows. Every rank runs the same number of fetch rounds.
    let beta_rows = (0..lenb)
        .map(|ib| same_spin_row(det.beta(), ib, mo))
        .collect::<Vec<_>>();
    let local = cc.local_range().collect_vec();
    let rounds = (cc.dist().range(0).len() + batch - 1) / batch;
    for chunk in (0..rounds).map(|round| local.iter().copied().skip(round * batch).take(batch)) {
        let alpha_rows = chunk
            .map(|ia| (ia, same_spin_row(det.alpha(), ia, mo)))
            .collect_vec();
        let needed = alpha_rows
            .iter()
            .flat_map(|(_, entries)| entries.iter().map(|(src, _)| *src))
            .collect_vec();
        let fetched = cc.fetch_rows(&needed)?;
        for (ia, entries) in alpha_rows {
            let mut buf = Array1::<f64>::zeros(lenb);
            for (src, v) in entries {
                buf.scaled_add(v, fetched_row(&fetched, src)?);
            }
            let crow = cc.local_row(ia)?;
            for (ib, entries) in beta_rows.iter().enumerate() {
                buf[ib] += entries.iter().map(|(src, v)| v * crow[*src]).sum::<f64>();
            }
            out.accumulate_bstring_buf(buf.view(), ia)?;
        }
    }

    // Alpha-beta contributions pushed from each (N-1)-electron alpha string.
    if det.nelea() > 0 && det.neleb() > 0 {
        let reduced = StringSpace::new(n, det.nelea() - 1)?;
        let dist = StaticDist::new(reduced.len(), comm.size());
        let eri = mo
            .eri()
            .view()
            .into_shape((n, n * n * n))
            .map_err(|err| format_err!(err))?;
        let mine = dist.range(comm.rank()).collect_vec();
        let rounds = (dist.range(0).len() + batch - 1) / batch;
        for round in 0..rounds {
            let strings = mine
                .iter()
                .skip(round * batch)
                .take(batch)
                .map(|&r| reduced.string(r))
                .collect_vec();
            let mut needed = vec![];
            for &astring in strings.iter() {
                for j in 0..n {
                    if let Some((source, _)) = create(astring, j) {
                        needed.push(det.alpha().rank(source));
                    }
                }
            }
            let fetched = cc.fetch_rows(&needed)?;
            for &astring in strings.iter() {
                for (target, buf) in alpha_beta_task(astring, &det, &fetched, eri.view())? {
                    out.accumulate_bstring_buf(buf.view(), target)?;
                }
            }
            out.flush()?;
        }
    }
    Ok(out)
}

fn fetched_row(
    fetched: &BTreeMap<usize, Array1<f64>>,
    ia: usize,
) -> Result<&Array1<f64>, anyhow::Error> {
    fetched
        .get(&ia)
        .ok_or_else(|| format_err!("Alpha string {ia} was not fetched."))
}

/// Alpha-beta sigma contributions routed through one (N-1)-electron alpha string `astring`:
/// returns `(target alpha rank, beta buffer)` pairs. `rows` must hold every alpha row reachable
/// from `astring` by one creation.
fn alpha_beta_task(
    astring: u64,
    det: &Determinants,
    rows: &BTreeMap<usize, Array1<f64>>,
    eri: ndarray::ArrayView2<'_, f64>,
) -> Result<Vec<(usize, Array1<f64>)>, anyhow::Error> {
    let n = det.norb();
    let n2 = n * n;
    let lenb = det.lenb();
    let beta = det.beta();

    // d[j, kl, :] = s_j E^β_kl C[a ∪ j, :]
    let mut d = Array3::<f64>::zeros((n, n2, lenb));
    for j in 0..n {
        let Some((source, sj)) = create(astring, j) else {
            continue;
        };
        let crow = fetched_row(rows, det.alpha().rank(source))?;
        let mut dj = d.index_axis_mut(Axis(0), j);
        for ib in 0..lenb {
            for e in beta.phi(ib) {
                dj[(e.ij, e.target)] += sj * e.sign * crow[ib];
            }
        }
    }
    let dflat = d
        .into_shape((n * n2, lenb))
        .map_err(|err| format_err!(err))?;
    let g = eri.dot(&dflat);

    Ok((0..n)
        .filter_map(|i| {
            create(astring, i).map(|(target, si)| {
                let row: ArrayView1<'_, f64> = g.row(i);
                (det.alpha().rank(target), row.mapv(|v| si * v))
            })
        })
        .collect())
}
