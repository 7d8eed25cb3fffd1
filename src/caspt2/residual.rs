//! Task queues evaluating the CASPT2 source vector, residual and metric products.

use anyhow::{self, format_err};
use ndarray::{s, Array, Array2, Dimension};

use crate::civec::SubspaceVector;
use crate::integrals::MOIntegrals;
use crate::parallel::CommHandle;
use crate::smith::{
    ContractionTask, IndexRange, MultiTensor, Queue, ResetTask, TaskHandle, Tensor, TensorId,
    TensorStore,
};

use super::densities::{PairDensities, PairTable};

/// Overlap of doubly external functions, direct term.
const METRIC_DIRECT: &str = "xpyq,abpq->abxy";

/// Overlap of doubly external functions, term with the virtual pair exchanged.
const METRIC_EXCHANGE: &str = "xqyp,bapq->abxy";

/// Overlap of singly external functions.
const METRIC_SINGLE: &str = "xyzpqr,apqr->axyz";

/// Overlap of internal functions.
const METRIC_INTERNAL: &str = "xyzwpqrs,pqrs->xyzw";

/// The classes of internally contracted first-order functions, by the number of electrons
/// placed in virtual orbitals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Excitation {
    /// $`\sum_{\sigma\tau}\hat{a}^\dagger_{a\sigma}\hat{a}^\dagger_{b\tau}\hat{a}_{q\tau}\hat{a}_{p\sigma}|j\rangle`$,
    /// ranges `[virt, virt, int, int]`.
    Double,

    /// $`\hat{E}_{ap}\hat{E}_{qr}|j\rangle`$, ranges `[virt, int, int, int]`.
    Single,

    /// $`\hat{Q}\hat{E}_{pq}\hat{E}_{rs}|j\rangle`$, ranges `[int, int, int, int]`.
    Internal,
}

impl Excitation {
    pub(crate) const ALL: [Excitation; 3] = [Self::Double, Self::Single, Self::Internal];

    /// The multi-tensor component holding this class for reference `state`.
    pub(crate) fn component(self, state: usize) -> usize {
        Self::ALL.len() * state + self as usize
    }

    fn label(self) -> &'static str {
        match self {
            Self::Double => "D",
            Self::Single => "S",
            Self::Internal => "I",
        }
    }
}

type PairIds = Vec<Vec<Option<TensorId>>>;

/// Blocks every pair density of `arrays` over the internal range.
fn insert_pairs<D: Dimension>(
    store: &mut TensorStore,
    arrays: &PairTable<Array<f64, D>>,
    name: &str,
    int: &IndexRange,
) -> Result<PairIds, anyhow::Error> {
    arrays
        .iter()
        .enumerate()
        .map(|(bra, row)| {
            row.iter()
                .enumerate()
                .map(|(ket, arr)| {
                    arr.as_ref()
                        .map(|a| {
                            Tensor::from_array(vec![int.clone(); a.ndim()], a.view().into_dyn())
                                .map(|t| store.insert(&format!("{name}({bra},{ket})"), t))
                        })
                        .transpose()
                })
                .collect()
        })
        .collect()
}

fn pair(table: &PairIds, bra: usize, ket: usize) -> Result<TensorId, anyhow::Error> {
    table
        .get(bra)
        .and_then(|row| row.get(ket))
        .copied()
        .flatten()
        .ok_or_else(|| format_err!("No pair density for reference states ({bra}, {ket})."))
}

/// Queues `factor * pattern(inputs)` into `output` after `reset`.
#[allow(clippy::too_many_arguments)]
fn contract_into(
    queue: &mut Queue,
    store: &TensorStore,
    label: &str,
    pattern: &str,
    output: TensorId,
    inputs: &[TensorId],
    factor: f64,
    reset: TaskHandle,
) -> Result<(), anyhow::Error> {
    queue.add_task(
        Box::new(ContractionTask::new(label, pattern, output, inputs, factor, store)?),
        &[reset],
    )?;
    Ok(())
}

/// The tensors shared by every queue of one CASPT2 calculation.
///
/// Amplitudes hold three components per reference state, one per [`Excitation`] class, at
/// [`Excitation::component`]. The doubly external component for reference $`j`$ holds
/// $`T^{j}_{ab,pq}`$, the coefficient of
/// $`\sum_{\sigma\tau}\hat{a}^\dagger_{a\sigma}\hat{a}^\dagger_{b\tau}\hat{a}_{q\tau}\hat{a}_{p\sigma}|j\rangle`$.
pub(crate) struct Caspt2Tensors {
    store: TensorStore,
    nstate: usize,
    ranges: [Vec<IndexRange>; 3],
    fock_vv: TensorId,
    fock_vi: TensorId,
    h_vi: TensorId,
    eri_vivi: TensorId,
    eri_viii: TensorId,
    gamma: PairIds,
    f3: PairIds,
    g1: PairIds,
    g1f: PairIds,
    g0: PairIds,
    g0f: PairIds,
    k: PairIds,
    l: PairIds,
    a1: PairIds,
    a2: PairIds,
    vi: PairIds,
    shuffle_seed: Option<u64>,
}

impl Caspt2Tensors {
    /// Blocks the Fock matrix, the integrals with one or two virtual indices and the pair
    /// densities.
    ///
    /// # Arguments
    ///
    /// * `fock` - The Fock matrix over all orbitals.
    /// * `mo` - The integrals over all orbitals.
    /// * `densities` - Internal-space pair densities.
    /// * `nint` - The number of internal (closed plus active) orbitals.
    /// * `block_size` - The largest block along any index range.
    /// * `shuffle_seed` - Seed with which queued tasks are shuffled.
    pub(crate) fn new(
        fock: &Array2<f64>,
        mo: &MOIntegrals,
        densities: &PairDensities,
        nint: usize,
        block_size: usize,
        shuffle_seed: Option<u64>,
    ) -> Result<Self, anyhow::Error> {
        let norb = fock.nrows();
        let int = IndexRange::new("int", nint, block_size, 0)?;
        let virt = IndexRange::new("virt", norb - nint, block_size, nint)?;
        let mut store = TensorStore::new();
        let vv = vec![virt.clone(), virt.clone()];
        let vi = vec![virt.clone(), int.clone()];
        let fock_vv = store.insert(
            "f(vv)",
            Tensor::from_array(vv, fock.slice(s![nint.., nint..]).into_dyn())?,
        );
        let fock_vi = store.insert(
            "f(vi)",
            Tensor::from_array(vi.clone(), fock.slice(s![nint.., ..nint]).into_dyn())?,
        );
        let h_vi = store.insert(
            "h(vi)",
            Tensor::from_array(vi, mo.one_body.slice(s![nint.., ..nint]).into_dyn())?,
        );
        let eri_vivi = store.insert(
            "(ar|bs)",
            Tensor::from_array(
                vec![virt.clone(), int.clone(), virt.clone(), int.clone()],
                mo.two_body.slice(s![nint.., ..nint, nint.., ..nint]).into_dyn(),
            )?,
        );
        let eri_viii = store.insert(
            "(au|vw)",
            Tensor::from_array(
                vec![virt.clone(), int.clone(), int.clone(), int.clone()],
                mo.two_body.slice(s![nint.., ..nint, ..nint, ..nint]).into_dyn(),
            )?,
        );
        Ok(Self {
            nstate: densities.gamma.len(),
            ranges: [
                vec![virt.clone(), virt.clone(), int.clone(), int.clone()],
                vec![virt, int.clone(), int.clone(), int.clone()],
                vec![int.clone(); 4],
            ],
            fock_vv,
            fock_vi,
            h_vi,
            eri_vivi,
            eri_viii,
            gamma: insert_pairs(&mut store, &densities.gamma, "Gamma", &int)?,
            f3: insert_pairs(&mut store, &densities.f3, "F3", &int)?,
            g1: insert_pairs(&mut store, &densities.g1, "G1", &int)?,
            g1f: insert_pairs(&mut store, &densities.g1f, "G1F", &int)?,
            g0: insert_pairs(&mut store, &densities.g0, "G0", &int)?,
            g0f: insert_pairs(&mut store, &densities.g0f, "G0F", &int)?,
            k: insert_pairs(&mut store, &densities.k, "K", &int)?,
            l: insert_pairs(&mut store, &densities.l, "L", &int)?,
            a1: insert_pairs(&mut store, &densities.a1, "A1", &int)?,
            a2: insert_pairs(&mut store, &densities.a2, "A2", &int)?,
            vi: insert_pairs(&mut store, &densities.vi, "VI", &int)?,
            store,
            shuffle_seed,
        })
    }

    /// The ranges of the amplitudes of one class.
    pub(crate) fn ranges(&self, class: Excitation) -> &[IndexRange] {
        &self.ranges[class as usize]
    }

    /// An unallocated amplitude vector covering every reference state.
    pub(crate) fn zeros(&self) -> MultiTensor {
        MultiTensor::new(
            (0..self.nstate)
                .flat_map(|_| Excitation::ALL.map(|c| Tensor::new(self.ranges(c).to_vec())))
                .collect(),
        )
    }

    /// The number of amplitudes belonging to `states`.
    pub(crate) fn nelement(&self, states: &[usize]) -> usize {
        states.len()
            * Excitation::ALL
                .iter()
                .map(|&c| self.ranges(c).iter().map(IndexRange::size).product::<usize>())
                .sum::<usize>()
    }

    fn declare(&mut self, name: &str, state: usize, class: Excitation) -> TensorId {
        let ranges = self.ranges(class).to_vec();
        self.store
            .declare(&format!("{name}{}({state})", class.label()), ranges)
    }

    /// Moves the components of `amplitude` belonging to `states` into the store, as
    /// `(state, [T_D, T_S, T_I])`.
    fn load(&mut self, amplitude: &MultiTensor, states: &[usize]) -> Vec<(usize, [TensorId; 3])> {
        states
            .iter()
            .map(|&j| {
                let ids = Excitation::ALL.map(|c| {
                    self.store.insert(
                        &format!("T{}({j})", c.label()),
                        amplitude.at(c.component(j)).clone(),
                    )
                });
                (j, ids)
            })
            .collect()
    }

    fn collect(
        &mut self,
        outputs: Vec<(usize, Excitation, TensorId)>,
        loaded: Vec<(usize, [TensorId; 3])>,
    ) -> Result<MultiTensor, anyhow::Error> {
        let mut out = self.zeros();
        for (j, class, id) in outputs {
            *out.at_mut(class.component(j)) = self.store.take(id)?;
        }
        for id in loaded.into_iter().flat_map(|(_, ids)| ids) {
            self.store.take(id)?;
        }
        Ok(out)
    }

    /// The source vector $`\langle\Omega^{j'}|\hat{H}|k\rangle`$ for each bra state in `bras`:
    /// ```math
    ///     V^{\mathrm{D}}_{ab,xy} = \sum_{rs}(ar|bs)\,\Gamma_{xrys}, \qquad
    ///     V^{\mathrm{S}}_{a,xyz} = \sum_u h_{au}A^{(1)}_{xyzu}
    ///         + \sum_{uvw}(au|vw)A^{(2)}_{xyzuvw}, \qquad
    ///     V^{\mathrm{I}}_{xyzw} = \langle\psi_{xyzw}|\hat{H}_{\mathrm{int}}|k\rangle.
    /// ```
    pub(crate) fn source(
        &mut self,
        ket: usize,
        bras: &[usize],
        comm: &CommHandle,
    ) -> Result<MultiTensor, anyhow::Error> {
        let mut queue = Queue::with_shuffle(self.shuffle_seed);
        let mut outputs = vec![];
        for &bra in bras {
            let terms = [
                (
                    Excitation::Double,
                    vec![("arbs,xrys->abxy", vec![self.eri_vivi, pair(&self.gamma, bra, ket)?])],
                ),
                (
                    Excitation::Single,
                    vec![
                        ("au,xyzu->axyz", vec![self.h_vi, pair(&self.a1, bra, ket)?]),
                        ("auvw,xyzuvw->axyz", vec![self.eri_viii, pair(&self.a2, bra, ket)?]),
                    ],
                ),
                (
                    Excitation::Internal,
                    vec![("xyzw->xyzw", vec![pair(&self.vi, bra, ket)?])],
                ),
            ];
            for (class, contractions) in terms {
                let out = self.declare(&format!("V[{ket}]"), bra, class);
                let reset = queue.add_task(Box::new(ResetTask::new(out)), &[])?;
                for (pattern, inputs) in contractions {
                    contract_into(
                        &mut queue, &self.store, "source", pattern, out, &inputs, 1.0, reset,
                    )?;
                }
                outputs.push((bra, class, out));
            }
        }
        queue.run(&mut self.store, comm)?;
        self.collect(outputs, vec![])
    }

    /// Applies $`\hat{H}_0 - E_0`$ to `amplitude`, coupling the components listed in `states`.
    ///
    /// $`\hat{H}_0`$ is the Fock operator projected onto the first-order space. Within a class the
    /// internal part is carried by Fock-contracted densities and the virtual part by the metric
    /// acting on the Fock-transformed amplitudes; the virtual-internal Fock block couples the
    /// doubly external to the singly external class, and the singly external to the internal one.
    pub(crate) fn sigma(
        &mut self,
        amplitude: &MultiTensor,
        states: &[usize],
        e0: f64,
        comm: &CommHandle,
    ) -> Result<MultiTensor, anyhow::Error> {
        let loaded = self.load(amplitude, states);
        let mut queue = Queue::with_shuffle(self.shuffle_seed);

        let mut fock_applied = vec![];
        for &(ket, [td, _, _]) in loaded.iter() {
            let ft = self.declare("fT", ket, Excitation::Double);
            let reset = queue.add_task(Box::new(ResetTask::new(ft)), &[])?;
            for pattern in ["ac,cbpq->abpq", "bc,acpq->abpq"] {
                contract_into(
                    &mut queue,
                    &self.store,
                    "virtual Fock",
                    pattern,
                    ft,
                    &[self.fock_vv, td],
                    1.0,
                    reset,
                )?;
            }
            fock_applied.push(ft);
        }

        let mut outputs = vec![];
        for &bra in states {
            let out_d = self.declare("R", bra, Excitation::Double);
            let out_s = self.declare("R", bra, Excitation::Single);
            let out_i = self.declare("R", bra, Excitation::Internal);
            let reset_d = queue.add_task(Box::new(ResetTask::new(out_d)), &[])?;
            let reset_s = queue.add_task(Box::new(ResetTask::new(out_s)), &[])?;
            let reset_i = queue.add_task(Box::new(ResetTask::new(out_i)), &[])?;
            for (&(ket, [td, ts, ti]), &ft) in loaded.iter().zip(fock_applied.iter()) {
                let gamma = pair(&self.gamma, bra, ket)?;
                let f3 = pair(&self.f3, bra, ket)?;
                let g1 = pair(&self.g1, bra, ket)?;
                let g1f = pair(&self.g1f, bra, ket)?;
                let g0 = pair(&self.g0, bra, ket)?;
                let g0f = pair(&self.g0f, bra, ket)?;
                let k_bk = pair(&self.k, bra, ket)?;
                let k_kb = pair(&self.k, ket, bra)?;
                let l_bk = pair(&self.l, bra, ket)?;
                let l_kb = pair(&self.l, ket, bra)?;
                let fvi = self.fock_vi;

                let mut terms: Vec<(TensorId, TaskHandle, &str, &str, Vec<TensorId>, f64)> = vec![];
                for pattern in [METRIC_DIRECT, METRIC_EXCHANGE] {
                    terms.push((out_d, reset_d, "internal Fock", pattern, vec![f3, td], 1.0));
                    terms.push((out_d, reset_d, "metric on fT", pattern, vec![gamma, ft], 1.0));
                    terms.push((out_d, reset_d, "metric on T", pattern, vec![gamma, td], -e0));
                }
                terms.extend([
                    (out_d, reset_d, "singles to doubles", "bu,xyupqr,apqr->abxy", vec![fvi, k_bk, ts], 1.0),
                    (out_d, reset_d, "singles to doubles", "au,yxupqr,bpqr->abxy", vec![fvi, k_bk, ts], 1.0),
                    (out_s, reset_s, "internal Fock", METRIC_SINGLE, vec![g1f, ts], 1.0),
                    (out_s, reset_s, "metric on T", METRIC_SINGLE, vec![g1, ts], -e0),
                    (out_s, reset_s, "virtual Fock", "ab,xyzpqr,bpqr->axyz", vec![self.fock_vv, g1, ts], 1.0),
                    (out_s, reset_s, "doubles to singles", "bu,pquxyz,abpq->axyz", vec![fvi, k_kb, td], 1.0),
                    (out_s, reset_s, "doubles to singles", "bu,qpuxyz,bapq->axyz", vec![fvi, k_kb, td], 1.0),
                    (out_s, reset_s, "internal to singles", "au,xyzupqrs,pqrs->axyz", vec![fvi, l_bk, ti], 1.0),
                    (out_i, reset_i, "internal Fock", METRIC_INTERNAL, vec![g0f, ti], 1.0),
                    (out_i, reset_i, "metric on T", METRIC_INTERNAL, vec![g0, ti], -e0),
                    (out_i, reset_i, "singles to internal", "au,pqruxyzw,apqr->xyzw", vec![fvi, l_kb, ts], 1.0),
                ]);
                for (out, reset, label, pattern, inputs, factor) in terms {
                    contract_into(&mut queue, &self.store, label, pattern, out, &inputs, factor, reset)?;
                }
            }
            outputs.extend([
                (bra, Excitation::Double, out_d),
                (bra, Excitation::Single, out_s),
                (bra, Excitation::Internal, out_i),
            ]);
        }
        queue.run(&mut self.store, comm)?;
        for ft in fock_applied {
            self.store.take(ft)?;
        }
        self.collect(outputs, loaded)
    }

    /// Applies the overlap of the first-order functions to `amplitude`.
    pub(crate) fn metric(
        &mut self,
        amplitude: &MultiTensor,
        states: &[usize],
        comm: &CommHandle,
    ) -> Result<MultiTensor, anyhow::Error> {
        let loaded = self.load(amplitude, states);
        let mut queue = Queue::with_shuffle(self.shuffle_seed);
        let mut outputs = vec![];
        for &bra in states {
            for class in Excitation::ALL {
                let out = self.declare("ST", bra, class);
                let reset = queue.add_task(Box::new(ResetTask::new(out)), &[])?;
                for &(ket, [td, ts, ti]) in loaded.iter() {
                    let terms = match class {
                        Excitation::Double => {
                            let gamma = pair(&self.gamma, bra, ket)?;
                            vec![(METRIC_DIRECT, [gamma, td]), (METRIC_EXCHANGE, [gamma, td])]
                        }
                        Excitation::Single => vec![(METRIC_SINGLE, [pair(&self.g1, bra, ket)?, ts])],
                        Excitation::Internal => {
                            vec![(METRIC_INTERNAL, [pair(&self.g0, bra, ket)?, ti])]
                        }
                    };
                    for (pattern, inputs) in terms {
                        contract_into(&mut queue, &self.store, "metric", pattern, out, &inputs, 1.0, reset)?;
                    }
                }
                outputs.push((bra, class, out));
            }
        }
        queue.run(&mut self.store, comm)?;
        self.collect(outputs, loaded)
    }

    /// The norm $`\langle\Psi^{(1)}|\Psi^{(1)}\rangle = \mathbf{t}^{\mathrm{T}}\mathbf{S}\mathbf{t}`$
    /// of a first-order wavefunction.
    pub(crate) fn norm(
        &mut self,
        amplitude: &MultiTensor,
        states: &[usize],
        comm: &CommHandle,
    ) -> Result<f64, anyhow::Error> {
        let st = self.metric(amplitude, states, comm)?;
        amplitude.dot(&st)
    }
}
