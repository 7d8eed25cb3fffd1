//! Second-order perturbation theory on CASSCF references.
//!
//! The first-order wavefunction of every reference state is expanded in internally contracted
//! functions of three classes,
//! ```math
//!     |ab,pq;j\rangle = \sum_{\sigma\tau} \hat{a}^\dagger_{a\sigma}\hat{a}^\dagger_{b\tau}
//!         \hat{a}_{q\tau}\hat{a}_{p\sigma} |j\rangle, \qquad
//!     |a,pqr;j\rangle = \hat{E}_{ap}\hat{E}_{qr}|j\rangle, \qquad
//!     |pqrs;j\rangle = \hat{Q}\hat{E}_{pq}\hat{E}_{rs}|j\rangle,
//! ```
//! with $`a, b`$ virtual, $`p, q, r, s`$ internal (closed or active) and $`\hat{Q}`$ the projector
//! onto determinants with a hole in the closed orbitals. The amplitude equations
//! $`(\hat{H}_0 - E_0 + \epsilon)\,\mathbf{t} = -\mathbf{v}`$ are solved by a preconditioned
//! linear subspace method whose matrix-vector products run through the task queues of
//! [`crate::smith`]. Multistate (MS) and extended multistate (XMS) variants couple the
//! references through an effective Hamiltonian.

use std::fmt;
use std::path::Path;

use anyhow::{self, ensure};
use derive_builder::Builder;
use itertools::Itertools;
use log;
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::auxiliary::linalg::symmetric_eigh;
use crate::casscf::{CasscfResult, FockMatrices};
use crate::civec::{Civec, SubspaceVector};
use crate::integrals::{IntegralProvider, MOFile, MOIntegrals};
use crate::io::format::{
    casmr_output, casmr_warn, convergence_note, log_rule, log_subtitle, log_table_header, nice_bool,
    CasmrOutput,
};
use crate::io::{write_casmr_binary, CasmrFile, CasmrFileType};
use crate::parallel::CommHandle;
use crate::rdm::rdm1;
use crate::smith::{LinearRM, MultiTensor};

mod densities;
pub mod denom;
mod residual;

pub use denom::Denom;

use densities::PairDensities;
use residual::{Caspt2Tensors, Excitation};


// ==================
// Struct definitions
// ==================

// ----------
// Parameters
// ----------

fn default_max_iter() -> usize {
    50
}

fn default_thresh() -> f64 {
    1.0e-8
}

fn default_true() -> bool {
    true
}

fn default_block_size() -> usize {
    4
}

fn default_max_subspace() -> usize {
    30
}

fn default_metric_threshold() -> f64 {
    1.0e-9
}

fn default_source_skip_threshold() -> f64 {
    1.0e-15
}

fn default_degeneracy_threshold() -> f64 {
    1.0e-12
}

fn default_linear_dependence_threshold() -> f64 {
    1.0e-10
}

/// Structure containing control parameters for CASPT2.
#[derive(Clone, Builder, Debug, Serialize, Deserialize)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct Caspt2Params {
    /// Maximum number of iterations of the amplitude equations per state.
    #[builder(default = "default_max_iter()")]
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,

    /// Convergence threshold on the residual RMS.
    #[builder(default = "default_thresh()")]
    #[serde(default = "default_thresh")]
    pub thresh: f64,

    /// Real level shift $`\epsilon`$ added to $`\hat{H}_0 - E_0`$.
    #[builder(default = "0.0")]
    #[serde(default)]
    pub shift: f64,

    /// Boolean indicating if the states are coupled through a multistate effective Hamiltonian.
    #[builder(default = "false")]
    #[serde(default)]
    pub ms: bool,

    /// Boolean indicating if the reference states are first rotated to diagonalise the
    /// state-averaged Fock operator. Requires `ms`.
    #[builder(default = "false")]
    #[serde(default)]
    pub xms: bool,

    /// Boolean indicating if each first-order wavefunction is built on its own reference only
    /// (single-state single-reference) rather than on every reference state.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub sssr: bool,

    /// Largest block along any orbital index range.
    #[builder(default = "default_block_size()")]
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Largest number of trial vectors kept by the linear solver.
    #[builder(default = "default_max_subspace()")]
    #[serde(default = "default_max_subspace")]
    pub max_subspace: usize,

    /// Eigenvalues of the metric of each excitation class below this are projected out.
    #[builder(default = "default_metric_threshold()")]
    #[serde(default = "default_metric_threshold")]
    pub metric_threshold: f64,

    /// States whose source vector has an RMS below this are not solved.
    #[builder(default = "default_source_skip_threshold()")]
    #[serde(default = "default_source_skip_threshold")]
    pub source_skip_threshold: f64,

    /// Zeroth-order energies closer than this are reported as degenerate.
    #[builder(default = "default_degeneracy_threshold()")]
    #[serde(default = "default_degeneracy_threshold")]
    pub degeneracy_threshold: f64,

    /// Trial vectors whose norm after orthogonalisation falls below this end the iterations.
    #[builder(default = "default_linear_dependence_threshold()")]
    #[serde(default = "default_linear_dependence_threshold")]
    pub linear_dependence_threshold: f64,

    /// Seed with which queued tensor tasks are shuffled before execution.
    #[builder(default = "None")]
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
}

impl Caspt2Params {
    /// Returns a builder to construct a [`Caspt2Params`] structure.
    pub fn builder() -> Caspt2ParamsBuilder {
        Caspt2ParamsBuilder::default()
    }
}

impl Default for Caspt2Params {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Unable to build a default `Caspt2Params`.")
    }
}

impl Caspt2ParamsBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.xms.unwrap_or(false) && !self.ms.unwrap_or(false) {
            return Err("XMS-CASPT2 requires multistate coupling to be enabled.".to_string());
        }
        if self.shift.unwrap_or(0.0) < 0.0 {
            return Err("The level shift must not be negative.".to_string());
        }
        if self.block_size.unwrap_or_else(default_block_size) == 0 {
            return Err("Block size must be positive.".to_string());
        }
        if self.max_subspace.unwrap_or_else(default_max_subspace) < 2 {
            return Err("The linear subspace must hold at least two vectors.".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for Caspt2Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match (self.ms, self.xms) {
            (true, true) => "XMS-CASPT2",
            (true, false) => "MS-CASPT2",
            _ => "SS-CASPT2",
        };
        writeln!(f, "Variant: {variant}")?;
        writeln!(f, "Single-state single-reference: {}", nice_bool(self.sssr))?;
        writeln!(f, "Level shift: {:.3e}", self.shift)?;
        writeln!(f, "Maximum iterations: {}", self.max_iter)?;
        writeln!(f, "Residual threshold: {:.3e}", self.thresh)?;
        writeln!(f, "Maximum subspace: {}", self.max_subspace)?;
        writeln!(f, "Block size: {}", self.block_size)?;
        writeln!(f, "Metric threshold: {:.3e}", self.metric_threshold)?;
        if let Some(seed) = self.shuffle_seed {
            writeln!(f, "Task shuffle seed: {seed}")?;
        }
        Ok(())
    }
}

// ------
// Result
// ------

/// CASPT2 energies for every reference state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Caspt2Result {
    /// The CASSCF energies of the reference states.
    pub reference_energies: Vec<f64>,

    /// The zeroth-order energies $`E_0`$, after the XMS rotation if requested.
    pub zeroth_order_energies: Vec<f64>,

    /// The second-order corrections, with any level-shift contribution removed.
    pub correlation_energies: Vec<f64>,

    /// The norms $`\langle\Psi^{(1)}|\Psi^{(1)}\rangle`$ of the first-order wavefunctions.
    pub norms: Vec<f64>,

    /// The effective Hamiltonian in the (rotated) reference basis.
    pub heff: Array2<f64>,

    /// The final CASPT2 energies.
    pub energies: Vec<f64>,

    /// Expansion of the final states in the original CASSCF states (columns), present for
    /// multistate variants.
    pub mixing: Option<Array2<f64>>,

    /// Number of iterations used for each state.
    pub iterations: Vec<usize>,

    /// Boolean indicating if every state converged.
    pub converged: bool,
}

impl Caspt2Result {
    /// Writes the result as a `casmr` binary file.
    pub fn write<P: AsRef<Path>>(&self, name: P) -> Result<(), anyhow::Error> {
        write_casmr_binary(name, self)?;
        Ok(())
    }
}

impl CasmrFile for Caspt2Result {
    const FILE_TYPE: CasmrFileType = CasmrFileType::Pt2;
}

impl fmt::Display for Caspt2Result {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>5} {:>20} {:>20} {:>12} {:>20}",
            "State", "E(ref)", "E(2)", "Norm", "E(CASPT2)"
        )?;
        for i in 0..self.energies.len() {
            writeln!(
                f,
                "{i:>5} {:>+20.12} {:>+20.12} {:>12.6} {:>+20.12}",
                self.reference_energies[i],
                self.correlation_energies[i],
                self.norms[i],
                self.energies[i],
            )?;
        }
        if let Some(mixing) = self.mixing.as_ref() {
            writeln!(f, "Mixing of reference states (columns):")?;
            for row in mixing.rows() {
                writeln!(f, "  {}", row.iter().map(|v| format!("{v:>+10.6}")).join(" "))?;
            }
        }
        write!(f, "Amplitude equations{}", convergence_note(self.converged))
    }
}

// ------
// Solver
// ------

/// The reference states in the basis in which perturbation theory is applied.
struct Reference {
    civecs: Vec<Civec>,
    eref: Array2<f64>,
    e0: Vec<f64>,
    rotation: Option<Array2<f64>>,
}

/// The solution of the amplitude equations for one state.
struct Amplitude {
    t: MultiTensor,
    hylleraas: f64,
    iterations: usize,
    converged: bool,
}

/// CASPT2 driver.
pub struct Caspt2<'a> {
    provider: &'a dyn IntegralProvider,
    reference: &'a CasscfResult,
    parameters: &'a Caspt2Params,
    comm: CommHandle,
}

impl<'a> Caspt2<'a> {
    /// Sets up CASPT2 on the orbitals and CI vectors of `reference`, which are assumed to be
    /// natural in the active space and semicanonical in the closed and virtual spaces.
    pub fn new(
        provider: &'a dyn IntegralProvider,
        reference: &'a CasscfResult,
        parameters: &'a Caspt2Params,
        comm: CommHandle,
    ) -> Result<Self, anyhow::Error> {
        ensure!(
            !reference.civecs.is_empty(),
            "The CASSCF reference contains no states."
        );
        ensure!(
            !parameters.xms || parameters.ms,
            "XMS-CASPT2 requires multistate coupling to be enabled."
        );
        ensure!(
            reference.coeff.nrows() == provider.nbasis(),
            "Reference orbitals span {} basis functions but the integrals have {}.",
            reference.coeff.nrows(),
            provider.nbasis()
        );
        Ok(Self {
            provider,
            reference,
            parameters,
            comm,
        })
    }

    fn nstate(&self) -> usize {
        self.reference.civecs.len()
    }

    /// The states whose functions make up the first-order wavefunction of `state`.
    fn coupled_states(&self, state: usize) -> Vec<usize> {
        if self.parameters.sssr {
            vec![state]
        } else {
            (0..self.nstate()).collect()
        }
    }

    /// Builds $`\langle i|\hat{F}|j\rangle`$ and, for XMS, rotates the references to diagonalise
    /// it.
    fn reference_hamiltonian(&self, fock: &Array2<f64>) -> Result<Reference, anyhow::Error> {
        let r = self.reference;
        let n = self.nstate();
        let nint = r.nclosed + r.nact;
        let core = 2.0 * (0..r.nclosed).map(|c| fock[(c, c)]).sum::<f64>();
        let fact = fock.slice(s![r.nclosed..nint, r.nclosed..nint]);
        let mut fmat = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                let gamma = rdm1(&r.civecs[i], &r.civecs[j])?;
                fmat[(i, j)] = (&gamma * &fact).sum() + if i == j { core } else { 0.0 };
            }
        }
        log::debug!("Reference Fock matrix:\n{fmat:+.10}");

        if !self.parameters.xms {
            return Ok(Reference {
                civecs: r.civecs.clone(),
                eref: Array2::from_diag(&Array1::from_vec(r.energies.clone())),
                e0: fmat.diag().to_vec(),
                rotation: None,
            });
        }

        let (w, u) = symmetric_eigh(&fmat)?;
        if let Some((k, gap)) = w
            .iter()
            .tuple_windows()
            .map(|(a, b)| b - a)
            .enumerate()
            .find(|(_, gap)| *gap < self.parameters.degeneracy_threshold)
        {
            casmr_warn!(
                "XMS zeroth-order energies {k} and {} are degenerate (gap {gap:.3e}); the rotation is not unique.",
                k + 1
            );
        }
        let civecs = (0..n)
            .map(|k| {
                let mut cc = r.civecs[0].clone();
                cc.zero();
                for (i, c) in r.civecs.iter().enumerate() {
                    cc.ax_plus_y(u[(i, k)], c)?;
                }
                Ok(cc)
            })
            .collect::<Result<Vec<_>, anyhow::Error>>()?;
        let energies = Array2::from_diag(&Array1::from_vec(r.energies.clone()));
        Ok(Reference {
            civecs,
            eref: u.t().dot(&energies).dot(&u),
            e0: w.to_vec(),
            rotation: Some(u),
        })
    }

    /// Transition densities of the internal space between the pairs of references that are
    /// needed. Fock-contracted densities are only formed for pairs coupled in the amplitude
    /// equations; the source densities of other pairs enter multistate couplings only.
    fn pair_densities(
        &self,
        civecs: &[Civec],
        fock: &Array2<f64>,
        mo: &MOIntegrals,
    ) -> Result<PairDensities, anyhow::Error> {
        let nclosed = self.reference.nclosed;
        let nint = nclosed + self.reference.nact;
        let fint = fock.slice(s![..nint, ..nint]).to_owned();
        let hint = MOFile::new(mo, 0, nint)?;
        let embedded = civecs
            .iter()
            .map(|cc| cc.embed(nclosed))
            .collect::<Result<Vec<_>, _>>()?;
        PairDensities::compute(
            &embedded,
            nclosed,
            &fint,
            &hint,
            !self.parameters.sssr,
            self.parameters.ms || !self.parameters.sssr,
        )
    }

    /// Solves the amplitude equations of one state.
    fn solve(
        &self,
        tensors: &mut Caspt2Tensors,
        denom: &Denom,
        source: &MultiTensor,
        states: &[usize],
        e0: f64,
    ) -> Result<Amplitude, anyhow::Error> {
        let params = self.parameters;
        let mut t = source.clone();
        t.zero();
        if source.rms()? < params.source_skip_threshold {
            log::debug!("Source vector vanishes; the amplitudes are zero.");
            return Ok(Amplitude {
                t,
                hylleraas: 0.0,
                iterations: 0,
                converged: true,
            });
        }
        let nelement = tensors.nelement(states);

        casmr_output!("");
        let width = log_table_header(&format!(
            "{:>5} {:>22} {:>14}",
            "Iter", "E(Hylleraas)", "Residual RMS"
        ));
        let mut solver = LinearRM::new(
            params.max_subspace,
            source.clone(),
            params.linear_dependence_threshold,
        )?;
        let mut trial = denom.apply(source, e0)?;
        let mut hylleraas = 0.0;
        let mut iterations = 0;
        let mut converged = false;
        for iter in 0..params.max_iter {
            let Some(trial_n) = solver.orthonormalize(trial)? else {
                casmr_warn!("New CASPT2 trial vector is linearly dependent on the subspace.");
                break;
            };
            iterations = iter + 1;
            let sigma = tensors.sigma(&trial_n, states, e0, &self.comm)?;
            let residual = solver.compute_residual(trial_n, sigma)?;
            t = solver.civec()?;
            hylleraas = source.dot(&t)? + residual.dot(&t)?;
            let rms = (residual.dot(&residual)? / nelement.max(1) as f64).sqrt();
            casmr_output!("{iter:>5} {hylleraas:>+22.12} {rms:>14.3e}");
            if rms < params.thresh {
                converged = true;
                break;
            }
            trial = denom.apply(&residual, e0)?;
        }
        log_rule(width);
        Ok(Amplitude {
            t,
            hylleraas,
            iterations,
            converged,
        })
    }

    /// Runs CASPT2 for every reference state.
    pub fn compute(&self) -> Result<Caspt2Result, anyhow::Error> {
        let params = self.parameters;
        let r = self.reference;
        let n = self.nstate();
        let nint = r.nclosed + r.nact;

        log_subtitle("CASPT2");
        casmr_output!("");
        params.log_output_display();

        let mo = self.provider.mo_integrals(r.coeff.view())?;
        let fock = FockMatrices::compute(&mo, r.nclosed, &r.rdms.rdm1, &r.rdms.rdm2)?.fock;
        let reference = self.reference_hamiltonian(&fock)?;
        if params.xms {
            casmr_output!(
                "XMS zeroth-order energies: {}",
                reference.e0.iter().map(|e| format!("{e:+.10}")).join(", ")
            );
        }
        let densities = self.pair_densities(&reference.civecs, &fock, &mo)?;
        let eps_virt = fock.diag().slice(s![nint..]).to_owned();
        let mut tensors = Caspt2Tensors::new(
            &fock,
            &mo,
            &densities,
            nint,
            params.block_size,
            params.shuffle_seed,
        )?;

        let all_sources = params.ms || !params.sssr;
        let sources = (0..n)
            .map(|k| {
                let bras = if all_sources { (0..n).collect_vec() } else { vec![k] };
                tensors.source(k, &bras, &self.comm)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let joint_denom = if params.sssr {
            None
        } else {
            Some(Denom::new(
                &(0..n).collect_vec(),
                &densities,
                nint,
                eps_virt.clone(),
                params.metric_threshold,
            )?)
        };

        let mut amplitudes = Vec::with_capacity(n);
        let mut correlation = Vec::with_capacity(n);
        let mut norms = Vec::with_capacity(n);
        for i in 0..n {
            casmr_output!("");
            casmr_output!("Amplitude equations for state {i}");
            let states = self.coupled_states(i);
            let mut source = sources[i].clone();
            (0..n)
                .filter(|j| !states.contains(j))
                .flat_map(|j| Excitation::ALL.map(|c| c.component(j)))
                .for_each(|c| source.at_mut(c).zero());
            let state_denom;
            let denom = match joint_denom.as_ref() {
                Some(d) => d,
                None => {
                    state_denom = Denom::new(
                        &states,
                        &densities,
                        nint,
                        eps_virt.clone(),
                        params.metric_threshold,
                    )?;
                    &state_denom
                }
            };
            let e0 = reference.e0[i] - params.shift;
            let amplitude = self.solve(&mut tensors, denom, &source, &states, e0)?;
            if !amplitude.converged {
                casmr_warn!(
                    "CASPT2 amplitudes for state {i} did not converge within {} iterations.",
                    params.max_iter
                );
            }
            let norm = tensors.norm(&amplitude.t, &states, &self.comm)?;
            correlation.push(amplitude.hylleraas - params.shift * norm);
            norms.push(norm);
            amplitudes.push(amplitude);
        }

        let mut heff = reference.eref.clone();
        for i in 0..n {
            heff[(i, i)] += correlation[i];
        }
        if params.ms {
            if params.shift != 0.0 {
                casmr_warn!(
                    "The level-shift correction is applied to diagonal elements of the effective Hamiltonian only."
                );
            }
            for i in 0..n {
                for j in 0..i {
                    let coupling = 0.5
                        * (sources[j].dot(&amplitudes[i].t)? + sources[i].dot(&amplitudes[j].t)?);
                    heff[(i, j)] += coupling;
                    heff[(j, i)] += coupling;
                }
            }
        }

        let (energies, mixing) = if params.ms {
            let (w, u) = symmetric_eigh(&heff)?;
            let mixing = match reference.rotation.as_ref() {
                Some(rot) => rot.dot(&u),
                None => u,
            };
            (w.to_vec(), Some(mixing))
        } else {
            (heff.diag().to_vec(), None)
        };

        let result = Caspt2Result {
            reference_energies: r.energies.clone(),
            zeroth_order_energies: reference.e0,
            correlation_energies: correlation,
            norms,
            heff,
            energies,
            mixing,
            iterations: amplitudes.iter().map(|a| a.iterations).collect(),
            converged: amplitudes.iter().all(|a| a.converged),
        };
        casmr_output!("");
        result.log_output_display();
        Ok(result)
    }
}
