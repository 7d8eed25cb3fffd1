//! Complete-active-space self-consistent field.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{self, ensure, format_err};
use derive_builder::Builder;
use itertools::Itertools;
use log;
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::auxiliary::linalg::exp_antisymmetric;
use crate::civec::{Civec, CivecData, SubspaceVector};
use crate::determinant::Determinants;
use crate::fci::{Fci, FciParams};
use crate::integrals::{check_orthonormal, IntegralProvider, MOFile};
use crate::io::format::{
    casmr_output, casmr_warn, convergence_note, log_rule, log_subtitle, log_table_header, nice_bool,
};
use crate::io::{read_casmr_binary, write_casmr_binary, CasmrFile, CasmrFileType};
use crate::rdm::Rdms;

pub mod fock;
pub mod optimizer;
pub mod rotfile;
pub mod superci;

pub use fock::FockMatrices;
pub use optimizer::{
    BfgsOptimizer, OptimizerKind, OptimizerSnapshot, OrbitalOptimizer, SuperCiOptimizer,
};
pub use rotfile::RotFile;

#[cfg(test)]
#[path = "casscf_tests.rs"]
mod casscf_tests;

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

fn default_optimizer() -> OptimizerKind {
    OptimizerKind::SuperCi
}

fn default_bfgs_history() -> usize {
    10
}

fn default_max_step() -> f64 {
    0.5
}

fn default_occupation_threshold() -> f64 {
    1.0e-10
}

fn default_denominator_floor() -> f64 {
    1.0e-2
}

/// Structure containing control parameters for CASSCF.
#[derive(Clone, Builder, Debug, Serialize, Deserialize)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct CasscfParams {
    /// Number of doubly occupied closed orbitals.
    pub nclosed: usize,

    /// Number of active orbitals.
    pub nact: usize,

    /// Number of active alpha electrons.
    pub nelea: usize,

    /// Number of active beta electrons.
    pub neleb: usize,

    /// Maximum number of macro-iterations.
    #[builder(default = "default_max_iter()")]
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,

    /// Convergence threshold on the RMS of the SuperCI gradient.
    #[builder(default = "default_thresh()")]
    #[serde(default = "default_thresh")]
    pub thresh: f64,

    /// The orbital optimiser.
    #[builder(default = "default_optimizer()")]
    #[serde(default = "default_optimizer")]
    pub optimizer: OptimizerKind,

    /// Number of curvature pairs kept by the BFGS optimiser.
    #[builder(default = "default_bfgs_history()")]
    #[serde(default = "default_bfgs_history")]
    pub bfgs_history: usize,

    /// Largest allowed rotation parameter in one step.
    #[builder(default = "default_max_step()")]
    #[serde(default = "default_max_step")]
    pub max_step: f64,

    /// Natural occupations (or holes) below this are treated as zero in the SuperCI gradient.
    #[builder(default = "default_occupation_threshold()")]
    #[serde(default = "default_occupation_threshold")]
    pub occupation_threshold: f64,

    /// Lower bound on the diagonal SuperCI denominators.
    #[builder(default = "default_denominator_floor()")]
    #[serde(default = "default_denominator_floor")]
    pub denominator_floor: f64,

    /// File stem for checkpoints written after every macro-iteration.
    #[builder(default = "None")]
    #[serde(default)]
    pub checkpoint: Option<String>,

    /// File stem of a checkpoint to restart from.
    #[builder(default = "None")]
    #[serde(default)]
    pub restart: Option<String>,
}

impl CasscfParams {
    /// Returns a builder to construct a [`CasscfParams`] structure.
    pub fn builder() -> CasscfParamsBuilder {
        CasscfParamsBuilder::default()
    }

    /// The number of occupied (closed plus active) orbitals.
    pub fn nocc(&self) -> usize {
        self.nclosed + self.nact
    }
}

impl CasscfParamsBuilder {
    fn validate(&self) -> Result<(), String> {
        let nact = self.nact.ok_or("Number of active orbitals not set.")?;
        let nelea = self.nelea.ok_or("Number of active alpha electrons not set.")?;
        let neleb = self.neleb.ok_or("Number of active beta electrons not set.")?;
        if nelea > nact || neleb > nact {
            return Err(format!(
                "{nelea} alpha and {neleb} beta electrons do not fit into {nact} active orbitals."
            ));
        }
        if self.max_step.unwrap_or_else(default_max_step) <= 0.0 {
            return Err("Maximum orbital step must be positive.".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for CasscfParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Active space: {} closed, {} active ({}α, {}β)",
            self.nclosed, self.nact, self.nelea, self.neleb
        )?;
        writeln!(f, "Orbital optimiser: {}", self.optimizer)?;
        if self.optimizer == OptimizerKind::Bfgs {
            writeln!(f, "BFGS history: {}", self.bfgs_history)?;
        }
        writeln!(f, "Maximum macro-iterations: {}", self.max_iter)?;
        writeln!(f, "Gradient threshold: {:.3e}", self.thresh)?;
        writeln!(f, "Maximum step: {:.3e}", self.max_step)?;
        writeln!(f, "Occupation threshold: {:.3e}", self.occupation_threshold)?;
        writeln!(f, "Denominator floor: {:.3e}", self.denominator_floor)?;
        writeln!(f, "Checkpointing: {}", nice_bool(self.checkpoint.is_some()))?;
        if let Some(restart) = self.restart.as_ref() {
            writeln!(f, "Restart from: {restart}")?;
        }
        Ok(())
    }
}

// ----------
// Checkpoint
// ----------

/// The macro-iteration state saved after every orbital update.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CasscfCheckpoint {
    /// The next macro-iteration to run.
    pub iteration: usize,

    /// The orbital coefficients to start that iteration from.
    pub coeff: Array2<f64>,

    /// The CI vectors used as Davidson guesses.
    pub civecs: Vec<CivecData>,

    /// The optimiser history.
    pub optimizer: OptimizerSnapshot,

    /// The state energies of the last completed iteration.
    pub energies: Vec<f64>,
}

impl CasmrFile for CasscfCheckpoint {
    const FILE_TYPE: CasmrFileType = CasmrFileType::Chk;
}

// ------
// Result
// ------

/// A converged (or best available) CASSCF wavefunction.
#[derive(Clone, Debug)]
pub struct CasscfResult {
    /// Total state energies.
    pub energies: Vec<f64>,

    /// The state-averaging weights.
    pub weights: Vec<f64>,

    /// Orbital coefficients: natural orbitals in the active space, semicanonical closed and
    /// virtual orbitals.
    pub coeff: Array2<f64>,

    /// The determinant space of the active electrons.
    pub det: Arc<Determinants>,

    /// The CI vectors in the final orbitals.
    pub civecs: Vec<Civec>,

    /// Active natural occupations.
    pub occupations: Array1<f64>,

    /// State-averaged densities in the final orbitals.
    pub rdms: Rdms,

    /// Number of closed orbitals.
    pub nclosed: usize,

    /// Number of active orbitals.
    pub nact: usize,

    /// RMS of the last SuperCI gradient.
    pub gradient_rms: f64,

    /// Number of macro-iterations performed.
    pub iterations: usize,

    /// Boolean indicating if the gradient threshold was reached.
    pub converged: bool,
}

/// Plain-data record of a [`CasscfResult`] for result files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CasscfRecord {
    pub energies: Vec<f64>,
    pub weights: Vec<f64>,
    pub coeff: Array2<f64>,
    pub civecs: Vec<CivecData>,
    pub occupations: Array1<f64>,
    pub nclosed: usize,
    pub nact: usize,
    pub converged: bool,
}

impl CasmrFile for CasscfRecord {
    const FILE_TYPE: CasmrFileType = CasmrFileType::Cas;
}

impl CasscfResult {
    /// The weighted average energy.
    pub fn averaged_energy(&self) -> f64 {
        self.energies
            .iter()
            .zip(self.weights.iter())
            .map(|(e, w)| e * w)
            .sum()
    }

    /// Writes the result as a `casmr` binary file.
    pub fn write<P: AsRef<Path>>(&self, name: P) -> Result<(), anyhow::Error> {
        let record = CasscfRecord {
            energies: self.energies.clone(),
            weights: self.weights.clone(),
            coeff: self.coeff.clone(),
            civecs: self.civecs.iter().map(CivecData::from).collect(),
            occupations: self.occupations.clone(),
            nclosed: self.nclosed,
            nact: self.nact,
            converged: self.converged,
        };
        write_casmr_binary(name, &record)?;
        Ok(())
    }
}

impl fmt::Display for CasscfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.energies.iter().enumerate() {
            writeln!(
                f,
                "State {i:>2}: E(CASSCF) = {e:>+20.12}{}",
                convergence_note(self.converged)
            )?;
        }
        if self.energies.len() > 1 {
            writeln!(f, "Averaged: E(SA-CASSCF) = {:>+20.12}", self.averaged_energy())?;
        }
        writeln!(
            f,
            "Natural occupations: {}",
            self.occupations.iter().map(|n| format!("{n:.6}")).join(" ")
        )?;
        Ok(())
    }
}

// ------
// Solver
// ------

/// One CASCI solution in a fixed orbital basis.
struct Casci {
    energies: Vec<f64>,
    civecs: Vec<Civec>,
    rdms: Rdms,
    converged: bool,
}

/// CASSCF macro-iteration driver.
pub struct Casscf<'a> {
    provider: &'a dyn IntegralProvider,
    parameters: &'a CasscfParams,
    fci_parameters: &'a FciParams,
    det: Arc<Determinants>,
}

impl<'a> Casscf<'a> {
    /// Sets up the solver.
    ///
    /// # Errors
    ///
    /// Errors if the orbital partition does not fit into the basis or if the state-averaging
    /// parameters are inconsistent.
    pub fn new(
        provider: &'a dyn IntegralProvider,
        parameters: &'a CasscfParams,
        fci_parameters: &'a FciParams,
    ) -> Result<Self, anyhow::Error> {
        ensure!(
            parameters.nocc() <= provider.nbasis(),
            "{} closed and {} active orbitals exceed the {} basis functions.",
            parameters.nclosed,
            parameters.nact,
            provider.nbasis()
        );
        fci_parameters.check()?;
        let det = Arc::new(Determinants::new(
            parameters.nact,
            parameters.nelea,
            parameters.neleb,
        )?);
        Ok(Self {
            provider,
            parameters,
            fci_parameters,
            det,
        })
    }

    /// The determinant space of the active electrons.
    pub fn det(&self) -> &Arc<Determinants> {
        &self.det
    }

    fn build_optimizer(&self) -> Box<dyn OrbitalOptimizer> {
        match self.parameters.optimizer {
            OptimizerKind::SuperCi => Box::new(SuperCiOptimizer::new(self.parameters.max_step)),
            OptimizerKind::Bfgs => Box::new(BfgsOptimizer::new(
                self.parameters.max_step,
                self.parameters.bfgs_history,
            )),
        }
    }

    fn casci(&self, coeff: &Array2<f64>, guesses: Option<&[Civec]>) -> Result<Casci, anyhow::Error> {
        let mo = self.provider.mo_integrals(coeff.view())?;
        let mofile = MOFile::new(&mo, self.parameters.nclosed, self.parameters.nact)?;
        let fci = Fci::new(self.det.clone(), &mofile, self.fci_parameters)?;
        let roots = fci.compute(guesses)?;
        if !roots.converged {
            casmr_warn!("CASCI roots did not converge within {} Davidson iterations.", roots.iterations);
        }
        let states = Rdms::compute_states(&roots.civecs)?;
        let rdms = Rdms::averaged(&states, &self.fci_parameters.state_weights())?;
        Ok(Casci {
            energies: roots.energies,
            civecs: roots.civecs,
            rdms,
            converged: roots.converged,
        })
    }

    /// Rotates the active columns of `coeff` into natural orbitals of `rdms`.
    fn to_natural_orbitals(
        &self,
        coeff: &mut Array2<f64>,
        rdms: &Rdms,
    ) -> Result<(Array1<f64>, Array2<f64>, Rdms), anyhow::Error> {
        let (occ, u) = rdms.natural_orbitals()?;
        let act = self.parameters.nclosed..self.parameters.nocc();
        let rotated = coeff.slice(s![.., act.clone()]).dot(&u);
        coeff.slice_mut(s![.., act]).assign(&rotated);
        let rdms = rdms.transform(&u)?;
        Ok((occ, u, rdms))
    }

    fn initial_state(
        &self,
        coeff: Array2<f64>,
        optimizer: &mut dyn OrbitalOptimizer,
    ) -> Result<(usize, Array2<f64>, Option<Vec<Civec>>), anyhow::Error> {
        match self.parameters.restart.as_ref() {
            Some(stem) => {
                let chk: CasscfCheckpoint = read_casmr_binary(stem)?;
                ensure!(
                    chk.coeff.dim() == coeff.dim(),
                    "Checkpointed coefficients of shape {:?} do not match {:?}.",
                    chk.coeff.dim(),
                    coeff.dim()
                );
                let civecs = chk
                    .civecs
                    .iter()
                    .map(|cc| cc.restore(self.det.clone()))
                    .collect::<Result<Vec<_>, _>>()?;
                optimizer.restore(chk.optimizer)?;
                log::info!("Restarting CASSCF at macro-iteration {}.", chk.iteration);
                Ok((chk.iteration, chk.coeff, Some(civecs)))
            }
            None => Ok((0, coeff, None)),
        }
    }

    /// Runs the macro-iterations from the orbital coefficients `coeff` (basis functions along
    /// rows, orbitals ordered closed, active, virtual along columns).
    ///
    /// # Returns
    ///
    /// The final wavefunction, flagged as converged or not.
    pub fn compute(&self, coeff: Array2<f64>) -> Result<CasscfResult, anyhow::Error> {
        ensure!(
            coeff.nrows() == self.provider.nbasis() && coeff.ncols() >= self.parameters.nocc(),
            "Coefficient matrix of shape {:?} does not fit the basis and active space.",
            coeff.dim()
        );
        check_orthonormal(coeff.view(), 1.0e-8)?;
        let params = self.parameters;
        let mut optimizer = self.build_optimizer();
        let (start, mut coeff, mut civecs) = self.initial_state(coeff, optimizer.as_mut())?;

        log_subtitle("CASSCF macro-iterations");
        casmr_output!("");
        let width = log_table_header(&format!(
            "{:>5} {:>22} {:>14} {:>14}",
            "Iter", "Energy", "Grad RMS", "Step"
        ));

        let mut converged = false;
        let mut iterations = start;
        let mut gradient_rms = f64::INFINITY;
        for iter in start..params.max_iter {
            iterations = iter + 1;
            let casci = self.casci(&coeff, civecs.as_deref())?;
            let (occ, u, rdms) = self.to_natural_orbitals(&mut coeff, &casci.rdms)?;
            optimizer.rotate_active(&u)?;
            let mo = self.provider.mo_integrals(coeff.view())?;
            let fock = FockMatrices::compute(&mo, params.nclosed, &rdms.rdm1, &rdms.rdm2)?;

            let sigma = superci::superci_gradient(&fock, &occ, params.occupation_threshold);
            gradient_rms = if sigma.size() == 0 { 0.0 } else { sigma.rms()? };
            let energy = casci
                .energies
                .iter()
                .zip(self.fci_parameters.state_weights().iter())
                .map(|(e, w)| e * w)
                .sum::<f64>();
            civecs = Some(casci.civecs);

            if gradient_rms < params.thresh {
                casmr_output!("{iter:>5} {energy:>+22.12} {gradient_rms:>14.3e} {:>14}", "--");
                converged = true;
                break;
            }

            let denom = superci::superci_denominators(&fock, &occ);
            let norm = superci::superci_normalisation(
                params.nclosed,
                fock.nvirt(),
                &occ,
                params.occupation_threshold,
            );
            let (grad, hess) =
                superci::to_rotation_space(&sigma, &denom, &norm, params.denominator_floor);
            let kappa = optimizer.step(&grad, &hess)?;
            casmr_output!(
                "{iter:>5} {energy:>+22.12} {gradient_rms:>14.3e} {:>14.3e}",
                kappa.max_abs()
            );
            coeff = coeff.dot(&exp_antisymmetric(&kappa.unpack())?);

            if let Some(stem) = params.checkpoint.as_ref() {
                let chk = CasscfCheckpoint {
                    iteration: iter + 1,
                    coeff: coeff.clone(),
                    civecs: civecs
                        .as_ref()
                        .map(|cc| cc.iter().map(CivecData::from).collect())
                        .unwrap_or_default(),
                    optimizer: optimizer.snapshot(),
                    energies: casci.energies.clone(),
                };
                write_casmr_binary(stem, &chk)?;
            }
        }
        log_rule(width);
        if !converged {
            casmr_warn!(
                "CASSCF did not reach the gradient threshold within {} macro-iterations.",
                params.max_iter
            );
        }
        self.finalise(coeff, civecs, gradient_rms, iterations, converged)
    }

    /// Semicanonicalises the closed and virtual orbitals, rotates the active orbitals to natural
    /// orbitals and re-solves the CASCI problem so that the CI vectors match the final orbitals.
    fn finalise(
        &self,
        mut coeff: Array2<f64>,
        civecs: Option<Vec<Civec>>,
        gradient_rms: f64,
        iterations: usize,
        converged: bool,
    ) -> Result<CasscfResult, anyhow::Error> {
        let params = self.parameters;
        let casci = self.casci(&coeff, civecs.as_deref())?;
        let (_, _, rdms) = self.to_natural_orbitals(&mut coeff, &casci.rdms)?;
        let fock = FockMatrices::compute(
            &self.provider.mo_integrals(coeff.view())?,
            params.nclosed,
            &rdms.rdm1,
            &rdms.rdm2,
        )?;
        let semi = fock::semicanonical_rotation(&fock.fock, params.nclosed, params.nact)?;
        coeff = coeff.dot(&semi);

        let casci = self.casci(&coeff, None)?;
        let occupations = casci.rdms.rdm1.diag().to_owned();
        let weights = self.fci_parameters.state_weights();
        log::debug!(
            "Final CASCI in natural orbitals: {} (Davidson {})",
            casci.energies.iter().map(|e| format!("{e:.12}")).join(", "),
            convergence_note(casci.converged).trim()
        );
        Ok(CasscfResult {
            energies: casci.energies,
            weights,
            coeff,
            det: self.det.clone(),
            civecs: casci.civecs,
            occupations,
            rdms: casci.rdms,
            nclosed: params.nclosed,
            nact: params.nact,
            gradient_rms,
            iterations,
            converged,
        })
    }
}

/// Reads a checkpoint written by [`Casscf::compute`].
pub fn read_checkpoint<P: AsRef<Path>>(name: P) -> Result<CasscfCheckpoint, anyhow::Error> {
    read_casmr_binary(name)
        .map_err(|err| format_err!("Unable to read CASSCF checkpoint: {err}"))
}
