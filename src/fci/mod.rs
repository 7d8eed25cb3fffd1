//! Full configuration interaction within an active space.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::{self, ensure};
use derive_builder::Builder;
use itertools::Itertools;
use log;
use ndarray::{Array2, Zip};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::civec::{Civec, DistCivec};
use crate::davidson::{DavidsonControl, DavidsonDiag, DavidsonResult};
use crate::determinant::Determinants;
use crate::integrals::MOFile;
use crate::io::format::{casmr_output, convergence_note, log_subtitle, nice_bool};
use crate::parallel::CommHandle;

pub mod sigma;

#[cfg(test)]
#[path = "fci_tests.rs"]
mod fci_tests;

// ==================
// Struct definitions
// ==================

// ----------
// Parameters
// ----------

fn default_max_iter() -> usize {
    100
}

fn default_davidson_subspace() -> usize {
    20
}

fn default_thresh() -> f64 {
    1.0e-10
}

fn default_print_thresh() -> f64 {
    0.05
}

fn default_nstate() -> usize {
    1
}

fn default_denominator_floor() -> f64 {
    0.1
}

fn default_linear_dependence_threshold() -> f64 {
    1.0e-8
}

fn default_print_iterations() -> bool {
    true
}

/// Structure containing control parameters for full configuration interaction.
#[derive(Clone, Builder, Debug, Serialize, Deserialize)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct FciParams {
    /// Maximum number of Davidson iterations.
    #[builder(default = "default_max_iter()")]
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,

    /// Maximum number of vectors held in the Davidson subspace.
    #[builder(default = "default_davidson_subspace()")]
    #[serde(default = "default_davidson_subspace")]
    pub davidson_subspace: usize,

    /// Number of guess vectors. If `None`, one guess per requested state is generated.
    #[builder(default = "None")]
    #[serde(default)]
    pub nguess: Option<usize>,

    /// Residual-norm convergence threshold.
    #[builder(default = "default_thresh()")]
    #[serde(default = "default_thresh")]
    pub thresh: f64,

    /// Coefficients with magnitudes above this are printed.
    #[builder(default = "default_print_thresh()")]
    #[serde(default = "default_print_thresh")]
    pub print_thresh: f64,

    /// Number of states.
    #[builder(default = "default_nstate()")]
    #[serde(default = "default_nstate")]
    pub nstate: usize,

    /// State-averaging weights. If `None`, all states are weighted equally.
    #[builder(default = "None")]
    #[serde(default)]
    pub weights: Option<Vec<f64>>,

    /// Lower bound on $`H_{II} - E`$ in the Davidson preconditioner.
    #[builder(default = "default_denominator_floor()")]
    #[serde(default = "default_denominator_floor")]
    pub denominator_floor: f64,

    /// Trial vectors with norms below this after orthogonalisation are dropped.
    #[builder(default = "default_linear_dependence_threshold()")]
    #[serde(default = "default_linear_dependence_threshold")]
    pub linear_dependence_threshold: f64,

    /// Boolean indicating if the Davidson iteration table is written to the output log.
    #[builder(default = "default_print_iterations()")]
    #[serde(default = "default_print_iterations")]
    pub print_iterations: bool,
}

impl FciParams {
    /// Returns a builder to construct a [`FciParams`] structure.
    pub fn builder() -> FciParamsBuilder {
        FciParamsBuilder::default()
    }

    /// The state-averaging weights, equal by default.
    pub fn state_weights(&self) -> Vec<f64> {
        self.weights
            .clone()
            .unwrap_or_else(|| vec![1.0 / self.nstate as f64; self.nstate])
    }

    /// Checks the parameters after deserialisation.
    pub fn check(&self) -> Result<(), anyhow::Error> {
        check_weights(self.nstate, self.weights.as_deref()).map_err(|err| anyhow::format_err!(err))
    }

    fn davidson_control(&self) -> DavidsonControl {
        DavidsonControl {
            max_iter: self.max_iter,
            thresh: self.thresh,
            linear_dependence_threshold: self.linear_dependence_threshold,
            verbose: self.print_iterations,
        }
    }
}

fn check_weights(nstate: usize, weights: Option<&[f64]>) -> Result<(), String> {
    if nstate == 0 {
        return Err("At least one state must be requested.".to_string());
    }
    if let Some(weights) = weights {
        if weights.len() != nstate {
            return Err(format!(
                "{} state-averaging weights given for {nstate} states.",
                weights.len()
            ));
        }
        if weights.iter().any(|&w| w < 0.0) {
            return Err("State-averaging weights must be non-negative.".to_string());
        }
    }
    Ok(())
}

impl FciParamsBuilder {
    fn validate(&self) -> Result<(), String> {
        let nstate = self.nstate.unwrap_or_else(default_nstate);
        let weights = self.weights.clone().flatten();
        check_weights(nstate, weights.as_deref())
    }
}

impl Default for FciParams {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Unable to build a default `FciParams`.")
    }
}

impl fmt::Display for FciParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Number of states: {}", self.nstate)?;
        writeln!(
            f,
            "State-averaging weights: {}",
            self.state_weights()
                .iter()
                .map(|w| format!("{w:.4}"))
                .join(", ")
        )?;
        writeln!(f, "Maximum Davidson iterations: {}", self.max_iter)?;
        writeln!(f, "Davidson subspace size: {}", self.davidson_subspace)?;
        writeln!(
            f,
            "Number of guess vectors: {}",
            self.nguess.unwrap_or(self.nstate)
        )?;
        writeln!(f, "Convergence threshold: {:.3e}", self.thresh)?;
        writeln!(f, "Denominator floor: {:.3e}", self.denominator_floor)?;
        writeln!(
            f,
            "Linear-dependence threshold: {:.3e}",
            self.linear_dependence_threshold
        )?;
        writeln!(
            f,
            "Print Davidson iterations: {}",
            nice_bool(self.print_iterations)
        )?;
        Ok(())
    }
}

// ------
// Result
// ------

/// The roots of an FCI calculation.
#[derive(Clone, Debug)]
pub struct FciResult {
    /// Total energies including the core energy.
    pub energies: Vec<f64>,

    /// The CI vectors.
    pub civecs: Vec<Civec>,

    /// Final residual norms.
    pub residual_norms: Vec<f64>,

    /// Number of Davidson iterations performed.
    pub iterations: usize,

    /// Boolean indicating if every root converged.
    pub converged: bool,
}

impl FciResult {
    fn from_davidson(davidson: DavidsonResult<Civec>, core_energy: f64) -> Self {
        Self {
            energies: davidson.energies.iter().map(|e| e + core_energy).collect(),
            civecs: davidson.vectors,
            residual_norms: davidson.residual_norms,
            iterations: davidson.iterations,
            converged: davidson.converged,
        }
    }

    /// The weighted average energy.
    pub fn averaged_energy(&self, weights: &[f64]) -> f64 {
        self.energies
            .iter()
            .zip(weights.iter())
            .map(|(e, w)| e * w)
            .sum()
    }
}

// ------
// Solver
// ------

/// Full configuration interaction solver for one active-space Hamiltonian.
pub struct Fci<'a> {
    det: Arc<Determinants>,
    mofile: &'a MOFile,
    parameters: &'a FciParams,

    /// Diagonal Hamiltonian elements without the core energy.
    denom: Array2<f64>,
}

impl<'a> Fci<'a> {
    /// Sets up the solver.
    ///
    /// # Errors
    ///
    /// Errors if the determinant space and the active-space integrals disagree in orbital count.
    pub fn new(
        det: Arc<Determinants>,
        mofile: &'a MOFile,
        parameters: &'a FciParams,
    ) -> Result<Self, anyhow::Error> {
        ensure!(
            det.norb() == mofile.nact(),
            "Determinant space has {} orbitals but the active-space Hamiltonian has {}.",
            det.norb(),
            mofile.nact()
        );
        ensure!(
            parameters.nstate <= det.size(),
            "{} states requested from only {} determinants.",
            parameters.nstate,
            det.size()
        );
        let denom = sigma::diagonal(&det, mofile);
        Ok(Self {
            det,
            mofile,
            parameters,
            denom,
        })
    }

    /// The determinant space.
    pub fn det(&self) -> &Arc<Determinants> {
        &self.det
    }

    /// The diagonal Hamiltonian elements without the core energy.
    pub fn denom(&self) -> &Array2<f64> {
        &self.denom
    }

    /// Applies the Hamiltonian (without the core energy) to `cc`.
    pub fn sigma(&self, cc: &Civec) -> Result<Civec, anyhow::Error> {
        sigma::sigma(cc, self.mofile)
    }

    /// Generates guess vectors from the determinants with the lowest diagonal energies. With
    /// equal alpha and beta electron counts, each guess is symmetrised under spin flip, which
    /// keeps the Davidson subspace within states of even spin.
    pub fn generate_guess(&self, nguess: usize) -> Result<Vec<Civec>, anyhow::Error> {
        let flip = self.det.nelea() == self.det.neleb();
        let order = self
            .denom
            .indexed_iter()
            .sorted_by_key(|(idx, v)| (OrderedFloat(**v), *idx))
            .map(|(idx, _)| idx)
            .collect_vec();
        let mut used = HashSet::new();
        let mut guesses = vec![];
        for (ia, ib) in order {
            if guesses.len() == nguess {
                break;
            }
            if !used.insert((ia, ib)) {
                continue;
            }
            let mut cc = Civec::zeros(self.det.clone());
            if flip && ia != ib {
                used.insert((ib, ia));
                cc.data_mut()[(ia, ib)] = std::f64::consts::FRAC_1_SQRT_2;
                cc.data_mut()[(ib, ia)] = std::f64::consts::FRAC_1_SQRT_2;
            } else {
                cc.data_mut()[(ia, ib)] = 1.0;
            }
            log::debug!(
                "FCI guess {}: {}",
                guesses.len(),
                self.det.occupation_label(ia, ib)
            );
            guesses.push(cc);
        }
        ensure!(
            guesses.len() >= self.parameters.nstate,
            "Could only generate {} guess vectors for {} states.",
            guesses.len(),
            self.parameters.nstate
        );
        Ok(guesses)
    }

    fn precondition(&self, residual: &Array2<f64>, energy: f64) -> Array2<f64> {
        let floor = self.parameters.denominator_floor;
        let mut out = residual.clone();
        Zip::from(&mut out)
            .and(&self.denom)
            .for_each(|t, &d| *t = -*t / (d - energy).max(floor));
        out
    }

    fn nguess(&self) -> usize {
        self.parameters
            .nguess
            .unwrap_or(self.parameters.nstate)
            .max(self.parameters.nstate)
    }

    /// Solves for the lowest states.
    ///
    /// # Arguments
    ///
    /// * `initial` - Optional starting vectors (*e.g.* from a previous macro-iteration); fresh
    /// guesses are generated otherwise.
    ///
    /// # Returns
    ///
    /// The roots, flagged as converged or not.
    pub fn compute(&self, initial: Option<&[Civec]>) -> Result<FciResult, anyhow::Error> {
        let guesses = match initial {
            Some(cc) => cc.to_vec(),
            None => self.generate_guess(self.nguess())?,
        };
        let davidson = DavidsonDiag::new(
            self.parameters.nstate,
            self.parameters.davidson_subspace,
            self.parameters.linear_dependence_threshold,
        )?;
        let result = davidson.solve(
            guesses,
            &self.parameters.davidson_control(),
            |cc| self.sigma(cc),
            |r, e| {
                let data = self.precondition(&r.data().to_owned(), e);
                Civec::from_array(self.det.clone(), data)
            },
        )?;
        Ok(FciResult::from_davidson(result, self.mofile.core_energy()))
    }

    /// Solves for the lowest states with CI vectors distributed over the ranks of `comm`.
    /// Collective; the returned vectors are gathered on every rank.
    pub fn compute_distributed(
        &self,
        comm: CommHandle,
        initial: Option<&[Civec]>,
    ) -> Result<FciResult, anyhow::Error> {
        let guesses = match initial {
            Some(cc) => cc.to_vec(),
            None => self.generate_guess(self.nguess())?,
        }
        .iter()
        .map(|cc| DistCivec::from_civec(cc, comm.clone()))
        .collect_vec();
        let davidson = DavidsonDiag::new(
            self.parameters.nstate,
            self.parameters.davidson_subspace,
            self.parameters.linear_dependence_threshold,
        )?;
        let result = davidson.solve(
            guesses,
            &self.parameters.davidson_control(),
            |cc| sigma::sigma_distributed(cc, self.mofile),
            |r, e| {
                let range = r.local_range();
                let denom = self.denom.slice(ndarray::s![range, ..]);
                let floor = self.parameters.denominator_floor;
                let mut out = r.clone();
                Zip::from(out.local_mut())
                    .and(&denom)
                    .for_each(|t, &d| *t = -*t / (d - e).max(floor));
                Ok(out)
            },
        )?;
        let civecs = result
            .vectors
            .iter()
            .map(|cc| cc.to_civec())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FciResult {
            energies: result
                .energies
                .iter()
                .map(|e| e + self.mofile.core_energy())
                .collect(),
            civecs,
            residual_norms: result.residual_norms,
            iterations: result.iterations,
            converged: result.converged,
        })
    }

    /// Logs the energies and leading determinants of each root.
    pub fn print(&self, result: &FciResult) {
        log_subtitle("FCI roots");
        casmr_output!("");
        for (i, (e, cc)) in result.energies.iter().zip(result.civecs.iter()).enumerate() {
            casmr_output!(
                "State {i:>2}: E = {e:>+20.12}{}",
                convergence_note(result.converged)
            );
            for (label, c) in cc.leading_determinants(self.parameters.print_thresh) {
                casmr_output!("    {label}  {c:>+14.8}");
            }
        }
        casmr_output!("");
    }
}
