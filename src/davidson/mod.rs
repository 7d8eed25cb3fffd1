//! Davidson diagonalisation over implicitly represented symmetric operators.

use std::fmt;

use anyhow::{self, ensure};
use derive_builder::Builder;
use itertools::Itertools;
use log;
use ndarray::{Array1, Array2};

use crate::auxiliary::linalg::symmetric_eigh;
use crate::civec::SubspaceVector;
use crate::io::format::{casmr_output, convergence_note, log_rule, log_table_header};

#[cfg(test)]
#[path = "davidson_tests.rs"]
mod davidson_tests;

// ==================
// Struct definitions
// ==================

// ----------
// Parameters
// ----------

/// Controls for one Davidson solve.
#[derive(Clone, Builder, Debug)]
pub struct DavidsonControl {
    /// Maximum number of iterations.
    #[builder(default = "100")]
    pub max_iter: usize,

    /// Residual-norm threshold below which a root is converged.
    #[builder(default = "1.0e-10")]
    pub thresh: f64,

    /// Trial vectors with norms below this after orthogonalisation are dropped.
    #[builder(default = "1.0e-8")]
    pub linear_dependence_threshold: f64,

    /// Boolean indicating if the iteration table is written to the output log.
    #[builder(default = "false")]
    pub verbose: bool,
}

impl DavidsonControl {
    /// Returns a builder to construct a [`DavidsonControl`] structure.
    pub fn builder() -> DavidsonControlBuilder {
        DavidsonControlBuilder::default()
    }
}

impl Default for DavidsonControl {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Unable to build a default `DavidsonControl`.")
    }
}

// ------
// Result
// ------

/// The outcome of a Davidson solve. Non-convergence is reported here and never as an error.
#[derive(Clone, Debug)]
pub struct DavidsonResult<V> {
    /// The lowest eigenvalues, in ascending order.
    pub energies: Vec<f64>,

    /// The corresponding Ritz vectors.
    pub vectors: Vec<V>,

    /// The final residual norms.
    pub residual_norms: Vec<f64>,

    /// The number of iterations performed.
    pub iterations: usize,

    /// Boolean indicating if every requested root converged.
    pub converged: bool,
}

impl<V> fmt::Display for DavidsonResult<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (e, r)) in self.energies.iter().zip(self.residual_norms.iter()).enumerate() {
            writeln!(
                f,
                "Root {i:>2}: {e:>+20.12}  |r| = {r:.3e}{}",
                convergence_note(self.converged)
            )?;
        }
        Ok(())
    }
}

// ---------
// Subspace
// ---------

/// The Davidson subspace for the `nstate` lowest roots: orthonormal basis vectors, their
/// sigma vectors and the projected operator.
///
/// The subspace lives for exactly one solve and is discarded afterwards.
#[derive(Clone, Debug)]
pub struct DavidsonDiag<V: SubspaceVector> {
    nstate: usize,
    max_subspace: usize,
    lindep_thresh: f64,
    basis: Vec<V>,
    sigma: Vec<V>,

    /// Projected operator $`\langle c_m | \sigma_n \rangle`$.
    mat: Array2<f64>,

    /// Current Ritz values.
    eig: Array1<f64>,

    /// Current Ritz coefficients, one column per root.
    coeffs: Array2<f64>,
}

impl<V: SubspaceVector> DavidsonDiag<V> {
    /// Creates an empty subspace for `nstate` roots with at most `max_subspace` vectors.
    pub fn new(nstate: usize, max_subspace: usize, lindep_thresh: f64) -> Result<Self, anyhow::Error> {
        ensure!(nstate > 0, "At least one root must be requested.");
        ensure!(
            max_subspace >= 2 * nstate,
            "A Davidson subspace of {max_subspace} cannot hold twice the {nstate} requested roots."
        );
        Ok(Self {
            nstate,
            max_subspace,
            lindep_thresh,
            basis: vec![],
            sigma: vec![],
            mat: Array2::zeros((0, 0)),
            eig: Array1::zeros(0),
            coeffs: Array2::zeros((0, 0)),
        })
    }

    /// The number of basis vectors currently held.
    pub fn len(&self) -> usize {
        self.basis.len()
    }

    /// Returns `true` if the subspace is empty.
    pub fn is_empty(&self) -> bool {
        self.basis.is_empty()
    }

    /// Orthonormalises `v` against the subspace and the already accepted vectors `pending` by
    /// modified Gram-Schmidt, returning `None` if the remainder is numerically dependent.
    pub fn orthonormalize(&self, mut v: V, pending: &[V]) -> Result<Option<V>, anyhow::Error> {
        // Two passes restore orthogonality lost to cancellation.
        for _ in 0..2 {
            for b in self.basis.iter().chain(pending.iter()) {
                let ovl = b.dot(&v)?;
                v.ax_plus_y(-ovl, b)?;
            }
        }
        let norm = v.norm()?;
        if norm < self.lindep_thresh {
            log::debug!("Dropping linearly dependent trial vector (norm {norm:.3e}).");
            return Ok(None);
        }
        v.scale(1.0 / norm);
        Ok(Some(v))
    }

    /// Adds orthonormal trial vectors and their sigma vectors, collapsing onto the current Ritz
    /// vectors first if the subspace would overflow, and returns the updated Ritz values.
    pub fn compute(&mut self, cc: Vec<V>, sigma: Vec<V>) -> Result<Array1<f64>, anyhow::Error> {
        ensure!(
            cc.len() == sigma.len(),
            "Received {} trial vectors but {} sigma vectors.",
            cc.len(),
            sigma.len()
        );
        if !self.basis.is_empty() && self.basis.len() + cc.len() > self.max_subspace {
            self.collapse()?;
        }
        let nold = self.basis.len();
        self.basis.extend(cc);
        self.sigma.extend(sigma);
        let n = self.basis.len();
        let mut mat = Array2::<f64>::zeros((n, n));
        mat.slice_mut(ndarray::s![..nold, ..nold])
            .assign(&self.mat);
        for i in 0..n {
            for j in nold.max(i)..n {
                let v = self.basis[i].dot(&self.sigma[j])?;
                mat[(i, j)] = v;
                mat[(j, i)] = v;
            }
        }
        self.mat = mat;
        let (eig, vecs) = symmetric_eigh(&self.mat)?;
        let nroot = self.nstate.min(n);
        self.eig = eig.slice(ndarray::s![..nroot]).to_owned();
        self.coeffs = vecs.slice(ndarray::s![.., ..nroot]).to_owned();
        Ok(self.eig.clone())
    }

    fn expand(&self, coeffs: ndarray::ArrayView1<'_, f64>, vectors: &[V]) -> Result<V, anyhow::Error> {
        let mut out = vectors[0].clone();
        out.zero();
        for (c, v) in coeffs.iter().zip(vectors.iter()) {
            out.ax_plus_y(*c, v)?;
        }
        Ok(out)
    }

    /// The current Ritz vectors.
    pub fn civec(&self) -> Result<Vec<V>, anyhow::Error> {
        ensure!(!self.basis.is_empty(), "The Davidson subspace is empty.");
        self.coeffs
            .columns()
            .into_iter()
            .map(|c| self.expand(c, &self.basis))
            .collect()
    }

    /// The residuals $`\mathbf{r}_k = \boldsymbol{\sigma}_k - \lambda_k \mathbf{c}_k`$ of the
    /// current Ritz pairs.
    pub fn residual(&self) -> Result<Vec<V>, anyhow::Error> {
        ensure!(!self.basis.is_empty(), "The Davidson subspace is empty.");
        self.coeffs
            .columns()
            .into_iter()
            .zip(self.eig.iter())
            .map(|(c, e)| {
                let mut r = self.expand(c, &self.sigma)?;
                r.ax_plus_y(-e, &self.expand(c, &self.basis)?)?;
                Ok(r)
            })
            .collect()
    }

    fn collapse(&mut self) -> Result<(), anyhow::Error> {
        log::debug!(
            "Collapsing Davidson subspace of {} vectors onto {} Ritz vectors.",
            self.basis.len(),
            self.coeffs.ncols()
        );
        let basis = self.civec()?;
        let sigma = self
            .coeffs
            .columns()
            .into_iter()
            .map(|c| self.expand(c, &self.sigma))
            .collect::<Result<Vec<_>, _>>()?;
        self.basis = basis;
        self.sigma = sigma;
        self.mat = Array2::from_diag(&self.eig);
        self.coeffs = Array2::eye(self.eig.len());
        Ok(())
    }

    /// Runs the Davidson iterations from `guesses`.
    ///
    /// # Arguments
    ///
    /// * `guesses` - Initial trial vectors, at least as many as requested roots after
    /// orthonormalisation.
    /// * `control` - Iteration controls.
    /// * `sigma_fn` - Applies the operator to a trial vector.
    /// * `precondition_fn` - Maps a residual and its Ritz value to a new trial direction.
    ///
    /// # Returns
    ///
    /// The best available roots, flagged as converged or not.
    pub fn solve<S, P>(
        mut self,
        guesses: Vec<V>,
        control: &DavidsonControl,
        mut sigma_fn: S,
        mut precondition_fn: P,
    ) -> Result<DavidsonResult<V>, anyhow::Error>
    where
        S: FnMut(&V) -> Result<V, anyhow::Error>,
        P: FnMut(&V, f64) -> Result<V, anyhow::Error>,
    {
        let mut trial: Vec<V> = vec![];
        for g in guesses {
            if let Some(v) = self.orthonormalize(g, &trial)? {
                trial.push(v);
            }
        }
        ensure!(
            trial.len() >= self.nstate,
            "Only {} independent guess vectors for {} requested roots.",
            trial.len(),
            self.nstate
        );

        let width = if control.verbose {
            log_table_header(&format!(
                "{:>5} {:>5} {:>4} {:>22} {:>14}",
                "Iter", "Dim", "Root", "Energy", "|r|"
            ))
        } else {
            0
        };

        let mut norms = vec![f64::INFINITY; self.nstate];
        let mut energies = Array1::<f64>::zeros(self.nstate);
        let mut iterations = 0;
        let mut converged = false;
        while iterations < control.max_iter {
            iterations += 1;
            let sigma = trial.iter().map(&mut sigma_fn).collect::<Result<Vec<_>, _>>()?;
            energies = self.compute(trial, sigma)?;
            let residuals = self.residual()?;
            norms = residuals.iter().map(|r| r.norm()).collect::<Result<Vec<_>, _>>()?;
            let conv = norms.iter().map(|&r| r < control.thresh).collect_vec();
            if control.verbose {
                for (i, (e, r)) in energies.iter().zip(norms.iter()).enumerate() {
                    casmr_output!(
                        "{:>5} {:>5} {i:>4} {e:>+22.12} {r:>14.3e}{}",
                        if i == 0 { iterations.to_string() } else { String::new() },
                        if i == 0 { self.len().to_string() } else { String::new() },
                        if conv[i] { " *" } else { "" }
                    );
                }
            }
            if conv.iter().all(|&c| c) {
                converged = true;
                break;
            }
            if iterations == control.max_iter {
                break;
            }

            trial = vec![];
            for ((r, e), c) in residuals.iter().zip(energies.iter()).zip(conv.iter()) {
                if *c {
                    continue;
                }
                let t = precondition_fn(r, *e)?;
                if let Some(v) = self.orthonormalize(t, &trial)? {
                    trial.push(v);
                }
            }
            if trial.is_empty() {
                log::debug!("No new independent Davidson directions; stopping.");
                break;
            }
        }
        if control.verbose {
            log_rule(width);
        }

        Ok(DavidsonResult {
            energies: energies.to_vec(),
            vectors: self.civec()?,
            residual_norms: norms,
            iterations,
            converged,
        })
    }
}
