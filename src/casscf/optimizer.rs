//! Orbital optimisers producing rotation steps from the orbital gradient.

use std::collections::VecDeque;
use std::fmt;

use anyhow::{self, ensure};
use log;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::casscf::rotfile::RotFile;
use crate::civec::SubspaceVector;

/// The available orbital optimisers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// Diagonal SuperCI (approximate Newton) steps.
    SuperCi,

    /// Limited-memory BFGS seeded with the diagonal SuperCI Hessian.
    Bfgs,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::SuperCi => write!(f, "SuperCI"),
            OptimizerKind::Bfgs => write!(f, "BFGS"),
        }
    }
}

/// Plain-data optimiser history for checkpoint files.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSnapshot {
    /// Step–gradient-change pairs, oldest first.
    pub history: Vec<(RotFile, RotFile)>,

    /// The last step together with the gradient it was taken from.
    pub previous: Option<(RotFile, RotFile)>,
}

/// Trait for orbital optimisers. All quantities are rotation parameters of the generator
/// returned by [`RotFile::unpack`].
pub trait OrbitalOptimizer {
    /// The kind of optimiser.
    fn kind(&self) -> OptimizerKind;

    /// Proposes a rotation step from the current gradient and diagonal Hessian.
    fn step(&mut self, gradient: &RotFile, hessian: &RotFile) -> Result<RotFile, anyhow::Error>;

    /// Re-expresses any stored history after the active orbitals have been rotated by `u`.
    fn rotate_active(&mut self, u: &Array2<f64>) -> Result<(), anyhow::Error>;

    /// The stored history.
    fn snapshot(&self) -> OptimizerSnapshot;

    /// Replaces the stored history.
    fn restore(&mut self, snapshot: OptimizerSnapshot) -> Result<(), anyhow::Error>;
}

/// Scales `step` so that no parameter exceeds `max_step` in magnitude.
fn cap_step(step: &mut RotFile, max_step: f64) {
    let largest = step.max_abs();
    if largest > max_step {
        log::debug!("Scaling orbital step from {largest:.3e} to {max_step:.3e}.");
        step.scale(max_step / largest);
    }
}

// -------
// SuperCI
// -------

/// Diagonal SuperCI steps $`\kappa = -g / h`$.
#[derive(Clone, Debug)]
pub struct SuperCiOptimizer {
    max_step: f64,
}

impl SuperCiOptimizer {
    pub fn new(max_step: f64) -> Self {
        Self { max_step }
    }
}

impl OrbitalOptimizer for SuperCiOptimizer {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::SuperCi
    }

    fn step(&mut self, gradient: &RotFile, hessian: &RotFile) -> Result<RotFile, anyhow::Error> {
        let mut step = gradient.divide(hessian)?;
        step.scale(-1.0);
        cap_step(&mut step, self.max_step);
        Ok(step)
    }

    fn rotate_active(&mut self, _: &Array2<f64>) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn snapshot(&self) -> OptimizerSnapshot {
        OptimizerSnapshot::default()
    }

    fn restore(&mut self, snapshot: OptimizerSnapshot) -> Result<(), anyhow::Error> {
        ensure!(
            snapshot.history.is_empty() && snapshot.previous.is_none(),
            "SuperCI optimiser cannot restore a quasi-Newton history."
        );
        Ok(())
    }
}

// ----
// BFGS
// ----

/// Limited-memory BFGS over the rotation parameters. The initial inverse Hessian is the
/// inverse of the diagonal SuperCI Hessian supplied at each step; successive steps are taken from
/// the current orbitals, so step and gradient differences are accumulated in the moving frame.
#[derive(Clone, Debug)]
pub struct BfgsOptimizer {
    max_step: f64,
    max_history: usize,
    history: VecDeque<(RotFile, RotFile)>,
    previous: Option<(RotFile, RotFile)>,
}

impl BfgsOptimizer {
    pub fn new(max_step: f64, max_history: usize) -> Self {
        Self {
            max_step,
            max_history,
            history: VecDeque::new(),
            previous: None,
        }
    }

    /// The number of stored curvature pairs.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn update_history(&mut self, gradient: &RotFile) -> Result<(), anyhow::Error> {
        if let Some((s, g_old)) = self.previous.take() {
            let mut y = gradient.clone();
            y.ax_plus_y(-1.0, &g_old)?;
            let sy = s.dot(&y)?;
            if sy > 1.0e-12 * s.norm()? * y.norm()? {
                self.history.push_back((s, y));
                while self.history.len() > self.max_history {
                    self.history.pop_front();
                }
            } else {
                log::debug!("Skipping BFGS update with non-positive curvature {sy:.3e}.");
            }
        }
        Ok(())
    }

    /// Two-loop recursion for $`\mathbf{H}^{-1}\mathbf{g}`$.
    fn apply_inverse_hessian(&self, gradient: &RotFile, hessian: &RotFile) -> Result<RotFile, anyhow::Error> {
        let mut q = gradient.clone();
        let mut alphas = Vec::with_capacity(self.history.len());
        for (s, y) in self.history.iter().rev() {
            let rho = 1.0 / y.dot(s)?;
            let alpha = rho * s.dot(&q)?;
            q.ax_plus_y(-alpha, y)?;
            alphas.push((rho, alpha));
        }
        let mut r = q.divide(hessian)?;
        for ((s, y), (rho, alpha)) in self.history.iter().zip(alphas.iter().rev()) {
            let beta = rho * y.dot(&r)?;
            r.ax_plus_y(alpha - beta, s)?;
        }
        Ok(r)
    }
}

impl OrbitalOptimizer for BfgsOptimizer {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Bfgs
    }

    fn step(&mut self, gradient: &RotFile, hessian: &RotFile) -> Result<RotFile, anyhow::Error> {
        self.update_history(gradient)?;
        let mut step = self.apply_inverse_hessian(gradient, hessian)?;
        step.scale(-1.0);
        if step.dot(gradient)? >= 0.0 {
            log::debug!("BFGS direction is not a descent direction; resetting history.");
            self.history.clear();
            step = gradient.divide(hessian)?;
            step.scale(-1.0);
        }
        cap_step(&mut step, self.max_step);
        self.previous = Some((step.clone(), gradient.clone()));
        Ok(step)
    }

    fn rotate_active(&mut self, u: &Array2<f64>) -> Result<(), anyhow::Error> {
        for (s, y) in self.history.iter_mut() {
            *s = s.rotate_active(u)?;
            *y = y.rotate_active(u)?;
        }
        if let Some((s, g)) = self.previous.as_mut() {
            *s = s.rotate_active(u)?;
            *g = g.rotate_active(u)?;
        }
        Ok(())
    }

    fn snapshot(&self) -> OptimizerSnapshot {
        OptimizerSnapshot {
            history: self.history.iter().cloned().collect(),
            previous: self.previous.clone(),
        }
    }

    fn restore(&mut self, snapshot: OptimizerSnapshot) -> Result<(), anyhow::Error> {
        self.history = snapshot.history.into_iter().collect();
        self.previous = snapshot.previous;
        Ok(())
    }
}
