//! Subspace solver for symmetric linear equations $`\mathbf{A}\mathbf{t} + \mathbf{s} = 0`$.

use anyhow::{self, ensure, format_err};
use log;
use ndarray::{s, Array1, Array2};

use crate::auxiliary::linalg::symmetric_eigh;
use crate::civec::SubspaceVector;

/// Eigenvalues of the subspace matrix below this are dropped when solving the subspace problem.
const SINGULAR_THRESHOLD: f64 = 1.0e-14;

/// Solves $`\mathbf{A}\mathbf{t} = -\mathbf{s}`$ for a symmetric $`\mathbf{A}`$ available only
/// through its action on trial vectors.
///
/// Trial vectors are kept orthonormal. Each call to [`Self::compute_residual`] adds one trial
/// vector together with its image under $`\mathbf{A}`$, solves the projected problem and returns
/// the full residual $`\mathbf{r} = \mathbf{s} + \mathbf{A}\mathbf{t}`$. When the subspace is full
/// it is collapsed onto the current solution.
#[derive(Clone, Debug)]
pub struct LinearRM<V: SubspaceVector> {
    max_subspace: usize,
    lindep_thresh: f64,
    source: V,
    trials: Vec<V>,
    sigmas: Vec<V>,
    mat: Array2<f64>,
    prod: Array1<f64>,
    coeffs: Array1<f64>,
}

impl<V: SubspaceVector> LinearRM<V> {
    /// Creates a solver for the source vector `source`.
    pub fn new(max_subspace: usize, source: V, lindep_thresh: f64) -> Result<Self, anyhow::Error> {
        ensure!(
            max_subspace >= 2,
            "A linear subspace solver needs room for at least two vectors."
        );
        Ok(Self {
            max_subspace,
            lindep_thresh,
            source,
            trials: vec![],
            sigmas: vec![],
            mat: Array2::zeros((max_subspace, max_subspace)),
            prod: Array1::zeros(max_subspace),
            coeffs: Array1::zeros(0),
        })
    }

    /// The number of trial vectors held.
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// Orthogonalises `v` against the subspace and normalises it. Returns `None` if `v` is
    /// linearly dependent on the subspace.
    pub fn orthonormalize(&self, mut v: V) -> Result<Option<V>, anyhow::Error> {
        for _ in 0..2 {
            for c in self.trials.iter() {
                let overlap = c.dot(&v)?;
                v.ax_plus_y(-overlap, c)?;
            }
        }
        let norm = v.norm()?;
        if norm < self.lindep_thresh {
            Ok(None)
        } else {
            v.scale(1.0 / norm);
            Ok(Some(v))
        }
    }

    /// Replaces the subspace with the normalised current solution.
    fn collapse(&mut self) -> Result<(), anyhow::Error> {
        let mut c = self.civec()?;
        let mut s = self.combine(&self.sigmas)?;
        let norm = c.norm()?;
        ensure!(norm > 0.0, "Cannot collapse onto a vanishing solution.");
        c.scale(1.0 / norm);
        s.scale(1.0 / norm);
        log::debug!("Collapsing linear subspace of {} vectors.", self.len());
        self.trials = vec![c];
        self.sigmas = vec![s];
        self.mat.fill(0.0);
        self.prod.fill(0.0);
        self.mat[(0, 0)] = self.trials[0].dot(&self.sigmas[0])?;
        self.prod[0] = -self.trials[0].dot(&self.source)?;
        Ok(())
    }

    /// Adds the orthonormal trial vector `trial` with `sigma` $`= \mathbf{A}\,`$`trial` and
    /// returns the residual of the updated solution.
    pub fn compute_residual(&mut self, trial: V, sigma: V) -> Result<V, anyhow::Error> {
        if self.len() == self.max_subspace {
            self.collapse()?;
        }
        self.trials.push(trial);
        self.sigmas.push(sigma);
        let n = self.len();
        let last = n - 1;
        for i in 0..n {
            let v = 0.5
                * (self.trials[i].dot(&self.sigmas[last])? + self.trials[last].dot(&self.sigmas[i])?);
            self.mat[(i, last)] = v;
            self.mat[(last, i)] = v;
        }
        self.prod[last] = -self.trials[last].dot(&self.source)?;

        let sub = self.mat.slice(s![..n, ..n]).to_owned();
        let (eigvals, eigvecs) = symmetric_eigh(&sub)?;
        let rhs = eigvecs.t().dot(&self.prod.slice(s![..n]));
        let scaled = Array1::from_iter(eigvals.iter().zip(rhs.iter()).map(|(e, r)| {
            if e.abs() > SINGULAR_THRESHOLD {
                r / e
            } else {
                0.0
            }
        }));
        self.coeffs = eigvecs.dot(&scaled);

        let mut residual = self.source.clone();
        for (x, s) in self.coeffs.iter().zip(self.sigmas.iter()) {
            residual.ax_plus_y(*x, s)?;
        }
        Ok(residual)
    }

    fn combine(&self, vectors: &[V]) -> Result<V, anyhow::Error> {
        let mut out = vectors
            .first()
            .ok_or_else(|| format_err!("The linear subspace is empty."))?
            .clone();
        out.zero();
        for (x, v) in self.coeffs.iter().zip(vectors.iter()) {
            out.ax_plus_y(*x, v)?;
        }
        Ok(out)
    }

    /// The current solution $`\mathbf{t}`$.
    pub fn civec(&self) -> Result<V, anyhow::Error> {
        self.combine(&self.trials)
    }
}
