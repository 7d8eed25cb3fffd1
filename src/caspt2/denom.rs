//! Preconditioner for the CASPT2 amplitude equations.

use anyhow::{self, ensure, format_err};
use log;
use ndarray::{s, Array1, Array2, ArrayD, Axis, IxDyn};

use crate::auxiliary::linalg::symmetric_eigh;
use crate::civec::SubspaceVector;
use crate::smith::{MultiTensor, Tensor};

use super::densities::PairDensities;
use super::residual::Excitation;

/// Denominators below this magnitude leave the corresponding amplitude untouched.
const DENOMINATOR_GUARD: f64 = 1.0e-10;

/// The orthonormalised metric basis of one excitation class.
#[derive(Clone, Debug)]
struct ClassBlock {
    class: Excitation,
    /// Internal functions per state.
    dim: usize,
    basis: Array2<f64>,
    eigvals: Array1<f64>,
}

fn square(a: &ArrayD<f64>, dim: usize) -> Result<Array2<f64>, anyhow::Error> {
    a.as_standard_layout()
        .into_owned()
        .into_shape((dim, dim))
        .map_err(|err| format_err!(err))
}

impl ClassBlock {
    /// The metric and Fock-contracted densities of one pair of states over internal functions.
    fn pair_matrices(
        class: Excitation,
        densities: &PairDensities,
        bra: usize,
        ket: usize,
        nint: usize,
    ) -> Result<(Array2<f64>, Array2<f64>), anyhow::Error> {
        let missing = || format_err!("Missing densities for reference states ({bra}, {ket}).");
        match class {
            Excitation::Double => {
                let (Some(g), Some(f)) = (&densities.gamma[bra][ket], &densities.f3[bra][ket]) else {
                    return Err(missing());
                };
                let npair = nint * nint;
                let mut metric = Array2::<f64>::zeros((npair, npair));
                let mut fock = Array2::<f64>::zeros((npair, npair));
                for x in 0..nint {
                    for y in 0..nint {
                        for p in 0..nint {
                            for q in 0..nint {
                                metric[(x * nint + y, p * nint + q)] = g[(x, p, y, q)];
                                fock[(x * nint + y, p * nint + q)] = f[(x, p, y, q)];
                            }
                        }
                    }
                }
                Ok((metric, fock))
            }
            Excitation::Single => {
                let (Some(g), Some(f)) = (&densities.g1[bra][ket], &densities.g1f[bra][ket]) else {
                    return Err(missing());
                };
                let dim = nint.pow(3);
                Ok((square(g, dim)?, square(f, dim)?))
            }
            Excitation::Internal => {
                let (Some(g), Some(f)) = (&densities.g0[bra][ket], &densities.g0f[bra][ket]) else {
                    return Err(missing());
                };
                let dim = nint.pow(4);
                Ok((square(g, dim)?, square(f, dim)?))
            }
        }
    }

    fn new(
        class: Excitation,
        states: &[usize],
        densities: &PairDensities,
        nint: usize,
        metric_threshold: f64,
    ) -> Result<Self, anyhow::Error> {
        let dim = match class {
            Excitation::Double => nint.pow(2),
            Excitation::Single => nint.pow(3),
            Excitation::Internal => nint.pow(4),
        };
        let n = states.len() * dim;
        let mut metric = Array2::<f64>::zeros((n, n));
        let mut fock = Array2::<f64>::zeros((n, n));
        for (ci, &bra) in states.iter().enumerate() {
            for (cj, &ket) in states.iter().enumerate() {
                let (m, f) = Self::pair_matrices(class, densities, bra, ket, nint)?;
                metric
                    .slice_mut(s![ci * dim..(ci + 1) * dim, cj * dim..(cj + 1) * dim])
                    .assign(&m);
                fock.slice_mut(s![ci * dim..(ci + 1) * dim, cj * dim..(cj + 1) * dim])
                    .assign(&f);
            }
        }
        let (lambda, u) = symmetric_eigh(&metric)?;
        let kept = lambda
            .iter()
            .enumerate()
            .filter(|(_, l)| **l > metric_threshold)
            .map(|(k, _)| k)
            .collect::<Vec<_>>();
        log::debug!(
            "CASPT2 {class:?} metric over states {states:?}: {} of {n} functions kept.",
            kept.len()
        );
        let mut x = Array2::<f64>::zeros((n, kept.len()));
        for (col, &k) in kept.iter().enumerate() {
            x.column_mut(col)
                .assign(&(&u.column(k) / lambda[k].sqrt()));
        }
        let fock_orth = x.t().dot(&fock).dot(&x);
        let (eigvals, w) = symmetric_eigh(&fock_orth)?;
        Ok(Self {
            class,
            dim,
            basis: x.dot(&w),
            eigvals,
        })
    }

    /// Divides the residual components of this class by their denominators in place of `out`.
    fn apply(
        &self,
        residual: &MultiTensor,
        out: &mut MultiTensor,
        states: &[usize],
        eps_virt: &Array1<f64>,
        e0: f64,
    ) -> Result<(), anyhow::Error> {
        let nvirt = eps_virt.len();
        let (nrow, factor) = match self.class {
            Excitation::Double => (nvirt * nvirt, 2.0),
            Excitation::Single => (nvirt, 1.0),
            Excitation::Internal => (1, 1.0),
        };
        let n = states.len() * self.dim;
        let mut rmat = Array2::<f64>::zeros((nrow, n));
        for (ci, &state) in states.iter().enumerate() {
            let component = residual.at(self.class.component(state)).to_array();
            ensure!(
                component.len() == nrow * self.dim,
                "{:?} residual of state {state} does not match the preconditioner.",
                self.class
            );
            let flat = component
                .into_shape((nrow, self.dim))
                .map_err(|err| format_err!(err))?;
            rmat.slice_mut(s![.., ci * self.dim..(ci + 1) * self.dim])
                .assign(&flat);
        }
        let mut z = rmat.dot(&self.basis);
        for (r, mut row) in z.axis_iter_mut(Axis(0)).enumerate() {
            let external = match self.class {
                Excitation::Double => eps_virt[r / nvirt] + eps_virt[r % nvirt],
                Excitation::Single => eps_virt[r],
                Excitation::Internal => 0.0,
            };
            row.iter_mut()
                .zip(self.eigvals.iter())
                .for_each(|(v, d)| {
                    let denom = factor * (d + external - e0);
                    *v = if denom.abs() > DENOMINATOR_GUARD {
                        -*v / denom
                    } else {
                        0.0
                    };
                });
        }
        let update = z.dot(&self.basis.t());
        for (ci, &state) in states.iter().enumerate() {
            let component = self.class.component(state);
            let ranges = residual.at(component).ranges().to_vec();
            let shape = ranges.iter().map(|r| r.size()).collect::<Vec<_>>();
            let block = update
                .slice(s![.., ci * self.dim..(ci + 1) * self.dim])
                .to_owned()
                .into_shape(IxDyn(&shape))
                .map_err(|err| format_err!(err))?;
            *out.at_mut(component) = Tensor::from_array(ranges, block.view())?;
        }
        Ok(())
    }
}

/// Approximate inverse of $`\hat{H}_0 - E_0`$, exact when the virtual–virtual Fock block is
/// diagonal and the virtual–internal block vanishes.
///
/// Each excitation class is treated separately. For fixed virtual indices the overlap and
/// zeroth-order Hamiltonian act on the internal indices of every included reference state through
/// the metric and the matrix of Fock-contracted densities. The metric is diagonalised and
/// truncated, the Fock-contracted matrix is diagonalised in the orthonormalised metric basis, and
/// residuals are divided by $`2(d_k + \epsilon_a + \epsilon_b - E_0)`$ for the doubly external
/// class, $`d_k + \epsilon_a - E_0`$ for the singly external one and $`d_k - E_0`$ for the
/// internal one.
#[derive(Clone, Debug)]
pub struct Denom {
    states: Vec<usize>,
    blocks: Vec<ClassBlock>,
    eps_virt: Array1<f64>,
}

impl Denom {
    pub(crate) fn new(
        states: &[usize],
        densities: &PairDensities,
        nint: usize,
        eps_virt: Array1<f64>,
        metric_threshold: f64,
    ) -> Result<Self, anyhow::Error> {
        let blocks = Excitation::ALL
            .iter()
            .map(|&class| ClassBlock::new(class, states, densities, nint, metric_threshold))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            states: states.to_vec(),
            blocks,
            eps_virt,
        })
    }

    /// The number of internal functions per virtual index kept after metric truncation, summed
    /// over the excitation classes.
    pub fn nkept(&self) -> usize {
        self.blocks.iter().map(|b| b.eigvals.len()).sum()
    }

    /// Applies the approximate inverse to `residual`, returning the amplitude update
    /// $`-(\hat{H}_0 - E_0)^{-1}\mathbf{r}`$.
    ///
    /// # Arguments
    ///
    /// * `residual` - Three components per reference state; components of states not covered
    ///   are ignored.
    /// * `e0` - The zeroth-order energy, already lowered by any level shift.
    pub fn apply(&self, residual: &MultiTensor, e0: f64) -> Result<MultiTensor, anyhow::Error> {
        let mut out = residual.clone();
        out.zero();
        for block in self.blocks.iter() {
            block.apply(residual, &mut out, &self.states, &self.eps_virt, e0)?;
        }
        Ok(out)
    }
}
