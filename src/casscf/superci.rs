//! SuperCI gradient and diagonal denominators in the natural-orbital basis.
//!
//! The SuperCI singles $`|a/i\rangle`$, $`|a/r\rangle`$ and $`|r/i\rangle`$ are normalised with
//! $`\sqrt{2}`$, $`\sqrt{n_r}`$ and $`\sqrt{2 - n_r}`$, where $`n_r`$ are the active natural
//! occupations. Rotations into orbitals whose normalisation falls below the occupation
//! threshold are dropped.

use ndarray::Array1;

use crate::casscf::fock::FockMatrices;
use crate::casscf::rotfile::RotFile;

const TINY: f64 = 1.0e-15;

fn inverse_sqrt_guarded(x: f64, thresh: f64) -> f64 {
    if x > thresh {
        1.0 / x.sqrt()
    } else {
        0.0
    }
}

/// The normalised SuperCI gradient $`\langle \mu | \hat{H} | 0 \rangle`$:
/// ```math
///     \sigma_{ai} = \sqrt{2} f_{ai}, \quad
///     \sigma_{ar} = \frac{f^{\mathrm{act}}_{ar}}{\sqrt{n_r}}, \quad
///     \sigma_{ir} = \frac{2 f_{ir} - f^{\mathrm{act}}_{ir}}{\sqrt{2 - n_r}}.
/// ```
pub fn superci_gradient(fock: &FockMatrices, occup: &Array1<f64>, occupation_threshold: f64) -> RotFile {
    let (nclosed, nact, nvirt) = (fock.nclosed, fock.nact, fock.nvirt());
    let nocc = nclosed + nact;
    let f = &fock.fock;
    let fact = &fock.fact;
    let mut sigma = RotFile::zeros(nclosed, nact, nvirt);
    for i in 0..nclosed {
        for a in 0..nvirt {
            *sigma.ele_vc_mut(a, i) = std::f64::consts::SQRT_2 * f[(nocc + a, i)];
        }
    }
    for r in 0..nact {
        let fac = inverse_sqrt_guarded(occup[r], occupation_threshold);
        for a in 0..nvirt {
            *sigma.ele_va_mut(a, r) = fac * fact[(nocc + a, r)];
        }
        let fac = inverse_sqrt_guarded(2.0 - occup[r], occupation_threshold);
        for i in 0..nclosed {
            *sigma.ele_ca_mut(i, r) = fac * (2.0 * f[(i, nclosed + r)] - fact[(i, r)]);
        }
    }
    sigma
}

/// Diagonal SuperCI denominators $`\langle \mu | \hat{H} - E_0 | \mu \rangle`$ in the
/// one-particle approximation.
pub fn superci_denominators(fock: &FockMatrices, occup: &Array1<f64>) -> RotFile {
    let (nclosed, nact, nvirt) = (fock.nclosed, fock.nact, fock.nvirt());
    let nocc = nclosed + nact;
    let f = &fock.fock;
    let fact = &fock.fact;
    let mut denom = RotFile::zeros(nclosed, nact, nvirt);
    for i in 0..nclosed {
        for a in 0..nvirt {
            *denom.ele_vc_mut(a, i) = f[(nocc + a, nocc + a)] - f[(i, i)];
        }
    }
    for r in 0..nact {
        let n = occup[r];
        let frr = fact[(nclosed + r, r)];
        for a in 0..nvirt {
            *denom.ele_va_mut(a, r) = (f[(nocc + a, nocc + a)] * n - frr) / (n + TINY);
        }
        for i in 0..nclosed {
            *denom.ele_ca_mut(i, r) = (2.0 * f[(nclosed + r, nclosed + r)] - frr
                - f[(i, i)] * (2.0 - n))
                / (2.0 - n + TINY);
        }
    }
    denom
}

/// The normalisation of each SuperCI single, zero where the occupation guard applies.
pub fn superci_normalisation(
    nclosed: usize,
    nvirt: usize,
    occup: &Array1<f64>,
    occupation_threshold: f64,
) -> RotFile {
    let nact = occup.len();
    let guard = |x: f64| if x > occupation_threshold { x.sqrt() } else { 0.0 };
    let mut norm = RotFile::zeros(nclosed, nact, nvirt);
    for i in 0..nclosed {
        for a in 0..nvirt {
            *norm.ele_vc_mut(a, i) = std::f64::consts::SQRT_2;
        }
    }
    for r in 0..nact {
        for a in 0..nvirt {
            *norm.ele_va_mut(a, r) = guard(occup[r]);
        }
        for i in 0..nclosed {
            *norm.ele_ca_mut(i, r) = guard(2.0 - occup[r]);
        }
    }
    norm
}

/// The energy gradient $`\partial E / \partial \kappa`$ for the rotation generator of
/// [`RotFile::unpack`], valid in any orbital basis:
/// ```math
///     g_{ai} = 4 f_{ai}, \quad g_{ar} = 2 f^{\mathrm{act}}_{ar}, \quad
///     g_{ri} = 2\left(2 f_{ri} - f^{\mathrm{act}}_{ir}\right).
/// ```
pub fn rotation_gradient(fock: &FockMatrices) -> RotFile {
    let (nclosed, nact, nvirt) = (fock.nclosed, fock.nact, fock.nvirt());
    let nocc = nclosed + nact;
    let f = &fock.fock;
    let fact = &fock.fact;
    let mut grad = RotFile::zeros(nclosed, nact, nvirt);
    for i in 0..nclosed {
        for a in 0..nvirt {
            *grad.ele_vc_mut(a, i) = 4.0 * f[(nocc + a, i)];
        }
    }
    for r in 0..nact {
        for a in 0..nvirt {
            *grad.ele_va_mut(a, r) = 2.0 * fact[(nocc + a, r)];
        }
        for i in 0..nclosed {
            *grad.ele_ca_mut(i, r) = 2.0 * (2.0 * f[(nclosed + r, i)] - fact[(i, r)]);
        }
    }
    grad
}

/// Converts the normalised SuperCI gradient and denominators into the rotation-parameter
/// gradient $`g = 2N\sigma`$ and diagonal Hessian $`h = 2N^2\max(d, d_{\mathrm{min}})`$.
/// Guarded elements get a unit Hessian and zero gradient.
pub fn to_rotation_space(
    sigma: &RotFile,
    denom: &RotFile,
    norm: &RotFile,
    denominator_floor: f64,
) -> (RotFile, RotFile) {
    let mut grad = sigma.clone();
    let mut hess = denom.clone();
    grad.data_mut()
        .iter_mut()
        .zip(hess.data_mut().iter_mut())
        .zip(norm.data().iter())
        .for_each(|((g, h), &n)| {
            if n == 0.0 {
                *g = 0.0;
                *h = 1.0;
            } else {
                *g *= 2.0 * n;
                *h = 2.0 * n * n * h.max(denominator_floor);
            }
        });
    (grad, hess)
}
