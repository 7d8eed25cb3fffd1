//! Dense linear-algebra helpers shared across the crate.

use anyhow::{self, ensure, format_err};
use ndarray::{Array1, Array2, Array4, ArrayD, ArrayView2, Axis, Ix2, Ix4};
use ndarray_einsum_beta::{einsum, ArrayLike};
use ndarray_linalg::{Eigh, UPLO};

/// Evaluates an Einstein-summation pattern over real operands.
///
/// # Arguments
///
/// * `pattern` - The contraction pattern, *e.g.* `"ij,jk->ik"`.
/// * `operands` - The operands in the order they appear in `pattern`.
///
/// # Returns
///
/// The contracted array with dynamic dimensionality.
pub(crate) fn contract(
    pattern: &str,
    operands: &[&dyn ArrayLike<f64>],
) -> Result<ArrayD<f64>, anyhow::Error> {
    einsum(pattern, operands).map_err(|err| format_err!("Contraction `{pattern}` failed: {err}"))
}

/// Evaluates a contraction whose result is a matrix.
pub(crate) fn contract2(
    pattern: &str,
    operands: &[&dyn ArrayLike<f64>],
) -> Result<Array2<f64>, anyhow::Error> {
    contract(pattern, operands)?
        .into_dimensionality::<Ix2>()
        .map_err(|err| format_err!(err))
}

/// Evaluates a contraction whose result is a rank-4 tensor.
pub(crate) fn contract4(
    pattern: &str,
    operands: &[&dyn ArrayLike<f64>],
) -> Result<Array4<f64>, anyhow::Error> {
    contract(pattern, operands)?
        .into_dimensionality::<Ix4>()
        .map_err(|err| format_err!(err))
}

/// Transforms all four indices of a rank-4 tensor, $`(pq|rs) \to (ij|kl)`$ with
/// $`(ij|kl) = \sum C_{pi} C_{qj} C_{rk} C_{sl} (pq|rs)`$.
pub(crate) fn transform4(
    eri: &Array4<f64>,
    c1: ArrayView2<'_, f64>,
    c2: ArrayView2<'_, f64>,
    c3: ArrayView2<'_, f64>,
    c4: ArrayView2<'_, f64>,
) -> Result<Array4<f64>, anyhow::Error> {
    let t = contract4("pqrs,pi->iqrs", &[eri, &c1])?;
    let t = contract4("iqrs,qj->ijrs", &[&t, &c2])?;
    let t = contract4("ijrs,rk->ijks", &[&t, &c3])?;
    contract4("ijks,sl->ijkl", &[&t, &c4])
}

/// Diagonalises a real symmetric matrix, returning ascending eigenvalues and the corresponding
/// eigenvectors as columns.
pub(crate) fn symmetric_eigh(
    mat: &Array2<f64>,
) -> Result<(Array1<f64>, Array2<f64>), anyhow::Error> {
    ensure!(mat.is_square(), "Cannot diagonalise a non-square matrix.");
    if mat.nrows() == 0 {
        return Ok((Array1::zeros(0), Array2::zeros((0, 0))));
    }
    let sym = (mat + &mat.t()) * 0.5;
    sym.eigh(UPLO::Lower).map_err(|err| format_err!(err))
}

/// Computes $`\exp(\mathbf{K})`$ for a real antisymmetric matrix $`\mathbf{K}`$ through the
/// eigendecomposition of $`\mathbf{K}^2 = -\mathbf{U}\boldsymbol{\theta}^2\mathbf{U}^{\mathsf{T}}`$:
/// ```math
///     \exp(\mathbf{K}) = \mathbf{U}\cos\boldsymbol{\theta}\,\mathbf{U}^{\mathsf{T}}
///         + \mathbf{U}\frac{\sin\boldsymbol{\theta}}{\boldsymbol{\theta}}\mathbf{U}^{\mathsf{T}}\mathbf{K}.
/// ```
pub(crate) fn exp_antisymmetric(kappa: &Array2<f64>) -> Result<Array2<f64>, anyhow::Error> {
    ensure!(kappa.is_square(), "Rotation generator must be square.");
    let k2 = kappa.dot(kappa);
    let (eigvals, u) = symmetric_eigh(&k2)?;
    let theta = eigvals.mapv(|v| (-v).max(0.0).sqrt());
    let cos = theta.mapv(f64::cos);
    let sinc = theta.mapv(|t| if t < 1e-8 { 1.0 - t * t / 6.0 } else { t.sin() / t });
    let ucos = &u * &cos.insert_axis(Axis(0));
    let usinc = &u * &sinc.insert_axis(Axis(0));
    Ok(ucos.dot(&u.t()) + usinc.dot(&u.t()).dot(kappa))
}

/// Root-mean-square of the elements of a matrix.
pub(crate) fn matrix_rms(mat: &Array2<f64>) -> f64 {
    if mat.is_empty() {
        0.0
    } else {
        (mat.iter().map(|v| v * v).sum::<f64>() / mat.len() as f64).sqrt()
    }
}
