use approx::assert_abs_diff_eq;
use ndarray::{array, Array1, Array2};

use crate::auxiliary::linalg::symmetric_eigh;
use crate::civec::SubspaceVector;
use crate::davidson::{DavidsonControl, DavidsonDiag};

fn diagonally_dominant_matrix() -> Array2<f64> {
    #[rustfmt::skip]
    let mat = array![
        [1.0, 0.1, 0.0, 0.2],
        [0.1, 2.0, 0.3, 0.0],
        [0.0, 0.3, 3.0, 0.1],
        [0.2, 0.0, 0.1, 4.0],
    ];
    mat
}

fn unit(n: usize, i: usize) -> Array1<f64> {
    let mut v = Array1::zeros(n);
    v[i] = 1.0;
    v
}

#[test]
fn test_davidson_lowest_root_of_small_matrix() {
    let mat = diagonally_dominant_matrix();
    let (exact, _) = symmetric_eigh(&mat).unwrap();
    let diag = mat.diag().to_owned();
    let control = DavidsonControl::builder()
        .max_iter(20)
        .thresh(1e-10)
        .build()
        .unwrap();
    let result = DavidsonDiag::new(1, 4, 1e-8)
        .unwrap()
        .solve(
            vec![unit(4, 0)],
            &control,
            |v| Ok(mat.dot(v)),
            |r, e| {
                Ok(Array1::from_shape_fn(4, |i| {
                    -r[i] / (diag[i] - e).max(0.1)
                }))
            },
        )
        .unwrap();
    assert!(result.converged);
    assert!(result.iterations <= 4);
    assert_abs_diff_eq!(result.energies[0], exact[0], epsilon = 1e-10);
    let v = &result.vectors[0];
    let mut r = mat.dot(v);
    r.ax_plus_y(-result.energies[0], v).unwrap();
    assert!(r.norm().unwrap() < 1e-9);
}

#[test]
fn test_davidson_two_roots_with_collapse() {
    let n = 12;
    let mat = Array2::from_shape_fn((n, n), |(i, j)| {
        if i == j {
            i as f64
        } else {
            0.05 / (1.0 + (i as f64 - j as f64).abs())
        }
    });
    let (exact, _) = symmetric_eigh(&mat).unwrap();
    let control = DavidsonControl::builder()
        .max_iter(60)
        .thresh(1e-9)
        .build()
        .unwrap();
    let result = DavidsonDiag::new(2, 4, 1e-8)
        .unwrap()
        .solve(
            vec![unit(n, 0), unit(n, 1)],
            &control,
            |v| Ok(mat.dot(v)),
            |r, e| Ok(Array1::from_shape_fn(n, |i| -r[i] / (mat[(i, i)] - e).max(0.1))),
        )
        .unwrap();
    assert!(result.converged);
    assert_abs_diff_eq!(result.energies[0], exact[0], epsilon = 1e-9);
    assert_abs_diff_eq!(result.energies[1], exact[1], epsilon = 1e-9);
    assert_abs_diff_eq!(
        result.vectors[0].dot(&result.vectors[1]),
        0.0,
        epsilon = 1e-10
    );
}

#[test]
fn test_davidson_reports_nonconvergence() {
    let mat = diagonally_dominant_matrix();
    let control = DavidsonControl::builder()
        .max_iter(1)
        .thresh(1e-14)
        .build()
        .unwrap();
    let result = DavidsonDiag::new(1, 4, 1e-8)
        .unwrap()
        .solve(
            vec![unit(4, 0)],
            &control,
            |v| Ok(mat.dot(v)),
            |r, _| Ok(r.clone()),
        )
        .unwrap();
    assert!(!result.converged);
    assert_eq!(result.iterations, 1);
    assert_abs_diff_eq!(result.energies[0], 1.0, epsilon = 1e-14);
}

#[test]
fn test_davidson_rejects_dependent_guesses() {
    let mat = diagonally_dominant_matrix();
    let control = DavidsonControl::default();
    let guesses = vec![unit(4, 0), unit(4, 0) * 2.0];
    let result = DavidsonDiag::new(2, 8, 1e-8).unwrap().solve(
        guesses,
        &control,
        |v| Ok(mat.dot(v)),
        |r, _| Ok(r.clone()),
    );
    assert!(result.is_err());
}

#[test]
fn test_davidson_dense_subspace_vector_arithmetic() {
    let mut x = array![1.0, 2.0, 3.0];
    let y = array![0.5, -1.0, 2.0];
    assert_abs_diff_eq!(SubspaceVector::dot(&x, &y).unwrap(), 4.5, epsilon = 1e-14);
    SubspaceVector::ax_plus_y(&mut x, 2.0, &y).unwrap();
    assert_abs_diff_eq!(x, array![2.0, 0.0, 7.0], epsilon = 1e-14);
    assert!(SubspaceVector::dot(&x, &unit(4, 0)).is_err());
}
