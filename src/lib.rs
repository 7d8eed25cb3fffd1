//! # casmr: Complete-Active-Space Multireference Methods
//!
//! `casmr` implements the core of state-averaged complete-active-space self-consistent-field
//! (CASSCF) theory and of internally contracted second-order perturbation theory on top of it
//! (CASPT2), together with the numerical machinery both rely on:
//! - string-based determinant spaces with α/β excitation lists,
//! - CI vectors held on every process or distributed over processes,
//! - Davidson diagonalisation of the active-space Hamiltonian,
//! - one- to four-particle reduced and transition density matrices,
//! - SuperCI and BFGS-accelerated orbital optimisation,
//! - a dependency-ordered task queue over blocked tensors, and
//! - single-state, multi-state (MS) and extended multi-state (XMS) CASPT2 with level shifts.
//!
//! Integrals are obtained through the [`integrals::IntegralProvider`] trait, either from an
//! explicit model Hamiltonian or from density-fitted three-index factors.
//!
//! ## Getting started
//!
//! ### Linear algebra backend
//!
//! There are six features defining six different ways a linear algebra backend can be configured.
//! These are inherited from the
//! [`ndarray-linalg`](https://docs.rs/ndarray-linalg/latest/ndarray_linalg/) crate. One
//! (and only one) of these must be enabled:
//! - `openblas-static`: Downloads, builds OpenBLAS, and links statically
//! - `openblas-system`: Finds and links existing OpenBLAS in the system
//! - `netlib-static`: Downloads, builds LAPACK, and links statically
//! - `netlib-system`: Finds and links existing LAPACK in the system
//! - `intel-mkl-static`: Finds and links existing static Intel MKL in the system, or downloads and
//!   links statically if not found
//! - `intel-mkl-system`: Finds and links existing shared Intel MKL in the system
//!
//! The `standard` feature enables `openblas-static`.
//!
//! ## Examples and usage
//!
//! For most items (structs, enums, functions, and traits), their usages are illustrated in test
//! functions. The `casmr` binary reads a YAML configuration file:
//!
//! ```text
//! casmr --config tests/input/model_chain.yml --output model_chain.out
//! ```
//!
//! ## License
//!
//! GNU Lesser General Public License v3.0.

pub mod auxiliary;
pub mod caspt2;
pub mod casscf;
pub mod civec;
pub mod davidson;
pub mod determinant;
pub mod drivers;
pub mod fci;
pub mod integrals;
pub mod interfaces;
pub mod io;
pub mod parallel;
pub mod rdm;
pub mod smith;
