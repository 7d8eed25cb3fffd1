//! Helper items shared by the numerical modules.

pub(crate) mod linalg;
