//! Drivers carrying out `casmr` calculations from parameter structures.

use anyhow;

pub mod caspt2;
pub mod casscf;

pub use self::caspt2::Caspt2Driver;
pub use self::casscf::CasscfDriver;

#[cfg(test)]
#[path = "drivers_tests.rs"]
mod drivers_tests;

// =================
// Trait definitions
// =================

/// Trait defining behaviours of `casmr` drivers.
pub trait CasDriver {
    /// The type of the parameter structure controlling the driver.
    type Params;

    /// The type of the successful outcome when executing the driver.
    type Outcome;

    /// Executes the driver and stores the result internally.
    fn run(&mut self) -> Result<(), anyhow::Error>;

    /// Returns the result of the driver execution.
    fn result(&self) -> Result<&Self::Outcome, anyhow::Error>;
}
