//! Driver for CASPT2 calculations.

use anyhow::{self, format_err};
use derive_builder::Builder;

use crate::caspt2::{Caspt2, Caspt2Params, Caspt2Result};
use crate::casscf::CasscfResult;
use crate::drivers::CasDriver;
use crate::integrals::IntegralProvider;
use crate::io::format::{casmr_output, log_title};
use crate::io::CasmrFileType;
use crate::parallel::{self, CommHandle};

/// A driver for CASPT2 on top of a CASSCF reference.
#[derive(Clone, Builder)]
pub struct Caspt2Driver<'a> {
    /// The control parameters for CASPT2.
    parameters: &'a Caspt2Params,

    /// The source of integrals.
    provider: &'a dyn IntegralProvider,

    /// The CASSCF reference.
    reference: &'a CasscfResult,

    /// The group of ranks sharing the tensor work.
    #[builder(default = "parallel::world()")]
    comm: CommHandle,

    /// File stem under which the result is saved, if any.
    #[builder(default = "None")]
    result_save_name: Option<String>,

    /// The result of the calculation.
    #[builder(setter(skip), default = "None")]
    result: Option<Caspt2Result>,
}

impl<'a> Caspt2Driver<'a> {
    /// Returns a builder to construct a [`Caspt2Driver`] structure.
    pub fn builder() -> Caspt2DriverBuilder<'a> {
        Caspt2DriverBuilder::default()
    }

    fn run_caspt2(&mut self) -> Result<(), anyhow::Error> {
        log_title("CASPT2");
        casmr_output!("");
        let result = Caspt2::new(
            self.provider,
            self.reference,
            self.parameters,
            self.comm.clone(),
        )?
        .compute()?;
        if let Some(name) = self.result_save_name.as_ref() {
            if self.comm.is_root() {
                result.write(name)?;
                casmr_output!("CASPT2 results saved as {name}.{}.", CasmrFileType::Pt2.ext());
            }
            self.comm.barrier();
        }
        casmr_output!("");
        self.result = Some(result);
        Ok(())
    }
}

impl CasDriver for Caspt2Driver<'_> {
    type Params = Caspt2Params;

    type Outcome = Caspt2Result;

    fn result(&self) -> Result<&Self::Outcome, anyhow::Error> {
        self.result
            .as_ref()
            .ok_or_else(|| format_err!("No CASPT2 results found."))
    }

    fn run(&mut self) -> Result<(), anyhow::Error> {
        self.run_caspt2()
    }
}
