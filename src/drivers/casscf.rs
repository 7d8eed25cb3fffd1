//! Driver for CASSCF calculations.

use anyhow::{self, format_err};
use derive_builder::Builder;
use ndarray::Array2;

use crate::casscf::{Casscf, CasscfParams, CasscfResult};
use crate::drivers::CasDriver;
use crate::fci::FciParams;
use crate::integrals::IntegralProvider;
use crate::io::format::{casmr_output, log_title, CasmrOutput};
use crate::io::CasmrFileType;

/// A driver for state-averaged CASSCF.
#[derive(Clone, Builder)]
pub struct CasscfDriver<'a> {
    /// The control parameters for the orbital optimisation.
    parameters: &'a CasscfParams,

    /// The control parameters for the CASCI problems.
    fci_parameters: &'a FciParams,

    /// The source of integrals.
    provider: &'a dyn IntegralProvider,

    /// Starting orbital coefficients. If `None`, the basis functions themselves are used.
    #[builder(default = "None")]
    coeff: Option<Array2<f64>>,

    /// File stem under which the result is saved, if any.
    #[builder(default = "None")]
    result_save_name: Option<String>,

    /// The result of the calculation.
    #[builder(setter(skip), default = "None")]
    result: Option<CasscfResult>,
}

impl<'a> CasscfDriver<'a> {
    /// Returns a builder to construct a [`CasscfDriver`] structure.
    pub fn builder() -> CasscfDriverBuilder<'a> {
        CasscfDriverBuilder::default()
    }

    fn run_casscf(&mut self) -> Result<(), anyhow::Error> {
        log_title("CASSCF");
        casmr_output!("");
        self.parameters.log_output_display();
        self.fci_parameters.log_output_display();
        casmr_output!("");

        let coeff = self
            .coeff
            .clone()
            .unwrap_or_else(|| Array2::eye(self.provider.nbasis()));
        let result = Casscf::new(self.provider, self.parameters, self.fci_parameters)?.compute(coeff)?;
        casmr_output!("");
        result.log_output_display();
        if let Some(name) = self.result_save_name.as_ref() {
            result.write(name)?;
            casmr_output!("CASSCF results saved as {name}.{}.", CasmrFileType::Cas.ext());
        }
        casmr_output!("");
        self.result = Some(result);
        Ok(())
    }
}

impl CasDriver for CasscfDriver<'_> {
    type Params = CasscfParams;

    type Outcome = CasscfResult;

    fn result(&self) -> Result<&Self::Outcome, anyhow::Error> {
        self.result
            .as_ref()
            .ok_or_else(|| format_err!("No CASSCF results found."))
    }

    fn run(&mut self) -> Result<(), anyhow::Error> {
        self.run_casscf()
    }
}
