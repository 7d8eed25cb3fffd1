//! YAML input files of the `casmr` binary.

use anyhow;
use serde::{Deserialize, Serialize};

use crate::caspt2::Caspt2Params;
use crate::casscf::CasscfParams;
use crate::drivers::{CasDriver, Caspt2Driver, CasscfDriver};
use crate::fci::FciParams;
use crate::integrals::HamiltonianSource;
use crate::interfaces::InputHandle;
use crate::io::format::{casmr_error, casmr_output, log_title, CasmrOutput};


/// A structure containing `casmr` input parameters which can be serialised into and deserialised
/// from a YAML input file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Input {
    /// The integrals defining the electronic Hamiltonian.
    pub hamiltonian: HamiltonianSource,

    /// Control parameters for the CASCI problems. If not specified, the defaults are used.
    #[serde(default)]
    pub fci: FciParams,

    /// Control parameters for CASSCF.
    pub casscf: CasscfParams,

    /// Control parameters for CASPT2. If `None`, no CASPT2 calculation is performed.
    ///
    /// # Default
    ///
    /// If not specified, this will be taken to be `None`.
    #[serde(default)]
    pub caspt2: Option<Caspt2Params>,

    /// File stem under which results are saved. If `None`, nothing is saved.
    #[serde(default)]
    pub result_save_name: Option<String>,
}

impl InputHandle for Input {
    /// Runs CASSCF and, if requested, CASPT2 on the Hamiltonian of the input. Failures are
    /// logged before being returned.
    fn handle(&self) -> Result<(), anyhow::Error> {
        self.run_calculations().map_err(|err| {
            casmr_error!("{err:#}");
            err
        })
    }
}

impl Input {
    fn run_calculations(&self) -> Result<(), anyhow::Error> {
        self.fci.check()?;
        log_title("Hamiltonian");
        casmr_output!("");
        self.hamiltonian.log_output_display();
        casmr_output!("");
        let provider = self.hamiltonian.provider()?;

        let mut casscf_driver = CasscfDriver::builder()
            .parameters(&self.casscf)
            .fci_parameters(&self.fci)
            .provider(provider.as_ref())
            .result_save_name(self.result_save_name.clone())
            .build()?;
        casscf_driver.run()?;
        let reference = casscf_driver.result()?;

        if let Some(caspt2_params) = self.caspt2.as_ref() {
            let mut caspt2_driver = Caspt2Driver::builder()
                .parameters(caspt2_params)
                .provider(provider.as_ref())
                .reference(reference)
                .result_save_name(self.result_save_name.clone())
                .build()?;
            caspt2_driver.run()?;
        }
        Ok(())
    }
}
