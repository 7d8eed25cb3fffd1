use approx::assert_abs_diff_eq;
use serial_test::serial;

use crate::caspt2::Caspt2Params;
use crate::casscf::{CasscfParams, CasscfRecord};
use crate::drivers::{CasDriver, Caspt2Driver, CasscfDriver};
use crate::fci::FciParams;
use crate::integrals::test_models::molecule_like;
use crate::io::{read_casmr_binary, CasmrFileType};

#[test]
#[serial]
fn test_drivers_casscf_then_caspt2() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dense = molecule_like(6, 11);
    let params = CasscfParams::builder()
        .nclosed(1)
        .nact(2)
        .nelea(1)
        .neleb(1)
        .thresh(1e-7)
        .build()
        .unwrap();
    let fci_params = FciParams::builder()
        .print_iterations(false)
        .thresh(1e-10)
        .build()
        .unwrap();
    let stem = std::env::temp_dir()
        .join(format!("casmr_drivers_{}", std::process::id()))
        .to_string_lossy()
        .to_string();

    let mut casscf_driver = CasscfDriver::builder()
        .parameters(&params)
        .fci_parameters(&fci_params)
        .provider(&dense)
        .result_save_name(Some(stem.clone()))
        .build()
        .unwrap();
    assert!(casscf_driver.result().is_err());
    casscf_driver.run().unwrap();
    let reference = casscf_driver.result().unwrap();
    assert!(reference.converged);

    let record: CasscfRecord = read_casmr_binary(&stem).unwrap();
    assert_eq!(record.energies, reference.energies);
    assert_eq!(record.nclosed, 1);

    let pt2_params = Caspt2Params::builder().thresh(1e-9).build().unwrap();
    let mut caspt2_driver = Caspt2Driver::builder()
        .parameters(&pt2_params)
        .provider(&dense)
        .reference(reference)
        .build()
        .unwrap();
    caspt2_driver.run().unwrap();
    let pt2 = caspt2_driver.result().unwrap();
    assert!(pt2.converged);
    assert!(pt2.correlation_energies[0] < 0.0);
    assert_abs_diff_eq!(
        pt2.energies[0],
        reference.energies[0] + pt2.correlation_energies[0],
        epsilon = 1e-12
    );

    std::fs::remove_file(CasmrFileType::Cas.path(&stem)).unwrap();
}
