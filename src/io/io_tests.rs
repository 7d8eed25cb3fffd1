use std::collections::BTreeMap;

use ndarray::{Array1, Array2};
use serial_test::serial;

use crate::casscf::{CasscfCheckpoint, CasscfRecord};
use crate::io::format::{convergence_note, log_table_header, nice_bool};
use crate::io::{read_casmr_binary, read_casmr_yaml, write_casmr_binary, CasmrFileType};

fn temp_stem(label: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("casmr_io_{label}_{}", std::process::id()))
}

fn record(energy: f64) -> CasscfRecord {
    CasscfRecord {
        energies: vec![energy],
        weights: vec![1.0],
        coeff: Array2::eye(3),
        civecs: vec![],
        occupations: Array1::from_vec(vec![1.5, 0.5]),
        nclosed: 1,
        nact: 2,
        converged: true,
    }
}

#[test]
fn test_io_file_type_paths() {
    assert_eq!(CasmrFileType::Chk.ext(), "casmr.chk");
    assert_eq!(CasmrFileType::Cas.ext(), "casmr.cas");
    assert_eq!(CasmrFileType::Pt2.ext(), "casmr.pt2");
    assert_eq!(
        CasmrFileType::Cas.path("runs/water"),
        std::path::PathBuf::from("runs/water.casmr.cas")
    );
}

#[test]
#[serial]
fn test_io_record_is_stored_under_its_own_type() {
    let stem = temp_stem("record");
    let path = write_casmr_binary(&stem, &record(-1.25)).unwrap();
    assert_eq!(path, CasmrFileType::Cas.path(&stem));

    let read: CasscfRecord = read_casmr_binary(&stem).unwrap();
    assert_eq!(read.energies, vec![-1.25]);
    assert_eq!(read.coeff, Array2::<f64>::eye(3));
    assert_eq!((read.nclosed, read.nact), (1, 2));

    // A checkpoint with the same stem lives under another extension.
    assert!(read_casmr_binary::<CasscfCheckpoint, _>(&stem).is_err());
    std::fs::remove_file(path).unwrap();
}

#[test]
#[serial]
fn test_io_write_replaces_earlier_file_and_leaves_no_partial() {
    let stem = temp_stem("replace");
    let path = write_casmr_binary(&stem, &record(-1.0)).unwrap();
    let mut partial = path.clone().into_os_string();
    partial.push(".partial");
    // Debris from an interrupted write is overwritten.
    std::fs::write(&partial, b"garbage").unwrap();

    write_casmr_binary(&stem, &record(-2.0)).unwrap();
    let read: CasscfRecord = read_casmr_binary(&stem).unwrap();
    assert_eq!(read.energies, vec![-2.0]);
    assert!(!std::path::Path::new(&partial).exists());
    std::fs::remove_file(path).unwrap();
}

#[test]
#[serial]
fn test_io_truncated_file_reports_its_path() {
    let stem = temp_stem("truncated");
    let path = CasmrFileType::Cas.path(&stem);
    std::fs::write(&path, [1_u8, 2, 3]).unwrap();
    let err = read_casmr_binary::<CasscfRecord, _>(&stem).unwrap_err();
    assert!(err.to_string().contains(&path.display().to_string()));
    std::fs::remove_file(path).unwrap();
}

#[test]
#[serial]
fn test_io_yaml_input() {
    let path = temp_stem("yaml").with_extension("yml");
    std::fs::write(&path, "nclosed: 2\nnact: 4\n").unwrap();
    let read: BTreeMap<String, usize> = read_casmr_yaml(&path).unwrap();
    assert_eq!(read.get("nclosed"), Some(&2));
    assert_eq!(read.get("nact"), Some(&4));
    std::fs::remove_file(path).unwrap();

    assert!(read_casmr_yaml::<BTreeMap<String, usize>, _>("no/such/file.yml").is_err());
}

#[test]
fn test_io_format_helpers() {
    assert_eq!(nice_bool(true), "yes");
    assert_eq!(nice_bool(false), "no");
    assert_eq!(convergence_note(true), "");
    assert_eq!(convergence_note(false), " (not converged)");
    assert_eq!(log_table_header(&format!("{:>5} {:>14}", "Iter", "Energy")), 20);
}
