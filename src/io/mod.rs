//! CASSCF checkpoints, result records and the YAML input of `casmr`.
//!
//! Every binary record type implements [`CasmrFile`], which fixes the extension it is stored
//! under, so a checkpoint can never be read back as a CASPT2 result or the other way round.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{self, format_err};
use bincode;
use serde::{de::DeserializeOwned, Serialize};
use serde_yaml;

pub(crate) mod format;

#[cfg(test)]
#[path = "io_tests.rs"]
mod io_tests;

/// The kinds of `casmr` binary file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CasmrFileType {
    /// Checkpoints written after every CASSCF macro-iteration.
    Chk,

    /// Converged CASSCF orbitals and CI vectors.
    Cas,

    /// CASPT2 energies and effective Hamiltonians.
    Pt2,
}

impl CasmrFileType {
    /// The extension of the file type.
    pub fn ext(&self) -> &'static str {
        match self {
            CasmrFileType::Chk => "casmr.chk",
            CasmrFileType::Cas => "casmr.cas",
            CasmrFileType::Pt2 => "casmr.pt2",
        }
    }

    /// The full path of a file of this type with the given stem.
    pub fn path<P: AsRef<Path>>(&self, name: P) -> PathBuf {
        let mut path = name.as_ref().to_path_buf();
        path.set_extension(self.ext());
        path
    }
}

/// A structure stored in `casmr` binary files of one type.
pub trait CasmrFile: Serialize + DeserializeOwned {
    const FILE_TYPE: CasmrFileType;
}

/// Reads a `casmr` binary file of the type belonging to `T`.
///
/// # Arguments
///
/// * `name` - The stem of the file, without `casmr`-specific extensions.
pub fn read_casmr_binary<T: CasmrFile, P: AsRef<Path>>(name: P) -> Result<T, anyhow::Error> {
    let path = T::FILE_TYPE.path(name);
    let mut reader = BufReader::new(
        File::open(&path).map_err(|err| format_err!("{}: {err}", path.display()))?,
    );
    bincode::deserialize_from(&mut reader)
        .map_err(|err| format_err!("{} is not a valid `{}` file: {err}", path.display(), T::FILE_TYPE.ext()))
}

/// Writes `value` as a `casmr` binary file of the type belonging to `T`.
///
/// The data is first written next to the target and then renamed over it, so an interrupted
/// write leaves any earlier file with the same stem intact.
///
/// # Arguments
///
/// * `name` - The stem of the file, without `casmr`-specific extensions.
/// * `value` - The record to be written.
///
/// # Returns
///
/// The path of the written file.
pub fn write_casmr_binary<T: CasmrFile, P: AsRef<Path>>(
    name: P,
    value: &T,
) -> Result<PathBuf, anyhow::Error> {
    let path = T::FILE_TYPE.path(name);
    let mut partial = path.clone().into_os_string();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    {
        let mut writer = BufWriter::new(
            File::create(&partial).map_err(|err| format_err!("{}: {err}", partial.display()))?,
        );
        bincode::serialize_into(&mut writer, value).map_err(|err| format_err!(err))?;
        writer.flush()?;
    }
    fs::rename(&partial, &path).map_err(|err| format_err!("{}: {err}", path.display()))?;
    Ok(path)
}

/// Reads a YAML input file and deserialises it into an appropriate structure.
///
/// # Arguments
///
/// * `name` - The name of the file, with its `.yml` or `.yaml` extension.
pub fn read_casmr_yaml<T, P: AsRef<Path>>(name: P) -> Result<T, anyhow::Error>
where
    T: DeserializeOwned,
{
    let path = name.as_ref();
    let mut reader = BufReader::new(
        File::open(path).map_err(|err| format_err!("{}: {err}", path.display()))?,
    );
    serde_yaml::from_reader(&mut reader).map_err(|err| format_err!("{}: {err}", path.display()))
}
