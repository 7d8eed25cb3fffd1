//! Formatting of the `casmr-output` log.

use std::fmt;

use log;

const CASMR_BANNER_LENGTH: usize = 91;

/// Logs an error to the `casmr-output` logger and to the default logger.
macro_rules! casmr_error {
    ($fmt:expr $(, $($arg:tt)*)?) => {
        log::error!($fmt, $($($arg)*)?);
        log::error!(target: "casmr-output", $fmt, $($($arg)*)?);
    }
}

/// Logs a warning to the `casmr-output` logger.
macro_rules! casmr_warn {
    ($fmt:expr $(, $($arg:tt)*)?) => { log::warn!(target: "casmr-output", $fmt, $($($arg)*)?) }
}

/// Logs a main output line to the `casmr-output` logger.
macro_rules! casmr_output {
    ($fmt:expr $(, $($arg:tt)*)?) => { log::info!(target: "casmr-output", $fmt, $($($arg)*)?) }
}

pub(crate) use {casmr_error, casmr_output, casmr_warn};

/// The three lines of a boxed section title.
fn title_box(title: &str) -> [String; 3] {
    let length = title.chars().count().max(CASMR_BANNER_LENGTH - 6);
    let bar = "─".repeat(length);
    [
        format!("┌──{bar}──┐"),
        format!("│§ {title:^length$} §│"),
        format!("└──{bar}──┘"),
    ]
}

/// Writes a boxed section title, as used by the density printouts.
pub(crate) fn write_title(f: &mut fmt::Formatter<'_>, title: &str) -> fmt::Result {
    title_box(title)
        .iter()
        .try_for_each(|line| writeln!(f, "{line}"))
}

/// Logs a boxed section title, as used by the drivers.
pub(crate) fn log_title(title: &str) {
    title_box(title)
        .iter()
        .for_each(|line| casmr_output!("{line}"));
}

/// Logs an underlined subtitle.
pub(crate) fn log_subtitle(subtitle: &str) {
    casmr_output!("{subtitle}");
    casmr_output!("{}", "═".repeat(subtitle.chars().count()));
}

/// Logs the header of an iteration table between two rules as wide as the header.
///
/// Returns the width, for the closing [`log_rule`].
pub(crate) fn log_table_header(header: &str) -> usize {
    let width = header.chars().count();
    log_rule(width);
    casmr_output!("{header}");
    log_rule(width);
    width
}

/// Logs a horizontal rule.
pub(crate) fn log_rule(width: usize) {
    casmr_output!("{}", "┈".repeat(width));
}

pub(crate) fn nice_bool(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

/// The annotation appended to energies and iteration counts that have not converged.
pub(crate) fn convergence_note(converged: bool) -> &'static str {
    if converged {
        ""
    } else {
        " (not converged)"
    }
}

/// Logs the `Display` output of parameters and results line by line.
pub(crate) trait CasmrOutput: fmt::Display {
    fn log_output_display(&self) {
        self.to_string()
            .lines()
            .for_each(|line| casmr_output!("{line}"));
    }
}

impl<T> CasmrOutput for T where T: fmt::Display {}
