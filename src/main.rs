use std::path::Path;
use std::process;

use anyhow::{self, format_err};
use clap::Parser;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

use casmr::interfaces::cli::{log_heading, Cli};
use casmr::interfaces::input::Input;
use casmr::interfaces::InputHandle;
use casmr::io::read_casmr_yaml;

/// Configures the loggers: diagnostics go to the console and the main output goes either to the
/// console or to `output`.
fn init_logging(output: Option<&Path>, debug: bool) -> Result<(), anyhow::Error> {
    let root_level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{h({l})} {m}{n}")))
        .build();
    let output_appender: Box<dyn log4rs::append::Append> = match output {
        Some(path) => Box::new(
            FileAppender::builder()
                .encoder(Box::new(PatternEncoder::new("{m}{n}")))
                .append(false)
                .build(path)?,
        ),
        None => Box::new(
            ConsoleAppender::builder()
                .encoder(Box::new(PatternEncoder::new("{m}{n}")))
                .build(),
        ),
    };
    let config = Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)))
        .appender(Appender::builder().build("output", output_appender))
        .logger(
            Logger::builder()
                .appender("output")
                .additive(false)
                .build("casmr-output", LevelFilter::Info),
        )
        .build(Root::builder().appender("console").build(root_level))?;
    log4rs::init_config(config)?;
    Ok(())
}

fn read_input(cli: &Cli) -> Result<Input, anyhow::Error> {
    let config = cli
        .config
        .as_ref()
        .ok_or_else(|| format_err!("No configuration file given. Use `--config`."))?;
    read_casmr_yaml::<Input, _>(config)
}

fn run(cli: &Cli) -> i32 {
    log_heading();
    let input = match read_input(cli) {
        Ok(input) => input,
        Err(err) => {
            log::error!(target: "casmr-output", "{err:#}");
            log::error!("{err:#}");
            return 1;
        }
    };
    if input.handle().is_err() {
        return 1;
    }
    0
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.output.as_deref(), cli.debug) {
        eprintln!("Unable to configure logging: {err}");
        process::exit(1);
    }
    // MPI is finalised when the universe is dropped, so it must outlive the calculation.
    #[cfg(feature = "mpi")]
    let universe = mpi::initialize();
    #[cfg(feature = "mpi")]
    if universe.is_none() {
        log::error!("Unable to initialise the MPI environment.");
        process::exit(1);
    }
    let code = run(&cli);
    #[cfg(feature = "mpi")]
    drop(universe);
    if code != 0 {
        process::exit(code);
    }
}
