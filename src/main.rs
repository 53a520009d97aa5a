use std::process::ExitCode;

use clap::Parser;
use tokenstudio::cli::{self, CliArgs};

fn main() -> ExitCode {
    cli::run(CliArgs::parse())
}
