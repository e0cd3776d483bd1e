use clap::Parser;
use rulescan::cli::{Cli, run};

fn main() -> std::process::ExitCode {
    run(Cli::parse())
}
