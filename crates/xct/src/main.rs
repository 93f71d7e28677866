//! xct - command-line entry point

use clap::Parser;
use xct_cli::cli::Cli;
use xct_cli::logging;

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(e) = xct_cli::run(cli) {
        eprintln!("xct: {e:#}");
        std::process::exit(1);
    }
}
