//! irisopsctl - run remediation commands against an IRIS instance

use clap::Parser;
use irisopsctl::cli::Cli;
use irisopsctl::{commands, errors, output};

fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    let code = match commands::run(cli) {
        Ok(code) => code,
        Err(err) => {
            output::display_error(&err, json);
            errors::exit_code_for(&err)
        }
    };
    std::process::exit(code);
}
