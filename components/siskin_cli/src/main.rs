//! The `siskin` binary: file runner, inline evaluator, and REPL.

use clap::Parser;
use siskin_cli::{repl, Cli, CliError, Runtime};

fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("siskin {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let mut runtime = Runtime::new(cli.print_bytecode, cli.trailing_semicolons);

    let result = if let Some(code) = &cli.eval {
        runtime.execute_source("main", code)
    } else if let Some(path) = &cli.path {
        runtime.execute_file(path)
    } else {
        repl::run_repl(&mut runtime)
    };

    match result {
        Ok(()) => {}
        Err(error) => {
            if let CliError::Io(e) = &error {
                eprintln!("Error: {e}");
            }
            std::process::exit(error.exit_code());
        }
    }
}
