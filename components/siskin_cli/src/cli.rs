//! Command-line argument definitions.

use clap::Parser;

/// The Siskin interpreter.
///
/// With a path, runs the script. With `--eval`, runs inline code. With no
/// arguments, starts the interactive REPL.
#[derive(Debug, Parser)]
#[command(name = "siskin", disable_version_flag = true)]
pub struct Cli {
    /// Script file to run.
    pub path: Option<String>,

    /// Evaluate inline code instead of a file.
    #[arg(short, long)]
    pub eval: Option<String>,

    /// Print the compiled bytecode before running.
    #[arg(long)]
    pub print_bytecode: bool,

    /// Permit a trailing semicolon after statements.
    #[arg(long)]
    pub trailing_semicolons: bool,

    /// Print the version and exit.
    #[arg(short = 'v', long = "version")]
    pub version: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_no_args() {
        let cli = Cli::try_parse_from(["siskin"]).unwrap();
        assert_eq!(cli.path, None);
        assert_eq!(cli.eval, None);
        assert!(!cli.print_bytecode);
        assert!(!cli.version);
    }

    #[test]
    fn test_parse_path() {
        let cli = Cli::try_parse_from(["siskin", "script.skn"]).unwrap();
        assert_eq!(cli.path.as_deref(), Some("script.skn"));
    }

    #[test]
    fn test_parse_eval() {
        let cli = Cli::try_parse_from(["siskin", "-e", "System.print(1)"]).unwrap();
        assert_eq!(cli.eval.as_deref(), Some("System.print(1)"));
    }

    #[test]
    fn test_parse_version_short_and_long() {
        assert!(Cli::try_parse_from(["siskin", "-v"]).unwrap().version);
        assert!(Cli::try_parse_from(["siskin", "--version"]).unwrap().version);
    }

    #[test]
    fn test_parse_print_bytecode() {
        let cli = Cli::try_parse_from(["siskin", "--print-bytecode", "a.skn"]).unwrap();
        assert!(cli.print_bytecode);
        assert_eq!(cli.path.as_deref(), Some("a.skn"));
    }
}
