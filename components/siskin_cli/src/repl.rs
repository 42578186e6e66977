//! The interactive REPL.

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::error::{CliError, CliResult};
use crate::runtime::Runtime;

/// Run the read-eval-print loop until the user exits.
pub fn run_repl(runtime: &mut Runtime) -> CliResult<()> {
    let mut editor = DefaultEditor::new()
        .map_err(|e| CliError::Repl(format!("Failed to initialize editor: {e}")))?;

    println!("siskin {}", env!("CARGO_PKG_VERSION"));
    println!("Type code, or 'exit' to quit.");
    println!();

    let mut buffer = String::new();
    let mut continuing = false;

    loop {
        let prompt = if continuing { "... " } else { "> " };

        match editor.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim();

                if !continuing && (trimmed == "exit" || trimmed == ".exit" || trimmed == "quit") {
                    break;
                }
                if !continuing && trimmed.starts_with('.') {
                    handle_command(trimmed);
                    continue;
                }

                if continuing {
                    buffer.push('\n');
                }
                buffer.push_str(&line);

                if !is_input_complete(&buffer) {
                    continuing = true;
                    continue;
                }
                continuing = false;
                let _ = editor.add_history_entry(&buffer);

                match runtime.execute_repl_line(&buffer) {
                    Ok(Some(result)) => println!("{result}"),
                    Ok(None) => {}
                    // Diagnostics already went to stderr via the callbacks.
                    Err(_) => {}
                }
                buffer.clear();
            }
            Err(ReadlineError::Interrupted) => {
                if continuing {
                    println!("^C");
                    buffer.clear();
                    continuing = false;
                } else {
                    println!("Press Ctrl-D or type 'exit' to quit");
                }
            }
            Err(ReadlineError::Eof) => {
                println!();
                break;
            }
            Err(err) => {
                return Err(CliError::Repl(format!("Readline error: {err}")));
            }
        }
    }

    Ok(())
}

fn handle_command(command: &str) {
    match command {
        ".help" => {
            println!("REPL commands:");
            println!("  .help     Show this help message");
            println!("  .clear    Clear the screen");
            println!("  .exit     Exit the REPL");
        }
        ".clear" => {
            print!("\x1b[2J\x1b[1;1H");
        }
        _ => {
            println!("Unknown command: {command}");
            println!("Type .help for available commands");
        }
    }
}

/// Whether the input looks complete: balanced delimiters outside strings.
fn is_input_complete(input: &str) -> bool {
    let mut braces = 0i32;
    let mut brackets = 0i32;
    let mut parens = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        if in_string {
            match c {
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => braces += 1,
            '}' => braces -= 1,
            '[' => brackets += 1,
            ']' => brackets -= 1,
            '(' => parens += 1,
            ')' => parens -= 1,
            _ => {}
        }
    }

    braces <= 0 && brackets <= 0 && parens <= 0 && !in_string
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_simple() {
        assert!(is_input_complete("var x = 42"));
        assert!(is_input_complete("System.print(\"hi\")"));
    }

    #[test]
    fn test_incomplete_block() {
        assert!(!is_input_complete("class Foo {"));
        assert!(!is_input_complete("if (x) {"));
    }

    #[test]
    fn test_complete_block() {
        assert!(is_input_complete("if (true) { System.print(1) }"));
    }

    #[test]
    fn test_strings_hide_delimiters() {
        assert!(is_input_complete("var s = \"{ [ (\""));
        assert!(!is_input_complete("var s = \"unclosed"));
    }

    #[test]
    fn test_escaped_quote() {
        assert!(is_input_complete("var s = \"a \\\" b\""));
    }
}
