use std::process;

use lily_vm::cli;

fn main() {
    if let Err(e) = cli::run_cli() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
