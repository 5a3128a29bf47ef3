use std::env;

use crate::{OutputMode, VmConfig};

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub gc_threshold: usize,
    pub gc_debug: bool,
    pub gc_stats: bool,
    pub run_tests: bool,
    pub no_table: bool,
    pub trace: bool,
    pub command: CliCommand,
}

#[derive(Debug, Clone)]
pub enum CliCommand {
    /// Run every built-in demo program.
    Demos,
    /// Run one demo by name.
    Demo { name: String },
    /// Disassemble one demo's functions through the code iterator.
    Dis { name: String },
}

impl CliArgs {
    pub fn parse() -> Result<Self, String> {
        let args: Vec<String> = env::args().collect();

        let mut gc_threshold = 100;
        let mut gc_debug = false;
        let mut gc_stats = false;
        let mut run_tests = false;
        let mut no_table = false;
        let mut trace = false;
        let mut index = 1;

        // Parse flags
        while index < args.len() && args[index].starts_with("--") {
            match args[index].as_str() {
                "--gc-threshold" => {
                    if index + 1 >= args.len() {
                        return Err("--gc-threshold requires a number".to_string());
                    }
                    gc_threshold = args[index + 1]
                        .parse()
                        .map_err(|_| format!("Bad GC threshold: {}", args[index + 1]))?;
                    index += 2;
                }
                "--gc-debug" => {
                    gc_debug = true;
                    index += 1;
                }
                "--gc-stats" => {
                    gc_stats = true;
                    index += 1;
                }
                "--run-tests" => {
                    run_tests = true;
                    index += 1;
                }
                "--no-table" => {
                    no_table = true;
                    index += 1;
                }
                "--trace" => {
                    trace = true;
                    index += 1;
                }
                _ => {
                    return Err(format!("Unknown flag: {}", args[index]));
                }
            }
        }

        // Parse command
        let command = if index < args.len() {
            match args[index].as_str() {
                "demos" => CliCommand::Demos,
                "demo" => {
                    if args.len() != index + 2 {
                        return Err("Usage: lilyvm demo <name>".to_string());
                    }
                    CliCommand::Demo { name: args[index + 1].clone() }
                }
                "dis" => {
                    if args.len() != index + 2 {
                        return Err("Usage: lilyvm dis <name>".to_string());
                    }
                    CliCommand::Dis { name: args[index + 1].clone() }
                }
                other => {
                    return Err(format!("Unknown command: {}\n{}", other, Self::usage_string()));
                }
            }
        } else if run_tests {
            // --run-tests alone is fine; reuse the demos command so the
            // run has something to do afterward.
            CliCommand::Demos
        } else {
            return Err(Self::usage_string());
        };

        Ok(CliArgs {
            gc_threshold,
            gc_debug,
            gc_stats,
            run_tests,
            no_table,
            trace,
            command,
        })
    }

    pub fn to_vm_config(&self) -> VmConfig {
        let output_mode = if self.no_table {
            OutputMode::Plain
        } else {
            OutputMode::PrettyTable
        };

        VmConfig {
            output_mode,
            gc_threshold: self.gc_threshold,
            recursion_limit: 100,
            gc_debug: self.gc_debug,
            gc_stats: self.gc_stats,
            trace: self.trace,
            run_tests: self.run_tests,
        }
    }

    fn usage_string() -> String {
        "Usage: lilyvm [--gc-threshold <n>] [--gc-debug] [--gc-stats] [--run-tests] [--no-table] [--trace] <command>\n\
         \x20      lilyvm demos                # Run all built-in demo programs\n\
         \x20      lilyvm demo <name>          # Run one demo (arith, closure, match, exception, cycle)\n\
         \x20      lilyvm dis <name>           # Disassemble a demo's functions\n\
         \n\
         GC: --gc-threshold sets the live-entry limit before a pass, --gc-debug prints pass details\n\
         Debug Output: --run-tests runs the unit test table, --gc-stats prints the GC table after a run\n\
         Table Control: --no-table switches to plain text output\n\
         Tracing: --trace prints each opcode as it is dispatched"
            .to_string()
    }
}
