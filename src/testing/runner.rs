use comfy_table::{modifiers::UTF8_SOLID_INNER_BORDERS, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use colored::*;

use crate::builtins::register_builtins;
use crate::emit::Emitter;
use crate::expr::{Ast, BinaryOp};
use crate::gc::GcStats;
use crate::value::Value;
use crate::vm::Vm;
use crate::{OutputMode, VmConfig};

#[derive(Debug, Clone)]
pub struct TestResult {
    pub name: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
}

fn eval_program<F>(build: F) -> Result<Value, String>
where
    F: FnOnce(&mut Emitter) -> crate::vm::LilyResult<u16>,
{
    let mut emitter = Emitter::new("[test]");
    register_builtins(&mut emitter);

    let spot = build(&mut emitter).map_err(|e| e.to_string())?;
    let symtab = emitter.finish().map_err(|e| e.to_string())?;

    let mut vm = Vm::new(symtab, VmConfig::default());
    vm.run_main().map_err(|e| e.to_string())?;
    Ok(vm.global(spot))
}

fn check(results: &mut Vec<TestResult>, name: &str, expected: &str, outcome: Result<Value, String>) {
    let actual = match outcome {
        Ok(value) => value.to_string(),
        Err(e) => format!("ERROR: {}", e),
    };

    results.push(TestResult {
        name: name.to_string(),
        expected: expected.to_string(),
        actual: actual.clone(),
        passed: actual == expected,
    });
}

pub fn run_vm_tests(config: &VmConfig) {
    if !config.run_tests {
        return;
    }

    let mut results = Vec::new();

    // Test 1: Basic arithmetic into a global.
    check(
        &mut results,
        "Basic addition",
        "8",
        eval_program(|emitter| {
            let integer = emitter.pool.integer();
            let sum = Ast::binary(BinaryOp::Plus, Ast::integer(5, 1), Ast::integer(3, 1), 1);
            let var = emitter.declare_var_assigned("x", integer, &sum)?;
            Ok(emitter.global_spot(var).unwrap())
        }),
    );

    // Test 2: While loop with a mutated global.
    check(
        &mut results,
        "While loop sum",
        "10",
        eval_program(|emitter| {
            let integer = emitter.pool.integer();
            let total = emitter.declare_var_assigned("total", integer.clone(), &Ast::integer(0, 1))?;
            let i = emitter.declare_var_assigned("i", integer, &Ast::integer(0, 1))?;

            let cond = Ast::binary(BinaryOp::Lt, Ast::var(i, 2), Ast::integer(5, 2), 2);
            emitter.begin_while(&cond)?;
            emitter.eval_expr(&Ast::binary(
                BinaryOp::Assign,
                Ast::var(total, 3),
                Ast::binary(BinaryOp::Plus, Ast::var(total, 3), Ast::var(i, 3), 3),
                3,
            ))?;
            emitter.eval_expr(&Ast::binary(
                BinaryOp::Assign,
                Ast::var(i, 4),
                Ast::binary(BinaryOp::Plus, Ast::var(i, 4), Ast::integer(1, 4), 4),
                4,
            ))?;
            emitter.leave_block()?;

            Ok(emitter.global_spot(total).unwrap())
        }),
    );

    // Test 3: List build and subscript.
    check(
        &mut results,
        "List subscript",
        "30",
        eval_program(|emitter| {
            let integer = emitter.pool.integer();
            let list_ty = emitter.pool.list_of(integer.clone());

            let items = Ast::new(
                crate::expr::AstKind::BuildList(vec![
                    Ast::integer(10, 1),
                    Ast::integer(20, 1),
                    Ast::integer(30, 1),
                ]),
                1,
            );
            let list = emitter.declare_var_assigned("items", list_ty, &items)?;

            let last = Ast::subscript(Ast::var(list, 2), Ast::integer(-1, 2), 2);
            let var = emitter.declare_var_assigned("last", integer, &last)?;
            Ok(emitter.global_spot(var).unwrap())
        }),
    );

    report_test_results(&results, config);
}

pub fn report_test_results(results: &[TestResult], config: &VmConfig) {
    match config.output_mode {
        OutputMode::PrettyTable => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL)
                 .apply_modifier(UTF8_SOLID_INNER_BORDERS);
            table.set_header(vec!["Test", "Expected", "Actual", "Result"]);

            for r in results {
                let status = if r.passed { "PASS" } else { "FAIL" };
                table.add_row(vec![
                    Cell::new(&r.name),
                    Cell::new(&r.expected),
                    Cell::new(&r.actual),
                    Cell::new(status),
                ]);
            }

            println!("=== Unit Test Results ===");
            println!("{table}");
        }
        OutputMode::Plain => {
            println!("=== Unit Test Results ===");
            for r in results {
                let status = if r.passed { "PASS" } else { "FAIL" };
                println!(
                    "{} | expected: {} | actual: {} | {}",
                    r.name, r.expected, r.actual, status
                );
            }
        }
    }

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();
    println!("Tests passed: {}/{}", passed, total);
}

pub fn report_gc_stats(stats: &GcStats, config: &VmConfig) {
    match config.output_mode {
        OutputMode::PrettyTable => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL)
                 .apply_modifier(UTF8_SOLID_INNER_BORDERS);
            table.set_header(vec![
                Cell::new("GC Metric").add_attribute(Attribute::Bold).fg(Color::Cyan),
                Cell::new("Value").add_attribute(Attribute::Bold).fg(Color::White),
            ]);

            let current_color = if stats.current_allocated > 10000 { Color::Red }
                              else if stats.current_allocated > 1000 { Color::Yellow }
                              else { Color::Green };

            table.add_row(vec![
                Cell::new("Total Allocated").fg(Color::White),
                Cell::new(stats.total_allocated.to_string()).fg(Color::Blue),
            ]);
            table.add_row(vec![
                Cell::new("Total Freed").fg(Color::White),
                Cell::new(stats.total_freed.to_string()).fg(Color::Green),
            ]);
            table.add_row(vec![
                Cell::new("Currently Allocated").fg(Color::White),
                Cell::new(stats.current_allocated.to_string()).fg(current_color),
            ]);
            table.add_row(vec![
                Cell::new("Collections Performed").fg(Color::White),
                Cell::new(stats.collections_performed.to_string()).fg(Color::Magenta),
            ]);

            println!("{}", "═══ GC Statistics ═══".bright_cyan().bold());
            println!("{table}");
        }
        OutputMode::Plain => {
            println!("{}", "═══ GC Statistics ═══".bright_cyan().bold());
            println!("{}: {}", "Total allocated".bright_cyan(),
                     stats.total_allocated.to_string().blue());
            println!("{}: {}", "Total freed".bright_cyan(),
                     stats.total_freed.to_string().green());
            println!("{}: {}", "Currently allocated".bright_cyan(),
                     stats.current_allocated.to_string().yellow());
            println!("{}: {}", "Collections performed".bright_cyan(),
                     stats.collections_performed.to_string().magenta());
        }
    }
}
