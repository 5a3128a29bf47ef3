pub mod runner;

pub use runner::{report_gc_stats, report_test_results, run_vm_tests, TestResult};
