//! End-to-end hot-plug scenarios.
//!
//! - `scenario_test`: the pass, add-timeout and partial multipath cases
//! - `stress_test`: randomized core ordering, budgets and abandoned resources
//! - `config_test`: configuration files and the JSON report

mod common;
mod config_test;
mod scenario_test;
mod stress_test;
