//! Scenario tests for the binary crate: whole-pipeline behaviour and the
//! command line.

mod scenario_tests;
