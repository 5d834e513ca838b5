//! Acceptance test suite modules.

pub mod common;

mod bank_test;
mod interlock_test;
