//! Shared contracts between the grader and the test bank: the test
//! specification model, feedback records, the cumulative result artifact,
//! and the bank's HTTP client.

pub mod bank;
pub mod types;
