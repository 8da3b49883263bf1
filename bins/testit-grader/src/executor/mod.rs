/// Test executors, one per test variant.
///
/// Each executor turns a spec into one or more `TestResult`s and never
/// returns an error: anything that goes wrong is the failing result's reason.
pub mod build_report;
pub mod http;
