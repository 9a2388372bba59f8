//! Crate-level test suites, run against the hosted kernel.

mod helpers;
mod integration;

/// Knobs shared by the heavier suites.
pub(crate) struct TestConfig {
    pub(crate) stress_thread_count: usize,
    pub(crate) stress_iterations: usize,
    pub(crate) property_cases: usize,
}

pub(crate) static TEST_CONFIG: spin::Mutex<TestConfig> = spin::Mutex::new(TestConfig {
    stress_thread_count: 8,
    stress_iterations: 500,
    property_cases: 64,
});
