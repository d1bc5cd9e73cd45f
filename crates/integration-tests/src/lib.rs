//! Registry for ibvk integration tests.
//!
//! Tests register themselves into distributed slices; the harness binary
//! collects them into libtest-mimic trials. Scenario-parameterized tests run
//! once per registered scenario name.

pub use linkme;
use linkme::distributed_slice;

pub struct IntegrationTest {
    pub name: &'static str,
    pub f: fn() -> color_eyre::Result<()>,
}

#[distributed_slice]
pub static INTEGRATION_TESTS: [IntegrationTest];

/// A test run once per scenario name reported by `ibvk list`.
pub struct ScenarioIntegrationTest {
    pub name: &'static str,
    pub f: fn(&str) -> color_eyre::Result<()>,
}

#[distributed_slice]
pub static SCENARIO_INTEGRATION_TESTS: [ScenarioIntegrationTest];

/// Register a plain integration test function.
#[macro_export]
macro_rules! integration_test {
    ($f:ident) => {
        const _: () = {
            #[$crate::linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            static REGISTERED: $crate::IntegrationTest = $crate::IntegrationTest {
                name: stringify!($f),
                f: $f,
            };
        };
    };
}

/// Register a test run once per scenario.
#[macro_export]
macro_rules! scenario_integration_test {
    ($f:ident) => {
        const _: () = {
            #[$crate::linkme::distributed_slice($crate::SCENARIO_INTEGRATION_TESTS)]
            static REGISTERED: $crate::ScenarioIntegrationTest = $crate::ScenarioIntegrationTest {
                name: stringify!($f),
                f: $f,
            };
        };
    };
}

/// Turn a scenario name into a test-name suffix.
pub fn scenario_to_test_suffix(scenario: &str) -> String {
    scenario.replace(['.', '-', ':'], "_")
}
