//! Integration tests for ibvk

use std::process::Output;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use serde_json::Value;
use xshell::{cmd, Shell};

// Re-export registry pieces for the test modules
pub(crate) use ibvk_integration_tests::{
    integration_test, scenario_integration_test, scenario_to_test_suffix, INTEGRATION_TESTS,
    SCENARIO_INTEGRATION_TESTS,
};

mod tests {
    pub mod scenarios;
}

/// Get the path to the ibvk binary, checking IBVK_PATH env var first, then
/// falling back to "ibvk"
pub(crate) fn get_ibvk_command() -> Result<String> {
    if let Some(path) = std::env::var("IBVK_PATH").ok() {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/ibvk", "target/release/ibvk"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set IBVK_PATH={path} to run using this binary"
        ));
    }
    Ok("ibvk".to_owned())
}

/// Scenario names to exercise end to end.
///
/// Parses the IBVK_SCENARIOS environment variable (whitespace-separated);
/// falls back to everything `ibvk list` reports.
pub(crate) fn get_test_scenarios() -> Result<Vec<String>> {
    if let Ok(names) = std::env::var("IBVK_SCENARIOS") {
        let names: Vec<String> = names.split_whitespace().map(|s| s.to_string()).collect();
        if !names.is_empty() {
            return Ok(names);
        }
        eprintln!("Warning: IBVK_SCENARIOS is set but empty, falling back to `ibvk list`");
    }
    let sh = Shell::new()?;
    let ibvk = get_ibvk_command()?;
    let stdout = cmd!(sh, "{ibvk} list --json").read()?;
    let metas: Value = serde_json::from_str(&stdout).context("Failed to parse scenario JSON")?;
    Ok(metas
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                .map(|n| n.to_string())
                .collect()
        })
        .unwrap_or_default())
}

/// Whether end-to-end VM tests are enabled in this environment.
pub(crate) fn vm_tests_enabled() -> bool {
    std::env::var("IBVK_TEST_VM").map(|v| v == "1").unwrap_or(false)
}

/// Captured output from a command with decoded stdout/stderr strings
pub(crate) struct CapturedOutput {
    pub output: Output,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    pub fn success(&self) -> bool {
        self.output.status.success()
    }
}

/// Run the ibvk command, capturing output
pub(crate) fn run_ibvk(args: &[&str]) -> Result<CapturedOutput> {
    let ibvk = get_ibvk_command()?;
    let output = std::process::Command::new(&ibvk).args(args).output()?;
    Ok(CapturedOutput::new(output))
}

fn test_list_json() -> Result<()> {
    println!("Running test: ibvk list --json");

    let sh = Shell::new()?;
    let ibvk = get_ibvk_command()?;

    let output = cmd!(sh, "{ibvk} list --json").output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!("Failed to run 'ibvk list --json': {}", stderr));
    }

    let stdout = String::from_utf8(output.stdout)?;
    let metas: Value = serde_json::from_str(&stdout).context("Failed to parse JSON output")?;
    let metas = metas
        .as_array()
        .ok_or_else(|| eyre!("Expected JSON array in output, got: {}", stdout))?;

    for (index, meta) in metas.iter().enumerate() {
        for key in ["name", "description", "platforms", "tags"] {
            if meta.get(key).is_none() {
                return Err(eyre!(
                    "Scenario entry {} is missing '{}': {}",
                    index,
                    key,
                    meta
                ));
            }
        }
    }

    let names: Vec<_> = metas
        .iter()
        .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
        .collect();
    if !names.contains(&"iscsi-boot") {
        return Err(eyre!("'iscsi-boot' missing from scenario list: {names:?}"));
    }

    println!("Test passed: ibvk list --json ({} scenarios)", metas.len());
    Ok(())
}
integration_test!(test_list_json);

fn main() {
    // Integration tests are only supported on Linux
    if std::env::consts::OS != "linux" {
        eprintln!(
            "Integration tests are only supported on Linux (current OS: {})",
            std::env::consts::OS
        );
        eprintln!("Skipping all integration tests.");
        std::process::exit(0);
    }

    let args = Arguments::from_args();

    let mut trials: Vec<Trial> = Vec::new();

    trials.extend(INTEGRATION_TESTS.iter().map(|test| {
        let name = test.name;
        let f = test.f;
        Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into()))
    }));

    // Generate one variant per scenario for parameterized tests
    let scenarios = get_test_scenarios().unwrap_or_else(|e| {
        eprintln!("Warning: could not enumerate scenarios: {e:?}");
        Vec::new()
    });
    for param_test in SCENARIO_INTEGRATION_TESTS.iter() {
        for scenario in &scenarios {
            let scenario = scenario.clone();
            let test_name = format!(
                "{}_{}",
                param_test.name,
                scenario_to_test_suffix(&scenario)
            );
            let f = param_test.f;
            trials.push(Trial::test(test_name, move || {
                f(&scenario).map_err(|e| format!("{:?}", e).into())
            }));
        }
    }

    libtest_mimic::run(&args, trials).exit();
}
