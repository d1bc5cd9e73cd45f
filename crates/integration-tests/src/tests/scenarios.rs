//! Scenario selection and end-to-end runs of the ibvk binary.

use color_eyre::eyre::eyre;
use color_eyre::Result;

use crate::{run_ibvk, vm_tests_enabled};

fn test_list_human_readable() -> Result<()> {
    let out = run_ibvk(&["list"])?;
    if !out.success() {
        return Err(eyre!("'ibvk list' failed: {}", out.stderr));
    }
    for name in ["iscsi-boot", "iscsi-boot-blockdev"] {
        if !out.stdout.contains(name) {
            return Err(eyre!("scenario '{}' missing from list output", name));
        }
    }
    Ok(())
}
crate::integration_test!(test_list_human_readable);

fn test_run_unknown_scenario_fails() -> Result<()> {
    let out = run_ibvk(&["run", "no-such-scenario"])?;
    if out.success() {
        return Err(eyre!("running an unknown scenario unexpectedly succeeded"));
    }
    if !out.stderr.contains("unknown scenario") {
        return Err(eyre!(
            "expected an 'unknown scenario' error, got: {}",
            out.stderr
        ));
    }
    Ok(())
}
crate::integration_test!(test_run_unknown_scenario_fails);

/// Full pass/fail run of one scenario. Needs KVM, podman, and network
/// access; enabled with IBVK_TEST_VM=1.
fn test_run_scenario(scenario: &str) -> Result<()> {
    if !vm_tests_enabled() {
        eprintln!("IBVK_TEST_VM is not set; skipping end-to-end run of {scenario}");
        return Ok(());
    }
    println!("Running scenario {scenario} end to end");
    let out = run_ibvk(&["run", scenario])?;
    if !out.success() {
        return Err(eyre!(
            "scenario {} did not pass:\nstdout: {}\nstderr: {}",
            scenario,
            out.stdout,
            out.stderr
        ));
    }
    if !out.stdout.contains("PASS") {
        return Err(eyre!("expected PASS verdict, got: {}", out.stdout));
    }
    Ok(())
}
crate::scenario_integration_test!(test_run_scenario);
