//! OS installation onto the exported LUN.
//!
//! Strictly ordered: discovery, login, device resolution, install, logout.
//! Any step failing aborts the remaining forward steps, but logout always
//! runs once a login happened, even if the installer failed: leaking an iSCSI
//! session would poison subsequent test runs on the same initiator.
//!
//! The installer target is resolved through `/dev/disk/by-path`, which
//! encodes the IQN of the session the device belongs to. Positional names
//! like `/dev/sda` cannot distinguish the iSCSI LUN from local disks.

use std::time::Duration;

use tracing::{info, warn};

use crate::config::TargetConfig;
use crate::errors::{Stage, TestError};
use crate::machine::Machine;
use crate::retry;
use crate::ssh::CommandOutput;

/// Patience for udev to surface the block device after login.
const DEVICE_ATTEMPTS: u32 = 10;
const DEVICE_DELAY: Duration = Duration::from_secs(1);

/// Make the exported LUN visible locally, install the OS onto it, then
/// release the session. `address` is the discovery portal of the target.
pub fn install_to_lun(
    machine: &dyn Machine,
    address: &str,
    config: &TargetConfig,
) -> Result<(), TestError> {
    let discovery = run_step(machine, &format!("iscsiadm -m discovery -p {address} -t st"))?;
    check_setup_step("discovery", address, &discovery)?;

    let login = run_step(machine, &format!("iscsiadm -m node -T {} -l", config.iqn))?;
    check_setup_step("login", address, &login)?;

    // From here on a session exists; logout must run exactly once no matter
    // how the install goes.
    let result = resolve_and_install(machine, config);

    let logout = machine.run_command("iscsiadm --mode node --logoutall=all");
    match logout {
        Ok(out) if out.success() => {}
        Ok(out) => warn!(
            "iscsi logout exited {}: {}",
            out.status,
            out.stderr.trim()
        ),
        Err(e) => warn!("iscsi logout failed: {e}"),
    }

    result
}

fn resolve_and_install(machine: &dyn Machine, config: &TargetConfig) -> Result<(), TestError> {
    let device = retry::retry(DEVICE_ATTEMPTS, DEVICE_DELAY, || {
        resolve_lun_device(machine, &config.iqn)
    })?;
    info!("iSCSI LUN visible as {device}");

    let mut cmd = format!("coreos-installer install {}", quote(&device)?);
    for karg in config.installer_kargs() {
        cmd.push_str(" --append-karg ");
        cmd.push_str(&quote(&karg)?);
    }
    let out = run_step(machine, &cmd)?;
    if !out.success() {
        return Err(TestError::Install {
            status: out.status,
            detail: out.stderr.trim().to_string(),
        });
    }
    info!("installer finished successfully");
    Ok(())
}

/// Find the block device belonging to the session with our IQN.
fn resolve_lun_device(machine: &dyn Machine, iqn: &str) -> Result<String, TestError> {
    let listing = run_step(machine, "ls /dev/disk/by-path")?;
    if !listing.success() {
        return Err(install_error(format!(
            "listing /dev/disk/by-path exited {}",
            listing.status
        )));
    }
    let needle = format!("-iscsi-{iqn}-lun-");
    let entry = listing
        .stdout
        .lines()
        .map(str::trim)
        .find(|line| line.contains(&needle))
        .ok_or_else(|| install_error(format!("no by-path entry for session {iqn} yet")))?;

    let resolved = run_step(
        machine,
        &format!("readlink -f /dev/disk/by-path/{}", quote(entry)?),
    )?;
    if !resolved.success() || resolved.stdout.trim().is_empty() {
        return Err(install_error(format!("could not resolve device for {entry}")));
    }
    Ok(resolved.stdout.trim().to_string())
}

/// Run one step, mapping transport loss through unchanged.
fn run_step(machine: &dyn Machine, command: &str) -> Result<CommandOutput, TestError> {
    machine.run_command(command)
}

fn check_setup_step(step: &str, address: &str, out: &CommandOutput) -> Result<(), TestError> {
    if out.success() {
        Ok(())
    } else {
        Err(install_error(format!(
            "{step} against {address} exited {}: {}",
            out.status,
            out.stderr.trim()
        )))
    }
}

fn install_error(detail: String) -> TestError {
    TestError::Setup {
        stage: Stage::Install,
        detail,
    }
}

/// Quote one shell argument, leaving plain arguments (device paths, kargs
/// like `ip=ibft`) untouched so the assembled command stays readable.
fn quote(s: &str) -> Result<String, TestError> {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "=_.,:/@%+-".contains(c));
    if plain {
        return Ok(s.to_string());
    }
    shlex::try_quote(s)
        .map(|q| q.into_owned())
        .map_err(|e| install_error(format!("unquotable argument {s:?}: {e}")))
}
