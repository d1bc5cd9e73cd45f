//! Target machine setup: from "freshly booted" to "exposes a discoverable
//! iSCSI target".
//!
//! The target machine's own boot automation starts the storage-target
//! container and runs the one-shot targetcli script (see [`crate::config`]);
//! this coordinator only provisions the machine and then polls discovery
//! until the expected IQN shows up. Container start and target creation race
//! against the first discovery attempt, so the check always goes through the
//! retry policy. Exhausting the budget is a fatal setup error that aborts the
//! whole test.

use std::time::Duration;

use tracing::{debug, info};

use crate::config::TargetConfig;
use crate::errors::{Stage, TestError};
use crate::machine::{MachineBackend, MachineGuard, MachineOptions};
use crate::progress;
use crate::retry;

/// Patience for the target's storage stack to come up.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        // The container image pull dominates first boot; be generous.
        Self {
            max_attempts: 30,
            delay: Duration::from_secs(10),
        }
    }
}

/// A booted machine confirmed to expose a discoverable iSCSI target.
/// Immutable once created; the handle moves forward with the test.
pub struct TargetServer {
    pub machine: MachineGuard,
    /// host:port reachable for iSCSI discovery.
    pub address: String,
}

/// Provision the target machine and wait until its target is discoverable.
///
/// On readiness failure the provisioned machine is destroyed before the error
/// propagates (guard scope), so no handle leaks out of a failed setup.
pub fn setup_target(
    backend: &dyn MachineBackend,
    config: &TargetConfig,
    opts: &MachineOptions,
    policy: ReadinessPolicy,
) -> Result<TargetServer, TestError> {
    let (machine, address) = backend.provision(config, opts)?;
    let guard = MachineGuard::new(machine);
    info!(
        "provisioned target machine {} (discovery portal {})",
        guard.machine().name(),
        address
    );

    let pb = progress::wait_spinner("Waiting for iSCSI target to become discoverable");
    let result = retry::retry(policy.max_attempts, policy.delay, || {
        check_discoverable(&guard, &address, &config.iqn)
    });
    pb.finish_and_clear();
    result?;

    info!("target {} is discoverable at {}", config.iqn, address);
    Ok(TargetServer {
        machine: guard,
        address,
    })
}

/// One discovery probe: the expected IQN must appear in `iscsiadm` output.
/// Discovery is idempotent, so it is safe to repeat under retry.
fn check_discoverable(
    guard: &MachineGuard,
    address: &str,
    iqn: &str,
) -> Result<(), TestError> {
    let cmd = format!("iscsiadm -m discovery -p {address} -t st");
    let out = guard.machine().run_command(&cmd)?;
    if !out.success() {
        return Err(TestError::Setup {
            stage: Stage::TargetSetup,
            detail: format!(
                "discovery against {address} exited {}: {}",
                out.status,
                out.stderr.trim()
            ),
        });
    }
    if !out.stdout.contains(iqn) {
        debug!("discovery output lacks {iqn}: {:?}", out.stdout.trim());
        return Err(TestError::Setup {
            stage: Stage::TargetSetup,
            detail: format!("target {iqn} not present in discovery output from {address}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::machine::testutil::{failed_output, ok_output, MockBackend, MockState};

    fn policy(attempts: u32) -> ReadinessPolicy {
        ReadinessPolicy {
            max_attempts: attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_ready_after_second_discovery_attempt() {
        let state = Rc::new(RefCell::new(MockState::default()));
        let calls = Rc::new(RefCell::new(0u32));
        let calls2 = calls.clone();
        let backend = MockBackend {
            state: state.clone(),
            address: "10.0.2.2:42123".to_string(),
            handler: Rc::new(move |_cmd| {
                *calls2.borrow_mut() += 1;
                if *calls2.borrow() == 1 {
                    // Container still pulling; portal not up yet
                    Ok(failed_output(21, "connection refused"))
                } else {
                    Ok(ok_output(
                        "10.0.2.2:42123,1 iqn.2023-10.coreos.target.vm:coreos\n",
                    ))
                }
            }),
        };
        let server = setup_target(
            &backend,
            &TargetConfig::default(),
            &MachineOptions::default(),
            policy(5),
        )
        .unwrap();
        assert_eq!(server.address, "10.0.2.2:42123");
        assert_eq!(*calls.borrow(), 2);
        drop(server);
        assert_eq!(state.borrow().destroys, 1);
    }

    #[test]
    fn test_missing_iqn_is_setup_error_and_destroys_machine() {
        let state = Rc::new(RefCell::new(MockState::default()));
        let backend = MockBackend {
            state: state.clone(),
            address: "192.168.5.9:3260".to_string(),
            // Discovery succeeds but advertises some other target
            handler: Rc::new(|_cmd| Ok(ok_output("192.168.5.9:3260,1 iqn.2000-01.other:lun\n"))),
        };
        let err = setup_target(
            &backend,
            &TargetConfig::default(),
            &MachineOptions::default(),
            policy(3),
        )
        .err()
        .expect("discovery without our IQN must fail setup");
        assert!(matches!(err, TestError::Setup { .. }));
        // Retried to the budget, then the guard tore the machine down
        assert_eq!(state.borrow().commands.len(), 3);
        assert_eq!(state.borrow().destroys, 1);
    }

    #[test]
    fn test_discovery_command_shape() {
        let state = Rc::new(RefCell::new(MockState::default()));
        let backend = MockBackend {
            state: state.clone(),
            address: "10.0.2.2:901".to_string(),
            handler: Rc::new(|_cmd| {
                Ok(ok_output("10.0.2.2:901,1 iqn.2023-10.coreos.target.vm:coreos"))
            }),
        };
        let _server = setup_target(
            &backend,
            &TargetConfig::default(),
            &MachineOptions::default(),
            policy(1),
        )
        .unwrap();
        assert_eq!(
            state.borrow().commands[0],
            "iscsiadm -m discovery -p 10.0.2.2:901 -t st"
        );
    }
}
