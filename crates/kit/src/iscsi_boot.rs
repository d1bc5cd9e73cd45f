//! The full boot-verification scenario: provision, configure storage,
//! install, netboot, verify.
//!
//! Stages run strictly sequentially; any fatal error aborts the remaining
//! stages immediately. One [`TestOutcome`] is produced per invocation, with
//! the originating stage attached. The single cross-cutting invariant is that
//! no machine handle outlives this module's entry point: every machine
//! provisioned along the way is destroyed on every exit path.

use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::{TargetConfig, COMPLETION_CHANNEL};
use crate::errors::{Stage, TestError, TestOutcome};
use crate::install;
use crate::machine::{MachineBackend, MachineOptions};
use crate::ssh::SshRunner;
use crate::target::{self, ReadinessPolicy};
use crate::verify::{BootVerifier, CompletionDetector, NETBOOT_CONTAINER};

/// Which completion-detection strategy a deployment uses. The strategies are
/// alternatives implementing the same contract; a run uses exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    SerialChannel,
    LogPattern,
}

/// Bounded patience for the whole scenario.
#[derive(Debug, Clone, Copy)]
pub struct RunPolicy {
    pub readiness: ReadinessPolicy,
    /// Overall window for the nested machine to report multi-user.
    pub verify_timeout: Duration,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            readiness: ReadinessPolicy::default(),
            verify_timeout: Duration::from_secs(300),
        }
    }
}

/// Run the scenario end to end and report exactly one outcome.
pub fn run_iscsi_boot(
    backend: &dyn MachineBackend,
    config: &TargetConfig,
    machine_opts: &MachineOptions,
    policy: &RunPolicy,
    detection: Detection,
) -> TestOutcome {
    match run_stages(backend, config, machine_opts, policy, detection) {
        Ok(()) => TestOutcome::Pass,
        Err(TestError::VerificationTimeout { timeout }) => TestOutcome::Fail {
            stage: Stage::Verify,
            reason: format!("nested machine did not reach multi-user within {timeout:?}"),
        },
        Err(error) => TestOutcome::Fatal {
            stage: error.stage(),
            error,
        },
    }
}

fn run_stages(
    backend: &dyn MachineBackend,
    config: &TargetConfig,
    machine_opts: &MachineOptions,
    policy: &RunPolicy,
    detection: Detection,
) -> Result<(), TestError> {
    // Machine teardown rides on the guard inside TargetServer: dropping it on
    // any path below, early error included, destroys the machine exactly once.
    let server = target::setup_target(backend, config, machine_opts, policy.readiness)?;

    install::install_to_lun(server.machine.machine(), &server.address, config)?;

    let mut verifier = BootVerifier::new(server.machine.machine(), policy.verify_timeout);
    verifier.launch()?;
    let detector = match detection {
        Detection::LogPattern => CompletionDetector::LogPattern,
        Detection::SerialChannel => CompletionDetector::SerialChannel(spawn_channel_reader(
            server.machine.machine().ssh_address().to_string(),
            policy.verify_timeout,
        )),
    };
    let result = verifier.await_completion(detector);
    // The nested machine comes down regardless of its internal state.
    verifier.teardown();
    info!("scenario finished: {:?}", verifier.state());
    result
}

/// Production wiring for the side channel: a reader polls the virtio-serial
/// channel output inside the netboot container and forwards the first
/// non-empty message into a single-slot channel owned by this invocation.
fn spawn_channel_reader(ssh_address: String, timeout: Duration) -> Receiver<String> {
    let (tx, rx) = mpsc::sync_channel(1);
    std::thread::spawn(move || {
        let runner = SshRunner::default();
        let deadline = Instant::now() + timeout;
        let read_cmd =
            format!("podman exec {NETBOOT_CONTAINER} cat /run/{COMPLETION_CHANNEL} 2>/dev/null");
        while Instant::now() < deadline {
            match runner.run(&ssh_address, &read_cmd) {
                Ok(out) if out.success() => {
                    let line = out.stdout.trim();
                    if !line.is_empty() {
                        // Single delivery; the receiver may already be gone
                        let _ = tx.send(line.to_string());
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("completion channel read failed: {e}"),
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    });
    rx
}
