//! Nested netboot launch and completion detection.
//!
//! The nested machine boots over the network from the freshly installed LUN,
//! driven by a container running the iPXE boot script on the target machine.
//! The verifier decides pass/fail by observing exactly one successful-boot
//! event within an overall deadline. Two detection strategies implement that
//! contract and a deployment picks one; they are alternatives, never a
//! dual-check:
//!
//! - a side channel: the guest's boot automation writes a literal token to a
//!   guest-to-host virtio-serial channel, surfaced here as a single-slot
//!   message channel;
//! - a log pattern: the nested machine's console log is polled for the
//!   init system's multi-user milestone line.
//!
//! Timeout expiry is a verdict (the boot did not happen in time), not a
//! retryable condition. Terminal states are final.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::COMPLETION_TOKEN;
use crate::errors::{Stage, TestError};
use crate::machine::Machine;
use crate::progress;

/// Name of the container running the nested netboot.
pub const NETBOOT_CONTAINER: &str = "iscsiboot";

/// Pattern the log-based detector looks for in the nested machine's console.
pub const MULTI_USER_PATTERN: &str = r"OK.*multi-user\.target";

/// Interval between console-log polls.
const LOG_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Lifecycle of one verification run. Terminal states are final; a failed
/// boot is never re-attempted by this component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    NotStarted,
    Booting,
    Succeeded,
    TimedOut,
    LaunchFailed,
}

impl BootState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BootState::Succeeded | BootState::TimedOut | BootState::LaunchFailed
        )
    }
}

/// How a completion event is detected.
pub enum CompletionDetector {
    /// Per-invocation single-slot channel carrying the guest's token.
    SerialChannel(Receiver<String>),
    /// Poll the netboot container's log for [`MULTI_USER_PATTERN`].
    LogPattern,
}

/// Drives the nested machine's netboot and watches for the completion event.
pub struct BootVerifier<'a> {
    machine: &'a dyn Machine,
    timeout: Duration,
    state: BootState,
}

impl<'a> BootVerifier<'a> {
    pub fn new(machine: &'a dyn Machine, timeout: Duration) -> Self {
        Self {
            machine,
            timeout,
            state: BootState::NotStarted,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    /// Launch the nested machine's netboot sequence (detached). A launch
    /// failure is terminal and fatal.
    pub fn launch(&mut self) -> Result<(), TestError> {
        assert_eq!(self.state, BootState::NotStarted, "launch is not restartable");
        let cmd = format!(
            "podman run -d --privileged --net=host --name {NETBOOT_CONTAINER} --rm \
             -v /mnt/temp/boot.ipxe:/mnt/temp/boot.ipxe \
             quay.io/coreos-assembler/coreos-assembler shell -- \
             kola qemuexec --netboot /mnt/temp/boot.ipxe --usernet-addr 10.0.3.0/24"
        );
        match self.machine.run_command(&cmd) {
            Ok(out) if out.success() => {
                info!("nested netboot launched (container {NETBOOT_CONTAINER})");
                self.state = BootState::Booting;
                Ok(())
            }
            Ok(out) => {
                self.state = BootState::LaunchFailed;
                Err(TestError::Setup {
                    stage: Stage::Verify,
                    detail: format!(
                        "netboot launch exited {}: {}",
                        out.status,
                        out.stderr.trim()
                    ),
                })
            }
            Err(e) => {
                self.state = BootState::LaunchFailed;
                Err(e)
            }
        }
    }

    /// Block until the completion event arrives or the deadline passes.
    /// Returns the terminal state reached; `TimedOut` maps to
    /// [`TestError::VerificationTimeout`].
    pub fn await_completion(&mut self, detector: CompletionDetector) -> Result<(), TestError> {
        assert_eq!(self.state, BootState::Booting, "nothing is booting");
        let deadline = Instant::now() + self.timeout;
        let pb = progress::wait_spinner("Waiting for nested machine to reach multi-user");
        let result = match detector {
            CompletionDetector::SerialChannel(rx) => self.wait_for_token(&rx, deadline),
            CompletionDetector::LogPattern => self.wait_for_log_line(deadline),
        };
        pb.finish_and_clear();

        match result {
            Ok(()) => {
                self.state = BootState::Succeeded;
                info!("nested machine reached multi-user");
                Ok(())
            }
            Err(e) => {
                if matches!(e, TestError::VerificationTimeout { .. }) {
                    self.state = BootState::TimedOut;
                }
                Err(e)
            }
        }
    }

    /// Side-channel strategy: the token must arrive strictly before the
    /// deadline. A token delivered at or after the deadline never flips a
    /// timeout verdict.
    fn wait_for_token(&self, rx: &Receiver<String>, deadline: Instant) -> Result<(), TestError> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(TestError::VerificationTimeout {
                    timeout: self.timeout,
                });
            }
            match rx.recv_timeout(deadline - now) {
                Ok(message) => {
                    if Instant::now() >= deadline {
                        debug!("token arrived after the deadline; ignoring");
                        return Err(TestError::VerificationTimeout {
                            timeout: self.timeout,
                        });
                    }
                    let message = message.trim();
                    if message == COMPLETION_TOKEN {
                        return Ok(());
                    }
                    // At-most-one delivery: anything else means the boot
                    // automation misfired, and nothing more will arrive.
                    warn!("unexpected completion message {message:?}; waiting out the deadline");
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(TestError::VerificationTimeout {
                        timeout: self.timeout,
                    });
                }
            }
        }
    }

    /// Log-pattern strategy: poll the netboot container's console log. A
    /// match observed at or after the deadline never flips a timeout verdict,
    /// same as the side-channel strategy.
    fn wait_for_log_line(&self, deadline: Instant) -> Result<(), TestError> {
        let pattern = Regex::new(MULTI_USER_PATTERN).expect("static pattern");
        loop {
            if Instant::now() >= deadline {
                return Err(TestError::VerificationTimeout {
                    timeout: self.timeout,
                });
            }
            match self
                .machine
                .run_command(&format!("podman logs {NETBOOT_CONTAINER}"))
            {
                Ok(out) if out.success() && pattern.is_match(&out.stdout) => {
                    if Instant::now() >= deadline {
                        debug!("multi-user line surfaced after the deadline; ignoring");
                        return Err(TestError::VerificationTimeout {
                            timeout: self.timeout,
                        });
                    }
                    return Ok(());
                }
                Ok(out) => {
                    debug!(
                        "no multi-user line yet (log poll exited {})",
                        out.status
                    );
                }
                Err(e) => return Err(e),
            }
            std::thread::sleep(LOG_POLL_INTERVAL.min(deadline.saturating_duration_since(
                Instant::now(),
            )));
        }
    }

    /// Tear down the netboot container, whatever state the nested machine is
    /// in. Best-effort; failures are logged.
    pub fn teardown(&self) {
        match self
            .machine
            .run_command(&format!("podman rm -f -t 0 {NETBOOT_CONTAINER}"))
        {
            Ok(out) if out.success() => {}
            Ok(out) => warn!("netboot teardown exited {}", out.status),
            Err(e) => warn!("netboot teardown failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::mpsc;

    use super::*;
    use crate::machine::testutil::{failed_output, ok_output, MockMachine, MockState};

    fn booting_verifier<'a>(
        machine: &'a dyn Machine,
        timeout: Duration,
    ) -> BootVerifier<'a> {
        let mut v = BootVerifier::new(machine, timeout);
        v.launch().unwrap();
        v
    }

    #[test]
    fn test_token_before_deadline_passes() {
        let state = Rc::new(RefCell::new(MockState::default()));
        let machine = MockMachine::boxed(state, |_| Ok(ok_output("")));
        let mut v = booting_verifier(&*machine, Duration::from_secs(5));

        let (tx, rx) = mpsc::channel();
        tx.send(COMPLETION_TOKEN.to_string()).unwrap();
        v.await_completion(CompletionDetector::SerialChannel(rx))
            .unwrap();
        assert_eq!(v.state(), BootState::Succeeded);
        assert!(v.state().is_terminal());
    }

    #[test]
    fn test_silence_times_out() {
        let state = Rc::new(RefCell::new(MockState::default()));
        let machine = MockMachine::boxed(state, |_| Ok(ok_output("")));
        let mut v = booting_verifier(&*machine, Duration::from_millis(30));

        let (_tx, rx) = mpsc::channel::<String>();
        let err = v
            .await_completion(CompletionDetector::SerialChannel(rx))
            .unwrap_err();
        assert!(matches!(err, TestError::VerificationTimeout { .. }));
        assert_eq!(v.state(), BootState::TimedOut);
    }

    #[test]
    fn test_late_token_does_not_flip_timeout() {
        let state = Rc::new(RefCell::new(MockState::default()));
        let machine = MockMachine::boxed(state, |_| Ok(ok_output("")));
        let timeout = Duration::from_millis(50);
        let mut v = booting_verifier(&*machine, timeout);

        let (tx, rx) = mpsc::channel();
        let sender = std::thread::spawn(move || {
            // Written after the verifier's window has expired
            std::thread::sleep(Duration::from_millis(120));
            let _ = tx.send(COMPLETION_TOKEN.to_string());
        });
        let err = v
            .await_completion(CompletionDetector::SerialChannel(rx))
            .unwrap_err();
        assert!(matches!(err, TestError::VerificationTimeout { .. }));
        assert_eq!(v.state(), BootState::TimedOut);
        sender.join().unwrap();
    }

    #[test]
    fn test_wrong_token_is_not_success() {
        let state = Rc::new(RefCell::new(MockState::default()));
        let machine = MockMachine::boxed(state, |_| Ok(ok_output("")));
        let mut v = booting_verifier(&*machine, Duration::from_millis(30));

        let (tx, rx) = mpsc::channel();
        tx.send("something-else".to_string()).unwrap();
        let err = v
            .await_completion(CompletionDetector::SerialChannel(rx))
            .unwrap_err();
        assert!(matches!(err, TestError::VerificationTimeout { .. }));
    }

    #[test]
    fn test_log_pattern_detection() {
        let state = Rc::new(RefCell::new(MockState::default()));
        let polls = Rc::new(RefCell::new(0u32));
        let polls2 = polls.clone();
        let machine = MockMachine::boxed(state, move |cmd| {
            if cmd.starts_with("podman logs") {
                *polls2.borrow_mut() += 1;
                if *polls2.borrow() >= 2 {
                    Ok(ok_output("[  OK  ] Reached target multi-user.target\n"))
                } else {
                    Ok(ok_output("[  ...  ] still booting\n"))
                }
            } else {
                Ok(ok_output(""))
            }
        });
        let mut v = booting_verifier(&*machine, Duration::from_secs(10));
        v.await_completion(CompletionDetector::LogPattern).unwrap();
        assert_eq!(v.state(), BootState::Succeeded);
        assert!(*polls.borrow() >= 2);
    }

    #[test]
    fn test_launch_failure_is_terminal() {
        let state = Rc::new(RefCell::new(MockState::default()));
        let machine = MockMachine::boxed(state, |_| Ok(failed_output(125, "image pull failed")));
        let mut v = BootVerifier::new(&*machine, Duration::from_secs(1));
        let err = v.launch().unwrap_err();
        // The launch happens in the verify stage, and the error says so
        assert!(matches!(
            err,
            TestError::Setup {
                stage: Stage::Verify,
                ..
            }
        ));
        assert_eq!(v.state(), BootState::LaunchFailed);
        assert!(v.state().is_terminal());
    }

    /// A matching log line observed only after the window expired is still a
    /// timeout, mirroring the late-token rule of the side channel.
    #[test]
    fn test_late_log_match_does_not_flip_timeout() {
        let state = Rc::new(RefCell::new(MockState::default()));
        let timeout = Duration::from_millis(30);
        let machine = MockMachine::boxed(state, move |cmd| {
            if cmd.starts_with("podman logs") {
                // The poll itself outlives the verification window
                std::thread::sleep(Duration::from_millis(60));
                Ok(ok_output("[  OK  ] Reached target multi-user.target\n"))
            } else {
                Ok(ok_output(""))
            }
        });
        let mut v = booting_verifier(&*machine, timeout);
        let err = v
            .await_completion(CompletionDetector::LogPattern)
            .unwrap_err();
        assert!(matches!(err, TestError::VerificationTimeout { .. }));
        assert_eq!(v.state(), BootState::TimedOut);
    }

    #[test]
    fn test_launch_target_iqn_in_boot_script_portal() {
        // The iPXE script rendered into the target config boots from the
        // same IQN the verifier's nested machine uses.
        let cfg = crate::config::TargetConfig::default();
        assert!(cfg.render().contains(crate::config::TARGET_IQN));
    }
}
