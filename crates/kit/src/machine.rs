//! Machine provisioning and lifecycle.
//!
//! The orchestrator only depends on two capabilities: a [`MachineBackend`]
//! that turns a boot configuration into a running machine plus a resolved
//! iSCSI discovery address, and a [`Machine`] handle that can run remote
//! commands and destroy itself. The production backends launch QEMU inside a
//! privileged podman container; how the cluster is networked decides how the
//! discovery address is resolved (forwarded host port vs. private IP).
//!
//! Ownership is exclusive: a handle is held by one stage at a time and moves
//! forward with the test. [`MachineGuard`] wraps every handle so teardown runs
//! exactly once on every exit path, including early failures.

use std::io::Write;
use std::process::Command;

use tracing::{debug, warn};

use crate::command_run::CommandRun;
use crate::config::TargetConfig;
use crate::errors::TestError;
use crate::ssh::{CommandOutput, SshRunner};

/// Container image wrapping QEMU for machine execution.
const RUNNER_IMAGE: &str = "quay.io/coreos-assembler/coreos-assembler:latest";

/// Well-known iSCSI port.
pub const ISCSI_PORT: u16 = 3260;

/// A provisioned virtual machine.
pub trait Machine {
    fn name(&self) -> &str;

    /// Address the remote-shell transport reaches this machine at.
    fn ssh_address(&self) -> &str;

    /// Execute a command on the machine's shell, blocking until it finishes.
    /// Non-zero remote exit is returned as data, not as an error.
    fn run_command(&self, command: &str) -> Result<CommandOutput, TestError>;

    /// Tear the machine down. Called at most once.
    fn destroy(&mut self) -> Result<(), TestError>;
}

/// Machine-specific provisioning options.
#[derive(Debug, Clone)]
pub struct MachineOptions {
    pub name: Option<String>,
    /// Memory size, e.g. "4G".
    pub memory: String,
    pub vcpus: u32,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            name: None,
            memory: "4G".to_string(),
            vcpus: 2,
        }
    }
}

/// Capability to create a machine from a declarative boot configuration.
///
/// One implementation per cluster backend; the orchestrator never depends on
/// backend identity, only on this trait.
pub trait MachineBackend {
    /// Provision a machine from `config`, returning the handle and the
    /// address at which the iSCSI target will be discoverable.
    fn provision(
        &self,
        config: &TargetConfig,
        opts: &MachineOptions,
    ) -> Result<(Box<dyn Machine>, String), TestError>;
}

/// Machine running as a QEMU-in-podman container.
struct PodmanMachine {
    name: String,
    container_id: String,
    ssh_address: String,
    runner: SshRunner,
    destroyed: bool,
}

impl Machine for PodmanMachine {
    fn name(&self) -> &str {
        &self.name
    }

    fn ssh_address(&self) -> &str {
        &self.ssh_address
    }

    fn run_command(&self, command: &str) -> Result<CommandOutput, TestError> {
        self.runner.run(&self.ssh_address, command)
    }

    fn destroy(&mut self) -> Result<(), TestError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        debug!("destroying machine {} ({})", self.name, self.container_id);
        Command::new("podman")
            .args(["rm", "-f", "-t", "0", &self.container_id])
            .run()
            .map_err(|e| TestError::Cleanup(format!("removing container {}: {e}", self.name)))
    }
}

/// Launch the machine container detached, returning its id.
///
/// The rendered boot configuration is written to a temporary file and bind
/// mounted into the container; the runner consumes it at boot.
fn launch_machine_container(
    config: &TargetConfig,
    opts: &MachineOptions,
    publish: &[u16],
) -> Result<(String, tempfile::NamedTempFile), TestError> {
    let mut cfg_file = tempfile::NamedTempFile::new()
        .map_err(|e| TestError::Provision(format!("creating config tempfile: {e}")))?;
    cfg_file
        .write_all(config.render().as_bytes())
        .map_err(|e| TestError::Provision(format!("writing boot configuration: {e}")))?;

    let mut cmd = Command::new("podman");
    cmd.args(["run", "-d", "--rm", "--privileged", "--device=/dev/kvm"]);
    cmd.arg("--label=ibvk.machine=1");
    if let Some(ref name) = opts.name {
        cmd.args(["--name", name]);
    }
    for port in publish {
        cmd.arg(format!("--publish=127.0.0.1::{port}"));
    }
    cmd.args([
        "-v",
        &format!("{}:/run/ibvk/config.bu:ro", cfg_file.path().display()),
    ]);
    cmd.args([
        RUNNER_IMAGE,
        "shell",
        "--",
        "kola",
        "qemuexec",
        "--butane",
        "/run/ibvk/config.bu",
        "--memory",
        &opts.memory,
        "--cpus",
        &opts.vcpus.to_string(),
    ]);

    let id = cmd
        .run_get_string()
        .map_err(|e| TestError::Provision(format!("launching machine container: {e}")))?
        .trim()
        .to_string();
    Ok((id, cfg_file))
}

/// Resolve the host port podman published for `container_port`.
fn published_port(container_id: &str, container_port: u16) -> Result<u16, TestError> {
    let out = Command::new("podman")
        .args(["port", container_id, &format!("{container_port}/tcp")])
        .run_get_string()
        .map_err(|e| TestError::Provision(format!("querying published ports: {e}")))?;
    // Output is e.g. "127.0.0.1:42123", one mapping per line
    out.lines()
        .find_map(|line| line.trim().rsplit_once(':'))
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| {
            TestError::Provision(format!(
                "no published mapping for port {container_port} in {out:?}"
            ))
        })
}

/// Backend for single-host clusters: the VM sits behind user-mode networking
/// and the iSCSI port is forwarded to the host. From inside the VM's network
/// the host is reachable at the usermode gateway address.
pub struct UserNetworkBackend {
    pub runner: SshRunner,
}

/// Gateway address of QEMU user-mode networking as seen from the guest.
const USERNET_GATEWAY: &str = "10.0.2.2";

impl MachineBackend for UserNetworkBackend {
    fn provision(
        &self,
        config: &TargetConfig,
        opts: &MachineOptions,
    ) -> Result<(Box<dyn Machine>, String), TestError> {
        let (container_id, cfg_file) = launch_machine_container(config, opts, &[22, ISCSI_PORT])?;
        // The container owns a bind mount of the config now
        drop(cfg_file);

        let ssh_port = published_port(&container_id, 22)?;
        let iscsi_port = published_port(&container_id, ISCSI_PORT)?;
        let name = opts
            .name
            .clone()
            .unwrap_or_else(|| format!("ibvk-{}", &container_id[..12.min(container_id.len())]));
        debug!(
            "provisioned {name}: ssh 127.0.0.1:{ssh_port}, iscsi {USERNET_GATEWAY}:{iscsi_port}"
        );

        let machine = PodmanMachine {
            name,
            container_id,
            ssh_address: format!("127.0.0.1:{ssh_port}"),
            runner: self.runner.clone(),
            destroyed: false,
        };
        Ok((
            Box::new(machine),
            format!("{USERNET_GATEWAY}:{iscsi_port}"),
        ))
    }
}

/// Backend for routed clusters: the machine has a reachable private address
/// and the target listens on the well-known iSCSI port.
pub struct RoutedNetworkBackend {
    pub runner: SshRunner,
}

impl MachineBackend for RoutedNetworkBackend {
    fn provision(
        &self,
        config: &TargetConfig,
        opts: &MachineOptions,
    ) -> Result<(Box<dyn Machine>, String), TestError> {
        let (container_id, cfg_file) = launch_machine_container(config, opts, &[])?;
        drop(cfg_file);

        let ip = Command::new("podman")
            .args([
                "inspect",
                "-f",
                "{{.NetworkSettings.IPAddress}}",
                &container_id,
            ])
            .run_get_string()
            .map_err(|e| TestError::Provision(format!("inspecting machine address: {e}")))?
            .trim()
            .to_string();
        if ip.is_empty() {
            return Err(TestError::Provision(format!(
                "machine container {container_id} has no private address"
            )));
        }
        let name = opts
            .name
            .clone()
            .unwrap_or_else(|| format!("ibvk-{}", &container_id[..12.min(container_id.len())]));
        debug!("provisioned {name}: private address {ip}");

        let machine = PodmanMachine {
            name,
            container_id,
            ssh_address: ip.clone(),
            runner: self.runner.clone(),
            destroyed: false,
        };
        Ok((Box::new(machine), format!("{ip}:{ISCSI_PORT}")))
    }
}

/// Scoped ownership of a machine: guarantees destroy-exactly-once on every
/// exit path, including early-return failures.
pub struct MachineGuard {
    machine: Option<Box<dyn Machine>>,
}

impl MachineGuard {
    pub fn new(machine: Box<dyn Machine>) -> Self {
        Self {
            machine: Some(machine),
        }
    }

    pub fn machine(&self) -> &dyn Machine {
        self.machine
            .as_deref()
            .expect("machine accessed after destroy")
    }

    /// Destroy now instead of at scope exit. Failure is logged as a cleanup
    /// error and never overturns an already-decided verdict.
    pub fn destroy(&mut self) {
        if let Some(mut machine) = self.machine.take() {
            if let Err(e) = machine.destroy() {
                warn!("machine teardown failed: {e}");
            }
        }
    }
}

impl Drop for MachineGuard {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Scripted machines and backends for exercising the coordinators.

    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    /// Per-mock shared state: everything the assertions need to observe.
    #[derive(Default)]
    pub(crate) struct MockState {
        pub commands: Vec<String>,
        pub destroys: u32,
    }

    type CommandHandler = Box<dyn Fn(&str) -> Result<CommandOutput, TestError>>;

    pub(crate) struct MockMachine {
        pub state: Rc<RefCell<MockState>>,
        pub handler: CommandHandler,
    }

    impl MockMachine {
        pub fn boxed(
            state: Rc<RefCell<MockState>>,
            handler: impl Fn(&str) -> Result<CommandOutput, TestError> + 'static,
        ) -> Box<dyn Machine> {
            Box::new(Self {
                state,
                handler: Box::new(handler),
            })
        }
    }

    /// Successful empty command output.
    pub(crate) fn ok_output(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            status: 0,
        }
    }

    pub(crate) fn failed_output(status: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            status,
        }
    }

    impl Machine for MockMachine {
        fn name(&self) -> &str {
            "mock"
        }

        fn ssh_address(&self) -> &str {
            "127.0.0.1:2222"
        }

        fn run_command(&self, command: &str) -> Result<CommandOutput, TestError> {
            self.state.borrow_mut().commands.push(command.to_string());
            (self.handler)(command)
        }

        fn destroy(&mut self) -> Result<(), TestError> {
            self.state.borrow_mut().destroys += 1;
            Ok(())
        }
    }

    pub(crate) struct MockBackend {
        pub state: Rc<RefCell<MockState>>,
        pub address: String,
        pub handler: Rc<dyn Fn(&str) -> Result<CommandOutput, TestError>>,
    }

    impl MachineBackend for MockBackend {
        fn provision(
            &self,
            _config: &TargetConfig,
            _opts: &MachineOptions,
        ) -> Result<(Box<dyn Machine>, String), TestError> {
            let handler = self.handler.clone();
            let machine = MockMachine::boxed(self.state.clone(), move |cmd| handler(cmd));
            Ok((machine, self.address.clone()))
        }
    }

    #[test]
    fn test_guard_destroys_exactly_once() {
        let state = Rc::new(RefCell::new(MockState::default()));
        {
            let mut guard = MachineGuard::new(MockMachine::boxed(state.clone(), |_| {
                Ok(ok_output(""))
            }));
            guard.destroy();
            guard.destroy();
            // Drop fires here as well
        }
        assert_eq!(state.borrow().destroys, 1);
    }

    #[test]
    fn test_guard_destroys_on_drop() {
        let state = Rc::new(RefCell::new(MockState::default()));
        {
            let _guard = MachineGuard::new(MockMachine::boxed(state.clone(), |_| {
                Ok(ok_output(""))
            }));
        }
        assert_eq!(state.borrow().destroys, 1);
    }
}
