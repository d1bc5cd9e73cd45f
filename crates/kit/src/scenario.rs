//! Scenario registry.
//!
//! Each scenario carries just enough metadata for a harness to select or
//! skip it: a name, a human description, the platforms it can run on, and a
//! tag set. The two registered scenarios mirror the two deployment variants
//! of the same flow: a file-backed backstore verified through the console
//! log, and a block-device backstore verified through the serial side
//! channel (with a serial console karg so the log stays usable for
//! debugging).

use serde::Serialize;

use crate::config::{BackingStore, TargetConfig};
use crate::errors::TestOutcome;
use crate::iscsi_boot::{run_iscsi_boot, Detection, RunPolicy};
use crate::machine::{MachineBackend, MachineOptions};

/// Metadata the harness uses for selective execution.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioMeta {
    pub name: &'static str,
    pub description: &'static str,
    pub platforms: &'static [&'static str],
    pub tags: &'static [&'static str],
}

/// A registered boot-verification scenario.
pub struct Scenario {
    pub meta: ScenarioMeta,
    config: fn() -> TargetConfig,
    detection: Detection,
}

impl Scenario {
    /// Execute this scenario against `backend`, producing exactly one
    /// outcome.
    pub fn run(
        &self,
        backend: &dyn MachineBackend,
        machine_opts: &MachineOptions,
        policy: &RunPolicy,
    ) -> TestOutcome {
        run_iscsi_boot(
            backend,
            &(self.config)(),
            machine_opts,
            policy,
            self.detection,
        )
    }
}

fn fileio_config() -> TargetConfig {
    TargetConfig::default()
}

fn blockdev_config() -> TargetConfig {
    TargetConfig {
        backing: BackingStore::BlockDevice {
            device: "/dev/disk/by-id/virtio-target".into(),
        },
        append_kargs: vec!["console=ttyS0".to_string()],
        ..TargetConfig::default()
    }
}

static SCENARIOS: &[Scenario] = &[
    Scenario {
        meta: ScenarioMeta {
            name: "iscsi-boot",
            description: "Verify the OS runs from an iSCSI boot volume (file-backed backstore)",
            platforms: &["qemu"],
            tags: &["iscsi", "netboot"],
        },
        config: fileio_config,
        detection: Detection::LogPattern,
    },
    Scenario {
        meta: ScenarioMeta {
            name: "iscsi-boot-blockdev",
            description:
                "Verify the OS runs from an iSCSI boot volume backed by a block device, \
                 with completion reported over the serial side channel",
            platforms: &["qemu"],
            tags: &["iscsi", "netboot"],
        },
        config: blockdev_config,
        detection: Detection::SerialChannel,
    },
];

/// All registered scenarios.
pub fn scenarios() -> &'static [Scenario] {
    SCENARIOS
}

/// Look up a scenario by name.
pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.meta.name == name)
}
