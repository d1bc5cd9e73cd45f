//! Declarative guest boot configuration for the iSCSI target machine.
//!
//! The configuration is an opaque blob from the orchestrator's point of view:
//! it is assembled from fixed embedded templates, and the only parameters that
//! vary are the backing store, the target IQN, the discovery portal, and the
//! kernel arguments handed to the installer. The target machine's own
//! boot-time automation (the quadlet container unit plus the one-shot
//! targetcli script below) does the actual storage-target creation; this core
//! only observes the result from the outside.

use camino::Utf8PathBuf;
use indoc::indoc;

/// IQN of the target created by the targetcli setup script.
pub const TARGET_IQN: &str = "iqn.2023-10.coreos.target.vm:coreos";

/// IQN the diskless nested machine identifies itself with while netbooting.
pub const INITIATOR_IQN: &str = "iqn.2023-11.coreos.diskless:testsetup";

/// Literal token the nested machine's boot automation writes to the
/// completion channel once its init system reports multi-user.
pub const COMPLETION_TOKEN: &str = "iscsi-boot-ok";

/// Name of the guest-to-host virtio-serial channel carrying the token.
pub const COMPLETION_CHANNEL: &str = "testisocompletion";

/// Filesystem label stamped onto the backing store; the installer target is
/// resolved by iSCSI path, never by positional device name.
pub const BACKING_LABEL: &str = "iscsiboot";

/// How the LUN is backed on the target machine.
#[derive(Debug, Clone)]
pub enum BackingStore {
    /// Sparse file allocated at first boot, e.g. 10G at /var/disk.img.
    FileImage { path: Utf8PathBuf, size: String },
    /// A whole block device attached to the target machine.
    BlockDevice { device: Utf8PathBuf },
}

/// System-visible parameters of one target configuration.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub backing: BackingStore,
    pub iqn: String,
    /// Portal the nested machine's iPXE script boots from.
    pub netboot_portal: String,
    /// Extra kernel arguments appended by the installer, beyond the iSCSI
    /// firmware and IBFT arguments that are always present.
    pub append_kargs: Vec<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            backing: BackingStore::FileImage {
                path: "/var/disk.img".into(),
                size: "10G".to_string(),
            },
            iqn: TARGET_IQN.to_string(),
            netboot_portal: "10.0.2.15".to_string(),
            append_kargs: Vec::new(),
        }
    }
}

impl TargetConfig {
    /// Kernel arguments required for iSCSI-rooted boot, plus any
    /// variant-specific extras.
    pub fn installer_kargs(&self) -> Vec<String> {
        let mut kargs = vec!["rd.iscsi.firmware=1".to_string(), "ip=ibft".to_string()];
        kargs.extend(self.append_kargs.iter().cloned());
        kargs
    }

    /// Render the full declarative boot configuration for the target machine.
    pub fn render(&self) -> String {
        indoc! {r#"
            variant: fcos
            version: 1.5.0
            storage:
              files:
                - path: /etc/containers/systemd/target.container
                  contents:
                    inline: |
                        [Unit]
                        Description=Targetd container
                        After=local-fs.target
                        After=network-online.target
                        Wants=network-online.target
                        [Container]
                        Image=quay.io/jbtrystram/targetcli:latest
                        ContainerName=target
                        AddCapability=CAP_SYS_MODULE
                        Network=host
                        Volume=/lib/modules:/lib/modules
                        Volume=/sys/kernel/config:/sys/kernel/config
                        {EXTRA_VOLUMES}
                        PodmanArgs=--privileged
                        [Install]
                        WantedBy=multi-user.target
                        [Service]
                        # Extend Timeout to allow time to pull the image
                        TimeoutStartSec=900
                - path: /usr/local/bin/targetcli_script
                  mode: 0755
                  contents:
                      inline: |
                        #!/bin/bash
                        set -euxo pipefail
                        {PREPARE_BACKING}
                        podman exec target bash -exc "
                        {CREATE_BACKSTORE}
                        targetcli iscsi/ create {IQN}
                        targetcli iscsi/{IQN}/tpg1/luns create /backstores/{BACKSTORE_PATH}
                        targetcli iscsi/{IQN}/tpg1/ set attribute authentication=0 demo_mode_write_protect=0 generate_node_acls=1 cache_dynamic_acls=1
                        "
                        # Exits 0 once local discovery yields the portal
                        iscsiadm -m discovery -p 127.0.0.1 -t st | grep {IQN}
                - path: /mnt/temp/boot.ipxe
                  mode: 0644
                  contents:
                    inline: |
                        #!ipxe
                        set initiator-iqn {INITIATOR_IQN}
                        sanboot iscsi:{PORTAL}::::{IQN}
            systemd:
                units:
                - name: setup-targetcli.service
                  enabled: true
                  contents: |
                    [Unit]
                    Description=Setup targetcli
                    Requires=target.service
                    After=target.service
                    ConditionFirstBoot=true
                    [Service]
                    Type=oneshot
                    RemainAfterExit=yes
                    ExecStart=/usr/local/bin/targetcli_script
                    [Install]
                    WantedBy=multi-user.target
        "#}
        .replace("{EXTRA_VOLUMES}", &self.extra_volumes())
        .replace("{PREPARE_BACKING}", &self.prepare_backing())
        .replace("{CREATE_BACKSTORE}", &self.create_backstore())
        .replace("{BACKSTORE_PATH}", &self.backstore_path())
        .replace("{IQN}", &self.iqn)
        .replace("{INITIATOR_IQN}", INITIATOR_IQN)
        .replace("{PORTAL}", &self.netboot_portal)
    }

    /// Container volume line mapping the backing block device through, if any.
    fn extra_volumes(&self) -> String {
        match &self.backing {
            BackingStore::FileImage { path, .. } => {
                let dir = path.parent().map(|p| p.as_str()).unwrap_or("/var");
                format!("Volume={dir}:{dir}")
            }
            BackingStore::BlockDevice { device } => format!("Volume={device}:{device}"),
        }
    }

    /// Host-side preparation run before the targetcli commands.
    fn prepare_backing(&self) -> String {
        match &self.backing {
            BackingStore::FileImage { path, size } => format!(
                "fallocate -l {size} {path}\nmkfs.ext4 -F {path} -L {label}",
                label = BACKING_LABEL
            ),
            BackingStore::BlockDevice { device } => {
                format!("mkfs.ext4 -F {device} -L {label}", label = BACKING_LABEL)
            }
        }
    }

    fn create_backstore(&self) -> String {
        match &self.backing {
            BackingStore::FileImage { path, .. } => {
                format!("targetcli /backstores/fileio create coreos {path}")
            }
            BackingStore::BlockDevice { device } => {
                format!("targetcli /backstores/block create name=coreos dev={device}")
            }
        }
    }

    fn backstore_path(&self) -> String {
        match &self.backing {
            BackingStore::FileImage { .. } => "fileio/coreos".to_string(),
            BackingStore::BlockDevice { .. } => "block/coreos".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_fileio_variant() {
        let cfg = TargetConfig::default();
        let doc = cfg.render();
        assert!(doc.contains("fallocate -l 10G /var/disk.img"));
        assert!(doc.contains("mkfs.ext4 -F /var/disk.img -L iscsiboot"));
        assert!(doc.contains("targetcli /backstores/fileio create coreos /var/disk.img"));
        assert!(doc.contains(&format!("targetcli iscsi/ create {}", TARGET_IQN)));
        assert!(doc.contains(&format!("sanboot iscsi:10.0.2.15::::{}", TARGET_IQN)));
        assert!(doc.contains("set initiator-iqn iqn.2023-11.coreos.diskless:testsetup"));
        // No template placeholders left behind
        for placeholder in ["{IQN}", "{PORTAL}", "{EXTRA_VOLUMES}", "{PREPARE_BACKING}"] {
            assert!(!doc.contains(placeholder), "unexpanded {placeholder}");
        }
    }

    #[test]
    fn test_render_blockdev_variant() {
        let cfg = TargetConfig {
            backing: BackingStore::BlockDevice {
                device: "/dev/disk/by-id/virtio-target".into(),
            },
            ..TargetConfig::default()
        };
        let doc = cfg.render();
        assert!(doc
            .contains("targetcli /backstores/block create name=coreos dev=/dev/disk/by-id/virtio-target"));
        assert!(doc.contains("luns create /backstores/block/coreos"));
        assert!(!doc.contains("fallocate"));
    }

    #[test]
    fn test_installer_kargs() {
        let mut cfg = TargetConfig::default();
        assert_eq!(cfg.installer_kargs(), vec!["rd.iscsi.firmware=1", "ip=ibft"]);
        cfg.append_kargs.push("console=ttyS0".to_string());
        assert_eq!(
            cfg.installer_kargs(),
            vec!["rd.iscsi.firmware=1", "ip=ibft", "console=ttyS0"]
        );
    }
}
