//! libvirt + ZFS backend.
//!
//! Disks are ZFS clones of a per-image `@base` snapshot, exposed to the guest
//! as a zvol block device. Domains are driven with `virsh`.

use std::io::Write;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{HypervisorError, HypervisorResult};
use crate::hypervisor::{validate_identifier, DomainSpec, DomainState, DomainStatus, Hypervisor};
use crate::runner::CommandRunner;

/// Host layout used by [`LibvirtHypervisor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibvirtConfig {
    /// Dataset holding one child per image, each with a `@base` snapshot.
    #[serde(default = "default_images_dataset")]
    pub images_dataset: String,

    /// Dataset under which per-VM clones are created.
    #[serde(default = "default_vms_dataset")]
    pub vms_dataset: String,

    /// libvirt network every guest is attached to.
    #[serde(default = "default_network")]
    pub network: String,
}

fn default_images_dataset() -> String {
    "images".to_string()
}

fn default_vms_dataset() -> String {
    "vms".to_string()
}

fn default_network() -> String {
    "default".to_string()
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            images_dataset: default_images_dataset(),
            vms_dataset: default_vms_dataset(),
            network: default_network(),
        }
    }
}

#[derive(Debug)]
pub struct LibvirtHypervisor<R> {
    runner: R,
    config: LibvirtConfig,
}

impl<R: CommandRunner> LibvirtHypervisor<R> {
    pub fn new(runner: R, config: LibvirtConfig) -> Self {
        Self { runner, config }
    }

    fn vm_dataset(&self, name: &str) -> String {
        format!("{}/{}", self.config.vms_dataset, name)
    }

    fn base_snapshot(&self, image: &str) -> String {
        format!("{}/{}@base", self.config.images_dataset, image)
    }

    async fn virsh(&self, args: &[&str]) -> HypervisorResult<String> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.runner.run("virsh", &args).await
    }

    async fn zfs(&self, args: &[&str]) -> HypervisorResult<String> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.runner.run("zfs", &args).await
    }

    /// `None` when libvirt has no such domain.
    async fn domain_state(&self, name: &str) -> HypervisorResult<Option<DomainState>> {
        match self.virsh(&["domstate", name]).await {
            Ok(out) => Ok(Some(DomainState::parse(&out))),
            Err(HypervisorError::CommandFailed { stderr, .. }) if is_missing_domain(&stderr) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn dataset_exists(&self, dataset: &str) -> HypervisorResult<bool> {
        match self.zfs(&["list", "-H", "-o", "name", dataset]).await {
            Ok(_) => Ok(true),
            Err(HypervisorError::CommandFailed { stderr, .. }) if stderr.contains("does not exist") => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn define(&self, spec: &DomainSpec) -> HypervisorResult<()> {
        let xml = domain_xml(spec, &self.vm_dataset(&spec.name), &self.config.network);

        // virsh reads the definition from a file
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-", spec.name))
            .suffix(".xml")
            .tempfile()?;
        file.write_all(xml.as_bytes())?;
        file.flush()?;

        let path = file.path().to_string_lossy().into_owned();
        self.virsh(&["define", &path]).await?;
        Ok(())
    }

    async fn dominfo(&self, name: &str) -> HypervisorResult<DomainStatus> {
        let out = self.virsh(&["dominfo", name]).await?;
        Ok(parse_dominfo(name, &out))
    }
}

#[async_trait]
impl<R: CommandRunner> Hypervisor for LibvirtHypervisor<R> {
    async fn create(&self, spec: &DomainSpec) -> HypervisorResult<String> {
        spec.validate()?;

        match self.domain_state(&spec.name).await? {
            Some(DomainState::Running) => {
                return Ok(format!("VM {} already running", spec.name));
            }
            Some(DomainState::Paused) => {
                tracing::info!(vm = %spec.name, "Domain paused; resuming it");
                self.virsh(&["resume", &spec.name]).await?;
                return Ok(format!("VM {} resumed", spec.name));
            }
            Some(state) => {
                tracing::info!(vm = %spec.name, state = %state, "Domain exists; starting it");
                self.virsh(&["start", &spec.name]).await?;
                return Ok(format!("VM {} started", spec.name));
            }
            None => {}
        }

        let dataset = self.vm_dataset(&spec.name);
        if self.dataset_exists(&dataset).await? {
            tracing::info!(vm = %spec.name, dataset = %dataset, "Reusing existing disk");
        } else {
            let snapshot = self.base_snapshot(&spec.image);
            tracing::info!(vm = %spec.name, snapshot = %snapshot, "Cloning disk");
            self.zfs(&["clone", &snapshot, &dataset]).await?;
        }

        self.define(spec).await?;
        self.virsh(&["start", &spec.name]).await?;

        tracing::info!(vm = %spec.name, cpu = spec.cpu, ram = spec.ram, "VM created");
        Ok(format!("VM {} created", spec.name))
    }

    async fn stop(&self, name: &str) -> HypervisorResult<String> {
        validate_identifier("name", name)?;

        match self.domain_state(name).await? {
            None => Err(HypervisorError::DomainNotFound(name.to_string())),
            Some(DomainState::Stopped) => Ok(format!("VM {name} already stopped")),
            Some(_) => {
                self.virsh(&["shutdown", name]).await?;
                tracing::info!(vm = %name, "Shutdown requested");
                Ok(format!("VM {name} stopping"))
            }
        }
    }

    async fn destroy(&self, name: &str) -> HypervisorResult<String> {
        validate_identifier("name", name)?;

        let state = self.domain_state(name).await?;
        if let Some(state) = &state {
            if *state != DomainState::Stopped {
                // Force-off; undefine below is what has to succeed
                if let Err(e) = self.virsh(&["destroy", name]).await {
                    tracing::warn!(vm = %name, error = %e, "Failed to power off domain");
                }
            }
            self.virsh(&["undefine", name]).await?;
        }

        let dataset = self.vm_dataset(name);
        let had_disk = self.dataset_exists(&dataset).await?;
        if had_disk {
            self.zfs(&["destroy", &dataset]).await?;
        }

        if state.is_none() && !had_disk {
            return Ok(format!("VM {name} already absent"));
        }
        tracing::info!(vm = %name, "VM destroyed");
        Ok(format!("VM {name} destroyed"))
    }

    async fn list(&self) -> HypervisorResult<Vec<DomainStatus>> {
        let out = self.virsh(&["list", "--all", "--name"]).await?;
        let mut domains = Vec::new();
        for name in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match self.dominfo(name).await {
                Ok(status) => domains.push(status),
                // Undefined between the two calls
                Err(HypervisorError::CommandFailed { stderr, .. }) if is_missing_domain(&stderr) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(domains)
    }
}

fn is_missing_domain(stderr: &str) -> bool {
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}

/// KVM definition for a VM booting from its zvol.
pub fn domain_xml(spec: &DomainSpec, dataset: &str, network: &str) -> String {
    format!(
        r"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{ram}</memory>
  <vcpu>{cpu}</vcpu>
  <os>
    <type arch='x86_64'>hvm</type>
    <boot dev='hd'/>
  </os>
  <devices>
    <disk type='block' device='disk'>
      <driver name='qemu' type='raw'/>
      <source dev='/dev/zvol/{dataset}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <graphics type='vnc' port='-1'/>
  </devices>
</domain>
",
        name = spec.name,
        ram = spec.ram,
        cpu = spec.cpu,
    )
}

/// Parse `virsh dominfo` output. Missing fields read as zero.
pub fn parse_dominfo(name: &str, out: &str) -> DomainStatus {
    let mut status = DomainStatus {
        name: name.to_string(),
        state: DomainState::Other("unknown".to_string()),
        cpu: 0,
        ram: 0,
    };
    for line in out.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "State" => status.state = DomainState::parse(value),
            "CPU(s)" => status.cpu = value.parse().unwrap_or(0),
            "Max memory" => {
                let kib: u64 = value
                    .split_whitespace()
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
                status.ram = u32::try_from(kib / 1024).unwrap_or(u32::MAX);
            }
            _ => {}
        }
    }
    status
}
