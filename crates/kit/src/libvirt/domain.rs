//! Domain XML generation for template base domains
//!
//! A freshly downloaded template image gets a minimal persistent domain so
//! that it can be instantiated like any hand-made template.

use crate::error::{ProvisionError, Result};
use crate::volume::VolumeFormat;
use crate::xml_utils::XmlWriter;

/// Architecture, machine type and CPU mode for the host.
fn host_machine() -> Result<(&'static str, &'static str)> {
    match std::env::consts::ARCH {
        "x86_64" => Ok(("x86_64", "q35")),
        "aarch64" => Ok(("aarch64", "virt")),
        unsupported => Err(ProvisionError::InvalidParameter(format!(
            "Unsupported architecture: {unsupported}. Supported architectures: x86_64, aarch64"
        ))),
    }
}

/// Builder for creating libvirt domain XML configurations
#[derive(Debug, Default)]
pub struct DomainBuilder {
    name: Option<String>,
    memory_mb: Option<u64>,
    vcpus: Option<u32>,
    disk: Option<(String, VolumeFormat)>,
    network: Option<String>,
    vnc: bool,
    description: Option<String>,
}

impl DomainBuilder {
    /// Create a new domain builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set domain name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Set memory in MB
    pub fn with_memory(mut self, memory_mb: u64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    /// Set number of vCPUs
    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = Some(vcpus);
        self
    }

    /// Set the boot disk
    pub fn with_disk(mut self, disk_path: &str, format: VolumeFormat) -> Self {
        self.disk = Some((disk_path.to_string(), format));
        self
    }

    /// Set network configuration: `none`, `bridge=<name>`, or a network name
    pub fn with_network(mut self, network: &str) -> Self {
        self.network = Some(network.to_string());
        self
    }

    /// Enable VNC with an automatically chosen port
    pub fn with_vnc(mut self) -> Self {
        self.vnc = true;
        self
    }

    /// Free-form description
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Build the domain XML
    pub fn build_xml(self) -> Result<String> {
        let name = self
            .name
            .ok_or_else(|| ProvisionError::InvalidParameter("Domain name is required".into()))?;
        let memory = self.memory_mb.unwrap_or(1024);
        let vcpus = self.vcpus.unwrap_or(1);
        let (arch, machine) = host_machine()?;

        let mut writer = XmlWriter::new();
        writer.start_element("domain", &[("type", "kvm")])?;

        writer.write_text_element("name", &name)?;
        if let Some(description) = &self.description {
            writer.write_text_element("description", description)?;
        }
        writer.write_text_element_with_attrs("memory", &memory.to_string(), &[("unit", "MiB")])?;
        writer.write_text_element_with_attrs(
            "currentMemory",
            &memory.to_string(),
            &[("unit", "MiB")],
        )?;
        writer.write_text_element("vcpu", &vcpus.to_string())?;

        writer.start_element("os", &[])?;
        writer.write_text_element_with_attrs(
            "type",
            "hvm",
            &[("arch", arch), ("machine", machine)],
        )?;
        writer.write_empty_element("boot", &[("dev", "hd")])?;
        writer.end_element("os")?;

        writer.start_element("features", &[])?;
        writer.write_empty_element("acpi", &[])?;
        writer.write_empty_element("apic", &[])?;
        writer.end_element("features")?;
        writer.write_empty_element("cpu", &[("mode", "host-passthrough")])?;
        writer.start_element("clock", &[("offset", "utc")])?;
        writer.write_empty_element("timer", &[("name", "rtc"), ("tickpolicy", "catchup")])?;
        writer.end_element("clock")?;

        writer.write_text_element("on_poweroff", "destroy")?;
        writer.write_text_element("on_reboot", "restart")?;
        writer.write_text_element("on_crash", "destroy")?;

        writer.start_element("devices", &[])?;

        if let Some((disk_path, format)) = &self.disk {
            writer.start_element("disk", &[("type", "file"), ("device", "disk")])?;
            writer.write_empty_element("driver", &[("name", "qemu"), ("type", format.as_str())])?;
            writer.write_empty_element("source", &[("file", disk_path)])?;
            writer.write_empty_element("target", &[("dev", "vda"), ("bus", "virtio")])?;
            writer.end_element("disk")?;
        }

        let network_config = self.network.as_deref().unwrap_or("default");
        match network_config {
            "none" => {}
            network if network.starts_with("bridge=") => {
                let bridge_name = &network["bridge=".len()..];
                writer.start_element("interface", &[("type", "bridge")])?;
                writer.write_empty_element("source", &[("bridge", bridge_name)])?;
                writer.write_empty_element("model", &[("type", "virtio")])?;
                writer.end_element("interface")?;
            }
            _ => {
                writer.start_element("interface", &[("type", "network")])?;
                writer.write_empty_element("source", &[("network", network_config)])?;
                writer.write_empty_element("model", &[("type", "virtio")])?;
                writer.end_element("interface")?;
            }
        }

        // Serial console
        writer.start_element("serial", &[("type", "pty")])?;
        writer.write_empty_element("target", &[("port", "0")])?;
        writer.end_element("serial")?;

        writer.start_element("console", &[("type", "pty")])?;
        writer.write_empty_element("target", &[("type", "serial"), ("port", "0")])?;
        writer.end_element("console")?;

        if self.vnc {
            writer.write_empty_element(
                "graphics",
                &[("type", "vnc"), ("port", "-1"), ("autoport", "yes")],
            )?;
            writer.start_element("video", &[])?;
            writer.write_empty_element("model", &[("type", "vga")])?;
            writer.end_element("video")?;
        }

        writer.end_element("devices")?;
        writer.end_element("domain")?;

        writer.into_string()
    }
}
