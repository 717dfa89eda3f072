//! Container specifications
//!
//! Describes what to run: image, entrypoint, command, platform and resource
//! hints. A set of `ContainerSpec`s is the input to stack provisioning and to
//! the local Docker driver.

use crun_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named volume mounted into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Volume name
    pub source: String,
    /// Mount path inside the container
    pub target: String,
    /// Read-only mount
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// One container of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference
    pub image: String,
    /// Container name (the configured default when None)
    pub name: Option<String>,
    /// Entrypoint override
    pub entrypoint: Vec<String>,
    /// Command
    pub command: Vec<String>,
    /// Working directory in container
    pub working_dir: Option<String>,
    /// `os/arch[/variant]`
    pub platform: Option<String>,
    /// vCPUs (0 leaves it to the task-level size)
    pub cpus: f32,
    /// Memory in bytes (0 leaves it to the task-level size)
    pub memory: u64,
    /// Init containers run to completion before the others and are not essential
    pub is_init: bool,
    /// Volume mounts
    pub volumes: Vec<VolumeMount>,
    /// `container[:ro]` entries
    pub volumes_from: Vec<String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: None,
            entrypoint: vec![],
            command: vec![],
            working_dir: None,
            platform: None,
            cpus: 0.0,
            memory: 0,
            is_init: false,
            volumes: vec![],
            volumes_from: vec![],
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = entrypoint;
        self
    }

    pub fn with_command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        let platform = platform.into();
        self.platform = if platform.is_empty() {
            None
        } else {
            Some(platform)
        };
        self
    }

    pub fn with_cpus(mut self, cpus: f32) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory = bytes;
        self
    }

    pub fn with_volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    pub fn with_volumes_from(mut self, source: impl Into<String>) -> Self {
        self.volumes_from.push(source.into());
        self
    }

    pub fn init(mut self) -> Self {
        self.is_init = true;
        self
    }

    /// Container name, falling back to `default`
    pub fn name_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(default)
    }
}

/// The single platform shared by `containers`; mixing platforms is rejected
pub fn common_platform(containers: &[ContainerSpec]) -> Result<Option<Platform>> {
    let mut platform: Option<&str> = None;
    for (i, container) in containers.iter().enumerate() {
        let current = container.platform.as_deref().unwrap_or("");
        match platform {
            None => platform = Some(current),
            Some(first) if first != current => {
                return Err(Error::Config(format!(
                    "all containers must have the same platform: container {} has {:?}, expected {:?}",
                    i, current, first
                )));
            }
            Some(_) => {}
        }
    }
    match platform {
        Some(p) if !p.is_empty() => Platform::parse(p).map(Some),
        _ => Ok(None),
    }
}

/// Parsed `os/arch[/variant]` (a bare value is an architecture)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: Option<String>,
    pub arch: String,
    pub variant: Option<String>,
}

impl Platform {
    pub fn parse(platform: &str) -> Result<Self> {
        let parts: Vec<&str> = platform.trim().split('/').collect();
        if parts.iter().any(|p| p.is_empty()) || parts.len() > 3 {
            return Err(Error::Config(format!("invalid platform: {:?}", platform)));
        }
        Ok(match parts.as_slice() {
            [arch] => Self {
                os: None,
                arch: arch.to_string(),
                variant: None,
            },
            [os, arch] => Self {
                os: Some(os.to_string()),
                arch: arch.to_string(),
                variant: None,
            },
            [os, arch, variant] => Self {
                os: Some(os.to_string()),
                arch: arch.to_string(),
                variant: Some(variant.to_string()),
            },
            _ => return Err(Error::Config(format!("invalid platform: {:?}", platform))),
        })
    }

    /// Task-definition CPU architecture (`X86_64`, `ARM64`)
    pub fn cpu_architecture(&self) -> String {
        let arch = self.arch.to_uppercase();
        if arch == "AMD64" {
            "X86_64".to_string()
        } else {
            arch
        }
    }

    /// Task-definition OS family (`LINUX`, ...)
    pub fn os_family(&self) -> Option<String> {
        self.os.as_ref().map(|os| os.to_uppercase())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(os) = &self.os {
            write!(f, "{}/", os)?;
        }
        f.write_str(&self.arch)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_spec_builder() {
        let spec = ContainerSpec::new("alpine:latest")
            .with_command(vec!["echo".into(), "hello".into()])
            .with_platform("linux/arm64")
            .with_memory(512 * 1024 * 1024)
            .with_volume(VolumeMount::new("data", "/data").read_only());

        assert_eq!(spec.image, "alpine:latest");
        assert_eq!(spec.platform.as_deref(), Some("linux/arm64"));
        assert!(spec.volumes[0].read_only);
        assert_eq!(spec.name_or("main"), "main");
        assert_eq!(spec.clone().with_name("web").name_or("main"), "web");
        assert!(ContainerSpec::new("x").with_platform("").platform.is_none());
    }

    #[test]
    fn test_parse_platform() {
        let p = Platform::parse("linux/amd64").unwrap();
        assert_eq!(p.os.as_deref(), Some("linux"));
        assert_eq!(p.arch, "amd64");
        assert_eq!(p.cpu_architecture(), "X86_64");
        assert_eq!(p.os_family().as_deref(), Some("LINUX"));

        let p = Platform::parse("linux/arm64/v8").unwrap();
        assert_eq!(p.variant.as_deref(), Some("v8"));
        assert_eq!(p.cpu_architecture(), "ARM64");
        assert_eq!(p.to_string(), "linux/arm64/v8");

        let p = Platform::parse("arm64").unwrap();
        assert!(p.os.is_none());
        assert_eq!(p.arch, "arm64");
        assert!(p.os_family().is_none());

        assert!(Platform::parse("").is_err());
        assert!(Platform::parse("linux//v8").is_err());
        assert!(Platform::parse("a/b/c/d").is_err());
    }

    #[test]
    fn test_common_platform() {
        let same = vec![
            ContainerSpec::new("a").with_platform("linux/amd64"),
            ContainerSpec::new("b").with_platform("linux/amd64"),
        ];
        assert_eq!(
            common_platform(&same).unwrap().unwrap().cpu_architecture(),
            "X86_64"
        );

        let none = vec![ContainerSpec::new("a")];
        assert!(common_platform(&none).unwrap().is_none());

        let mixed = vec![
            ContainerSpec::new("a").with_platform("linux/amd64"),
            ContainerSpec::new("b"),
        ];
        let err = common_platform(&mixed).unwrap_err();
        assert!(err.to_string().contains("same platform"));
    }
}
