//! Runtime configuration: the flag set that shapes sandbox behavior.

use crate::errors::SandboxError;
use std::{fmt, path::PathBuf, str::FromStr};

/// Annotation key prefix for per-container flag overrides.
pub const ANNOTATION_FLAG_PREFIX: &str = "org.sandkern.flag.";

/// Pod annotations consumed from the container spec.
pub const POD_NAME_ANNOTATION: &str = "io.kubernetes.cri.sandbox-name";
pub const POD_NAMESPACE_ANNOTATION: &str = "io.kubernetes.cri.sandbox-namespace";

/// Flags an annotation may override. Everything else is refused so an
/// untrusted image cannot weaken the sandbox.
const ANNOTATION_OVERRIDE_ALLOWLIST: &[&str] = &[
    "net-raw",
    "oci-seccomp",
    "overlay2",
    "host-uds",
    "cpu-num-from-quota",
];

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkType {
    Sandbox,
    Host,
    None,
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sandbox" => Ok(NetworkType::Sandbox),
            "host" => Ok(NetworkType::Host),
            "none" => Ok(NetworkType::None),
            other => Err(format!("invalid network type {other:?}")),
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetworkType::Sandbox => write!(f, "sandbox"),
            NetworkType::Host => write!(f, "host"),
            NetworkType::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FileAccessType {
    Exclusive,
    Shared,
}

impl FromStr for FileAccessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exclusive" => Ok(FileAccessType::Exclusive),
            "shared" => Ok(FileAccessType::Shared),
            other => Err(format!("invalid file access type {other:?}")),
        }
    }
}

impl fmt::Display for FileAccessType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FileAccessType::Exclusive => write!(f, "exclusive"),
            FileAccessType::Shared => write!(f, "shared"),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HostUds {
    None,
    Open,
    Create,
    All,
}

impl FromStr for HostUds {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(HostUds::None),
            "open" => Ok(HostUds::Open),
            "create" => Ok(HostUds::Create),
            "all" => Ok(HostUds::All),
            other => Err(format!("invalid host-uds mode {other:?}")),
        }
    }
}

impl fmt::Display for HostUds {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostUds::None => write!(f, "none"),
            HostUds::Open => write!(f, "open"),
            HostUds::Create => write!(f, "create"),
            HostUds::All => write!(f, "all"),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OverlayScope {
    Root,
    All,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OverlayMedium {
    Memory,
    SelfBacked,
    Dir(PathBuf),
}

/// The --overlay2 setting: which mounts get an overlay and what backs
/// the upper layer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Overlay2 {
    Disabled,
    Enabled {
        scope: OverlayScope,
        medium: OverlayMedium,
    },
}

impl FromStr for Overlay2 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "none" {
            return Ok(Overlay2::Disabled);
        }
        let (scope, medium) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid overlay2 value {s:?}, expected <scope>:<medium>"))?;
        let scope = match scope {
            "root" => OverlayScope::Root,
            "all" => OverlayScope::All,
            other => return Err(format!("invalid overlay2 scope {other:?}")),
        };
        let medium = match medium {
            "memory" => OverlayMedium::Memory,
            "self" => OverlayMedium::SelfBacked,
            other => match other.strip_prefix("dir=") {
                Some(dir) if !dir.is_empty() => OverlayMedium::Dir(PathBuf::from(dir)),
                _ => return Err(format!("invalid overlay2 medium {other:?}")),
            },
        };
        Ok(Overlay2::Enabled { scope, medium })
    }
}

impl fmt::Display for Overlay2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Overlay2::Disabled => write!(f, "none"),
            Overlay2::Enabled { scope, medium } => {
                let scope = match scope {
                    OverlayScope::Root => "root",
                    OverlayScope::All => "all",
                };
                match medium {
                    OverlayMedium::Memory => write!(f, "{scope}:memory"),
                    OverlayMedium::SelfBacked => write!(f, "{scope}:self"),
                    OverlayMedium::Dir(dir) => write!(f, "{scope}:dir={}", dir.display()),
                }
            }
        }
    }
}

/// Runtime configuration, as assembled from flags by the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub root_dir: PathBuf,
    pub platform: String,
    pub platform_device_path: Option<PathBuf>,
    pub network: NetworkType,
    pub file_access: FileAccessType,
    pub overlay2: Overlay2,
    pub host_uds: HostUds,
    pub directfs: bool,
    pub net_raw: bool,
    pub oci_seccomp: bool,
    pub nvproxy: bool,
    pub tpuproxy: bool,
    pub rootless: bool,
    pub profile: bool,
    pub pod_init_config: Option<PathBuf>,
    pub metric_server: String,
    pub cpu_num_from_quota: bool,
    pub debug: bool,
    pub log_filename: Option<PathBuf>,
    pub debug_log: Option<PathBuf>,
    pub panic_log: Option<PathBuf>,
    /// Permits annotations to override any flag, including weakening
    /// ones. Off by default.
    pub allow_flag_override: bool,
    /// Test-only escape hatch: run without chroot and keep the caller's
    /// environment. Never set outside the test suite.
    pub test_only_allow_run_as_current_user_without_chroot: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root_dir: PathBuf::from("/var/run/sandkern"),
            platform: "systrap".to_string(),
            platform_device_path: None,
            network: NetworkType::Sandbox,
            file_access: FileAccessType::Exclusive,
            overlay2: Overlay2::Disabled,
            host_uds: HostUds::None,
            directfs: false,
            net_raw: false,
            oci_seccomp: false,
            nvproxy: false,
            tpuproxy: false,
            rootless: false,
            profile: false,
            pod_init_config: None,
            metric_server: String::new(),
            cpu_num_from_quota: false,
            debug: false,
            log_filename: None,
            debug_log: None,
            panic_log: None,
            allow_flag_override: false,
            test_only_allow_run_as_current_user_without_chroot: false,
        }
    }
}

impl Config {
    /// Serializes the flags that must be relayed to the boot process.
    /// Booleans appear only when set.
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = vec![
            format!("--root={}", self.root_dir.display()),
            format!("--platform={}", self.platform),
            format!("--network={}", self.network),
            format!("--file-access={}", self.file_access),
            format!("--overlay2={}", self.overlay2),
            format!("--host-uds={}", self.host_uds),
        ];
        for (name, value) in [
            ("--directfs", self.directfs),
            ("--net-raw", self.net_raw),
            ("--oci-seccomp", self.oci_seccomp),
            ("--nvproxy", self.nvproxy),
            ("--tpuproxy", self.tpuproxy),
            ("--rootless", self.rootless),
            ("--profile", self.profile),
            ("--cpu-num-from-quota", self.cpu_num_from_quota),
            ("--debug", self.debug),
        ] {
            if value {
                flags.push(name.to_string());
            }
        }
        if let Some(path) = &self.pod_init_config {
            flags.push(format!("--pod-init-config={}", path.display()));
        }
        if !self.metric_server.is_empty() {
            flags.push(format!("--metric-server={}", self.metric_server));
        }
        flags
    }

    /// Applies one `org.sandkern.flag.<name>` annotation.
    ///
    /// The allowlist bounds what annotations may change, and
    /// `oci-seccomp` may only be turned on this way: turning it off
    /// weakens the sandbox, which requires the global override flag.
    pub fn apply_annotation(&mut self, key: &str, value: &str) -> Result<(), SandboxError> {
        let name = key
            .strip_prefix(ANNOTATION_FLAG_PREFIX)
            .ok_or_else(|| SandboxError::Config(format!("not a flag annotation: {key:?}")))?;
        if !self.allow_flag_override && !ANNOTATION_OVERRIDE_ALLOWLIST.contains(&name) {
            return Err(SandboxError::Config(format!(
                "flag {name:?} may not be overridden by annotation"
            )));
        }
        let parse_bool = |value: &str| -> Result<bool, SandboxError> {
            value
                .parse::<bool>()
                .map_err(|_| SandboxError::Config(format!("invalid boolean {value:?} for {name:?}")))
        };
        match name {
            "net-raw" => self.net_raw = parse_bool(value)?,
            "oci-seccomp" => {
                let wanted = parse_bool(value)?;
                if !wanted && self.oci_seccomp && !self.allow_flag_override {
                    return Err(SandboxError::Config(
                        "oci-seccomp may be enabled but not disabled via annotation".to_string(),
                    ));
                }
                self.oci_seccomp = wanted;
            }
            "overlay2" => {
                self.overlay2 = value.parse().map_err(SandboxError::Config)?;
            }
            "host-uds" => {
                self.host_uds = value.parse().map_err(SandboxError::Config)?;
            }
            "cpu-num-from-quota" => self.cpu_num_from_quota = parse_bool(value)?,
            "network" if self.allow_flag_override => {
                self.network = value.parse().map_err(SandboxError::Config)?;
            }
            "directfs" if self.allow_flag_override => self.directfs = parse_bool(value)?,
            other => {
                return Err(SandboxError::Config(format!(
                    "flag {other:?} may not be overridden by annotation"
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay2_parses() {
        assert_eq!("none".parse::<Overlay2>().unwrap(), Overlay2::Disabled);
        assert_eq!(
            "root:memory".parse::<Overlay2>().unwrap(),
            Overlay2::Enabled {
                scope: OverlayScope::Root,
                medium: OverlayMedium::Memory,
            }
        );
        let parsed = "all:dir=/var/cache".parse::<Overlay2>().unwrap();
        assert_eq!(
            parsed,
            Overlay2::Enabled {
                scope: OverlayScope::All,
                medium: OverlayMedium::Dir(PathBuf::from("/var/cache")),
            }
        );
        assert_eq!(parsed.to_string(), "all:dir=/var/cache");
        assert!("root".parse::<Overlay2>().is_err());
        assert!("root:tape".parse::<Overlay2>().is_err());
        assert!("everything:memory".parse::<Overlay2>().is_err());
    }

    #[test]
    fn annotations_respect_allowlist() {
        let mut config = Config::default();
        config
            .apply_annotation("org.sandkern.flag.net-raw", "true")
            .unwrap();
        assert!(config.net_raw);

        // platform is not on the allowlist.
        assert!(config
            .apply_annotation("org.sandkern.flag.platform", "kvm")
            .is_err());
        assert_eq!(config.platform, "systrap");
    }

    #[test]
    fn oci_seccomp_enable_only() {
        let mut config = Config::default();
        config
            .apply_annotation("org.sandkern.flag.oci-seccomp", "true")
            .unwrap();
        assert!(config.oci_seccomp);
        assert!(config
            .apply_annotation("org.sandkern.flag.oci-seccomp", "false")
            .is_err());
        assert!(config.oci_seccomp);

        config.allow_flag_override = true;
        config
            .apply_annotation("org.sandkern.flag.oci-seccomp", "false")
            .unwrap();
        assert!(!config.oci_seccomp);
    }

    #[test]
    fn flags_roundtrip_the_boot_surface() {
        let config = Config {
            network: NetworkType::Host,
            metric_server: "localhost:1337".to_string(),
            net_raw: true,
            ..Default::default()
        };
        let flags = config.to_flags();
        assert!(flags.contains(&"--network=host".to_string()));
        assert!(flags.contains(&"--metric-server=localhost:1337".to_string()));
        assert!(flags.contains(&"--net-raw".to_string()));
        assert!(flags.iter().any(|f| f.starts_with("--platform=")));
        // Unset booleans stay off the command line.
        assert!(!flags.iter().any(|f| f.starts_with("--rootless")));
    }
}
