//! Static facts about the host the backup runs on.
//!
//! The [EnvironmentDescriptor] is detected once at the start of a run and
//! only read afterwards. Nothing in here installs packages: an
//! [`PackageManager::Unknown`] descriptor means "manual action required".

use std::fmt;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};
use regex::Regex;

const OS_RELEASE: &str = "/etc/os-release";
const SYSTEMD_RUNTIME_DIR: &str = "/run/systemd/system";
const OPENRC_RUN: &str = "/sbin/openrc-run";

/// Errors on detecting the host environment.
#[derive(Debug, Display, Error)]
pub enum EnvironmentError {
    /// Host OS is neither Linux nor macOS.
    #[display("Unsupported platform: {_0}")]
    UnsupportedPlatform(#[error(ignore)] String),
    /// A tool required by the configuration is not installed.
    #[display("Required tool `{_0}` not found in PATH")]
    MissingTool(#[error(ignore)] String),
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum OsFamily {
    #[display("linux")]
    Linux,
    #[display("macos")]
    MacOs,
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum PackageManager {
    #[display("apt")]
    Apt,
    #[display("dnf")]
    Dnf,
    #[display("yum")]
    Yum,
    #[display("pacman")]
    Pacman,
    #[display("zypper")]
    Zypper,
    #[display("apk")]
    Apk,
    #[display("brew")]
    Brew,
    #[display("unknown")]
    Unknown,
}

impl PackageManager {
    /// Command prefix used to install a package, if known.
    pub fn install_command(&self) -> Option<&'static str> {
        match self {
            Self::Apt => Some("apt-get install -y"),
            Self::Dnf => Some("dnf install -y"),
            Self::Yum => Some("yum install -y"),
            Self::Pacman => Some("pacman -S --noconfirm"),
            Self::Zypper => Some("zypper install -y"),
            Self::Apk => Some("apk add"),
            Self::Brew => Some("brew install"),
            Self::Unknown => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum ServiceManagerKind {
    #[display("systemd")]
    Systemd,
    #[display("launchd")]
    Launchd,
    #[display("openrc")]
    OpenRc,
    #[display("unknown")]
    Unknown,
}

/// Distribution families which share service names.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DistroFamily {
    Debian,
    RedHat,
    Arch,
    Suse,
    Alpine,
    Other,
}

/// Host facts needed for service control and tool selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvironmentDescriptor {
    pub os_family: OsFamily,
    pub distro: String,
    /// Space separated `ID_LIKE` of the distribution.
    pub distro_like: String,
    pub package_manager: PackageManager,
    pub service_manager: ServiceManagerKind,
    pub default_web_root: PathBuf,
}

impl fmt::Display for EnvironmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}), package manager: {}, service manager: {}",
            self.distro, self.os_family, self.package_manager, self.service_manager
        )
    }
}

/// Detect the environment of the running host.
pub fn detect() -> Result<EnvironmentDescriptor, EnvironmentError> {
    let os_release = match std::env::consts::OS {
        "linux" => std::fs::read_to_string(OS_RELEASE)
            .inspect_err(|e| {
                log::debug!(target: "environment", "Reading {OS_RELEASE} failed: {e}");
            })
            .ok(),
        _ => None,
    };
    let systemd_booted = Path::new(SYSTEMD_RUNTIME_DIR).is_dir();
    let openrc = Path::new(OPENRC_RUN).exists();

    let descriptor = detect_from(
        std::env::consts::OS,
        os_release.as_deref(),
        systemd_booted,
        openrc,
    )?;
    log::debug!(target: "environment", "Detected host: {descriptor}");

    Ok(descriptor)
}

/// Build the descriptor from raw host facts.
pub fn detect_from(
    os: &str,
    os_release: Option<&str>,
    systemd_booted: bool,
    openrc: bool,
) -> Result<EnvironmentDescriptor, EnvironmentError> {
    match os {
        "macos" => Ok(EnvironmentDescriptor {
            os_family: OsFamily::MacOs,
            distro: "macos".into(),
            distro_like: String::new(),
            package_manager: PackageManager::Brew,
            service_manager: ServiceManagerKind::Launchd,
            default_web_root: PathBuf::from("/usr/local/var/www"),
        }),
        "linux" => {
            let fields = os_release.map(parse_os_release).unwrap_or_default();
            let id = field(&fields, "ID").unwrap_or("linux").to_string();
            let id_like = field(&fields, "ID_LIKE").unwrap_or_default();
            let (family, package_manager) = classify(&id, id_like);

            let service_manager = if systemd_booted {
                ServiceManagerKind::Systemd
            } else if openrc || family == DistroFamily::Alpine {
                ServiceManagerKind::OpenRc
            } else {
                ServiceManagerKind::Unknown
            };

            let default_web_root = match family {
                DistroFamily::Arch => "/srv/http",
                DistroFamily::Suse => "/srv/www/htdocs",
                _ => "/var/www",
            };

            if package_manager == PackageManager::Unknown {
                log::warn!(target: "environment", "Unknown distribution `{id}`, manual action required for missing tools");
            }

            Ok(EnvironmentDescriptor {
                os_family: OsFamily::Linux,
                distro: id,
                distro_like: id_like.to_string(),
                package_manager,
                service_manager,
                default_web_root: PathBuf::from(default_web_root),
            })
        }
        other => Err(EnvironmentError::UnsupportedPlatform(other.to_string())),
    }
}

impl EnvironmentDescriptor {
    /// Services considered web-related on this host, in stop order.
    pub fn web_services(&self) -> Vec<String> {
        let names: &[&str] = match self.service_manager {
            ServiceManagerKind::Launchd => &[
                "homebrew.mxcl.nginx",
                "homebrew.mxcl.httpd",
                "homebrew.mxcl.php",
            ],
            _ => match self.family() {
                DistroFamily::Debian | DistroFamily::Alpine => &["nginx", "apache2", "php-fpm"],
                DistroFamily::Suse => &["nginx", "apache2", "php-fpm"],
                DistroFamily::RedHat | DistroFamily::Arch | DistroFamily::Other => {
                    &["nginx", "httpd", "php-fpm"]
                }
            },
        };

        names.iter().map(|name| name.to_string()).collect()
    }

    fn family(&self) -> DistroFamily {
        classify(&self.distro, &self.distro_like).0
    }
}

/// Ensure `tool` is an executable in `PATH`.
pub fn require_tool(tool: &str) -> Result<PathBuf, EnvironmentError> {
    which::which(tool).map_err(|e| {
        log::debug!(target: "environment", "Looking up {tool} failed: {e}");
        EnvironmentError::MissingTool(tool.to_string())
    })
}

fn parse_os_release(content: &str) -> Vec<(String, String)> {
    let re = Regex::new(r#"^([A-Z_]+)=(?:"([^"]*)"|'([^']*)'|(.*))$"#).expect("valid regex");

    content
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            Some((caps[1].to_string(), value.to_string()))
        })
        .collect()
}

fn field<'a>(fields: &'a [(String, String)], key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn classify(id: &str, id_like: &str) -> (DistroFamily, PackageManager) {
    let candidates = std::iter::once(id).chain(id_like.split_whitespace());
    for candidate in candidates {
        let found = match candidate {
            "debian" | "ubuntu" | "linuxmint" | "raspbian" | "pop" => {
                Some((DistroFamily::Debian, PackageManager::Apt))
            }
            "fedora" | "rhel" | "rocky" | "almalinux" => {
                Some((DistroFamily::RedHat, PackageManager::Dnf))
            }
            "centos" | "amzn" => Some((DistroFamily::RedHat, PackageManager::Yum)),
            "arch" | "manjaro" | "endeavouros" => Some((DistroFamily::Arch, PackageManager::Pacman)),
            "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "sles" | "suse" => {
                Some((DistroFamily::Suse, PackageManager::Zypper))
            }
            "alpine" => Some((DistroFamily::Alpine, PackageManager::Apk)),
            _ => None,
        };
        if let Some(found) = found {
            return found;
        }
    }

    (DistroFamily::Other, PackageManager::Unknown)
}
