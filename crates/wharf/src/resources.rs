//! Resource request validation.
//!
//! Everything here is pure: requests are checked and normalized before any
//! daemon call, and every violation is collected so the caller can report
//! them all at once.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Violations, WharfError, WharfResult};

/// Smallest CPU limit, in thousandths of a CPU.
pub const MIN_CPU_MILLIS: u32 = 500;
/// Largest CPU limit, in thousandths of a CPU.
pub const MAX_CPU_MILLIS: u32 = 16_000;

const MAX_NAME_LEN: usize = 128;
const MAX_IMAGE_LEN: usize = 256;

/// Transport protocol of a forwarded port.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(format!("unknown protocol: {}", s)),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A container port as requested by the caller (not yet range-checked).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDeclaration {
    pub container_port: u32,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortDeclaration {
    pub fn tcp(container_port: u32) -> Self {
        Self {
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(container_port: u32) -> Self {
        Self {
            container_port,
            protocol: Protocol::Udp,
        }
    }
}

/// Raw resource request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus: f64,
    /// Human-readable size such as "512m" or "2g".
    pub memory: String,
    #[serde(default)]
    pub ports: Vec<PortDeclaration>,
}

/// Validated CPU and memory limits. Immutable once a container exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_millis: u32,
    pub memory_bytes: u64,
}

impl ResourceSpec {
    /// CPU limit as a fractional number of CPUs.
    pub fn cpus(&self) -> f64 {
        f64::from(self.cpu_millis) / 1000.0
    }
}

/// A validated port declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeclaredPort {
    pub container_port: u16,
    pub protocol: Protocol,
}

/// Output of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedResources {
    pub spec: ResourceSpec,
    pub ports: Vec<DeclaredPort>,
}

/// Validate and normalize a resource request.
pub fn validate_resources(request: &ResourceRequest) -> WharfResult<ValidatedResources> {
    let mut violations = Violations::new();
    match check_resources(request, &mut violations) {
        Some(validated) if violations.is_empty() => Ok(validated),
        _ => Err(WharfError::Validation(violations)),
    }
}

/// Check a request, recording violations instead of stopping at the first.
///
/// Returns `Some` only when nothing was recorded.
pub(crate) fn check_resources(
    request: &ResourceRequest,
    violations: &mut Violations,
) -> Option<ValidatedResources> {
    let before = violations.len();

    let cpu_millis = check_cpus(request.cpus, violations);
    let memory_bytes = match parse_memory(&request.memory) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            violations.push(e);
            None
        }
    };
    let ports = check_ports(&request.ports, violations);

    if violations.len() > before {
        return None;
    }
    Some(ValidatedResources {
        spec: ResourceSpec {
            cpu_millis: cpu_millis?,
            memory_bytes: memory_bytes?,
        },
        ports,
    })
}

fn check_cpus(cpus: f64, violations: &mut Violations) -> Option<u32> {
    if !cpus.is_finite() {
        violations.push("cpus must be a number");
        return None;
    }
    let min = f64::from(MIN_CPU_MILLIS) / 1000.0;
    let max = f64::from(MAX_CPU_MILLIS) / 1000.0;
    if cpus < min || cpus > max {
        violations.push(format!("cpus must be between {min} and {max} (got {cpus})"));
        return None;
    }
    Some((cpus * 1000.0).round() as u32)
}

fn check_ports(ports: &[PortDeclaration], violations: &mut Violations) -> Vec<DeclaredPort> {
    let mut seen = HashSet::new();
    let mut declared = Vec::with_capacity(ports.len());
    for port in ports {
        let number = match u16::try_from(port.container_port) {
            Ok(n) if n > 0 => n,
            _ => {
                violations.push(format!(
                    "container port {} is out of range 1-65535",
                    port.container_port
                ));
                continue;
            }
        };
        if !seen.insert((number, port.protocol)) {
            violations.push(format!(
                "container port {}/{} is declared more than once",
                number, port.protocol
            ));
            continue;
        }
        declared.push(DeclaredPort {
            container_port: number,
            protocol: port.protocol,
        });
    }
    declared
}

/// Parse a memory size such as "512m", "2G" or "1.5g" into bytes.
///
/// Units are binary (k = 1024) and required.
pub fn parse_memory(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let Some(unit) = text.chars().last() else {
        return Err("memory cannot be empty".to_string());
    };
    let multiplier: u64 = match unit.to_ascii_lowercase() {
        'b' => 1,
        'k' => 1024,
        'm' => 1024 * 1024,
        'g' => 1024 * 1024 * 1024,
        _ => {
            return Err(format!(
                "memory '{text}' must end with a unit (b, k, m or g)"
            ));
        }
    };
    let number = &text[..text.len() - unit.len_utf8()];
    let valid_number = !number.is_empty()
        && number.chars().all(|c| c.is_ascii_digit() || c == '.')
        && number.chars().filter(|c| *c == '.').count() <= 1
        && number.chars().any(|c| c.is_ascii_digit());
    if !valid_number {
        return Err(format!("memory '{text}' is not of the form <number><unit>"));
    }

    let bytes = if let Ok(whole) = number.parse::<u64>() {
        whole
            .checked_mul(multiplier)
            .ok_or_else(|| format!("memory '{text}' is too large"))?
    } else {
        let value: f64 = number
            .parse()
            .map_err(|_| format!("memory '{text}' is not of the form <number><unit>"))?;
        let bytes = (value * multiplier as f64).floor();
        if bytes >= u64::MAX as f64 {
            return Err(format!("memory '{text}' is too large"));
        }
        bytes as u64
    };

    if bytes == 0 {
        return Err(format!("memory '{text}' must be greater than zero"));
    }
    Ok(bytes)
}

/// Check a container name: alphanumeric, '-' and '_', starting with an
/// alphanumeric character or underscore.
pub fn check_container_name(name: &str, violations: &mut Violations) {
    if name.is_empty() {
        violations.push("container name cannot be empty");
        return;
    }
    if name.len() > MAX_NAME_LEN {
        violations.push(format!(
            "container name exceeds maximum length of {MAX_NAME_LEN} characters"
        ));
    }
    if let Some(first) = name.chars().next()
        && !first.is_ascii_alphanumeric()
        && first != '_'
    {
        violations.push("container name must start with an alphanumeric character or underscore");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        violations.push(format!(
            "container name '{name}' contains invalid characters; only alphanumeric, '-', '_' are allowed"
        ));
    }
}

/// Check an image reference (`[registry/][namespace/]name[:tag][@digest]`).
pub fn check_image(image: &str, violations: &mut Violations) {
    if image.is_empty() {
        violations.push("image cannot be empty");
        return;
    }
    if image.len() > MAX_IMAGE_LEN {
        violations.push(format!(
            "image exceeds maximum length of {MAX_IMAGE_LEN} characters"
        ));
    }
    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };
    if !image.chars().all(valid_chars) {
        violations.push(format!(
            "image '{image}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed"
        ));
    }
    if image.contains("..") {
        violations.push("image cannot contain '..'");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn request(cpus: f64, memory: &str) -> ResourceRequest {
        ResourceRequest {
            cpus,
            memory: memory.to_string(),
            ports: vec![],
        }
    }

    #[test]
    fn test_cpu_bounds() {
        assert!(validate_resources(&request(0.4, "512m")).is_err());
        let ok = validate_resources(&request(0.5, "512m")).unwrap();
        assert_eq!(ok.spec.cpu_millis, 500);
        assert!(validate_resources(&request(16.0, "512m")).is_ok());
        assert!(validate_resources(&request(16.01, "512m")).is_err());
        assert!(validate_resources(&request(f64::NAN, "512m")).is_err());
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_memory("100b").unwrap(), 100);
        assert_eq!(parse_memory("1.5g").unwrap(), 1536 * 1024 * 1024);
        assert!(parse_memory("").is_err());
        assert!(parse_memory("0m").is_err());
        assert!(parse_memory("512").is_err());
        assert!(parse_memory("g").is_err());
        assert!(parse_memory("12t").is_err());
        assert!(parse_memory("1.2.3m").is_err());
        assert!(parse_memory("99999999999999999999g").is_err());
    }

    #[test]
    fn test_ports_are_checked() {
        let mut req = request(1.0, "1g");
        req.ports = vec![
            PortDeclaration::tcp(8080),
            PortDeclaration::udp(8080),
            PortDeclaration::tcp(0),
            PortDeclaration::tcp(70000),
            PortDeclaration::tcp(8080),
        ];
        let err = validate_resources(&req).unwrap_err();
        let WharfError::Validation(violations) = err else {
            panic!("expected validation error");
        };
        assert_eq!(violations.len(), 3);
    }

    #[test]
    fn test_same_port_allowed_once_per_protocol() {
        let mut req = request(1.0, "1g");
        req.ports = vec![PortDeclaration::tcp(53), PortDeclaration::udp(53)];
        let ok = validate_resources(&req).unwrap();
        assert_eq!(ok.ports.len(), 2);
    }

    #[test]
    fn test_all_violations_reported_together() {
        let mut req = request(0.1, "lots");
        req.ports = vec![PortDeclaration::tcp(0)];
        let err = validate_resources(&req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let message = err.to_string();
        assert!(message.contains("cpus"));
        assert!(message.contains("memory"));
        assert!(message.contains("port 0"));
    }

    #[test]
    fn test_container_name_rules() {
        let check = |name: &str| {
            let mut v = Violations::new();
            check_container_name(name, &mut v);
            v.is_empty()
        };
        assert!(check("dev-box_1"));
        assert!(check("_private"));
        assert!(!check(""));
        assert!(!check("-leading"));
        assert!(!check("has space"));
        assert!(!check(&"a".repeat(129)));
    }

    #[test]
    fn test_image_rules() {
        let check = |image: &str| {
            let mut v = Violations::new();
            check_image(image, &mut v);
            v.is_empty()
        };
        assert!(check("alpine"));
        assert!(check("ghcr.io/org/tool:1.2@sha256:abcd"));
        assert!(!check(""));
        assert!(!check("alpine; rm -rf /"));
        assert!(!check("../etc"));
    }
}
