//! Interface loader
//!
//! The remote service's interface is an opaque, versioned JSON descriptor
//! supplied at runtime. A schema directory holds one file per version:
//!
//! ```text
//! schemas/
//!   lightning-v0.16.4.json
//!   lightning-v0.17.0.json   <- picked as latest
//! ```
//!
//! Message bodies stay opaque bytes; the descriptor only tells us which
//! methods exist, how they stream, and the gRPC path to call them on.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::error::{NodeLinkError, Result};

const DESCRIPTOR_EXTENSION: &str = "json";

/// Numeric, dotted schema version (`0.17.4`)
#[derive(Debug, Clone)]
pub struct SchemaVersion(Vec<u64>);

impl SchemaVersion {
    pub fn components(&self) -> &[u64] {
        &self.0
    }

    /// Extract the version embedded in a descriptor file name.
    ///
    /// Accepts `<name>-v<version>.json`, `<name>_v<version>.json` and
    /// `v<version>.json`.
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(DESCRIPTOR_EXTENSION)?.strip_suffix('.')?;
        let tail = match stem.rfind(['-', '_']) {
            Some(idx) => &stem[idx + 1..],
            None => stem,
        };
        let version = tail.strip_prefix('v')?;
        version.parse().ok()
    }
}

impl FromStr for SchemaVersion {
    type Err = NodeLinkError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('v');
        let components = trimmed
            .split('.')
            .map(|part| part.parse::<u64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| NodeLinkError::Config(format!("invalid schema version {:?}", s)))?;

        if components.is_empty() {
            return Err(NodeLinkError::Config(format!("invalid schema version {:?}", s)));
        }
        Ok(Self(components))
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // Missing trailing components count as zero: 1.2 == 1.2.0
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| {
                let a = self.0.get(i).copied().unwrap_or(0);
                let b = other.0.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialEq for SchemaVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SchemaVersion {}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// How a method streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl MethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::ServerStreaming => "server-streaming",
            Self::ClientStreaming => "client-streaming",
            Self::BidiStreaming => "bidi-streaming",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub kind: MethodKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<MethodDescriptor>,
}

/// Parsed contents of one descriptor file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescription {
    /// Protobuf package, prefixed to service names on the wire
    #[serde(default)]
    pub package: String,
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
}

impl InterfaceDescription {
    /// Look up a service by bare (`Lightning`) or qualified
    /// (`lnrpc.Lightning`) name
    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        let bare = match name.strip_prefix(self.package.as_str()) {
            Some(rest) if !self.package.is_empty() => rest.strip_prefix('.').unwrap_or(name),
            _ => name,
        };
        self.services.iter().find(|s| s.name == bare)
    }
}

/// Callable client definition for one service of one schema version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFactory {
    version: SchemaVersion,
    package: String,
    service: ServiceDescriptor,
}

impl ClientFactory {
    pub fn version(&self) -> &SchemaVersion {
        &self.version
    }

    /// Fully qualified service name
    pub fn service_name(&self) -> String {
        if self.package.is_empty() {
            self.service.name.clone()
        } else {
            format!("{}.{}", self.package, self.service.name)
        }
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.service.methods
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.service.methods.iter().find(|m| m.name == name)
    }

    /// gRPC path of a method of the expected kind
    pub fn path(&self, method: &str, expected: MethodKind) -> Result<String> {
        match self.method(method) {
            Some(m) if m.kind == expected => Ok(format!("/{}/{}", self.service_name(), m.name)),
            _ => Err(NodeLinkError::UnknownMethod {
                service: self.service_name(),
                method: method.to_string(),
                expected: expected.as_str(),
            }),
        }
    }
}

/// Reads versioned schema descriptors from a directory
#[derive(Debug, Clone)]
pub struct InterfaceLoader {
    dir: PathBuf,
}

impl InterfaceLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All descriptor versions present, newest first
    pub fn available(&self) -> Result<Vec<(SchemaVersion, PathBuf)>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| NodeLinkError::SchemaNotFound {
            dir: self.dir.clone(),
            reason: e.to_string(),
        })?;

        let mut found: Vec<(SchemaVersion, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name();
                let version = SchemaVersion::from_file_name(name.to_str()?)?;
                Some((version, entry.path()))
            })
            .collect();

        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(found)
    }

    /// Highest version present in the directory
    pub fn latest_version(&self) -> Result<SchemaVersion> {
        self.available()?
            .into_iter()
            .next()
            .map(|(version, _)| version)
            .ok_or_else(|| self.not_found("no versioned descriptor files"))
    }

    /// Parse the descriptor of a given version (latest when `None`)
    pub fn describe(
        &self,
        version: Option<&SchemaVersion>,
    ) -> Result<(SchemaVersion, InterfaceDescription)> {
        let available = self.available()?;
        let (version, path) = match version {
            Some(wanted) => available
                .into_iter()
                .find(|(v, _)| v == wanted)
                .ok_or_else(|| self.not_found(&format!("version {} not present", wanted)))?,
            None => available
                .into_iter()
                .next()
                .ok_or_else(|| self.not_found("no versioned descriptor files"))?,
        };

        let content = std::fs::read_to_string(&path).map_err(|e| NodeLinkError::Schema {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let description: InterfaceDescription =
            serde_json::from_str(&content).map_err(|e| NodeLinkError::Schema {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        debug!(
            path = %path.display(),
            version = %version,
            services = description.services.len(),
            "Loaded schema descriptor"
        );

        Ok((version, description))
    }

    /// Build a client factory for one named service
    pub fn load(&self, version: Option<&SchemaVersion>, service: &str) -> Result<ClientFactory> {
        let (version, description) = self.describe(version)?;
        let descriptor = description
            .service(service)
            .cloned()
            .ok_or_else(|| self.not_found(&format!("service {} not in version {}", service, version)))?;

        Ok(ClientFactory {
            version,
            package: description.package,
            service: descriptor,
        })
    }

    fn not_found(&self, reason: &str) -> NodeLinkError {
        NodeLinkError::SchemaNotFound {
            dir: self.dir.clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DESCRIPTOR: &str = r#"{
        "package": "lnrpc",
        "services": [{
            "name": "Lightning",
            "methods": [
                { "name": "GetInfo", "kind": "unary" },
                { "name": "SubscribeInvoices", "kind": "server_streaming" }
            ]
        }]
    }"#;

    fn v(s: &str) -> SchemaVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_version_from_file_name() {
        assert_eq!(SchemaVersion::from_file_name("lightning-v0.17.4.json"), Some(v("0.17.4")));
        assert_eq!(SchemaVersion::from_file_name("rpc_v12.json"), Some(v("12")));
        assert_eq!(SchemaVersion::from_file_name("v1.2.json"), Some(v("1.2")));
        assert_eq!(SchemaVersion::from_file_name("lightning.json"), None);
        assert_eq!(SchemaVersion::from_file_name("lightning-v0.17.4.proto"), None);
        assert_eq!(SchemaVersion::from_file_name("lightning-vnext.json"), None);
    }

    #[test]
    fn test_version_ordering_is_numeric() {
        assert!(v("0.10.0") > v("0.9.9"));
        assert!(v("1.2.1") > v("1.2"));
        assert_eq!(v("1.2").cmp(&v("1.2.0")), Ordering::Equal);
        assert_eq!(v("v0.17.4").to_string(), "0.17.4");
    }

    #[test]
    fn test_latest_version_picks_maximum() {
        let dir = TempDir::new().unwrap();
        for name in ["lightning-v0.9.0.json", "lightning-v0.10.1.json", "notes.txt"] {
            std::fs::write(dir.path().join(name), DESCRIPTOR).unwrap();
        }

        let loader = InterfaceLoader::new(dir.path());
        assert_eq!(loader.latest_version().unwrap(), v("0.10.1"));
    }

    #[test]
    fn test_empty_or_missing_dir_is_schema_not_found() {
        let dir = TempDir::new().unwrap();
        let loader = InterfaceLoader::new(dir.path());
        assert!(matches!(
            loader.latest_version(),
            Err(NodeLinkError::SchemaNotFound { .. })
        ));

        let loader = InterfaceLoader::new(dir.path().join("missing"));
        assert!(matches!(
            loader.load(None, "Lightning"),
            Err(NodeLinkError::SchemaNotFound { .. })
        ));
    }

    #[test]
    fn test_load_is_idempotent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("lightning-v0.17.0.json"), DESCRIPTOR).unwrap();

        let loader = InterfaceLoader::new(dir.path());
        let first = loader.load(None, "lnrpc.Lightning").unwrap();
        let second = loader.load(None, "Lightning").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.service_name(), "lnrpc.Lightning");
    }

    #[test]
    fn test_method_paths_check_kind() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("lightning-v0.17.0.json"), DESCRIPTOR).unwrap();
        let factory = InterfaceLoader::new(dir.path()).load(None, "Lightning").unwrap();

        assert_eq!(
            factory.path("SubscribeInvoices", MethodKind::ServerStreaming).unwrap(),
            "/lnrpc.Lightning/SubscribeInvoices"
        );
        assert!(matches!(
            factory.path("GetInfo", MethodKind::ServerStreaming),
            Err(NodeLinkError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn test_pinned_version_must_exist() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("lightning-v0.17.0.json"), DESCRIPTOR).unwrap();
        let loader = InterfaceLoader::new(dir.path());

        assert!(loader.load(Some(&v("0.17")), "Lightning").is_ok());
        assert!(matches!(
            loader.load(Some(&v("0.16.0")), "Lightning"),
            Err(NodeLinkError::SchemaNotFound { .. })
        ));
    }

    #[test]
    fn test_malformed_descriptor_is_schema_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("lightning-v1.json"), "{ not json").unwrap();
        let loader = InterfaceLoader::new(dir.path());
        assert!(matches!(
            loader.load(None, "Lightning"),
            Err(NodeLinkError::Schema { .. })
        ));
    }
}
