//! Registry of pre-approved sandbox profiles (C1).
//!
//! Parses the declarative catalog at a configured path and serves it to the
//! lifecycle controller. A profile not present here can never be started —
//! the registry is the sole authorization boundary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// A single pre-approved sandbox profile.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SandboxProfile {
    /// Unique key. Filled in from the document's map key, not the body.
    #[serde(skip)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub triggers: Vec<String>,

    /// Engine image reference. Synthesized from `name` if omitted.
    #[serde(default)]
    pub image: Option<String>,

    #[serde(default)]
    pub build_context: Option<PathBuf>,

    #[serde(default)]
    pub security: SecurityPolicy,

    #[serde(default)]
    pub resources: ResourceLimits,
}

impl SandboxProfile {
    /// The image reference to run, synthesizing one from the profile name
    /// when the document didn't declare one explicitly.
    pub fn image_ref(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| format!("sandbox-{}:latest", self.name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    None,
    Default,
}

impl Default for NetworkMode {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub network_mode: NetworkMode,
    pub read_only: bool,
    pub needs_confirm: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            network_mode: NetworkMode::None,
            read_only: false,
            needs_confirm: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct ResourceLimits {
    /// Size-string in the engine's native syntax (e.g. `"512m"`).
    pub memory: Option<String>,
    pub cpus: Option<f64>,
}

/// Shape of the registry document on disk.
///
/// `settings` is accepted and currently unused — reserved for future
/// catalog-wide knobs. Unknown top-level keys are ignored by serde's default
/// behavior (no `deny_unknown_fields`).
#[derive(Debug, Deserialize, Default)]
struct RegistryDocument {
    #[serde(default)]
    containers: HashMap<String, SandboxProfile>,
    #[serde(default)]
    settings: serde_yaml::Value,
}

/// The read-mostly catalog of allowed sandbox profiles.
pub struct Registry {
    profiles: RwLock<HashMap<String, SandboxProfile>>,
}

impl Registry {
    /// Load from `path`. An unreadable or unparseable file degrades to an
    /// empty catalog (logged), rather than failing daemon startup — every
    /// `start` request will then be rejected with `ProfileNotAllowed`.
    pub async fn load(path: &Path) -> Self {
        let profiles = Self::read_document(path).unwrap_or_else(|e| {
            error!(path = %path.display(), error = %e, "failed to load sandbox registry; falling back to empty catalog");
            HashMap::new()
        });

        if profiles.is_empty() {
            warn!(path = %path.display(), "sandbox registry is empty");
        } else {
            info!(path = %path.display(), count = profiles.len(), "loaded sandbox registry");
        }

        Self {
            profiles: RwLock::new(profiles),
        }
    }

    fn read_document(path: &Path) -> anyhow::Result<HashMap<String, SandboxProfile>> {
        let raw = std::fs::read_to_string(path)?;
        let doc: RegistryDocument = serde_yaml::from_str(&raw)?;
        let mut profiles = doc.containers;
        for (name, profile) in &mut profiles {
            profile.name = name.clone();
        }
        Ok(profiles)
    }

    pub async fn list(&self) -> Vec<SandboxProfile> {
        self.profiles.read().await.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Option<SandboxProfile> {
        self.profiles.read().await.get(name).cloned()
    }

    pub async fn allowed(&self, name: &str) -> bool {
        self.profiles.read().await.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[tokio::test]
    async fn loads_valid_document() {
        let file = write_temp(
            r#"
containers:
  python-sandbox:
    description: "Python REPL sandbox"
    triggers: ["python", "py"]
    image: "sandbox-python:latest"
    security:
      network_mode: none
      read_only: true
    resources:
      cpus: 0.5
  rogue:
    description: "not actually allowed, just testing map parsing"
settings:
  unused_knob: 42
"#,
        );

        let registry = Registry::load(file.path()).await;
        assert!(registry.allowed("python-sandbox").await);
        assert!(registry.allowed("rogue").await);
        assert!(!registry.allowed("does-not-exist").await);

        let profile = registry.get("python-sandbox").await.unwrap();
        assert_eq!(profile.name, "python-sandbox");
        assert_eq!(profile.image_ref(), "sandbox-python:latest");
        assert_eq!(profile.security.network_mode, NetworkMode::None);
        assert!(profile.security.read_only);
        assert_eq!(profile.resources.cpus, Some(0.5));

        assert_eq!(registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn missing_file_degrades_to_empty_catalog() {
        let registry = Registry::load(Path::new("/nonexistent/registry.yaml")).await;
        assert!(registry.list().await.is_empty());
        assert!(!registry.allowed("anything").await);
    }

    #[tokio::test]
    async fn invalid_yaml_degrades_to_empty_catalog() {
        let file = write_temp("containers: [this, is, not, a, map]");
        let registry = Registry::load(file.path()).await;
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn image_synthesized_from_name_when_absent() {
        let file = write_temp(
            r#"
containers:
  shell:
    description: "bash sandbox"
"#,
        );
        let registry = Registry::load(file.path()).await;
        let profile = registry.get("shell").await.unwrap();
        assert_eq!(profile.image_ref(), "sandbox-shell:latest");
    }
}
