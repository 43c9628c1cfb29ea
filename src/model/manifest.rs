//! Model bundle manifest: artifact checksums, cloud binding, and the
//! instance-family allowlist.
//!
//! A bundle trained for one cloud must never run against another, and a
//! node whose instance family the bundle was not trained on must never be
//! scored — it is forced straight to EMERGENCY_EXIT by the caller.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::ModelError;

pub const MANIFEST_FILE: &str = "MODEL_MANIFEST.json";

/// Environment overrides, taking precedence over the manifest.
pub const ENV_MODEL_CLOUD: &str = "MODEL_CLOUD";
pub const ENV_SUPPORTED_FAMILIES: &str = "SUPPORTED_INSTANCE_FAMILIES";

/// Declared contents of a model bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    /// Cloud the bundle was trained for (e.g. "aws").
    pub cloud: String,
    /// Family tokens: `c6i`, `c6i.*`, or exact types like `c6i.2xlarge`.
    #[serde(default)]
    pub supported_instance_families: Vec<String>,
    /// Artifact file name -> SHA-256 hex digest.
    #[serde(default)]
    pub artifacts: HashMap<String, String>,
}

impl ModelManifest {
    /// Load the manifest from the bundle directory, `None` when absent.
    pub fn load(dir: &Path) -> Result<Option<ModelManifest>, ModelError> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| ModelError::Io {
            path: path.clone(),
            source: e,
        })?;
        let manifest: ModelManifest = serde_json::from_str(&content)
            .map_err(|e| ModelError::Manifest(format!("{}: {}", path.display(), e)))?;
        Ok(Some(manifest))
    }

    /// Verify every declared artifact's checksum against the files on disk.
    pub fn verify_artifacts(&self, dir: &Path) -> Result<(), ModelError> {
        for (artifact, expected) in &self.artifacts {
            let path = dir.join(artifact);
            let content = fs::read(&path).map_err(|e| ModelError::Io {
                path: path.clone(),
                source: e,
            })?;
            let actual = hex::encode(Sha256::digest(&content));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(ModelError::ChecksumMismatch {
                    artifact: artifact.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Fail when the bundle's cloud is not the one the agent expects.
    pub fn check_cloud(&self, expected: &str) -> Result<(), ModelError> {
        if !self.cloud.eq_ignore_ascii_case(expected) {
            return Err(ModelError::CloudMismatch {
                expected: expected.to_string(),
                actual: self.cloud.clone(),
            });
        }
        Ok(())
    }
}

/// Instance families the loaded models may score. `None` allows everything,
/// for bundles without a manifest when the contract is not required.
#[derive(Debug, Clone, Default)]
pub struct FamilyAllowlist {
    families: Option<Vec<String>>,
}

impl FamilyAllowlist {
    pub fn allow_all() -> Self {
        Self { families: None }
    }

    pub fn from_tokens(tokens: Vec<String>) -> Self {
        if tokens.is_empty() {
            Self::allow_all()
        } else {
            Self {
                families: Some(tokens),
            }
        }
    }

    /// Build from the manifest plus environment overrides. The env list, if
    /// set, replaces the manifest's entirely.
    pub fn resolve(manifest: Option<&ModelManifest>) -> Self {
        if let Ok(value) = std::env::var(ENV_SUPPORTED_FAMILIES) {
            let tokens: Vec<String> = value
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            return Self::from_tokens(tokens);
        }
        match manifest {
            Some(m) => Self::from_tokens(m.supported_instance_families.clone()),
            None => Self::allow_all(),
        }
    }

    /// Whether an instance type is inside the contract. Tokens match the
    /// family (`c6i`), the family wildcard (`c6i.*`), or the exact type.
    pub fn is_supported(&self, instance_type: &str) -> bool {
        let Some(families) = &self.families else {
            return true;
        };
        let family = instance_type.split('.').next().unwrap_or(instance_type);
        families.iter().any(|token| {
            token == instance_type
                || token == family
                || token
                    .strip_suffix(".*")
                    .map(|prefix| prefix == family)
                    .unwrap_or(false)
        })
    }
}

/// Expected cloud, env override first, then the manifest.
pub fn resolve_expected_cloud(default_cloud: &str) -> String {
    std::env::var(ENV_MODEL_CLOUD).unwrap_or_else(|_| default_cloud.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_family_token_forms() {
        let allowlist =
            FamilyAllowlist::from_tokens(vec!["c6i".into(), "m6a.*".into(), "r5.large".into()]);
        assert!(allowlist.is_supported("c6i.2xlarge"));
        assert!(allowlist.is_supported("c6i.large"));
        assert!(allowlist.is_supported("m6a.xlarge"));
        assert!(allowlist.is_supported("r5.large"));
        assert!(!allowlist.is_supported("r5.xlarge"));
        assert!(!allowlist.is_supported("t3.large"));
    }

    #[test]
    fn test_allow_all_when_no_manifest() {
        let allowlist = FamilyAllowlist::resolve(None);
        assert!(allowlist.is_supported("anything.large"));
    }

    #[test]
    fn test_empty_token_list_allows_all() {
        let allowlist = FamilyAllowlist::from_tokens(Vec::new());
        assert!(allowlist.is_supported("t3.micro"));
    }

    #[test]
    fn test_checksum_verification() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("tft.onnx");
        let mut f = fs::File::create(&model_path).unwrap();
        f.write_all(b"model-bytes").unwrap();
        drop(f);

        let digest = hex::encode(Sha256::digest(b"model-bytes"));
        let mut manifest = ModelManifest {
            cloud: "aws".to_string(),
            supported_instance_families: vec![],
            artifacts: [("tft.onnx".to_string(), digest)].into(),
        };
        assert!(manifest.verify_artifacts(dir.path()).is_ok());

        manifest
            .artifacts
            .insert("tft.onnx".to_string(), "deadbeef".to_string());
        assert!(matches!(
            manifest.verify_artifacts(dir.path()),
            Err(ModelError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_cloud_mismatch_fatal() {
        let manifest = ModelManifest {
            cloud: "gcp".to_string(),
            supported_instance_families: vec![],
            artifacts: HashMap::new(),
        };
        assert!(manifest.check_cloud("aws").is_err());
        assert!(manifest.check_cloud("GCP").is_ok());
    }

    #[test]
    fn test_load_missing_manifest_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModelManifest::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_load_parses_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"cloud": "aws", "supported_instance_families": ["c6i", "m6a"]}"#,
        )
        .unwrap();
        let manifest = ModelManifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(manifest.cloud, "aws");
        assert_eq!(manifest.supported_instance_families.len(), 2);
    }
}
