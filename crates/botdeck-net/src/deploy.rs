//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Deployment backends invoked by the deploy endpoint."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use botdeck_common::DeployConfig;
use botdeck_core::{DeployReceipt, DeployRequest};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;
use url::Url;

const DEFAULT_PRIMARY_NAME: &str = "bot.py";
const DEFAULT_DEPENDENCIES_NAME: &str = "requirements.txt";
const MANIFEST_NAME: &str = "deployment.json";

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid deploy request: {0}")]
    Invalid(String),
    #[error("deployment io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("deployment manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("deployment url error: {0}")]
    Url(#[from] url::ParseError),
}

/// Publishes a user's bot files and reports where they landed.
#[async_trait]
pub trait DeployBackend: Send + Sync + 'static {
    async fn deploy(&self, uid: &str, request: &DeployRequest) -> Result<DeployReceipt, DeployError>;
}

/// Writes each deployment into `<directory>/<uid>/` and serves it under
/// `<public_base_url>/<uid>/`.
#[derive(Debug, Clone)]
pub struct DirectoryDeployBackend {
    directory: PathBuf,
    public_base_url: Url,
    repository_prefix: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    uid: &'a str,
    repository_ref: &'a str,
    deployment_url: &'a Url,
    primary_file: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dependencies_file: Option<&'a str>,
    deployed_at: DateTime<Utc>,
}

impl DirectoryDeployBackend {
    pub fn new(config: &DeployConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            public_base_url: config.public_base_url.clone(),
            repository_prefix: config.repository_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[async_trait]
impl DeployBackend for DirectoryDeployBackend {
    async fn deploy(&self, uid: &str, request: &DeployRequest) -> Result<DeployReceipt, DeployError> {
        validate_uid(uid)?;
        if request.primary_file_content.trim().is_empty() {
            return Err(DeployError::Invalid("primary file is empty".into()));
        }

        let primary_name = sanitize_file_name(&request.primary_file_name, DEFAULT_PRIMARY_NAME);
        let dependencies = request.dependencies_file_content.as_deref().map(|content| {
            let name = request
                .dependencies_file_name
                .as_deref()
                .unwrap_or(DEFAULT_DEPENDENCIES_NAME);
            (sanitize_file_name(name, DEFAULT_DEPENDENCIES_NAME), content)
        });

        let target = self.directory.join(uid);
        tokio::fs::create_dir_all(&target).await?;
        tokio::fs::write(target.join(&primary_name), &request.primary_file_content).await?;
        if let Some((name, content)) = &dependencies {
            tokio::fs::write(target.join(name), content).await?;
        }

        let repository_ref = format!(
            "{}/{}@{}",
            self.repository_prefix,
            uid,
            content_digest(request)
        );
        let deployment_url = self.public_base_url.join(&format!("{uid}/"))?;
        let manifest = Manifest {
            uid,
            repository_ref: &repository_ref,
            deployment_url: &deployment_url,
            primary_file: &primary_name,
            dependencies_file: dependencies.as_ref().map(|(name, _)| name.as_str()),
            deployed_at: Utc::now(),
        };
        tokio::fs::write(
            target.join(MANIFEST_NAME),
            serde_json::to_vec_pretty(&manifest)?,
        )
        .await?;

        info!(uid, %deployment_url, repository_ref, "deployment published");
        Ok(DeployReceipt {
            deployment_url,
            repository_ref,
        })
    }
}

fn validate_uid(uid: &str) -> Result<(), DeployError> {
    let valid = !uid.is_empty()
        && uid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DeployError::Invalid(format!("user id {uid:?} is not path safe")))
    }
}

/// Keep only the final path component and drop anything outside a
/// conservative character set.
fn sanitize_file_name(name: &str, fallback: &str) -> String {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') || cleaned == MANIFEST_NAME {
        fallback.to_string()
    } else {
        cleaned
    }
}

fn content_digest(request: &DeployRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.primary_file_content.as_bytes());
    if let Some(content) = &request.dependencies_file_content {
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(12);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn backend(dir: &Path) -> DirectoryDeployBackend {
        DirectoryDeployBackend::new(&DeployConfig {
            directory: dir.to_path_buf(),
            public_base_url: Url::parse("https://bots.example.com/run/").unwrap(),
            repository_prefix: "botdeck/".into(),
        })
    }

    fn request() -> DeployRequest {
        DeployRequest {
            primary_file_name: "../../etc/trader.py".into(),
            primary_file_content: "print('hi')\n".into(),
            dependencies_file_name: None,
            dependencies_file_content: Some("requests==2.31\n".into()),
        }
    }

    #[tokio::test]
    async fn deploy_writes_files_under_user_directory() {
        let dir = tempdir().unwrap();
        let receipt = backend(dir.path()).deploy("alice", &request()).await.unwrap();

        assert_eq!(
            receipt.deployment_url.as_str(),
            "https://bots.example.com/run/alice/"
        );
        assert!(receipt.repository_ref.starts_with("botdeck/alice@"));
        assert_eq!(receipt.repository_ref.len(), "botdeck/alice@".len() + 12);

        let root = dir.path().join("alice");
        assert_eq!(
            std::fs::read_to_string(root.join("trader.py")).unwrap(),
            "print('hi')\n"
        );
        assert!(root.join("requirements.txt").exists());
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(root.join("deployment.json")).unwrap()).unwrap();
        assert_eq!(manifest["repositoryRef"], receipt.repository_ref.as_str());
    }

    #[tokio::test]
    async fn same_content_yields_same_reference() {
        let dir = tempdir().unwrap();
        let backend = backend(dir.path());
        let first = backend.deploy("alice", &request()).await.unwrap();
        let second = backend.deploy("alice", &request()).await.unwrap();
        assert_eq!(first.repository_ref, second.repository_ref);

        let mut changed = request();
        changed.primary_file_content.push_str("# v2\n");
        let third = backend.deploy("alice", &changed).await.unwrap();
        assert_ne!(first.repository_ref, third.repository_ref);
    }

    #[tokio::test]
    async fn rejects_unsafe_uid_and_empty_primary() {
        let dir = tempdir().unwrap();
        let backend = backend(dir.path());
        assert!(matches!(
            backend.deploy("../bob", &request()).await,
            Err(DeployError::Invalid(_))
        ));

        let mut empty = request();
        empty.primary_file_content = "  \n".into();
        assert!(matches!(
            backend.deploy("alice", &empty).await,
            Err(DeployError::Invalid(_))
        ));
    }

    #[test]
    fn sanitize_falls_back_for_degenerate_names() {
        assert_eq!(sanitize_file_name("..", "bot.py"), "bot.py");
        assert_eq!(sanitize_file_name("dir/deployment.json", "bot.py"), "bot.py");
        assert_eq!(sanitize_file_name("my bot!.py", "bot.py"), "mybot.py");
    }
}
