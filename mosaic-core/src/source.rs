//! Model source detection and resolution
//!
//! The identifier syntax alone decides where a model comes from:
//! - a filesystem path (`/abs`, `./rel`, `~/x`, `file://...`, or anything that exists)
//! - a versioned artifact store entry, `entity/project/name[:version]`
//! - a Hugging Face hub repo, `namespace/name[:revision]` or `hf://namespace/name`

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use hf_hub::api::tokio::Api;
use hf_hub::{Repo, RepoType};
use tracing::{debug, info};

use crate::{Error, Result};

const DEFAULT_REVISION: &str = "main";
const LATEST: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    Artifact {
        entity: String,
        project: String,
        name: String,
        version: Option<String>,
    },
    Hub {
        repo: String,
        revision: Option<String>,
    },
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

fn split_version(s: &str) -> (&str, Option<&str>) {
    match s.rsplit_once(':') {
        Some((base, version)) if !version.is_empty() => (base, Some(version)),
        Some((base, _)) => (base, None),
        None => (s, None),
    }
}

/// Artifact entity, project, name and version each map to one directory
/// under the store root.
fn is_plain_component(component: &str) -> bool {
    !matches!(component, "." | "..") && !component.contains(['/', '\\'])
}

impl ModelSource {
    pub fn parse(identifier: &str) -> Result<Self> {
        let id = identifier.trim();
        if id.is_empty() {
            return Err(Error::resolution(identifier, "empty model identifier"));
        }
        if let Some(path) = id.strip_prefix("file://") {
            return Ok(Self::Local(expand_home(path)));
        }
        let looks_like_path = id.starts_with('/')
            || id.starts_with("./")
            || id.starts_with("../")
            || id.starts_with("~/");
        if looks_like_path || Path::new(id).exists() {
            return Ok(Self::Local(expand_home(id)));
        }

        let (hub_only, rest) = match id.strip_prefix("hf://") {
            Some(rest) => (true, rest),
            None => (false, id),
        };
        let (base, version) = split_version(rest);
        let segments: Vec<&str> = base.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::resolution(identifier, "empty path segment"));
        }
        match segments.as_slice() {
            [namespace, name] => Ok(Self::Hub {
                repo: format!("{namespace}/{name}"),
                revision: version.map(str::to_string),
            }),
            [entity, project, name] if !hub_only => {
                let components = [*entity, *project, *name].into_iter().chain(version);
                for component in components {
                    if !is_plain_component(component) {
                        return Err(Error::resolution(
                            identifier,
                            format!("`{component}` is not a plain artifact path component"),
                        ));
                    }
                }
                Ok(Self::Artifact {
                entity: entity.to_string(),
                project: project.to_string(),
                name: name.to_string(),
                version: version.map(str::to_string),
                })
            }
            _ => Err(Error::resolution(
                identifier,
                "expected `namespace/name[:revision]`, `entity/project/name[:version]` or a path",
            )),
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "local path {}", path.display()),
            Self::Artifact {
                entity,
                project,
                name,
                ..
            } => write!(f, "artifact {entity}/{project}/{name}"),
            Self::Hub { repo, .. } => write!(f, "hub repo {repo}"),
        }
    }
}

/// The files of one resolved model, keyed by their canonical name.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub identifier: String,
    pub revision: String,
    files: HashMap<String, PathBuf>,
}

impl ModelFiles {
    pub fn get(&self, name: &str) -> Result<&Path> {
        self.files
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| Error::resolution(&self.identifier, format!("`{name}` was not resolved")))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Locates model files on disk, in the artifact store, or on the hub.
#[derive(Clone)]
pub struct Resolver {
    artifact_root: PathBuf,
}

impl Resolver {
    pub fn new(artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            artifact_root: artifact_root.into(),
        }
    }

    pub async fn resolve(&self, identifier: &str, required: &[&str]) -> Result<ModelFiles> {
        let source = ModelSource::parse(identifier)?;
        debug!(identifier, %source, "resolving model");
        let files = match &source {
            ModelSource::Local(path) => {
                collect_files(identifier, path, "local".to_string(), required)?
            }
            ModelSource::Artifact {
                entity,
                project,
                name,
                version,
            } => {
                let base = self.artifact_root.join(entity).join(project).join(name);
                let version = match version.as_deref() {
                    None | Some(LATEST) => latest_version(identifier, &base)?,
                    Some(v) => v.to_string(),
                };
                collect_files(identifier, &base.join(&version), version, required)?
            }
            ModelSource::Hub { repo, revision } => {
                let revision = revision.as_deref().unwrap_or(DEFAULT_REVISION).to_string();
                self.fetch_from_hub(identifier, repo, revision, required).await?
            }
        };
        info!(identifier, revision = %files.revision, files = files.len(), "resolved model");
        Ok(files)
    }

    async fn fetch_from_hub(
        &self,
        identifier: &str,
        repo: &str,
        revision: String,
        required: &[&str],
    ) -> Result<ModelFiles> {
        let api = Api::new().map_err(|e| Error::resolution(identifier, e.to_string()))?;
        let repo_api = api.repo(Repo::with_revision(
            repo.to_string(),
            RepoType::Model,
            revision.clone(),
        ));
        let mut files = HashMap::new();
        for &name in required {
            let path = repo_api
                .get(name)
                .await
                .map_err(|e| Error::resolution(identifier, format!("failed to get `{name}`: {e}")))?;
            files.insert(name.to_string(), path);
        }
        Ok(ModelFiles {
            identifier: identifier.to_string(),
            revision,
            files,
        })
    }
}

fn collect_files(
    identifier: &str,
    root: &Path,
    revision: String,
    required: &[&str],
) -> Result<ModelFiles> {
    let mut files = HashMap::new();
    if root.is_file() {
        // A bare file path stands in for a single-file model.
        match required {
            [name] => {
                files.insert(name.to_string(), root.to_path_buf());
            }
            _ => {
                return Err(Error::resolution(
                    identifier,
                    format!("{} is a file but {} files are required", root.display(), required.len()),
                ))
            }
        }
    } else if root.is_dir() {
        for &name in required {
            let candidate = root.join(name);
            if !candidate.is_file() {
                return Err(Error::resolution(
                    identifier,
                    format!("missing `{name}` in {}", root.display()),
                ));
            }
            files.insert(name.to_string(), candidate);
        }
    } else {
        return Err(Error::resolution(
            identifier,
            format!("path does not exist: {}", root.display()),
        ));
    }
    Ok(ModelFiles {
        identifier: identifier.to_string(),
        revision,
        files,
    })
}

/// Picks the highest `vN` directory of an artifact.
fn latest_version(identifier: &str, base: &Path) -> Result<String> {
    let entries = std::fs::read_dir(base)
        .map_err(|e| Error::resolution(identifier, format!("{}: {e}", base.display())))?;
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let n = name.strip_prefix('v')?.parse::<u64>().ok()?;
            Some((n, name))
        })
        .max_by_key(|(n, _)| *n)
        .map(|(_, name)| name)
        .ok_or_else(|| Error::resolution(identifier, "artifact has no versions"))
}
