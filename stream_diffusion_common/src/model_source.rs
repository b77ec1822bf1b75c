use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use hf_hub::{
    api::sync::{ApiBuilder, ApiRepo},
    Repo, RepoType,
};

use crate::{get_token, TokenSource};

/// Where to load the model from.
///
/// Models are expected in the diffusers directory layout: `tokenizer/`,
/// `text_encoder/`, `unet/` and `vae/` subdirectories each carrying their
/// own weights and `config.json`.
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// A Hugging Face model ID.
    ModelId(String),
    /// A local diffusers-layout directory.
    LocalDir(PathBuf),
}

impl ModelSource {
    pub fn from_model_id<S: ToString>(model_id: S) -> Self {
        Self::ModelId(model_id.to_string())
    }

    pub fn local_dir<P: Into<PathBuf>>(path: P) -> anyhow::Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            anyhow::bail!("`{}` is not a directory", path.display());
        }
        Ok(Self::LocalDir(path))
    }

    /// The identifier used for logging and cache-key construction.
    pub fn id(&self) -> String {
        match self {
            Self::ModelId(id) => id.clone(),
            Self::LocalDir(path) => path.display().to_string(),
        }
    }
}

impl Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelId(id) => write!(f, "model id: {id}"),
            Self::LocalDir(path) => write!(f, "local dir: {}", path.display()),
        }
    }
}

/// Resolves component files for a [`ModelSource`].
///
/// The API variant keeps the resolved token and progress setting so sibling
/// repos (adapters, tiny VAE) are fetched with the same credentials.
pub enum FileLoader {
    Api {
        repo: ApiRepo,
        token: Option<String>,
        silent: bool,
    },
    LocalDir(PathBuf),
}

impl FileLoader {
    pub fn from_model_source(
        source: &ModelSource,
        silent: bool,
        token: TokenSource,
        revision: Option<String>,
    ) -> anyhow::Result<Self> {
        match source {
            ModelSource::ModelId(model_id) => {
                let token = get_token(&token)?;
                let api = ApiBuilder::new()
                    .with_progress(!silent)
                    .with_token(token.clone())
                    .build()?;
                let revision = revision.unwrap_or("main".to_string());
                let repo = api.repo(Repo::with_revision(
                    model_id.clone(),
                    RepoType::Model,
                    revision,
                ));
                Ok(Self::Api {
                    repo,
                    token,
                    silent,
                })
            }
            ModelSource::LocalDir(path) => Ok(Self::LocalDir(path.clone())),
        }
    }

    /// Fetch a repo-relative file, downloading it if necessary.
    pub fn get(&self, name: &str) -> anyhow::Result<PathBuf> {
        match self {
            Self::Api { repo, .. } => repo
                .get(name)
                .map_err(|e| anyhow::Error::msg(e.to_string())),
            Self::LocalDir(dir) => {
                let path = dir.join(name);
                if !path.exists() {
                    anyhow::bail!("`{}` not found in `{}`", name, dir.display());
                }
                Ok(path)
            }
        }
    }

    /// Fetch a repo-relative file from another repo, reusing this loader's
    /// credentials. Local sources resolve `model_id` as a path.
    pub fn get_from(&self, model_id: &str, name: &str) -> anyhow::Result<PathBuf> {
        match self {
            Self::Api { token, silent, .. } => {
                let sibling = ApiBuilder::new()
                    .with_progress(!silent)
                    .with_token(token.clone())
                    .build()?
                    .repo(Repo::new(model_id.to_string(), RepoType::Model));
                sibling
                    .get(name)
                    .map_err(|e| anyhow::Error::msg(e.to_string()))
            }
            Self::LocalDir(_) => {
                let path = Path::new(model_id).join(name);
                if !path.exists() {
                    anyhow::bail!("`{}` not found in `{model_id}`", name);
                }
                Ok(path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_source_id_and_display() {
        let source = ModelSource::from_model_id("stable-diffusion-v1-5/stable-diffusion-v1-5");
        assert_eq!(source.id(), "stable-diffusion-v1-5/stable-diffusion-v1-5");
        assert_eq!(
            source.to_string(),
            "model id: stable-diffusion-v1-5/stable-diffusion-v1-5"
        );
    }

    #[test]
    fn local_dir_must_exist() {
        assert!(ModelSource::local_dir("/definitely/not/a/dir").is_err());
    }

    #[test]
    fn api_loader_keeps_credentials_for_sibling_repos() -> anyhow::Result<()> {
        let source = ModelSource::from_model_id("some/model");
        let loader = FileLoader::from_model_source(
            &source,
            true,
            crate::TokenSource::Literal("hf_abc".to_string()),
            None,
        )?;
        match loader {
            FileLoader::Api { token, silent, .. } => {
                assert_eq!(token.as_deref(), Some("hf_abc"));
                assert!(silent);
            }
            FileLoader::LocalDir(_) => panic!("expected an API loader"),
        }
        Ok(())
    }

    #[test]
    fn local_loader_rejects_missing_files() {
        let dir = std::env::temp_dir();
        let loader = FileLoader::LocalDir(dir);
        assert!(loader.get("unet/missing.safetensors").is_err());
    }
}
