// Image resolution: reuse an image by name or build it from source
use crate::docker::provider::InfrastructureProvider;
use crate::errors::{Result, TbError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A resolved image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub source_dir: PathBuf,
    /// True when this call built the image, false when it already existed
    pub built: bool,
}

/// Resolves images by name, building only on a cache miss
///
/// The cache key is the image name alone. A changed source directory does
/// not invalidate an image that already carries the name.
#[derive(Clone)]
pub struct ImageProvisioner {
    provider: Arc<dyn InfrastructureProvider>,
    descriptor: String,
    build_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ImageProvisioner {
    pub fn new(provider: Arc<dyn InfrastructureProvider>, descriptor: &str) -> Self {
        Self {
            provider,
            descriptor: descriptor.to_string(),
            build_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return `name`, building it from `source_dir` if no image carries it
    ///
    /// Concurrent calls for the same name through clones of one provisioner
    /// are serialized, so the build is requested once.
    pub async fn resolve(&self, name: &str, source_dir: &Path) -> Result<ImageRef> {
        let lock = self.build_lock(name);
        let _guard = lock.lock().await;

        if self.provider.image_exists(name).await? {
            tracing::debug!(image = name, "image cached");
            return Ok(ImageRef {
                name: name.to_string(),
                source_dir: source_dir.to_path_buf(),
                built: false,
            });
        }

        tracing::info!(image = name, source = %source_dir.display(), "building image");
        self.provider
            .build_image(name, source_dir, &self.descriptor)
            .await?;

        if !self.provider.image_exists(name).await? {
            return Err(TbError::BuildFailure {
                image: name.to_string(),
                reason: "build finished but the image is not present".to_string(),
            });
        }

        Ok(ImageRef {
            name: name.to_string(),
            source_dir: source_dir.to_path_buf(),
            built: true,
        })
    }

    /// Remove `name` from the image store; returns whether anything was removed
    pub async fn remove(&self, name: &str) -> Result<bool> {
        if !self.provider.image_exists(name).await? {
            return Ok(false);
        }

        match self.provider.remove_image(name).await {
            Ok(()) => {
                tracing::info!(image = name, "removed image");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn build_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.build_locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}
