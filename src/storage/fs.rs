use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    model::Model,
    storage::{ModelStorage, StorageResult},
};

const EXTENSION: &str = "bin";

/// Stores every global model in its own file, `<dir>/<id>.bin`, encoded with `bincode`.
#[derive(Debug, Clone)]
pub struct FsModelStorage {
    dir: PathBuf,
}

impl FsModelStorage {
    /// Creates a storage writing into `dir`. The directory is created if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// The path of the file holding the model `id`.
    pub fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, EXTENSION))
    }

    /// Reads a model file written by this storage.
    pub async fn read_model(path: impl AsRef<Path>) -> StorageResult<Model> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        bincode::deserialize(&bytes)
            .with_context(|| format!("{} is not a valid model file", path.display()))
    }

    /// Writes `bytes` to `path` through a temporary file, so that `path` either holds the previous
    /// content or all of `bytes`.
    async fn write_durably(&self, path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)
            .await
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to move {} to {}", tmp.display(), path.display()))?;
        sync_dir(&self.dir).await
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> StorageResult<()> {
    fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> StorageResult<()> {
    Ok(())
}

#[async_trait]
impl ModelStorage for FsModelStorage {
    async fn set_global_model(
        &mut self,
        run_id: &str,
        round: u64,
        global_model: &Model,
    ) -> StorageResult<String> {
        let id = Self::create_global_model_id(run_id, round);
        let path = self.path(&id);
        let bytes = bincode::serialize(global_model)?;
        self.write_durably(&path, &bytes).await?;
        debug!("global model {} written to {}", id, path.display());
        Ok(id)
    }

    async fn global_model(&mut self, id: &str) -> StorageResult<Option<Model>> {
        let path = self.path(id);
        match fs::metadata(&path).await {
            Ok(_) => Self::read_model(&path).await.map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
