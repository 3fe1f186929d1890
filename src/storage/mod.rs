//! Persistence of the global model.
//!
//! The coordinator persists the global model of every completed round before broadcasting it.
//! [`FsModelStorage`] writes one snapshot file per round, [`MemoryModelStorage`] keeps the
//! snapshots in memory.

mod fs;
mod memory;

pub use self::{fs::FsModelStorage, memory::MemoryModelStorage};

use async_trait::async_trait;

use crate::model::Model;

/// The error type for storage operations. These are not related to the application domain, for
/// example I/O errors like a full disk or a missing file.
pub type StorageError = anyhow::Error;

/// The result of a storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
/// An abstract global model storage.
pub trait ModelStorage
where
    Self: Send + Sync + 'static,
{
    /// Persists the global model computed in `round` of the run `run_id` and returns its id.
    ///
    /// # Behavior
    ///
    /// When `StorageResult::Ok` is returned the model is durable: it survives a crash of the
    /// process.
    async fn set_global_model(
        &mut self,
        run_id: &str,
        round: u64,
        global_model: &Model,
    ) -> StorageResult<String>;

    /// Returns a global model.
    ///
    /// # Behavior
    ///
    /// - If the global model does not exist, return `StorageResult::Ok(Option::None)`.
    /// - If the global model exists, return `StorageResult::Ok(Option::Some(Model))`.
    async fn global_model(&mut self, id: &str) -> StorageResult<Option<Model>>;

    /// Creates a unique global model id from the run id and the round in which the global model
    /// was computed.
    ///
    /// The format of the default implementation is `weights_<run_id>_v<round>`.
    fn create_global_model_id(run_id: &str, round: u64) -> String
    where
        Self: Sized,
    {
        format!("weights_{}_v{}", run_id, round)
    }
}
