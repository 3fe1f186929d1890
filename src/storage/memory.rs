use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    model::Model,
    storage::{ModelStorage, StorageResult},
};

/// Keeps the global models in memory. Clones share the same models.
#[derive(Debug, Clone, Default)]
pub struct MemoryModelStorage {
    models: Arc<Mutex<HashMap<String, Model>>>,
}

impl MemoryModelStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The ids of the stored models, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.models.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ModelStorage for MemoryModelStorage {
    async fn set_global_model(
        &mut self,
        run_id: &str,
        round: u64,
        global_model: &Model,
    ) -> StorageResult<String> {
        let id = Self::create_global_model_id(run_id, round);
        self.models
            .lock()
            .await
            .insert(id.clone(), global_model.clone());
        Ok(id)
    }

    async fn global_model(&mut self, id: &str) -> StorageResult<Option<Model>> {
        Ok(self.models.lock().await.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_models() {
        let storage = MemoryModelStorage::new();
        let mut writer = storage.clone();
        writer
            .set_global_model("run", 2, &Model::from(vec![4.]))
            .await
            .unwrap();
        writer
            .set_global_model("run", 1, &Model::from(vec![2.]))
            .await
            .unwrap();

        assert_eq!(storage.ids().await, vec!["weights_run_v1", "weights_run_v2"]);
        let mut reader = storage;
        assert_eq!(
            reader.global_model("weights_run_v2").await.unwrap(),
            Some(Model::from(vec![4.]))
        );
        assert_eq!(reader.global_model("weights_run_v3").await.unwrap(), None);
    }
}
