use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use delve_core::error::Result;
use delve_core::traits::StateStore;

/// Process-local store. State is lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn save(&self, id: &str, data: serde_json::Value) -> BoxFuture<'_, Result<()>> {
        let id = id.to_string();
        Box::pin(async move {
            self.entries.write().await.insert(id, data);
            Ok(())
        })
    }

    fn load(&self, id: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.entries.read().await.get(&id).cloned()) })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.entries.write().await.remove(&id).is_some()) })
    }

    fn exists(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.entries.read().await.contains_key(&id)) })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
            ids.sort();
            Ok(ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = MemoryStore::new();
        assert!(store.load("r1").await.unwrap().is_none());
        assert!(!store.exists("r1").await.unwrap());

        store.save("r1", json!({"status": "running"})).await.unwrap();
        assert!(store.exists("r1").await.unwrap());
        assert_eq!(
            store.load("r1").await.unwrap(),
            Some(json!({"status": "running"}))
        );

        store.save("r1", json!({"status": "completed"})).await.unwrap();
        assert_eq!(
            store.load("r1").await.unwrap().unwrap()["status"],
            "completed"
        );

        assert!(store.delete("r1").await.unwrap());
        assert!(!store.delete("r1").await.unwrap());
        assert!(store.load("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let store = MemoryStore::new();
        store.save("b", json!(1)).await.unwrap();
        store.save("a", json!(2)).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
    }
}
