use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::provider::{key_for, KvError, KvNode, KvProvider};

/// In-process key-value provider.
///
/// Every operation runs under a single mutex, which makes the store trivially
///  linearizable. Used for single-node deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<MemoryKvInner>>,
}

#[derive(Debug, Default)]
struct MemoryKvInner {
    nodes: BTreeMap<String, KvNode>,
    /// prefix -> (name -> id)
    index: HashMap<String, HashMap<String, String>>,
    revision: u64,
}

impl MemoryKvInner {
    fn write(&mut self, key: String, value: String) -> KvNode {
        self.revision += 1;
        let node = KvNode {
            key: key.clone(),
            value,
            modified_index: self.revision,
        };
        self.nodes.insert(key, node.clone());
        node
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvProvider for MemoryKv {
    type Error = Infallible;

    async fn get_by_id(&self, prefix: &str, id: &str) -> Result<KvNode, KvError<Self::Error>> {
        let key = key_for(prefix, id);
        self.inner
            .lock()
            .nodes
            .get(&key)
            .cloned()
            .ok_or(KvError::NotFound(key))
    }

    async fn set(
        &self,
        prefix: &str,
        id: &str,
        value: String,
    ) -> Result<KvNode, KvError<Self::Error>> {
        Ok(self.inner.lock().write(key_for(prefix, id), value))
    }

    async fn create(
        &self,
        prefix: &str,
        id: &str,
        value: String,
    ) -> Result<KvNode, KvError<Self::Error>> {
        let key = key_for(prefix, id);
        let mut inner = self.inner.lock();
        if inner.nodes.contains_key(&key) {
            return Err(KvError::AlreadyExists(key));
        }
        Ok(inner.write(key, value))
    }

    async fn compare_and_swap(
        &self,
        prefix: &str,
        id: &str,
        expected: &str,
        value: String,
    ) -> Result<KvNode, KvError<Self::Error>> {
        let key = key_for(prefix, id);
        let mut inner = self.inner.lock();
        match inner.nodes.get(&key) {
            None => Err(KvError::NotFound(key)),
            Some(node) if node.value != expected => Err(KvError::Conflict(key)),
            Some(_) => Ok(inner.write(key, value)),
        }
    }

    async fn delete(&self, prefix: &str, id: &str) -> Result<(), KvError<Self::Error>> {
        let key = key_for(prefix, id);
        let mut inner = self.inner.lock();
        match inner.nodes.remove(&key) {
            Some(_) => {
                inner.revision += 1;
                Ok(())
            }
            None => Err(KvError::NotFound(key)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvNode>, KvError<Self::Error>> {
        let start = key_for(prefix, "");
        let inner = self.inner.lock();
        Ok(inner
            .nodes
            .range(start.clone()..)
            .take_while(|(key, _)| key.starts_with(&start))
            // direct children only
            .filter(|(key, _)| !key[start.len()..].contains('/'))
            .map(|(_, node)| node.clone())
            .collect())
    }

    async fn add_to_index(
        &self,
        prefix: &str,
        name: &str,
        id: &str,
    ) -> Result<(), KvError<Self::Error>> {
        self.inner
            .lock()
            .index
            .entry(prefix.to_string())
            .or_default()
            .insert(name.to_string(), id.to_string());
        Ok(())
    }

    async fn delete_from_index(
        &self,
        prefix: &str,
        name: &str,
    ) -> Result<(), KvError<Self::Error>> {
        let mut inner = self.inner.lock();
        inner
            .index
            .get_mut(prefix)
            .and_then(|names| names.remove(name))
            .map(|_| ())
            .ok_or_else(|| KvError::NotFound(key_for(prefix, name)))
    }

    async fn find_id(&self, prefix: &str, name: &str) -> Result<String, KvError<Self::Error>> {
        self.inner
            .lock()
            .index
            .get(prefix)
            .and_then(|names| names.get(name))
            .cloned()
            .ok_or_else(|| KvError::NotFound(key_for(prefix, name)))
    }
}
