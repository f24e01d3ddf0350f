use crate::error::Result;
use crate::types::{Delivery, NodeState};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

const MAX_DELIVERIES_PER_NODE: usize = 50;

/// Durable per-node key-value storage for trigger state.
pub trait NodeStateStore: Send + Sync {
    fn get(&self, node_id: &str) -> Option<NodeState>;
    fn set(&self, node_id: &str, state: NodeState) -> Result<()>;
    fn delete(&self, node_id: &str) -> Result<()>;
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, NodeState>,
    deliveries: HashMap<String, VecDeque<Delivery>>,
}

/// JSON-file backed store rooted at the extension's data directory.
pub struct FileStore {
    inner: Mutex<Inner>,
    data_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            data_dir,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn load(&self) -> Result<()> {
        let mut inner = self.lock();

        let nodes_path = self.data_dir.join("node_state.json");
        if nodes_path.exists() {
            let content = std::fs::read_to_string(&nodes_path)?;
            inner.nodes = serde_json::from_str(&content)?;
        }

        let deliveries_dir = self.data_dir.join("deliveries");
        if deliveries_dir.exists() {
            let ids: Vec<String> = inner.nodes.keys().cloned().collect();
            for id in ids {
                let path = deliveries_dir.join(format!("{id}.json"));
                let Ok(content) = std::fs::read_to_string(&path) else {
                    continue;
                };
                match serde_json::from_str::<Vec<Delivery>>(&content) {
                    Ok(items) => {
                        inner.deliveries.insert(id, VecDeque::from(items));
                    }
                    Err(e) => tracing::warn!(node_id = %id, error = %e, "skipping unreadable delivery log"),
                }
            }
        }

        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let inner = self.lock();
        self.write_nodes(&inner)
    }

    fn write_nodes(&self, inner: &Inner) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let content = serde_json::to_string_pretty(&inner.nodes)?;
        std::fs::write(self.data_dir.join("node_state.json"), content)?;
        Ok(())
    }

    /// Node ids that currently hold a registered subscription.
    pub fn active_nodes(&self) -> Vec<String> {
        let inner = self.lock();
        let mut ids: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, s)| s.webhook_id.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn record_delivery(&self, delivery: Delivery) -> Result<()> {
        let mut inner = self.lock();
        let id = delivery.node_id.clone();
        let queue = inner.deliveries.entry(id.clone()).or_default();
        if queue.len() >= MAX_DELIVERIES_PER_NODE {
            queue.pop_front();
        }
        queue.push_back(delivery);

        let dir = self.data_dir.join("deliveries");
        std::fs::create_dir_all(&dir)?;
        let items: Vec<&Delivery> = queue.iter().collect();
        let content = serde_json::to_string_pretty(&items)?;
        std::fs::write(dir.join(format!("{id}.json")), content)?;
        Ok(())
    }

    /// Most recent first.
    pub fn deliveries(&self, node_id: &str) -> Vec<Delivery> {
        self.lock()
            .deliveries
            .get(node_id)
            .map(|q| q.iter().rev().cloned().collect())
            .unwrap_or_default()
    }
}

impl NodeStateStore for FileStore {
    fn get(&self, node_id: &str) -> Option<NodeState> {
        self.lock().nodes.get(node_id).cloned()
    }

    fn set(&self, node_id: &str, state: NodeState) -> Result<()> {
        let mut inner = self.lock();
        inner.nodes.insert(node_id.to_string(), state);
        self.write_nodes(&inner)
    }

    fn delete(&self, node_id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.nodes.remove(node_id);
        self.write_nodes(&inner)
    }
}

/// Volatile store used where nothing needs to outlive the process.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    nodes: Mutex<HashMap<String, NodeState>>,
}

#[cfg(test)]
impl NodeStateStore for MemoryStore {
    fn get(&self, node_id: &str) -> Option<NodeState> {
        self.nodes.lock().unwrap().get(node_id).cloned()
    }

    fn set(&self, node_id: &str, state: NodeState) -> Result<()> {
        self.nodes.lock().unwrap().insert(node_id.to_string(), state);
        Ok(())
    }

    fn delete(&self, node_id: &str) -> Result<()> {
        self.nodes.lock().unwrap().remove(node_id);
        Ok(())
    }
}
