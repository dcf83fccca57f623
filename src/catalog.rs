//! Shared catalog of entities that the UI reads.
//!
//! The write contract is `upsert_entity`, `remove_entity` and `set_active`.
//! Every effective write is broadcast as a [`CatalogChange`]; readers only
//! ever receive clones.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::catalog::CatalogEntity;

const CHANGE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CatalogChange {
    Upserted { entity: CatalogEntity },
    Removed { entity: CatalogEntity },
    ActiveChanged { id: String, active: bool },
}

pub struct CatalogRegistry {
    items: RwLock<BTreeMap<String, CatalogEntity>>,
    changes: broadcast::Sender<CatalogChange>,
}

impl Default for CatalogRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            items: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Inserts or replaces the entity with the same uid. Writing an identical
    /// entity is a no-op and returns `false`.
    pub fn upsert_entity(&self, entity: CatalogEntity) -> bool {
        {
            let mut items = self.items.write();
            if items.get(entity.id()) == Some(&entity) {
                return false;
            }
            items.insert(entity.id().to_string(), entity.clone());
        }
        let _ = self.changes.send(CatalogChange::Upserted { entity });
        true
    }

    pub fn remove_entity(&self, id: &str) -> Option<CatalogEntity> {
        let removed = self.items.write().remove(id)?;
        let _ = self.changes.send(CatalogChange::Removed {
            entity: removed.clone(),
        });
        Some(removed)
    }

    /// Sets the `active` flag of one entity. Returns `false` if the entity is
    /// unknown or already had that value.
    pub fn set_active(&self, id: &str, active: bool) -> bool {
        {
            let mut items = self.items.write();
            let Some(entity) = items.get_mut(id) else {
                return false;
            };
            if entity.status.active == active {
                return false;
            }
            entity.status.active = active;
        }
        let _ = self.changes.send(CatalogChange::ActiveChanged {
            id: id.to_string(),
            active,
        });
        true
    }

    pub fn get(&self, id: &str) -> Option<CatalogEntity> {
        self.items.read().get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<CatalogEntity> {
        self.items.read().values().cloned().collect()
    }

    pub fn kubernetes_clusters(&self) -> Vec<CatalogEntity> {
        self.items
            .read()
            .values()
            .filter(|e| e.is_kubernetes_cluster())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CatalogChange> {
        self.changes.subscribe()
    }
}
