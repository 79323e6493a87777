//! Optimization item store
//!
//! Keeps exactly one record per `(session, id)`. A re-emitted item replaces
//! the earlier record in place, so display order stays the order in which
//! ids were first seen.

use crate::plugin::session::SessionId;
use crate::protocol::OptimizationItem;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub session: SessionId,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

/// An item together with the plugin that produced it
#[derive(Debug, Clone)]
pub struct StoredItem {
    pub plugin: String,
    pub session: SessionId,
    pub item: Arc<OptimizationItem>,
}

#[derive(Debug, Default)]
struct Items {
    order: Vec<ItemKey>,
    by_key: HashMap<ItemKey, StoredItem>,
}

#[derive(Debug, Default)]
pub struct OptimizationStore {
    inner: RwLock<Items>,
}

impl OptimizationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Items> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Items> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn upsert(&self, plugin: &str, session: SessionId, item: Arc<OptimizationItem>) -> Upsert {
        let key = ItemKey {
            session,
            id: item.id.clone(),
        };
        let stored = StoredItem {
            plugin: plugin.to_string(),
            session,
            item,
        };
        let mut items = self.write();
        match items.by_key.insert(key.clone(), stored) {
            Some(_) => Upsert::Replaced,
            None => {
                items.order.push(key);
                Upsert::Inserted
            }
        }
    }

    pub fn get(&self, session: SessionId, id: &str) -> Option<Arc<OptimizationItem>> {
        let key = ItemKey {
            session,
            id: id.to_string(),
        };
        self.read().by_key.get(&key).map(|s| s.item.clone())
    }

    /// Latest-session record for `id`, regardless of which session sent it
    pub fn find(&self, id: &str) -> Option<StoredItem> {
        self.read()
            .by_key
            .values()
            .filter(|s| s.item.id == id)
            .max_by_key(|s| s.session)
            .cloned()
    }

    /// Snapshot in first-seen order
    pub fn items(&self) -> Vec<StoredItem> {
        let items = self.read();
        items
            .order
            .iter()
            .filter_map(|key| items.by_key.get(key).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_savings(&self) -> f64 {
        self.read()
            .by_key
            .values()
            .filter(|s| !s.item.skipped)
            .map(|s| s.item.savings())
            .sum()
    }
}
