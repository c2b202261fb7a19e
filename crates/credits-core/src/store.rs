//! Purchase Storage
//!
//! Durable client-side records of pending purchases, keyed by purchase id, plus
//! the saved "return to" path. Every status change is a read-modify-write
//! against the current stored value.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::model::{PendingPurchase, PurchaseId, PurchaseStatus};

/// Purchase storage trait for persistence
pub trait PurchaseStore: Send + Sync {
    /// Save or replace a purchase
    fn save(&self, purchase: &PendingPurchase) -> Result<()>;

    /// Load a purchase by id
    fn get(&self, id: &PurchaseId) -> Result<Option<PendingPurchase>>;

    /// All stored purchases, oldest first
    fn list(&self) -> Result<Vec<PendingPurchase>>;

    /// Atomically apply `f` to the stored purchase and return the new value
    fn modify(
        &self,
        id: &PurchaseId,
        f: &mut dyn FnMut(&mut PendingPurchase),
    ) -> Result<PendingPurchase>;

    /// Remember where to send the user after the callback
    fn save_return_path(&self, path: &str) -> Result<()>;

    /// Take the saved return path, clearing it
    fn take_return_path(&self) -> Result<Option<String>>;

    /// Purchases still eligible for reconciliation
    fn list_open(&self) -> Result<Vec<PendingPurchase>> {
        Ok(self.list()?.into_iter().filter(PendingPurchase::is_open).collect())
    }

    /// Purchase already settled by `order_id`, if any
    fn find_by_order_id(&self, order_id: &str) -> Result<Option<PendingPurchase>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|p| p.settled_order_id.as_deref() == Some(order_id)))
    }

    /// `initiated → confirming`. Other states are left alone.
    fn mark_confirming(&self, id: &PurchaseId) -> Result<PendingPurchase> {
        self.modify(id, &mut |p| {
            if p.status == PurchaseStatus::Initiated {
                p.status = PurchaseStatus::Confirming;
                p.updated_at = Some(Utc::now());
            }
        })
    }

    /// Mark settled by `order_id`. Repeating the same call is a no-op.
    ///
    /// Checked and written under the store lock: fails if the purchase is
    /// terminal with another order, or if `order_id` already settled a
    /// different purchase.
    fn mark_settled(&self, id: &PurchaseId, order_id: &str) -> Result<PendingPurchase>;

    /// Mark abandoned unless already settled
    fn mark_abandoned(&self, id: &PurchaseId) -> Result<PendingPurchase> {
        self.modify(id, &mut |p| {
            if !p.status.is_terminal() {
                p.status = PurchaseStatus::Abandoned;
                p.updated_at = Some(Utc::now());
            }
        })
    }
}

#[derive(Default, Serialize, Deserialize)]
struct StoreSnapshot {
    #[serde(default)]
    purchases: BTreeMap<PurchaseId, PendingPurchase>,
    #[serde(default)]
    return_path: Option<String>,
}

impl StoreSnapshot {
    fn list(&self) -> Vec<PendingPurchase> {
        let mut purchases: Vec<_> = self.purchases.values().cloned().collect();
        purchases.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        purchases
    }

    fn modify(
        &mut self,
        id: &PurchaseId,
        f: &mut dyn FnMut(&mut PendingPurchase),
    ) -> Result<PendingPurchase> {
        let purchase = self
            .purchases
            .get_mut(id)
            .ok_or_else(|| ReconcileError::PurchaseNotFound(id.to_string()))?;
        f(purchase);
        Ok(purchase.clone())
    }

    fn settle(&mut self, id: &PurchaseId, order_id: &str) -> Result<PendingPurchase> {
        if let Some(other) = self.purchases.values().find(|p| {
            p.purchase_id != *id && p.settled_order_id.as_deref() == Some(order_id)
        }) {
            return Err(ReconcileError::Storage(format!(
                "order {order_id} already settled purchase {}",
                other.purchase_id
            )));
        }

        let updated = self.modify(id, &mut |p| {
            if !p.status.is_terminal() {
                p.status = PurchaseStatus::Settled;
                p.settled_order_id = Some(order_id.to_string());
                p.updated_at = Some(Utc::now());
            }
        })?;

        match updated.settled_order_id.as_deref() {
            Some(settled) if settled == order_id => Ok(updated),
            _ => Err(ReconcileError::Storage(format!(
                "purchase {id} is {} and cannot settle with order {order_id}",
                updated.status.as_str()
            ))),
        }
    }
}

/// In-memory purchase store (for development/testing)
#[derive(Default)]
pub struct MemoryPurchaseStore {
    inner: Mutex<StoreSnapshot>,
}

impl MemoryPurchaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PurchaseStore for MemoryPurchaseStore {
    fn save(&self, purchase: &PendingPurchase) -> Result<()> {
        self.lock()
            .purchases
            .insert(purchase.purchase_id.clone(), purchase.clone());
        Ok(())
    }

    fn get(&self, id: &PurchaseId) -> Result<Option<PendingPurchase>> {
        Ok(self.lock().purchases.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<PendingPurchase>> {
        Ok(self.lock().list())
    }

    fn modify(
        &self,
        id: &PurchaseId,
        f: &mut dyn FnMut(&mut PendingPurchase),
    ) -> Result<PendingPurchase> {
        self.lock().modify(id, f)
    }

    fn mark_settled(&self, id: &PurchaseId, order_id: &str) -> Result<PendingPurchase> {
        self.lock().settle(id, order_id)
    }

    fn save_return_path(&self, path: &str) -> Result<()> {
        self.lock().return_path = Some(path.to_string());
        Ok(())
    }

    fn take_return_path(&self) -> Result<Option<String>> {
        Ok(self.lock().return_path.take())
    }
}

/// JSON file purchase store
///
/// The whole snapshot is rewritten on every mutation through a temp file and
/// rename, under one process-wide lock.
pub struct JsonFilePurchaseStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFilePurchaseStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<StoreSnapshot> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(StoreSnapshot::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreSnapshot::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update<T>(&self, f: impl FnOnce(&mut StoreSnapshot) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot = self.read()?;
        let out = f(&mut snapshot)?;
        self.write(&snapshot)?;
        Ok(out)
    }
}

impl PurchaseStore for JsonFilePurchaseStore {
    fn save(&self, purchase: &PendingPurchase) -> Result<()> {
        self.update(|s| {
            s.purchases
                .insert(purchase.purchase_id.clone(), purchase.clone());
            Ok(())
        })
    }

    fn get(&self, id: &PurchaseId) -> Result<Option<PendingPurchase>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.purchases.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<PendingPurchase>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.list())
    }

    fn modify(
        &self,
        id: &PurchaseId,
        f: &mut dyn FnMut(&mut PendingPurchase),
    ) -> Result<PendingPurchase> {
        self.update(|s| s.modify(id, f))
    }

    fn mark_settled(&self, id: &PurchaseId, order_id: &str) -> Result<PendingPurchase> {
        self.update(|s| s.settle(id, order_id))
    }

    fn save_return_path(&self, path: &str) -> Result<()> {
        self.update(|s| {
            s.return_path = Some(path.to_string());
            Ok(())
        })
    }

    fn take_return_path(&self) -> Result<Option<String>> {
        self.update(|s| Ok(s.return_path.take()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("credits-core-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn test_settle_is_idempotent() {
        let store = MemoryPurchaseStore::new();
        let purchase = PendingPurchase::new("basic", 10, "a@example.com");
        let id = purchase.purchase_id.clone();
        store.save(&purchase).unwrap();

        store.mark_confirming(&id).unwrap();
        let first = store.mark_settled(&id, "order-1").unwrap();
        let second = store.mark_settled(&id, "order-1").unwrap();
        assert_eq!(first.status, PurchaseStatus::Settled);
        assert_eq!(second.settled_order_id.as_deref(), Some("order-1"));
        assert!(store.mark_settled(&id, "order-2").is_err());
    }

    #[test]
    fn test_order_settles_one_purchase() {
        let store = MemoryPurchaseStore::new();
        let first = PendingPurchase::new("basic", 10, "a@example.com");
        let second = PendingPurchase::new("basic", 10, "a@example.com");
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        store.mark_settled(&first.purchase_id, "order-1").unwrap();
        let result = store.mark_settled(&second.purchase_id, "order-1");

        assert!(matches!(result, Err(ReconcileError::Storage(_))));
        let stored = store.get(&second.purchase_id).unwrap().unwrap();
        assert_eq!(stored.status, PurchaseStatus::Initiated);
        assert!(stored.settled_order_id.is_none());
    }

    #[test]
    fn test_file_store_refuses_second_settlement_for_order() {
        let path = temp_store_path("purchases.json");
        let store = JsonFilePurchaseStore::open(&path).unwrap();
        let first = PendingPurchase::new("basic", 10, "a@example.com");
        let second = PendingPurchase::new("basic", 10, "a@example.com");
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        store.mark_settled(&first.purchase_id, "order-1").unwrap();
        assert!(store.mark_settled(&second.purchase_id, "order-1").is_err());
        assert_eq!(
            store.find_by_order_id("order-1").unwrap().unwrap().purchase_id,
            first.purchase_id
        );

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_settled_purchase_is_never_abandoned() {
        let store = MemoryPurchaseStore::new();
        let purchase = PendingPurchase::new("basic", 10, "a@example.com");
        let id = purchase.purchase_id.clone();
        store.save(&purchase).unwrap();
        store.mark_settled(&id, "order-1").unwrap();

        let after = store.mark_abandoned(&id).unwrap();
        assert_eq!(after.status, PurchaseStatus::Settled);
        assert!(store.list_open().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_purchase() {
        let store = MemoryPurchaseStore::new();
        let result = store.mark_confirming(&PurchaseId::from_string("nope"));
        assert!(matches!(result, Err(ReconcileError::PurchaseNotFound(_))));
    }

    #[test]
    fn test_return_path_consumed_once() {
        let store = MemoryPurchaseStore::new();
        store.save_return_path("/pricing").unwrap();
        assert_eq!(store.take_return_path().unwrap().as_deref(), Some("/pricing"));
        assert!(store.take_return_path().unwrap().is_none());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let path = temp_store_path("purchases.json");
        let purchase = PendingPurchase::new("pro", 50, "a@example.com");
        let id = purchase.purchase_id.clone();

        {
            let store = JsonFilePurchaseStore::open(&path).unwrap();
            store.save(&purchase).unwrap();
            store.mark_confirming(&id).unwrap();
            store.save_return_path("/dashboard").unwrap();
        }

        let store = JsonFilePurchaseStore::open(&path).unwrap();
        let loaded = store.get(&id).unwrap().unwrap();
        assert_eq!(loaded.status, PurchaseStatus::Confirming);
        assert_eq!(loaded.expected_credits, 50);
        assert_eq!(store.take_return_path().unwrap().as_deref(), Some("/dashboard"));
        assert!(store.take_return_path().unwrap().is_none());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
