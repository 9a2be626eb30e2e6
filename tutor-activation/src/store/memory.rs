//! In-process entitlement store
//!
//! Enforces the same uniqueness rule as the SQLite store under a single lock.
//! Outages can be simulated, which is how the retry and recovery paths are
//! exercised without a real database going down.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::EntitlementStore;
use crate::error::StoreError;
use crate::models::EntitlementRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outage {
    None,
    /// Fail this many upcoming calls, then recover
    Calls(u32),
    Permanent,
}

#[derive(Debug)]
struct Inner {
    records: HashMap<String, EntitlementRecord>,
    outage: Outage,
    calls: u64,
}

#[derive(Debug)]
pub struct MemoryEntitlementStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryEntitlementStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEntitlementStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                outage: Outage::None,
                calls: 0,
            }),
        }
    }

    /// Make the next `calls` store calls fail with `Unavailable`
    pub fn fail_next_calls(&self, calls: u32) {
        self.lock().outage = if calls == 0 {
            Outage::None
        } else {
            Outage::Calls(calls)
        };
    }

    /// Switch a permanent outage on or off
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().outage = if unavailable {
            Outage::Permanent
        } else {
            Outage::None
        };
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total store calls seen, including failed ones
    pub fn call_count(&self) -> u64 {
        self.lock().calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-call; the map is still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn check_available(&mut self) -> Result<(), StoreError> {
        self.calls += 1;
        match self.outage {
            Outage::None => Ok(()),
            Outage::Permanent => Err(StoreError::Unavailable("simulated outage".to_string())),
            Outage::Calls(remaining) => {
                self.outage = if remaining <= 1 {
                    Outage::None
                } else {
                    Outage::Calls(remaining - 1)
                };
                Err(StoreError::Unavailable("simulated outage".to_string()))
            }
        }
    }
}

#[async_trait]
impl EntitlementStore for MemoryEntitlementStore {
    async fn find_by_external_ref(
        &self,
        reference: &str,
    ) -> Result<Option<EntitlementRecord>, StoreError> {
        let mut inner = self.lock();
        inner.check_available()?;
        Ok(inner.records.get(reference).cloned())
    }

    async fn create(&self, record: &EntitlementRecord) -> Result<EntitlementRecord, StoreError> {
        let mut inner = self.lock();
        inner.check_available()?;

        let reference = record.external_payment_reference.clone();
        if inner.records.contains_key(&reference) {
            return Err(StoreError::Duplicate { reference });
        }
        inner.records.insert(reference, record.clone());
        Ok(record.clone())
    }
}
