//! Generic repository trait and its in-memory implementation

use async_trait::async_trait;
use chrono::Utc;
use gpufleet_core::{FleetError, FleetResult, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::record::Record;

/// Page selector, 1-based; `page_size == 0` returns everything
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Page number starting at 1
    #[serde(default = "first_page")]
    pub page: u64,
    /// Items per page
    #[serde(default)]
    pub page_size: u64,
}

fn first_page() -> u64 {
    1
}

impl Page {
    /// No pagination
    pub fn all() -> Self {
        Self {
            page: 1,
            page_size: 0,
        }
    }

    /// A specific page
    pub fn new(page: u64, page_size: u64) -> Self {
        Self { page, page_size }
    }

    fn bounds(&self, total: usize) -> (usize, usize) {
        if self.page_size == 0 {
            return (0, total);
        }
        let size = self.page_size as usize;
        let start = (self.page.max(1) as usize - 1).saturating_mul(size).min(total);
        (start, start.saturating_add(size).min(total))
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::all()
    }
}

/// One page of results with the unpaged total
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paged<T> {
    /// Records on this page
    pub items: Vec<T>,
    /// Matching records across all pages
    pub total: u64,
}

/// Persistence operations for one record kind
#[async_trait]
pub trait Repository<T: Record>: Send + Sync {
    /// Find a live record by id
    async fn find(&self, id: RecordId) -> FleetResult<Option<T>>;

    /// Find live records matching a filter, ordered by id
    async fn find_many(&self, filter: &T::Filter, page: Page) -> FleetResult<Paged<T>>;

    /// Insert a record; id 0 is replaced with a fresh id
    async fn create(&self, record: T) -> FleetResult<T>;

    /// Overwrite a live record
    async fn replace(&self, record: T) -> FleetResult<T>;

    /// Apply a field patch to a live record
    async fn update(&self, id: RecordId, patch: T::Patch) -> FleetResult<T>;

    /// Soft-delete records, returning how many were live
    async fn delete(&self, ids: &[RecordId]) -> FleetResult<usize>;

    /// Find a live record or fail with NotFound
    async fn get(&self, id: RecordId) -> FleetResult<T> {
        self.find(id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("{} {}", T::KIND, id)))
    }

    /// All live records matching a filter
    async fn list(&self, filter: &T::Filter) -> FleetResult<Vec<T>> {
        Ok(self.find_many(filter, Page::all()).await?.items)
    }
}

/// Repository held in process memory
pub struct MemoryRepository<T> {
    records: RwLock<BTreeMap<RecordId, T>>,
    next_id: AtomicU64,
}

impl<T: Record> MemoryRepository<T> {
    /// Create an empty repository
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn assign_id(&self, record: &mut T) {
        if record.id() == 0 {
            record.set_id(self.next_id.fetch_add(1, Ordering::SeqCst));
        } else {
            self.next_id.fetch_max(record.id() + 1, Ordering::SeqCst);
        }
    }
}

impl<T: Record> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Record> Repository<T> for MemoryRepository<T> {
    async fn find(&self, id: RecordId) -> FleetResult<Option<T>> {
        let records = self.records.read().await;
        Ok(records.get(&id).filter(|r| !r.is_deleted()).cloned())
    }

    async fn find_many(&self, filter: &T::Filter, page: Page) -> FleetResult<Paged<T>> {
        let records = self.records.read().await;
        let matching: Vec<&T> = records
            .values()
            .filter(|r| !r.is_deleted() && r.matches(filter))
            .collect();
        let total = matching.len();
        let (start, end) = page.bounds(total);
        Ok(Paged {
            items: matching[start..end].iter().map(|r| (*r).clone()).collect(),
            total: total as u64,
        })
    }

    async fn create(&self, mut record: T) -> FleetResult<T> {
        self.assign_id(&mut record);
        record.stamp_created(Utc::now());

        let mut records = self.records.write().await;
        if records.contains_key(&record.id()) {
            return Err(FleetError::Storage(format!(
                "{} {} already exists",
                T::KIND,
                record.id()
            )));
        }
        records.insert(record.id(), record.clone());
        debug!(kind = T::KIND, id = record.id(), "Created record");
        Ok(record)
    }

    async fn replace(&self, mut record: T) -> FleetResult<T> {
        let mut records = self.records.write().await;
        match records.get(&record.id()) {
            Some(existing) if !existing.is_deleted() => {}
            _ => {
                return Err(FleetError::NotFound(format!(
                    "{} {}",
                    T::KIND,
                    record.id()
                )))
            }
        }
        record.touch(Utc::now());
        records.insert(record.id(), record.clone());
        Ok(record)
    }

    async fn update(&self, id: RecordId, patch: T::Patch) -> FleetResult<T> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .filter(|r| !r.is_deleted())
            .ok_or_else(|| FleetError::NotFound(format!("{} {}", T::KIND, id)))?;
        record.apply(patch);
        record.touch(Utc::now());
        Ok(record.clone())
    }

    async fn delete(&self, ids: &[RecordId]) -> FleetResult<usize> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let mut deleted = 0;
        for id in ids {
            if let Some(record) = records.get_mut(id).filter(|r| !r.is_deleted()) {
                record.mark_deleted(now);
                deleted += 1;
            }
        }
        debug!(kind = T::KIND, count = deleted, "Soft-deleted records");
        Ok(deleted)
    }
}
