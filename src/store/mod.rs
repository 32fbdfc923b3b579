// src/store/mod.rs
pub mod memory;
pub mod postgres;
pub mod run_ledger;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;

use crate::models::stats_models::DuplicateGroup;
use crate::models::{BusinessKey, GradeRecord, PredictionRecord};

pub use memory::MemoryRecordStore;
pub use postgres::{ensure_schema, PgRecordStore};
pub use run_ledger::{MemoryRunLedger, PgRunLedger, PipelineRun, RunLedger};

/// How a consolidation lands in the canonical store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Insert or replace per business key; other keys for the date are untouched.
    Merge,
    /// Delete everything for the date, then insert, in one transaction.
    ReplaceScope,
}

/// A record that can go through staging and consolidation.
pub trait StoredRecord: Clone + Send + Sync + 'static {
    fn business_key(&self) -> BusinessKey;
    fn context_date(&self) -> NaiveDate;
    fn written_at(&self) -> DateTime<Utc>;
}

impl StoredRecord for PredictionRecord {
    fn business_key(&self) -> BusinessKey {
        PredictionRecord::business_key(self)
    }

    fn context_date(&self) -> NaiveDate {
        self.context_date
    }

    fn written_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl StoredRecord for GradeRecord {
    fn business_key(&self) -> BusinessKey {
        GradeRecord::business_key(self)
    }

    fn context_date(&self) -> NaiveDate {
        self.context_date
    }

    fn written_at(&self) -> DateTime<Utc> {
        self.graded_at
    }
}

#[async_trait]
pub trait RecordStore<R: StoredRecord>: Send + Sync {
    /// Replaces whatever was staged under `batch_id`.
    async fn write_staged(&self, batch_id: &str, records: &[R]) -> Result<usize>;

    async fn load_staged(&self, batch_ids: &[String]) -> Result<Vec<R>>;

    async fn discard_staged(&self, batch_ids: &[String]) -> Result<()>;

    /// Single atomic write. `records` must already be unique by business key.
    async fn upsert_canonical(
        &self,
        context_date: NaiveDate,
        records: &[R],
        mode: WriteMode,
    ) -> Result<usize>;

    async fn find_duplicates(&self, context_date: NaiveDate) -> Result<Vec<DuplicateGroup>>;

    async fn load_canonical(&self, context_date: NaiveDate) -> Result<Vec<R>>;
}

/// One record per business key, the most recently written winning (later input on ties).
/// Output is ordered by key.
pub fn collapse_by_key<R: StoredRecord>(records: Vec<R>) -> Vec<R> {
    let mut latest: HashMap<BusinessKey, R> = HashMap::with_capacity(records.len());
    for record in records {
        let key = record.business_key();
        match latest.get(&key) {
            Some(existing) if existing.written_at() > record.written_at() => {}
            _ => {
                latest.insert(key, record);
            }
        }
    }
    let mut collapsed: Vec<(BusinessKey, R)> = latest.into_iter().collect();
    collapsed.sort_by(|a, b| a.0.cmp(&b.0));
    collapsed.into_iter().map(|(_, r)| r).collect()
}
