// src/store/memory.rs
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{RecordStore, StoredRecord, WriteMode};
use crate::models::stats_models::DuplicateGroup;
use crate::models::BusinessKey;

struct Inner<R> {
    staged: HashMap<String, Vec<R>>,
    canonical: Vec<R>,
}

/// In-memory staging area and canonical table. The canonical side is a plain
/// list, so it can represent duplicates if anything ever writes one.
pub struct MemoryRecordStore<R> {
    inner: Mutex<Inner<R>>,
}

impl<R: StoredRecord> Default for MemoryRecordStore<R> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                staged: HashMap::new(),
                canonical: Vec::new(),
            }),
        }
    }
}

impl<R: StoredRecord> MemoryRecordStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner<R>>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("record store mutex poisoned"))
    }

    pub fn canonical_len(&self) -> usize {
        self.lock().map(|inner| inner.canonical.len()).unwrap_or(0)
    }

    pub fn staged_batch_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .map(|inner| inner.staged.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Appends straight to the canonical list, bypassing the key index.
    #[cfg(test)]
    pub fn inject_canonical_unchecked(&self, record: R) {
        if let Ok(mut inner) = self.lock() {
            inner.canonical.push(record);
        }
    }
}

#[async_trait]
impl<R: StoredRecord> RecordStore<R> for MemoryRecordStore<R> {
    async fn write_staged(&self, batch_id: &str, records: &[R]) -> Result<usize> {
        let mut inner = self.lock()?;
        inner.staged.insert(batch_id.to_string(), records.to_vec());
        Ok(records.len())
    }

    async fn load_staged(&self, batch_ids: &[String]) -> Result<Vec<R>> {
        let inner = self.lock()?;
        Ok(batch_ids
            .iter()
            .filter_map(|id| inner.staged.get(id))
            .flat_map(|batch| batch.iter().cloned())
            .collect())
    }

    async fn discard_staged(&self, batch_ids: &[String]) -> Result<()> {
        let mut inner = self.lock()?;
        for id in batch_ids {
            inner.staged.remove(id);
        }
        Ok(())
    }

    async fn upsert_canonical(
        &self,
        context_date: NaiveDate,
        records: &[R],
        mode: WriteMode,
    ) -> Result<usize> {
        let mut inner = self.lock()?;
        if mode == WriteMode::ReplaceScope {
            inner.canonical.retain(|r| r.context_date() != context_date);
        }
        for record in records {
            let key = record.business_key();
            let existing = inner
                .canonical
                .iter()
                .position(|r| r.context_date() == context_date && r.business_key() == key);
            match existing {
                Some(idx) => inner.canonical[idx] = record.clone(),
                None => inner.canonical.push(record.clone()),
            }
        }
        Ok(records.len())
    }

    async fn find_duplicates(&self, context_date: NaiveDate) -> Result<Vec<DuplicateGroup>> {
        let inner = self.lock()?;
        let mut groups: BTreeMap<BusinessKey, Vec<_>> = BTreeMap::new();
        for record in inner.canonical.iter().filter(|r| r.context_date() == context_date) {
            groups
                .entry(record.business_key())
                .or_default()
                .push(record.written_at());
        }
        Ok(groups
            .into_iter()
            .filter(|(_, written)| written.len() > 1)
            .map(|(key, mut written_at)| {
                written_at.sort();
                DuplicateGroup {
                    key,
                    count: written_at.len(),
                    written_at,
                }
            })
            .collect())
    }

    async fn load_canonical(&self, context_date: NaiveDate) -> Result<Vec<R>> {
        let inner = self.lock()?;
        Ok(inner
            .canonical
            .iter()
            .filter(|r| r.context_date() == context_date)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PredictionRecord;
    use crate::test_support::{prediction, test_date};

    #[tokio::test]
    async fn test_restaging_a_batch_replaces_it() {
        let store = MemoryRecordStore::<PredictionRecord>::new();
        store
            .write_staged("b1", &[prediction("p1", "m", 20.5, 21.0), prediction("p2", "m", 20.5, 21.0)])
            .await
            .unwrap();
        store.write_staged("b1", &[prediction("p1", "m", 20.5, 22.0)]).await.unwrap();

        let staged = store.load_staged(&["b1".to_string()]).await.unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].predicted_value, 22.0);
    }

    #[tokio::test]
    async fn test_replace_scope_drops_keys_missing_from_new_set() {
        let store = MemoryRecordStore::<PredictionRecord>::new();
        let date = test_date();
        store
            .upsert_canonical(
                date,
                &[prediction("p1", "m", 20.5, 21.0), prediction("p2", "m", 20.5, 21.0)],
                WriteMode::Merge,
            )
            .await
            .unwrap();
        store
            .upsert_canonical(date, &[prediction("p1", "m", 20.5, 19.0)], WriteMode::ReplaceScope)
            .await
            .unwrap();

        let canonical = store.load_canonical(date).await.unwrap();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].predicted_value, 19.0);
    }

    #[tokio::test]
    async fn test_find_duplicates_reports_injected_copies() {
        let store = MemoryRecordStore::<PredictionRecord>::new();
        let date = test_date();
        let record = prediction("p1", "m", 20.5, 21.0);
        store.upsert_canonical(date, &[record.clone()], WriteMode::Merge).await.unwrap();
        assert!(store.find_duplicates(date).await.unwrap().is_empty());

        store.inject_canonical_unchecked(record.clone());
        let dups = store.find_duplicates(date).await.unwrap();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].count, 2);
        assert_eq!(dups[0].key, record.business_key());
    }
}
