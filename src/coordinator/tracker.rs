// src/coordinator/tracker.rs
use std::collections::{BTreeMap, BTreeSet};

use crate::worker::{EntityOutcome, PartitionReport};

#[derive(Debug, Clone, PartialEq)]
pub enum PartitionState {
    Pending,
    Running { attempt: u32 },
    Succeeded(PartitionReport),
    Failed { attempts: u32, error: String },
}

/// Completion state for one `run_batch` invocation. Never shared between runs.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    partitions: BTreeMap<usize, PartitionState>,
    entities_by_partition: BTreeMap<usize, Vec<String>>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, index: usize, entity_ids: Vec<String>) {
        self.partitions.insert(index, PartitionState::Pending);
        self.entities_by_partition.insert(index, entity_ids);
    }

    pub fn mark_running(&mut self, index: usize, attempt: u32) {
        self.partitions.insert(index, PartitionState::Running { attempt });
    }

    pub fn mark_succeeded(&mut self, report: PartitionReport) {
        self.partitions
            .insert(report.index, PartitionState::Succeeded(report));
    }

    pub fn mark_failed(&mut self, index: usize, attempts: u32, error: String) {
        self.partitions
            .insert(index, PartitionState::Failed { attempts, error });
    }

    pub fn total(&self) -> usize {
        self.partitions.len()
    }

    pub fn reports(&self) -> impl Iterator<Item = &PartitionReport> {
        self.partitions.values().filter_map(|s| match s {
            PartitionState::Succeeded(r) => Some(r),
            _ => None,
        })
    }

    pub fn succeeded_count(&self) -> usize {
        self.reports().count()
    }

    pub fn failed_count(&self) -> usize {
        self.partitions
            .values()
            .filter(|s| matches!(s, PartitionState::Failed { .. }))
            .count()
    }

    pub fn unfinished_count(&self) -> usize {
        self.partitions
            .values()
            .filter(|s| matches!(s, PartitionState::Pending | PartitionState::Running { .. }))
            .count()
    }

    pub fn failure_messages(&self) -> Vec<String> {
        self.partitions
            .iter()
            .filter_map(|(index, s)| match s {
                PartitionState::Failed { attempts, error } => Some(format!(
                    "partition {} failed after {} attempt(s): {}",
                    index, attempts, error
                )),
                _ => None,
            })
            .collect()
    }

    pub fn succeeded_batch_ids(&self) -> Vec<String> {
        self.reports().map(|r| r.batch_id.clone()).collect()
    }

    /// Entities whose partition did not succeed, in roster order per partition.
    pub fn missing_entities(&self) -> Vec<String> {
        self.partitions
            .iter()
            .filter(|(_, s)| !matches!(s, PartitionState::Succeeded(_)))
            .flat_map(|(index, _)| {
                self.entities_by_partition
                    .get(index)
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    /// (predicted, skipped) entity counts over succeeded partitions.
    pub fn entity_counts(&self) -> (usize, usize) {
        self.reports()
            .flat_map(|r| r.entities.values())
            .fold((0, 0), |(p, s), outcome| match outcome {
                EntityOutcome::Predicted => (p + 1, s),
                EntityOutcome::Skipped => (p, s + 1),
            })
    }

    pub fn staged_records(&self) -> usize {
        self.reports().map(|r| r.staged_records).sum()
    }

    /// Producers that answered for some entity in a succeeded partition. Model errors on
    /// individual entities do not hold a producer back; they are reported as adapter errors.
    /// Failed partitions are accounted for by `missing_entities`.
    pub fn done_producers(&self) -> BTreeSet<String> {
        self.reports()
            .flat_map(|r| r.producers.iter())
            .filter(|(_, tally)| tally.completed())
            .map(|(producer, _)| producer.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ProducerTally;

    fn report(index: usize, entities: &[(&str, EntityOutcome)], producers: &[(&str, ProducerTally)]) -> PartitionReport {
        PartitionReport {
            index,
            batch_id: format!("b{}", index),
            staged_records: 2,
            entities: entities.iter().map(|(e, o)| (e.to_string(), *o)).collect(),
            producers: producers.iter().map(|(p, t)| (p.to_string(), t.clone())).collect(),
            adapter_errors: Vec::new(),
        }
    }

    fn tally(predicted: usize, skipped: usize, errored: usize) -> ProducerTally {
        ProducerTally {
            predicted,
            skipped,
            errored,
        }
    }

    #[test]
    fn test_missing_entities_come_from_failed_partitions() {
        let mut tracker = CompletionTracker::new();
        tracker.register(0, vec!["p1".into(), "p2".into()]);
        tracker.register(1, vec!["p3".into()]);
        tracker.mark_running(1, 1);
        tracker.mark_succeeded(report(
            0,
            &[("p1", EntityOutcome::Predicted), ("p2", EntityOutcome::Skipped)],
            &[("m", tally(1, 1, 0))],
        ));
        tracker.mark_failed(1, 3, "feature store unavailable".into());

        assert_eq!(tracker.missing_entities(), vec!["p3".to_string()]);
        assert_eq!(tracker.entity_counts(), (1, 1));
        assert_eq!(tracker.succeeded_batch_ids(), vec!["b0".to_string()]);
        assert_eq!(tracker.done_producers().len(), 1);
        assert_eq!(tracker.unfinished_count(), 0);
        assert_eq!(tracker.failure_messages().len(), 1);
    }

    #[test]
    fn test_occasional_model_errors_do_not_hold_a_producer_back() {
        let mut tracker = CompletionTracker::new();
        tracker.register(0, vec!["p1".into()]);
        tracker.register(1, vec!["p2".into()]);
        tracker.mark_succeeded(report(
            0,
            &[("p1", EntityOutcome::Predicted)],
            &[("a", tally(1, 0, 0)), ("b", tally(1, 0, 0)), ("broken", tally(0, 0, 1))],
        ));
        tracker.mark_succeeded(report(
            1,
            &[("p2", EntityOutcome::Predicted)],
            &[("a", tally(1, 0, 0)), ("b", tally(0, 0, 1)), ("broken", tally(0, 0, 1))],
        ));

        let done = tracker.done_producers();
        assert!(done.contains("a"));
        assert!(done.contains("b"));
        assert!(!done.contains("broken"));
    }
}
