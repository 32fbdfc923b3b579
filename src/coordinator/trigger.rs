// src/coordinator/trigger.rs
use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::models::stats_models::{RunMode, TriggerDecision};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedProducer {
    pub producer_id: String,
    #[serde(default = "default_critical")]
    pub critical: bool,
}

fn default_critical() -> bool {
    true
}

/// Which producers must report before a mode's batch may be consolidated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerTable {
    pub modes: HashMap<RunMode, Vec<ExpectedProducer>>,
}

impl ProducerTable {
    /// Every active producer is critical in every mode.
    pub fn all_critical(producer_ids: &[String]) -> Self {
        let expected: Vec<ExpectedProducer> = producer_ids
            .iter()
            .map(|id| ExpectedProducer {
                producer_id: id.clone(),
                critical: true,
            })
            .collect();
        Self {
            modes: HashMap::from([
                (RunMode::Scheduled, expected.clone()),
                (RunMode::Refresh, expected),
            ]),
        }
    }

    pub fn load(path: Option<&str>, producer_ids: &[String]) -> Result<Self> {
        let table = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .context(format!("Failed to read producer table {}", path))?;
                let table: ProducerTable = serde_json::from_str(&raw)
                    .context(format!("Failed to parse producer table {}", path))?;
                info!("Loaded expected-producer table from {}", path);
                table
            }
            None => Self::all_critical(producer_ids),
        };

        for (mode, expected) in &table.modes {
            for producer in expected {
                if !producer_ids.contains(&producer.producer_id) {
                    warn!(
                        "Producer '{}' expected in {} runs is not an active model{}",
                        producer.producer_id,
                        mode,
                        if producer.critical {
                            "; these runs will block"
                        } else {
                            ""
                        }
                    );
                }
            }
        }
        Ok(table)
    }

    /// Ready when every critical producer is done and at least `optional_quorum`
    /// of the optional ones are.
    pub fn evaluate(
        &self,
        mode: RunMode,
        done: &BTreeSet<String>,
        optional_quorum: f64,
    ) -> TriggerDecision {
        let Some(expected) = self.modes.get(&mode) else {
            warn!("No expected producers configured for {} runs; consolidating", mode);
            return TriggerDecision::Ready {
                missing_optional: Vec::new(),
            };
        };

        let missing_critical: Vec<String> = expected
            .iter()
            .filter(|p| p.critical && !done.contains(&p.producer_id))
            .map(|p| p.producer_id.clone())
            .collect();
        let optional: Vec<&ExpectedProducer> = expected.iter().filter(|p| !p.critical).collect();
        let missing_optional: Vec<String> = optional
            .iter()
            .filter(|p| !done.contains(&p.producer_id))
            .map(|p| p.producer_id.clone())
            .collect();
        let optional_done_ratio = if optional.is_empty() {
            1.0
        } else {
            (optional.len() - missing_optional.len()) as f64 / optional.len() as f64
        };

        if !missing_critical.is_empty() || optional_done_ratio < optional_quorum {
            return TriggerDecision::Blocked {
                missing_critical,
                optional_done_ratio,
            };
        }
        if !missing_optional.is_empty() {
            warn!(
                "Degraded trigger for {} run: optional producers missing {:?} ({:.0}% done)",
                mode,
                missing_optional,
                optional_done_ratio * 100.0
            );
        }
        TriggerDecision::Ready { missing_optional }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ProducerTable {
        let raw = r#"{
            "scheduled": [
                {"producer_id": "stat_baseline"},
                {"producer_id": "ensemble", "critical": true},
                {"producer_id": "gbm_points", "critical": false},
                {"producer_id": "similarity_knn", "critical": false},
                {"producer_id": "matchup", "critical": false}
            ]
        }"#;
        serde_json::from_str(raw).unwrap()
    }

    fn done(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_all_done_is_ready() {
        let decision = table().evaluate(
            RunMode::Scheduled,
            &done(&["stat_baseline", "ensemble", "gbm_points", "similarity_knn", "matchup"]),
            0.6,
        );
        assert!(decision.is_ready());
        assert!(!decision.is_degraded());
    }

    #[test]
    fn test_degraded_trigger_fires_at_quorum() {
        // 2 of 3 optional producers is 67%, above a 60% quorum.
        let decision = table().evaluate(
            RunMode::Scheduled,
            &done(&["stat_baseline", "ensemble", "gbm_points", "similarity_knn"]),
            0.6,
        );
        assert!(decision.is_degraded());
        assert_eq!(
            decision,
            TriggerDecision::Ready {
                missing_optional: vec!["matchup".to_string()]
            }
        );
    }

    #[test]
    fn test_below_quorum_blocks() {
        let decision = table().evaluate(
            RunMode::Scheduled,
            &done(&["stat_baseline", "ensemble", "gbm_points"]),
            0.6,
        );
        match decision {
            TriggerDecision::Blocked {
                missing_critical,
                optional_done_ratio,
            } => {
                assert!(missing_critical.is_empty());
                assert!((optional_done_ratio - 1.0 / 3.0).abs() < 1e-9);
            }
            other => panic!("expected blocked, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_critical_blocks_regardless_of_optional() {
        let decision = table().evaluate(
            RunMode::Scheduled,
            &done(&["stat_baseline", "gbm_points", "similarity_knn", "matchup"]),
            0.0,
        );
        assert_eq!(
            decision,
            TriggerDecision::Blocked {
                missing_critical: vec!["ensemble".to_string()],
                optional_done_ratio: 1.0
            }
        );
    }

    #[test]
    fn test_unconfigured_mode_is_ready() {
        assert!(table().evaluate(RunMode::Refresh, &done(&[]), 0.6).is_ready());
    }

    #[test]
    fn test_default_table_makes_everyone_critical() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let table = ProducerTable::load(None, &ids).unwrap();
        assert!(!table.evaluate(RunMode::Refresh, &done(&["a"]), 0.0).is_ready());
        assert!(table.evaluate(RunMode::Refresh, &done(&["a", "b"]), 0.0).is_ready());
    }
}
