//! Aggregate statistics over live instances.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use phaseflow_types::instance::{InstanceAge, InstanceStatistics, InstanceStatus};

use crate::instance::WorkflowInstance;

/// The fields of an instance that statistics are computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub template_id: String,
    pub status: InstanceStatus,
    pub overall_progress: u32,
    /// Start time, or creation time for instances that never started.
    pub started_at: DateTime<Utc>,
}

impl InstanceSummary {
    pub fn of(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.id().to_string(),
            template_id: instance.template_id().to_string(),
            status: instance.status(),
            overall_progress: instance.progress().overall,
            started_at: instance.started_at().unwrap_or_else(|| instance.created_at()),
        }
    }
}

pub fn compute_statistics(summaries: &[InstanceSummary]) -> InstanceStatistics {
    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_template: BTreeMap<String, usize> = BTreeMap::new();
    for summary in summaries {
        *by_status.entry(summary.status.to_string()).or_default() += 1;
        *by_template.entry(summary.template_id.clone()).or_default() += 1;
    }

    let average_progress = if summaries.is_empty() {
        0.0
    } else {
        summaries
            .iter()
            .map(|s| f64::from(s.overall_progress))
            .sum::<f64>()
            / summaries.len() as f64
    };

    let age = |s: &InstanceSummary| InstanceAge {
        instance_id: s.instance_id.clone(),
        started_at: s.started_at,
    };

    InstanceStatistics {
        total: summaries.len(),
        by_status,
        by_template,
        average_progress,
        oldest: summaries.iter().min_by_key(|s| s.started_at).map(age),
        newest: summaries.iter().max_by_key(|s| s.started_at).map(age),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn summary(id: &str, template: &str, status: InstanceStatus, progress: u32, age_mins: i64) -> InstanceSummary {
        InstanceSummary {
            instance_id: id.to_string(),
            template_id: template.to_string(),
            status,
            overall_progress: progress,
            started_at: Utc::now() - Duration::minutes(age_mins),
        }
    }

    #[test]
    fn empty_statistics() {
        let stats = compute_statistics(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.average_progress, 0.0);
        assert!(stats.oldest.is_none());
        assert!(stats.newest.is_none());
    }

    #[test]
    fn counts_average_and_ages() {
        let stats = compute_statistics(&[
            summary("a", "t1", InstanceStatus::Completed, 100, 30),
            summary("b", "t1", InstanceStatus::Running, 50, 10),
            summary("c", "t2", InstanceStatus::Running, 0, 60),
        ]);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status["completed"], 1);
        assert_eq!(stats.by_status["running"], 2);
        assert_eq!(stats.by_template["t1"], 2);
        assert_eq!(stats.by_template["t2"], 1);
        assert_eq!(stats.average_progress, 50.0);
        assert_eq!(stats.oldest.unwrap().instance_id, "c");
        assert_eq!(stats.newest.unwrap().instance_id, "b");
    }
}
