//! Background rule evaluation.
//!
//! Accepted batches produce one [`EvaluationJob`] each. A single worker drains
//! the queue in arrival order; jobs for the same device are not coordinated
//! with later ingestions or rule edits. Double firing is prevented by the
//! conditional `last_notification` update in [`RuleStore::mark_fired`].

use crate::errors::Result;
use crate::metrics::{EVALUATIONS_TOTAL, RULES_FIRED_TOTAL};
use crate::model::Reading;
use crate::notify::{spawn_notifications, Dispatcher};
use crate::rule::{Rule, RuleStore};
use crate::timeseries::ReadingStore;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EvaluationJob {
    pub device_id: Uuid,
    /// Most recent reading of the accepted batch; feeds the templates.
    pub reading: Reading,
}

pub struct Evaluator {
    rules: Arc<dyn RuleStore>,
    readings: Arc<dyn ReadingStore>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Evaluator {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        readings: Arc<dyn ReadingStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            rules,
            readings,
            dispatcher,
        }
    }

    /// Evaluates every active rule of the job's device and returns the ids of
    /// the rules that fired.
    pub async fn evaluate(&self, job: &EvaluationJob, now: DateTime<Utc>) -> Vec<Uuid> {
        EVALUATIONS_TOTAL.inc();

        let rules = match self.rules.active_rules_for_device(job.device_id).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(device_id = %job.device_id, "Failed to load rules: {}", e);
                return Vec::new();
            }
        };

        let mut fired = Vec::new();
        for rule in rules.iter().filter(|r| r.is_active()) {
            match self.evaluate_rule(rule, job, now).await {
                Ok(true) => fired.push(rule.id),
                Ok(false) => {}
                Err(e) => warn!(rule_id = %rule.id, "Rule evaluation abandoned: {}", e),
            }
        }
        fired
    }

    async fn evaluate_rule(&self, rule: &Rule, job: &EvaluationJob, now: DateTime<Utc>) -> Result<bool> {
        if rule.is_throttled(now) {
            debug!(rule_id = %rule.id, "Rule throttled");
            return Ok(false);
        }

        let Some(observed) = self.observed_value(rule, job.device_id).await? else {
            return Ok(false);
        };

        let operator = rule.effective_operator();
        let target = rule.comparison_value();
        let holds = match &observed {
            Observed::Latest(value) => operator.holds(value, &target),
            Observed::Aggregate(number) => operator.holds_number(*number, &target),
        };
        if !holds {
            return Ok(false);
        }

        if !self
            .rules
            .mark_fired(rule.id, rule.last_notification, now)
            .await?
        {
            debug!(rule_id = %rule.id, "Rule already fired by a concurrent evaluation");
            return Ok(false);
        }

        RULES_FIRED_TOTAL.inc();
        info!(
            rule_id = %rule.id,
            device_id = %job.device_id,
            sensor = %rule.sensor,
            "Rule fired"
        );
        spawn_notifications(self.dispatcher.clone(), rule, &job.reading);
        Ok(true)
    }

    /// The value the rule compares: the newest stored reading of its sensor,
    /// or the aggregate over the `count_latest` newest ones.
    async fn observed_value(&self, rule: &Rule, device_id: Uuid) -> Result<Option<Observed>> {
        let window = rule.count_latest.max(1) as usize;
        let docs = self
            .readings
            .latest_with_field(device_id, &rule.sensor, window)
            .await?;

        if window < 2 {
            return Ok(docs
                .into_iter()
                .next()
                .and_then(|mut d| d.remove(&rule.sensor))
                .map(Observed::Latest));
        }

        let Some(aggregation) = rule.operation else {
            warn!(rule_id = %rule.id, "Windowed rule without an operation");
            return Ok(None);
        };
        let values: Vec<Value> = docs
            .into_iter()
            .filter_map(|mut d| d.remove(&rule.sensor))
            .collect();
        Ok(aggregation.apply(&values).map(Observed::Aggregate))
    }
}

/// Aggregates stay `f64`; a JSON number cannot hold an overflowed sum.
enum Observed {
    Latest(Value),
    Aggregate(f64),
}

/// Drains the evaluation queue until every sender is gone.
pub async fn run_evaluator(mut rx: mpsc::Receiver<EvaluationJob>, evaluator: Evaluator) {
    info!("Starting rule evaluator");

    while let Some(job) = rx.recv().await {
        let fired = evaluator.evaluate(&job, Utc::now()).await;
        if !fired.is_empty() {
            debug!(device_id = %job.device_id, "{} rule(s) fired", fired.len());
        }
    }

    info!("Rule evaluator stopped");
}
