//! The tick loop that starts scheduled executions.
//!
//! Every tick scans the active workflows for `schedule` trigger nodes and
//! fires each one whose next fire time, counted from when it last fired,
//! has passed. A trigger seen for the first time only starts its clock, and
//! any number of fire times missed between two ticks collapse into one run.

use crate::error::ScheduleError;
use crate::schedule::CronSchedule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowforge_core::{ExecutionId, Result, WorkflowId};
use flowforge_engine::{Engine, ExecutionRequest};
use flowforge_workflow::trigger::{TriggerConfig, schedule_triggers};
use flowforge_workflow::{ExecutionMode, NodeId, Workflow};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchedulerConfig {
    /// Run the tick loop at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_tick_interval_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

/// Where scheduled runs come from and go to.
#[async_trait]
pub trait ScheduleTarget: Send + Sync {
    /// Workflows whose triggers may fire.
    async fn active_workflows(&self) -> Result<Vec<Workflow>, ScheduleError>;

    /// Starts a SCHEDULE execution from `trigger`.
    async fn fire(
        &self,
        workflow_id: WorkflowId,
        trigger: NodeId,
        payload: JsonValue,
    ) -> Result<ExecutionId, ScheduleError>;
}

#[async_trait]
impl ScheduleTarget for Engine {
    async fn active_workflows(&self) -> Result<Vec<Workflow>, ScheduleError> {
        Engine::active_workflows(self).await.map_err(|report| {
            ScheduleError::DispatchFailed {
                reason: report.current_context().to_string(),
            }
            .into()
        })
    }

    async fn fire(
        &self,
        workflow_id: WorkflowId,
        trigger: NodeId,
        payload: JsonValue,
    ) -> Result<ExecutionId, ScheduleError> {
        let request = ExecutionRequest::manual(workflow_id, payload)
            .fired(ExecutionMode::Schedule, trigger);
        self.execute_workflow(request).await.map_err(|report| {
            ScheduleError::DispatchFailed {
                reason: report.current_context().to_string(),
            }
            .into()
        })
    }
}

type TriggerKey = (WorkflowId, NodeId);

/// Fires schedule triggers on a fixed tick.
pub struct ScheduleDispatcher {
    target: Arc<dyn ScheduleTarget>,
    config: SchedulerConfig,
    /// When each known trigger last fired, or was first seen.
    last_fired: Mutex<HashMap<TriggerKey, DateTime<Utc>>>,
}

impl ScheduleDispatcher {
    #[must_use]
    pub fn new(target: Arc<dyn ScheduleTarget>, config: SchedulerConfig) -> Self {
        Self {
            target,
            config,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Fires every due trigger and returns the executions started.
    ///
    /// A trigger whose cron expression does not parse, or whose execution
    /// cannot be started, is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the active workflows cannot be listed.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>, ScheduleError> {
        let workflows = self.target.active_workflows().await?;
        let mut last_fired = self.last_fired.lock().await;
        let mut seen: HashMap<TriggerKey, DateTime<Utc>> = HashMap::new();
        let mut started = Vec::new();

        for workflow in &workflows {
            for trigger in schedule_triggers(workflow) {
                let TriggerConfig::Schedule(config) = &trigger.config else {
                    continue;
                };
                let key = (workflow.id, trigger.node_id.clone());
                let Some(&since) = last_fired.get(&key) else {
                    debug!(workflow_id = %workflow.id, node_id = %trigger.node_id, "schedule registered");
                    seen.insert(key, now);
                    continue;
                };
                let schedule = match CronSchedule::parse(&config.cron, config.timezone.as_deref()) {
                    Ok(schedule) => schedule,
                    Err(e) => {
                        warn!(workflow_id = %workflow.id, node_id = %trigger.node_id, error = %e, "skipping schedule");
                        seen.insert(key, since);
                        continue;
                    }
                };
                if !schedule.is_due(since, now) {
                    seen.insert(key, since);
                    continue;
                }

                let payload = trigger.schedule_payload();
                match self
                    .target
                    .fire(workflow.id, trigger.node_id.clone(), payload)
                    .await
                {
                    Ok(execution_id) => {
                        info!(
                            workflow_id = %workflow.id,
                            node_id = %trigger.node_id,
                            %execution_id,
                            cron = schedule.expression(),
                            "schedule fired"
                        );
                        started.push(execution_id);
                    }
                    Err(report) => warn!(
                        workflow_id = %workflow.id,
                        node_id = %trigger.node_id,
                        error = %report.current_context(),
                        "scheduled execution could not be started"
                    ),
                }
                seen.insert(key, now);
            }
        }

        // Triggers of deleted, deactivated or edited workflows are forgotten.
        *last_fired = seen;
        debug!(triggers = last_fired.len(), fired = started.len(), "schedule tick");
        Ok(started)
    }

    /// Ticks until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("scheduler disabled");
            return;
        }
        let period = Duration::from_secs(self.config.tick_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = period.as_secs(), "scheduler started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(report) = self.tick(Utc::now()).await {
                        warn!(error = %report.current_context(), "schedule tick failed");
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flowforge_core::UserId;
    use flowforge_workflow::{Node, NodeType};
    use serde_json::json;
    use std::sync::PoisonError;

    #[derive(Default)]
    struct FakeTarget {
        workflows: std::sync::Mutex<Vec<Workflow>>,
        fired: std::sync::Mutex<Vec<(WorkflowId, NodeId, JsonValue)>>,
    }

    impl FakeTarget {
        fn fired(&self) -> Vec<(WorkflowId, NodeId, JsonValue)> {
            self.fired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl ScheduleTarget for FakeTarget {
        async fn active_workflows(&self) -> Result<Vec<Workflow>, ScheduleError> {
            Ok(self
                .workflows
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone())
        }

        async fn fire(
            &self,
            workflow_id: WorkflowId,
            trigger: NodeId,
            payload: JsonValue,
        ) -> Result<ExecutionId, ScheduleError> {
            self.fired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((workflow_id, trigger, payload));
            Ok(ExecutionId::new())
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).single().expect("valid time")
    }

    fn scheduled(cron: &str) -> Workflow {
        Workflow::new(UserId::new(), "nightly").with_graph(
            vec![
                Node::new(
                    "every",
                    NodeType::ScheduleTrigger,
                    json!({ "cron": cron, "payload": { "source": "cron" } }),
                ),
                Node::new("manual", NodeType::ManualTrigger, json!({})),
            ],
            vec![],
        )
    }

    fn dispatcher(workflows: Vec<Workflow>) -> (ScheduleDispatcher, Arc<FakeTarget>) {
        let target = Arc::new(FakeTarget::default());
        *target.workflows.lock().unwrap_or_else(PoisonError::into_inner) = workflows;
        (
            ScheduleDispatcher::new(target.clone(), SchedulerConfig::default()),
            target,
        )
    }

    #[tokio::test]
    async fn first_sight_only_starts_the_clock() {
        let workflow = scheduled("* * * * *");
        let (dispatcher, target) = dispatcher(vec![workflow.clone()]);

        assert!(dispatcher.tick(at(12, 0, 30)).await.expect("tick").is_empty());
        assert_eq!(dispatcher.tick(at(12, 1, 5)).await.expect("tick").len(), 1);
        assert!(dispatcher.tick(at(12, 1, 40)).await.expect("tick").is_empty());

        let fired = target.fired();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, workflow.id);
        assert_eq!(fired[0].1, NodeId::new("every"));
        assert_eq!(fired[0].2, json!({ "source": "cron" }));
    }

    #[tokio::test]
    async fn missed_fires_collapse_into_one() {
        let (dispatcher, target) = dispatcher(vec![scheduled("*/5 * * * *")]);
        dispatcher.tick(at(12, 0, 0)).await.expect("tick");
        assert_eq!(dispatcher.tick(at(13, 0, 0)).await.expect("tick").len(), 1);
        assert_eq!(target.fired().len(), 1);
    }

    #[tokio::test]
    async fn invalid_expression_is_skipped() {
        let mut broken = scheduled("* * * * *");
        broken.nodes[0].config = json!({ "cron": "61 * * * *" });
        let healthy = scheduled("* * * * *");
        let (dispatcher, target) = dispatcher(vec![broken, healthy.clone()]);

        dispatcher.tick(at(12, 0, 0)).await.expect("tick");
        dispatcher.tick(at(12, 2, 0)).await.expect("tick");
        let fired = target.fired();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, healthy.id);
    }

    #[tokio::test]
    async fn removed_workflows_are_forgotten() {
        let (dispatcher, target) = dispatcher(vec![scheduled("* * * * *")]);
        dispatcher.tick(at(12, 0, 0)).await.expect("tick");
        target
            .workflows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        dispatcher.tick(at(12, 5, 0)).await.expect("tick");
        assert!(dispatcher.last_fired.lock().await.is_empty());
        assert!(target.fired().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let (dispatcher, _) = dispatcher(vec![]);
        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { dispatcher.run(shutdown).await })
        };
        tokio::time::sleep(Duration::from_secs(90)).await;
        shutdown.cancel();
        handle.await.expect("dispatcher task");
    }

    #[test]
    fn config_defaults() {
        let config: SchedulerConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.tick_interval_secs, 30);
    }
}
