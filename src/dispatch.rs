//! Dispatch waves
//!
//! One wave fans every delegated task out concurrently and aggregates
//! whatever finishes before the wall-clock deadline. A late or crashed
//! runner costs only its own slot; siblings keep their results.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::events::EventEmitter;
use crate::models::{AgentResult, AgentStatus, AgentTask};
use crate::specialist::{find_specialist, SpecialistContext, SpecialistRunner};

pub struct Dispatcher {
    runner: Arc<SpecialistRunner>,
    wave_deadline: Duration,
}

impl Dispatcher {
    pub fn new(runner: Arc<SpecialistRunner>, wave_deadline: Duration) -> Self {
        Self {
            runner,
            wave_deadline,
        }
    }

    /// Runs one wave to completion or deadline, returning results in the
    /// order runners finished. Tasks still running at the deadline are
    /// aborted and recorded as failed with a timeout cause.
    pub async fn run_wave(
        &self,
        tasks: Vec<AgentTask>,
        ctx: &SpecialistContext,
        emitter: &EventEmitter,
    ) -> Vec<AgentResult> {
        let deadline = Instant::now() + self.wave_deadline;
        let mut results = Vec::with_capacity(tasks.len());
        let mut launched: Vec<String> = Vec::new();
        let mut join_set = JoinSet::new();

        for task in tasks {
            let Some(spec) = find_specialist(&task.agent_id) else {
                warn!(agent_id = %task.agent_id, "delegation names unknown specialist");
                results.push(AgentResult {
                    agent_id: task.agent_id.clone(),
                    payload: format!("unknown specialist '{}'", task.agent_id),
                    status: AgentStatus::Failed,
                    completed_at: Utc::now(),
                });
                continue;
            };

            launched.push(task.agent_id.clone());
            let runner = Arc::clone(&self.runner);
            let ctx = ctx.clone();
            let emitter = emitter.clone();
            join_set.spawn(async move { runner.run(spec, &task, &ctx, &emitter).await });
        }
        info!(wave_size = launched.len(), "dispatch wave launched");

        while !join_set.is_empty() {
            match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok(result))) => results.push(result),
                Ok(Some(Err(e))) => warn!(error = %e, "specialist task aborted"),
                Ok(None) => break,
                Err(_) => {
                    join_set.abort_all();
                    // Rescue anything that finished right at the deadline.
                    while let Some(joined) = join_set.try_join_next() {
                        if let Ok(result) = joined {
                            results.push(result);
                        }
                    }
                    break;
                }
            }
        }

        let finished: HashSet<&str> = results.iter().map(|r| r.agent_id.as_str()).collect();
        let missed: Vec<String> = launched
            .into_iter()
            .filter(|id| !finished.contains(id.as_str()))
            .collect();
        for agent_id in missed {
            warn!(
                agent_id = %agent_id,
                deadline_secs = self.wave_deadline.as_secs(),
                "specialist missed the wave deadline"
            );
            results.push(AgentResult {
                agent_id,
                payload: format!(
                    "no result before the {}s wave deadline",
                    self.wave_deadline.as_secs()
                ),
                status: AgentStatus::Failed,
                completed_at: Utc::now(),
            });
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedModel, ScriptedTurn};
    use crate::tools::ToolRegistry;

    fn context() -> SpecialistContext {
        SpecialistContext {
            user_id: 7,
            instrument: None,
        }
    }

    fn dispatcher(model: Arc<ScriptedModel>, deadline: Duration) -> Dispatcher {
        let runner = Arc::new(SpecialistRunner::new(
            model,
            Arc::new(ToolRegistry::new()),
            Duration::from_secs(1),
        ));
        Dispatcher::new(runner, deadline)
    }

    #[tokio::test]
    async fn one_failing_specialist_leaves_siblings_intact() {
        let model = Arc::new(ScriptedModel::keyed());
        model
            .insert(
                "'market' specialist",
                vec![ScriptedTurn::fail("model unavailable")],
            )
            .await;
        model
            .insert(
                "'technical' specialist",
                vec![ScriptedTurn::text("추세는 상승입니다")],
            )
            .await;

        let dispatcher = dispatcher(model, Duration::from_secs(5));
        let (emitter, _rx) = EventEmitter::channel(64);
        let results = dispatcher
            .run_wave(
                vec![
                    AgentTask::new("market", "뉴스 분석", 3),
                    AgentTask::new("technical", "추세 분석", 3),
                ],
                &context(),
                &emitter,
            )
            .await;

        assert_eq!(results.len(), 2);
        let market = results.iter().find(|r| r.agent_id == "market").unwrap();
        let technical = results.iter().find(|r| r.agent_id == "technical").unwrap();
        assert_eq!(market.status, AgentStatus::Failed);
        assert_eq!(technical.status, AgentStatus::Completed);
        assert!(technical.payload.contains("상승"));
    }

    #[tokio::test]
    async fn deadline_fails_only_the_late_specialist() {
        let model = Arc::new(ScriptedModel::keyed());
        model
            .insert(
                "'market' specialist",
                vec![ScriptedTurn::text("뉴스 흐름 양호")],
            )
            .await;
        model
            .insert(
                "'technical' specialist",
                vec![ScriptedTurn::text("late").with_delay(Duration::from_millis(500))],
            )
            .await;

        let dispatcher = dispatcher(model, Duration::from_millis(60));
        let (emitter, _rx) = EventEmitter::channel(64);
        let results = dispatcher
            .run_wave(
                vec![
                    AgentTask::new("market", "뉴스", 3),
                    AgentTask::new("technical", "추세", 3),
                ],
                &context(),
                &emitter,
            )
            .await;

        assert_eq!(results.len(), 2);
        let market = results.iter().find(|r| r.agent_id == "market").unwrap();
        let technical = results.iter().find(|r| r.agent_id == "technical").unwrap();
        assert_eq!(market.status, AgentStatus::Completed);
        assert_eq!(technical.status, AgentStatus::Failed);
        assert!(technical.payload.contains("wave deadline"));
    }

    #[tokio::test]
    async fn results_arrive_in_completion_order() {
        let model = Arc::new(ScriptedModel::keyed());
        model
            .insert(
                "'market' specialist",
                vec![ScriptedTurn::text("slow").with_delay(Duration::from_millis(80))],
            )
            .await;
        model
            .insert("'graph' specialist", vec![ScriptedTurn::text("fast")])
            .await;

        let dispatcher = dispatcher(model, Duration::from_secs(5));
        let (emitter, _rx) = EventEmitter::channel(64);
        let results = dispatcher
            .run_wave(
                vec![
                    AgentTask::new("market", "뉴스", 3),
                    AgentTask::new("graph", "관계", 3),
                ],
                &context(),
                &emitter,
            )
            .await;

        assert_eq!(results[0].agent_id, "graph");
        assert_eq!(results[1].agent_id, "market");
    }

    #[tokio::test]
    async fn unknown_specialist_id_fails_without_launching() {
        let model = Arc::new(ScriptedModel::sequential(vec![]));
        let dispatcher = dispatcher(model, Duration::from_secs(1));
        let (emitter, _rx) = EventEmitter::channel(16);

        let results = dispatcher
            .run_wave(
                vec![AgentTask::new("astrology", "점성술", 3)],
                &context(),
                &emitter,
            )
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, AgentStatus::Failed);
        assert!(results[0].payload.contains("unknown specialist"));
    }
}
