//! ReAct 主循环
//!
//! Planning → Acting → Observing，直到 planner 给出 conversational_response、
//! 达到 max_iterations、失败循环检测触发或整体超时/取消。
//! 每个 await（规划与技能调用）都受取消令牌和整体截止时间约束；
//! 所有结局都以 OperatorOutcome 返回，且都带一个（可能是尽力而为的）回答。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditCategory, AuditEvent, AuditLevel, AuditSink};
use crate::react::detector::FailureLoopDetector;
use crate::react::observation::{self, ObservationFormat};
use crate::react::planner::{PlanContext, Planner};
use crate::react::scratchpad::{Scratchpad, Step};
use crate::skills::{ErrorClass, SkillExecutor, SkillOutcome, TrustLevel};

/// planner 出错时记录到 scratchpad 的 action 名
pub const PLAN_ERROR_ACTION: &str = "plan_error";

#[derive(Debug, Clone)]
pub struct ReactConfig {
    pub max_iterations: usize,
    pub timeout: Duration,
    pub repeat_threshold: usize,
    pub observation_format: ObservationFormat,
    pub max_observation_chars: usize,
    /// 调用技能时使用的信任级别
    pub trust: TrustLevel,
    pub actor: String,
}

impl Default for ReactConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            timeout: Duration::from_secs(120),
            repeat_threshold: 2,
            observation_format: ObservationFormat::Summary,
            max_observation_chars: 4000,
            trust: TrustLevel::Suggest,
            actor: "react".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorStatus {
    Complete,
    /// 超时或取消，回答为部分结果
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    Completed,
    IterationCap,
    FailureLoop { reason: String },
    Timeout,
    Cancelled,
}

impl Termination {
    pub fn status(&self) -> OperatorStatus {
        match self {
            Termination::Completed => OperatorStatus::Complete,
            Termination::IterationCap | Termination::FailureLoop { .. } => OperatorStatus::Failed,
            Termination::Timeout | Termination::Cancelled => OperatorStatus::Partial,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorOutcome {
    pub run_id: String,
    pub status: OperatorStatus,
    pub termination: Termination,
    pub answer: String,
    pub iterations: usize,
    pub scratchpad: Scratchpad,
}

enum Interrupt {
    Cancelled,
    Timeout,
}

pub struct ReactOperator {
    planner: Arc<dyn Planner>,
    executor: Arc<SkillExecutor>,
    audit: Arc<dyn AuditSink>,
    config: ReactConfig,
}

impl ReactOperator {
    pub fn new(
        planner: Arc<dyn Planner>,
        executor: Arc<SkillExecutor>,
        audit: Arc<dyn AuditSink>,
        config: ReactConfig,
    ) -> Self {
        Self {
            planner,
            executor,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &ReactConfig {
        &self.config
    }

    async fn bounded<F: Future>(
        cancel: &CancellationToken,
        deadline: Instant,
        fut: F,
    ) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(Interrupt::Timeout),
            out = fut => Ok(out),
        }
    }

    pub async fn run(&self, goal: &str, cancel: &CancellationToken) -> OperatorOutcome {
        let run_id = format!("react_{}", uuid::Uuid::new_v4().simple());
        let deadline = Instant::now() + self.config.timeout;
        let catalog = self.executor.registry().catalog_json();
        let mut pad = Scratchpad::new();
        let mut detector = FailureLoopDetector::new(self.config.repeat_threshold);

        tracing::info!(run = %run_id, goal = %goal, "ReAct run started");
        self.audit.audit(
            AuditEvent::new(AuditCategory::React, "react_started")
                .actor(&self.config.actor)
                .details(json!({
                    "runId": run_id,
                    "goal": goal,
                    "maxIterations": self.config.max_iterations,
                    "timeoutSecs": self.config.timeout.as_secs(),
                })),
        );

        let mut iterations = 0;
        while iterations < self.config.max_iterations {
            iterations += 1;

            // Planning
            let ctx = PlanContext {
                goal,
                catalog: &catalog,
                scratchpad: &pad,
                iteration: iterations,
                max_iterations: self.config.max_iterations,
            };
            let planned = match Self::bounded(cancel, deadline, self.planner.plan(&ctx)).await {
                Ok(planned) => planned,
                Err(interrupt) => return self.interrupted(run_id, goal, pad, iterations, interrupt),
            };

            let step = match planned {
                Ok(plan) if plan.is_completion() => {
                    let answer = plan.answer();
                    let step = Step::new(plan.thought.clone(), plan.action.clone(), plan.action_input.clone())
                        .observed(answer.clone(), json!({ "answer": answer }), None);
                    self.audit_step(&run_id, iterations, pad.push(step));
                    return self.finish(run_id, Termination::Completed, answer, iterations, pad);
                }
                // Acting + Observing
                Ok(plan) => {
                    let call = self.executor.execute_as(
                        &plan.action,
                        plan.action_input.clone(),
                        self.config.trust,
                        false,
                        &self.config.actor,
                    );
                    let result = match Self::bounded(cancel, deadline, call).await {
                        Ok(result) => result,
                        Err(interrupt) => return self.interrupted(run_id, goal, pad, iterations, interrupt),
                    };
                    let step = Step::new(plan.thought, plan.action, plan.action_input);
                    match result {
                        Ok(SkillOutcome::Completed(value)) => step.observed(
                            observation::format_success(
                                &value,
                                self.config.observation_format,
                                self.config.max_observation_chars,
                            ),
                            value,
                            None,
                        ),
                        Ok(SkillOutcome::AwaitingApproval { queue_id }) => step.observed(
                            observation::format_awaiting(&queue_id),
                            json!({ "awaitingApproval": queue_id }),
                            Some(ErrorClass::AwaitingApproval),
                        ),
                        Err(e) => {
                            let class = e.class();
                            let message = e.to_string();
                            step.observed(
                                observation::format_error(class, &message, self.config.max_observation_chars),
                                json!({ "errorClass": class, "error": message }),
                                Some(class),
                            )
                        }
                    }
                }
                Err(plan_error) => {
                    let message = plan_error.to_string();
                    Step::new(String::new(), PLAN_ERROR_ACTION, serde_json::Value::Null).observed(
                        observation::format_error(
                            ErrorClass::InvalidPlan,
                            &message,
                            self.config.max_observation_chars,
                        ),
                        json!({ "errorClass": ErrorClass::InvalidPlan, "error": message }),
                        Some(ErrorClass::InvalidPlan),
                    )
                }
            };

            let step = pad.push(step);
            self.audit_step(&run_id, iterations, step);
            if let Some(reason) = detector.observe(step) {
                tracing::warn!(run = %run_id, reason = %reason, "Failure loop detected");
                let answer = pad.synthesize_answer(goal);
                return self.finish(run_id, Termination::FailureLoop { reason }, answer, iterations, pad);
            }
        }

        let answer = pad.synthesize_answer(goal);
        self.finish(run_id, Termination::IterationCap, answer, iterations, pad)
    }

    fn interrupted(
        &self,
        run_id: String,
        goal: &str,
        pad: Scratchpad,
        iterations: usize,
        interrupt: Interrupt,
    ) -> OperatorOutcome {
        let termination = match interrupt {
            Interrupt::Cancelled => Termination::Cancelled,
            Interrupt::Timeout => Termination::Timeout,
        };
        let answer = pad.synthesize_answer(goal);
        self.finish(run_id, termination, answer, iterations, pad)
    }

    fn audit_step(&self, run_id: &str, iteration: usize, step: &Step) {
        let level = if step.is_success() {
            AuditLevel::Info
        } else {
            AuditLevel::Warn
        };
        self.audit.audit(
            AuditEvent::new(AuditCategory::React, "react_step")
                .level(level)
                .actor(&self.config.actor)
                .details(json!({
                    "runId": run_id,
                    "iteration": iteration,
                    "step": step,
                })),
        );
    }

    fn finish(
        &self,
        run_id: String,
        termination: Termination,
        answer: String,
        iterations: usize,
        scratchpad: Scratchpad,
    ) -> OperatorOutcome {
        let status = termination.status();
        let level = match status {
            OperatorStatus::Complete => AuditLevel::Info,
            _ => AuditLevel::Warn,
        };
        tracing::info!(run = %run_id, status = ?status, iterations, "ReAct run finished");
        self.audit.audit(
            AuditEvent::new(AuditCategory::React, "react_finished")
                .level(level)
                .actor(&self.config.actor)
                .details(json!({
                    "runId": run_id,
                    "status": status,
                    "termination": termination,
                    "iterations": iterations,
                    "answer": answer,
                })),
        );
        OperatorOutcome {
            run_id,
            status,
            termination,
            answer,
            iterations,
            scratchpad,
        }
    }
}
