//! 阶段编排器：驱动单个请求走完感知 → 推理 → 审查管线
//!
//! 感知 / 推理 / 知识检索经分发器异步执行；失败一律消耗重试预算并记录异常，
//! 预算检查收在一处，从不无限循环。低置信与审查否决先查询纠错记忆，
//! 把既往 prevention_note 作为下一轮推理的调整提示；修复尝试结束后写回成败记录。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::PipelineSection;
use crate::core::correction::{
    CorrectionMemory, CorrectionOutcome, CorrectionRecord, StrategyDescriptor,
};
use crate::core::{CoreError, RequestContext, Severity, Stage};
use crate::dispatch::{Job, JobOutcome, JobPayload, TaskDispatcher};
use crate::providers::{Analysis, ClarificationChannel, PolicyReviewer};

/// 低置信重试使用的纠错记忆类别
const LOW_CONFIDENCE: &str = "low_confidence";

/// 待验证的修复策略：下一轮结果揭晓后写回记录
struct PendingRemediation {
    category: String,
    strategy: StrategyDescriptor,
    note: String,
}

/// 阶段编排器；一次 run 独占一个 RequestContext，多个 run 可共享同一分发器
pub struct StageOrchestrator {
    dispatcher: Arc<TaskDispatcher>,
    corrections: Arc<CorrectionMemory>,
    reviewer: Arc<dyn PolicyReviewer>,
    clarifier: Arc<dyn ClarificationChannel>,
    config: PipelineSection,
}

impl StageOrchestrator {
    pub fn new(
        dispatcher: Arc<TaskDispatcher>,
        corrections: Arc<CorrectionMemory>,
        reviewer: Arc<dyn PolicyReviewer>,
        clarifier: Arc<dyn ClarificationChannel>,
        config: PipelineSection,
    ) -> Self {
        Self {
            dispatcher,
            corrections,
            reviewer,
            clarifier,
            config,
        }
    }

    /// 驱动一个请求直至 Complete / Halted，返回最终上下文
    ///
    /// cancel 触发时在下一个阶段边界以 Halted 收束，不泄漏等待。
    pub async fn run(&self, mut ctx: RequestContext, cancel: &CancellationToken) -> RequestContext {
        tracing::info!(request = %ctx.id, "Pipeline run started");
        ctx.advance(Stage::Perceiving, "request accepted");

        // 本轮感知产物与下一轮推理的调整提示
        let mut analysis: Option<Analysis> = None;
        let mut snippets: Vec<String> = Vec::new();
        let mut hint: Option<String> = None;
        let mut pending: Option<PendingRemediation> = None;

        loop {
            if cancel.is_cancelled() {
                self.settle(&mut pending, CorrectionOutcome::Failure);
                return self.halt(ctx, "cancelled", "run cancelled by caller", Severity::High);
            }

            match ctx.stage {
                Stage::Received => {
                    ctx.advance(Stage::Perceiving, "request accepted");
                }

                Stage::Perceiving => {
                    let payload = JobPayload::Perceive {
                        snapshot: ctx.clone(),
                    };
                    match self.run_job(payload, &ctx, cancel).await {
                        Ok(JobOutcome::Analysis(a)) => {
                            snippets.clear();
                            if !a.knowledge_keys.is_empty() {
                                let lookup = JobPayload::LookupKnowledge {
                                    keys: a.knowledge_keys.clone(),
                                };
                                match self.run_job(lookup, &ctx, cancel).await {
                                    Ok(JobOutcome::Snippets(s)) => snippets = s,
                                    Ok(other) => {
                                        if !self.fail_cycle(
                                            &mut ctx,
                                            "knowledge_failure",
                                            format!("unexpected outcome {:?}", other),
                                        ) {
                                            self.settle(&mut pending, CorrectionOutcome::Failure);
                                            return self.halt(
                                                ctx,
                                                "knowledge_failure",
                                                "knowledge lookup kept failing",
                                                Severity::Critical,
                                            );
                                        }
                                        continue;
                                    }
                                    Err(e) => {
                                        if !self.fail_cycle(
                                            &mut ctx,
                                            "knowledge_failure",
                                            e.to_string(),
                                        ) {
                                            self.settle(&mut pending, CorrectionOutcome::Failure);
                                            return self.halt(
                                                ctx,
                                                "knowledge_failure",
                                                "knowledge lookup kept failing",
                                                Severity::Critical,
                                            );
                                        }
                                        continue;
                                    }
                                }
                            }
                            analysis = Some(a);
                            ctx.advance(Stage::Reasoning, "perception complete");
                        }
                        Ok(other) => {
                            if !self.fail_cycle(
                                &mut ctx,
                                "perception_failure",
                                format!("unexpected outcome {:?}", other),
                            ) {
                                self.settle(&mut pending, CorrectionOutcome::Failure);
                                return self.halt(
                                    ctx,
                                    "perception_failure",
                                    "perception kept failing",
                                    Severity::Critical,
                                );
                            }
                        }
                        Err(e) => {
                            if !self.fail_cycle(&mut ctx, "perception_failure", e.to_string()) {
                                self.settle(&mut pending, CorrectionOutcome::Failure);
                                return self.halt(
                                    ctx,
                                    "perception_failure",
                                    "perception kept failing",
                                    Severity::Critical,
                                );
                            }
                        }
                    }
                }

                Stage::Reasoning => {
                    let Some(current) = analysis.clone() else {
                        ctx.advance(Stage::Perceiving, "missing analysis, re-entering perception");
                        continue;
                    };
                    let payload = JobPayload::Reason {
                        snapshot: ctx.clone(),
                        analysis: current,
                        snippets: snippets.clone(),
                        hint: hint.take(),
                    };
                    match self.run_job(payload, &ctx, cancel).await {
                        Ok(JobOutcome::Candidate(c)) => {
                            ctx.confidence = c.confidence;
                            ctx.candidate_output = Some(c.output.clone());

                            if c.ambiguous
                                && ctx.clarification_attempts < self.config.max_clarifications
                            {
                                ctx.advance(
                                    Stage::AwaitingClarification,
                                    "reasoning flagged ambiguity",
                                );
                                // 歧义时问题由推理方给出，缺省退回通用问法
                                let question = c.clarification_question.unwrap_or_else(|| {
                                    format!("Could you clarify your request: {}?", ctx.input)
                                });
                                match self.clarify(&mut ctx, &question).await {
                                    ClarifyStep::Merged => {
                                        ctx.advance(
                                            Stage::Perceiving,
                                            "clarification merged, re-entering perception",
                                        );
                                    }
                                    ClarifyStep::Expired => {
                                        ctx.advance(
                                            Stage::Perceiving,
                                            "clarification expired, re-entering perception",
                                        );
                                    }
                                    ClarifyStep::Exhausted => {
                                        self.settle(&mut pending, CorrectionOutcome::Failure);
                                        return self.halt(
                                            ctx,
                                            "clarification_exhausted",
                                            "clarification budget exhausted without an answer",
                                            Severity::High,
                                        );
                                    }
                                }
                                continue;
                            }

                            if c.confidence < self.config.min_confidence_to_review {
                                // 上一轮修复策略未能越过门槛
                                self.settle(&mut pending, CorrectionOutcome::Failure);
                                let detail = format!(
                                    "confidence {:.2} below review threshold {:.2}",
                                    c.confidence, self.config.min_confidence_to_review
                                );
                                if !self.fail_cycle(&mut ctx, LOW_CONFIDENCE, detail) {
                                    return self.halt(
                                        ctx,
                                        LOW_CONFIDENCE,
                                        "confidence never reached review threshold",
                                        Severity::High,
                                    );
                                }
                                let (next_hint, remediation) = self.consult(LOW_CONFIDENCE);
                                hint = Some(next_hint);
                                pending = Some(remediation);
                                continue;
                            }

                            // 门槛越过：若在验证低置信修复策略，记一次成功
                            if pending
                                .as_ref()
                                .map_or(false, |p| p.category == LOW_CONFIDENCE)
                            {
                                self.settle(&mut pending, CorrectionOutcome::Success);
                            }
                            ctx.advance(Stage::PolicyReview, "confidence cleared review threshold");
                        }
                        Ok(other) => {
                            self.settle(&mut pending, CorrectionOutcome::Failure);
                            if !self.fail_cycle(
                                &mut ctx,
                                "reasoning_failure",
                                format!("unexpected outcome {:?}", other),
                            ) {
                                return self.halt(
                                    ctx,
                                    "reasoning_failure",
                                    "reasoning kept failing",
                                    Severity::Critical,
                                );
                            }
                        }
                        Err(e) => {
                            self.settle(&mut pending, CorrectionOutcome::Failure);
                            if !self.fail_cycle(&mut ctx, "reasoning_failure", e.to_string()) {
                                return self.halt(
                                    ctx,
                                    "reasoning_failure",
                                    "reasoning kept failing",
                                    Severity::Critical,
                                );
                            }
                        }
                    }
                }

                Stage::PolicyReview => {
                    let Some(candidate) = ctx.candidate_output.clone() else {
                        ctx.advance(Stage::Reasoning, "missing candidate, re-entering reasoning");
                        continue;
                    };
                    let wait = Duration::from_secs(self.config.result_wait_timeout_secs);
                    let verdict =
                        match tokio::time::timeout(wait, self.reviewer.review(&candidate)).await {
                            Err(_) => Err("policy review timed out".to_string()),
                            Ok(Err(e)) => Err(format!("policy review failed: {}", e)),
                            Ok(Ok(v)) => Ok(v),
                        };

                    match verdict {
                        Err(e) => {
                            if !self.fail_cycle(&mut ctx, "review_failure", e) {
                                self.settle(&mut pending, CorrectionOutcome::Failure);
                                return self.halt(
                                    ctx,
                                    "review_failure",
                                    "policy review kept failing",
                                    Severity::Critical,
                                );
                            }
                            ctx.advance(Stage::Reasoning, "review failed, re-entering reasoning");
                        }
                        Ok(v) if v.accepted => {
                            // 审查通过：候选转正；在验证中的否决修复策略记成功
                            self.settle(&mut pending, CorrectionOutcome::Success);
                            ctx.final_output = ctx.candidate_output.clone();
                            ctx.advance(Stage::Complete, "policy review accepted candidate");
                            tracing::info!(request = %ctx.id, "Pipeline run complete");
                            return ctx;
                        }
                        Ok(v) => {
                            let category = format!("policy_rejection:{}", v.reason_tag);
                            // 每次否决恰好落一条失败记录：有待验证策略则由它收尾，
                            // 否则为本轮初始候选记一条
                            if pending.is_some() {
                                self.settle(&mut pending, CorrectionOutcome::Failure);
                            } else {
                                self.corrections.record(CorrectionRecord::new(
                                    category.clone(),
                                    StrategyDescriptor {
                                        name: "initial_candidate".to_string(),
                                        adjustment_hint: String::new(),
                                    },
                                    CorrectionOutcome::Failure,
                                    format!(
                                        "Revise the candidate to address policy concern: {}",
                                        v.reason_tag
                                    ),
                                ));
                            }

                            if !self.fail_cycle(
                                &mut ctx,
                                "policy_rejection",
                                format!("candidate rejected: {}", v.reason_tag),
                            ) {
                                return self.halt(
                                    ctx,
                                    "policy_rejection",
                                    format!("rejected beyond retry budget: {}", v.reason_tag),
                                    Severity::High,
                                );
                            }

                            let (next_hint, remediation) = self.consult(&category);
                            hint = Some(next_hint);
                            pending = Some(remediation);
                            ctx.advance(
                                Stage::Reasoning,
                                "policy rejected, retrying with correction hint",
                            );
                        }
                    }
                }

                // clarify() 在 Reasoning 分支内就地处理，这里只作为防御分支
                Stage::AwaitingClarification => {
                    ctx.advance(Stage::Perceiving, "re-entering perception");
                }

                Stage::Complete | Stage::Halted => return ctx,
            }
        }
    }

    /// 提交任务并限时等待结果
    ///
    /// QueueFull / 超时 / 任务失败对调用方是同一类可重试条件，由重试预算统一裁决。
    async fn run_job(
        &self,
        payload: JobPayload,
        ctx: &RequestContext,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, CoreError> {
        // 重试中的请求优先于新到请求
        let job = Job::new(payload).with_priority(ctx.retry_count as i32);
        let job_id = self.dispatcher.submit(job)?;

        let wait = Duration::from_secs(self.config.result_wait_timeout_secs);
        let result = self.dispatcher.await_result(job_id, wait, cancel).await?;
        result.payload.map_err(CoreError::JobFailure)
    }

    /// 记录异常并消耗一次重试预算；预算仍有剩余返回 true
    ///
    /// 边界含入：max_retries = 0 表示一次也不重试。
    fn fail_cycle(&self, ctx: &mut RequestContext, kind: &str, detail: String) -> bool {
        tracing::warn!(request = %ctx.id, kind, "Cycle failed: {}", detail);
        ctx.add_anomaly(kind, detail, Severity::Medium);
        if ctx.retry_count >= self.config.max_retries {
            return false;
        }
        ctx.retry_count += 1;
        true
    }

    /// 查纠错记忆并生成下一轮提示与待验证策略
    fn consult(&self, category: &str) -> (String, PendingRemediation) {
        match self.corrections.lookup(category) {
            Some(rec) => {
                tracing::debug!(category, strategy = %rec.strategy.name, "Reusing prior correction");
                let hint = rec.prevention_note.clone();
                (
                    hint.clone(),
                    PendingRemediation {
                        category: category.to_string(),
                        strategy: StrategyDescriptor {
                            name: format!("reuse:{}", rec.strategy.name),
                            adjustment_hint: hint.clone(),
                        },
                        note: hint,
                    },
                )
            }
            None => {
                let hint = format!("Previous attempt failed with {}; adjust the approach.", category);
                (
                    hint.clone(),
                    PendingRemediation {
                        category: category.to_string(),
                        strategy: StrategyDescriptor {
                            name: "baseline_retry".to_string(),
                            adjustment_hint: hint.clone(),
                        },
                        note: hint,
                    },
                )
            }
        }
    }

    /// 把待验证的修复策略落盘为一条纠错记录
    fn settle(&self, pending: &mut Option<PendingRemediation>, outcome: CorrectionOutcome) {
        if let Some(p) = pending.take() {
            self.corrections.record(CorrectionRecord::new(
                p.category, p.strategy, outcome, p.note,
            ));
        }
    }

    /// 澄清子对话：限时等待回答，空回答视为过期
    async fn clarify(&self, ctx: &mut RequestContext, question: &str) -> ClarifyStep {
        ctx.clarification_attempts += 1;
        let wait = Duration::from_secs(self.config.clarification_timeout_secs);
        let answer = match tokio::time::timeout(wait, self.clarifier.ask(question)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                ctx.add_anomaly(
                    "clarification_failure",
                    format!("clarification channel failed: {}", e),
                    Severity::Medium,
                );
                String::new()
            }
            Err(_) => String::new(),
        };

        let answer = answer.trim().to_string();
        if answer.is_empty() {
            ctx.add_anomaly(
                "clarification_expired",
                "clarification wait expired or answer was empty",
                Severity::Medium,
            );
            if ctx.clarification_attempts >= self.config.max_clarifications {
                return ClarifyStep::Exhausted;
            }
            return ClarifyStep::Expired;
        }

        tracing::debug!(request = %ctx.id, "Clarification answer merged");
        ctx.clarifications.push(answer);
        ClarifyStep::Merged
    }

    /// 终止：写入非空回退输出与收束异常
    fn halt(
        &self,
        mut ctx: RequestContext,
        kind: &str,
        detail: impl Into<String>,
        severity: Severity,
    ) -> RequestContext {
        ctx.add_anomaly(kind, detail, severity);
        ctx.final_output = Some(self.config.fallback_output.clone());
        ctx.advance(Stage::Halted, format!("pipeline halted: {}", kind));
        tracing::warn!(request = %ctx.id, "Pipeline halted: {}", kind);
        ctx
    }
}

/// 澄清子对话的推进结果
enum ClarifyStep {
    /// 拿到回答并已并入上下文
    Merged,
    /// 过期 / 空回答，但预算未耗尽
    Expired,
    /// 预算耗尽
    Exhausted,
}
