//! 协作者执行器：把任务载荷映射到对应的外部协作者调用
//!
//! 分发器本身不关心任务语义；worker 通过本执行器触达感知 / 推理 / 知识检索。

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{Job, JobOutcome, JobPayload};
use crate::providers::{KnowledgeLookup, PerceptionProvider, ReasoningProvider};

/// worker 执行任务体的接口
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &Job, cancel: &CancellationToken) -> Result<JobOutcome, String>;
}

/// 标准执行器：持有三个异步协作者
pub struct CollaboratorRunner {
    perception: Arc<dyn PerceptionProvider>,
    reasoning: Arc<dyn ReasoningProvider>,
    knowledge: Arc<dyn KnowledgeLookup>,
}

impl CollaboratorRunner {
    pub fn new(
        perception: Arc<dyn PerceptionProvider>,
        reasoning: Arc<dyn ReasoningProvider>,
        knowledge: Arc<dyn KnowledgeLookup>,
    ) -> Self {
        Self {
            perception,
            reasoning,
            knowledge,
        }
    }
}

#[async_trait]
impl JobRunner for CollaboratorRunner {
    async fn run(&self, job: &Job, cancel: &CancellationToken) -> Result<JobOutcome, String> {
        match &job.payload {
            JobPayload::Perceive { snapshot } => self
                .perception
                .perceive(snapshot, cancel)
                .await
                .map(JobOutcome::Analysis),
            JobPayload::Reason {
                snapshot,
                analysis,
                snippets,
                hint,
            } => self
                .reasoning
                .reason(snapshot, analysis, snippets, hint.as_deref(), cancel)
                .await
                .map(JobOutcome::Candidate),
            JobPayload::LookupKnowledge { keys } => self
                .knowledge
                .lookup(keys)
                .await
                .map(JobOutcome::Snippets),
        }
    }
}
