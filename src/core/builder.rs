//! 管线构建器：统一的组装与依赖注入
//!
//! 协作者先构造、后注入，不使用延迟闭包；构建出的 Pipeline 持有共享的
//! 分发器与纠错记忆，可同时驱动多个请求。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{load_config, AppConfig};
use crate::core::correction::CorrectionMemory;
use crate::core::orchestrator::StageOrchestrator;
use crate::core::RequestContext;
use crate::dispatch::{CollaboratorRunner, DispatcherStats, TaskDispatcher};
use crate::providers::{
    ClarificationChannel, KnowledgeLookup, PerceptionProvider, PolicyReviewer, ReasoningProvider,
};

/// 管线构建器
pub struct PipelineBuilder {
    config: AppConfig,
    perception: Option<Arc<dyn PerceptionProvider>>,
    reasoning: Option<Arc<dyn ReasoningProvider>>,
    knowledge: Option<Arc<dyn KnowledgeLookup>>,
    reviewer: Option<Arc<dyn PolicyReviewer>>,
    clarifier: Option<Arc<dyn ClarificationChannel>>,
}

impl PipelineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            perception: None,
            reasoning: None,
            knowledge: None,
            reviewer: None,
            clarifier: None,
        }
    }

    pub fn with_perception(mut self, provider: Arc<dyn PerceptionProvider>) -> Self {
        self.perception = Some(provider);
        self
    }

    pub fn with_reasoning(mut self, provider: Arc<dyn ReasoningProvider>) -> Self {
        self.reasoning = Some(provider);
        self
    }

    pub fn with_knowledge(mut self, provider: Arc<dyn KnowledgeLookup>) -> Self {
        self.knowledge = Some(provider);
        self
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn PolicyReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn with_clarifier(mut self, clarifier: Arc<dyn ClarificationChannel>) -> Self {
        self.clarifier = Some(clarifier);
        self
    }

    /// 组装管线；任一协作者缺失时报错
    pub fn build(self) -> anyhow::Result<Pipeline> {
        let perception = self
            .perception
            .ok_or_else(|| anyhow::anyhow!("perception provider not set"))?;
        let reasoning = self
            .reasoning
            .ok_or_else(|| anyhow::anyhow!("reasoning provider not set"))?;
        let knowledge = self
            .knowledge
            .ok_or_else(|| anyhow::anyhow!("knowledge lookup not set"))?;
        let reviewer = self
            .reviewer
            .ok_or_else(|| anyhow::anyhow!("policy reviewer not set"))?;
        let clarifier = self
            .clarifier
            .ok_or_else(|| anyhow::anyhow!("clarification channel not set"))?;

        let runner = Arc::new(CollaboratorRunner::new(perception, reasoning, knowledge));
        let dispatcher = Arc::new(TaskDispatcher::new(
            self.config.dispatcher.queue_capacity,
            self.config.dispatcher.worker_count,
            runner,
        ));
        let corrections = Arc::new(CorrectionMemory::new(self.config.memory.correction_capacity));
        let orchestrator = Arc::new(StageOrchestrator::new(
            Arc::clone(&dispatcher),
            Arc::clone(&corrections),
            reviewer,
            clarifier,
            self.config.pipeline.clone(),
        ));

        Ok(Pipeline {
            orchestrator,
            dispatcher,
            corrections,
            config: self.config,
        })
    }
}

/// 组装完成的管线：分发器与纠错记忆可跨请求共享
pub struct Pipeline {
    orchestrator: Arc<StageOrchestrator>,
    dispatcher: Arc<TaskDispatcher>,
    corrections: Arc<CorrectionMemory>,
    config: AppConfig,
}

impl Pipeline {
    /// 处理一个请求直至终态；可多请求并发调用
    pub async fn run(
        &self,
        conversation_id: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> RequestContext {
        let ctx = RequestContext::new(conversation_id, input);
        self.orchestrator.run(ctx, cancel).await
    }

    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    pub fn corrections(&self) -> &Arc<CorrectionMemory> {
        &self.corrections
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 关闭底层分发器：限时排空后强制取消
    pub async fn shutdown(&self) {
        self.dispatcher
            .shutdown(Duration::from_secs(self.config.dispatcher.drain_timeout_secs))
            .await;
    }
}

/// 便捷函数：从默认路径加载配置并创建构建器
pub fn create_pipeline_builder(config_path: Option<PathBuf>) -> PipelineBuilder {
    let config = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    PipelineBuilder::new(config)
}
