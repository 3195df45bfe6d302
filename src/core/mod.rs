//! 核心编排层：请求上下文、错误类型、纠错记忆、阶段编排与构建器

pub mod builder;
pub mod context;
pub mod correction;
pub mod error;
pub mod orchestrator;

pub use builder::{create_pipeline_builder, Pipeline, PipelineBuilder};
pub use context::{Anomaly, HistoryEntry, RequestContext, Severity, Stage};
pub use correction::{CorrectionMemory, CorrectionOutcome, CorrectionRecord, StrategyDescriptor};
pub use error::CoreError;
pub use orchestrator::StageOrchestrator;
