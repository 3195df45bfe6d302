//! 外部协作者接口
//!
//! 感知 / 推理 / 策略审查 / 知识检索 / 澄清通道。全部先构造、后经构造函数显式注入，
//! 不使用延迟闭包；协作者失败经 Err(String) 返回，从不以进程终止的方式暴露。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::RequestContext;

/// 感知结果：请求摘要与供知识检索使用的键
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Analysis {
    pub summary: String,
    pub knowledge_keys: Vec<String>,
}

/// 候选回答：输出、置信度、歧义标记与可选的澄清问题
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub output: String,
    /// 0~1
    pub confidence: f64,
    /// 为 true 时编排器可发起澄清子对话
    pub ambiguous: bool,
    /// 歧义时建议向用户提出的问题
    pub clarification_question: Option<String>,
}

/// 审查裁决
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub accepted: bool,
    /// 否决原因标签，用于纠错记忆的类别键
    pub reason_tag: String,
}

/// 感知：分析请求快照；须响应取消信号，并在调用方的软期限内返回
#[async_trait]
pub trait PerceptionProvider: Send + Sync {
    async fn perceive(
        &self,
        snapshot: &RequestContext,
        cancel: &CancellationToken,
    ) -> Result<Analysis, String>;
}

/// 推理：基于感知结果、知识片段与可选调整提示产出候选回答
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    async fn reason(
        &self,
        snapshot: &RequestContext,
        analysis: &Analysis,
        snippets: &[String],
        hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Candidate, String>;
}

/// 策略审查：对候选输出给出接受 / 否决裁决
#[async_trait]
pub trait PolicyReviewer: Send + Sync {
    async fn review(&self, candidate_output: &str) -> Result<Verdict, String>;
}

/// 知识检索：按键返回零或多条片段；可为空，受与其它协作者相同的超时约束
#[async_trait]
pub trait KnowledgeLookup: Send + Sync {
    async fn lookup(&self, keys: &[String]) -> Result<Vec<String>, String>;
}

/// 澄清通道：唯一跨越到人类 / 外部参与者的接口
///
/// 等待上限由编排器施加；空回答视为过期。
#[async_trait]
pub trait ClarificationChannel: Send + Sync {
    async fn ask(&self, question: &str) -> Result<String, String>;
}
