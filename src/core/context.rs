//! 请求上下文：贯穿管线的工作单元
//!
//! stage 只向前推进；final_output 仅在终态设置一次；anomalies 与 history 只追加、不清除。
//! 单个 RequestContext 由唯一一次 run 调用独占，不存在并发修改。

use serde::{Deserialize, Serialize};

/// 请求所处的处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// 已接收，尚未开始处理
    Received,
    /// 感知：理解请求
    Perceiving,
    /// 推理：产出候选回答
    Reasoning,
    /// 策略审查
    PolicyReview,
    /// 等待用户澄清
    AwaitingClarification,
    /// 已完成（终态）
    Complete,
    /// 已终止（终态）
    Halted,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Halted)
    }
}

/// 异常严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Medium,
    High,
    Critical,
}

/// 处理过程中记录的异常；整个请求生命周期内累积，重试不清除
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: String,
    pub detail: String,
    pub severity: Severity,
}

/// 阶段变迁日志条目（写入后不再修改，仅供事后检查与测试）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub stage: Stage,
    /// 毫秒时间戳
    pub timestamp: i64,
    pub note: String,
}

/// 请求上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// 请求 ID，创建后不变
    pub id: String,
    /// 所属会话 ID，创建后不变
    pub conversation_id: String,
    /// 原始用户输入
    pub input: String,
    pub stage: Stage,
    pub retry_count: u32,
    pub clarification_attempts: u32,
    /// 最近一次推理给出的置信度（0~1）
    pub confidence: f64,
    pub anomalies: Vec<Anomaly>,
    /// 最近一轮推理的候选输出
    pub candidate_output: Option<String>,
    /// 仅在转入 Complete / Halted 时设置一次
    pub final_output: Option<String>,
    /// 已采纳的澄清回答，感知阶段可见
    pub clarifications: Vec<String>,
    pub history: Vec<HistoryEntry>,
}

impl RequestContext {
    pub fn new(conversation_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: format!("req_{}", uuid::Uuid::new_v4()),
            conversation_id: conversation_id.into(),
            input: input.into(),
            stage: Stage::Received,
            retry_count: 0,
            clarification_attempts: 0,
            confidence: 0.0,
            anomalies: Vec::new(),
            candidate_output: None,
            final_output: None,
            clarifications: Vec::new(),
            history: Vec::new(),
        }
    }

    /// 推进阶段并记录一条历史
    pub(crate) fn advance(&mut self, stage: Stage, note: impl Into<String>) {
        self.stage = stage;
        self.history.push(HistoryEntry {
            stage,
            timestamp: chrono::Utc::now().timestamp_millis(),
            note: note.into(),
        });
    }

    pub(crate) fn add_anomaly(
        &mut self,
        kind: impl Into<String>,
        detail: impl Into<String>,
        severity: Severity,
    ) {
        self.anomalies.push(Anomaly {
            kind: kind.into(),
            detail: detail.into(),
            severity,
        });
    }

    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal()
    }

    /// 是否存在指定类别的异常
    pub fn has_anomaly(&self, kind: &str) -> bool {
        self.anomalies.iter().any(|a| a.kind == kind)
    }
}
