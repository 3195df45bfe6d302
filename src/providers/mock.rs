//! Mock 协作者（用于测试，无需真实后端）
//!
//! 每个 Mock 维护一个脚本队列：有脚本时按序弹出，耗尽后退回默认行为；
//! 并用计数器记录调用次数，便于断言。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::RequestContext;
use crate::providers::{
    Analysis, Candidate, ClarificationChannel, KnowledgeLookup, PerceptionProvider,
    PolicyReviewer, ReasoningProvider, Verdict,
};

/// Mock 感知：默认回显输入摘要；可脚本化或设为恒失败
#[derive(Default)]
pub struct MockPerception {
    script: Mutex<VecDeque<Result<Analysis, String>>>,
    fail_with: Option<String>,
    calls: AtomicUsize,
}

impl MockPerception {
    pub fn new() -> Self {
        Self::default()
    }

    /// 恒失败版本（模拟持续故障的协作者）
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_script(results: impl IntoIterator<Item = Result<Analysis, String>>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PerceptionProvider for MockPerception {
    async fn perceive(
        &self,
        snapshot: &RequestContext,
        _cancel: &CancellationToken,
    ) -> Result<Analysis, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = &self.fail_with {
            return Err(msg.clone());
        }
        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return scripted;
        }
        // 默认：摘要 = 输入 + 已采纳的澄清
        let mut summary = format!("analysis of: {}", snapshot.input);
        for c in &snapshot.clarifications {
            summary.push_str(&format!(" | clarified: {}", c));
        }
        Ok(Analysis {
            summary,
            knowledge_keys: Vec::new(),
        })
    }
}

/// Mock 推理：默认高置信、无歧义；置信度与歧义标记可配置
#[derive(Default)]
pub struct MockReasoning {
    script: Mutex<VecDeque<Result<Candidate, String>>>,
    fail_with: Option<String>,
    confidence: Option<f64>,
    ambiguous: bool,
    calls: AtomicUsize,
}

impl MockReasoning {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_script(results: impl IntoIterator<Item = Result<Candidate, String>>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            ..Self::default()
        }
    }

    /// 固定置信度（默认 0.9）
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// 恒歧义（触发澄清子对话）
    pub fn with_ambiguous(mut self) -> Self {
        self.ambiguous = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningProvider for MockReasoning {
    async fn reason(
        &self,
        snapshot: &RequestContext,
        analysis: &Analysis,
        snippets: &[String],
        hint: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<Candidate, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = &self.fail_with {
            return Err(msg.clone());
        }
        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return scripted;
        }
        let mut output = format!("draft answer for [{}]", analysis.summary);
        if !snippets.is_empty() {
            output.push_str(&format!(" using {} snippets", snippets.len()));
        }
        if let Some(h) = hint {
            output.push_str(&format!(" (adjusted: {})", h));
        }
        Ok(Candidate {
            output,
            confidence: self.confidence.unwrap_or(0.9),
            ambiguous: self.ambiguous,
            clarification_question: if self.ambiguous {
                Some(format!("What exactly do you mean by '{}'?", snapshot.input))
            } else {
                None
            },
        })
    }
}

/// Mock 审查：默认接受；可脚本化一串裁决或设为恒否决
#[derive(Default)]
pub struct MockReviewer {
    script: Mutex<VecDeque<Verdict>>,
    always_reject: Option<String>,
    calls: AtomicUsize,
}

impl MockReviewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(reason_tag: &str) -> Self {
        Self {
            always_reject: Some(reason_tag.to_string()),
            ..Self::default()
        }
    }

    /// 按序返回脚本裁决，耗尽后接受
    pub fn with_script(verdicts: impl IntoIterator<Item = Verdict>) -> Self {
        Self {
            script: Mutex::new(verdicts.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn reject(reason_tag: &str) -> Verdict {
        Verdict {
            accepted: false,
            reason_tag: reason_tag.to_string(),
        }
    }

    pub fn accept() -> Verdict {
        Verdict {
            accepted: true,
            reason_tag: String::new(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyReviewer for MockReviewer {
    async fn review(&self, _candidate_output: &str) -> Result<Verdict, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(tag) = &self.always_reject {
            return Ok(Self::reject(tag));
        }
        if let Some(verdict) = self.script.lock().unwrap().pop_front() {
            return Ok(verdict);
        }
        Ok(Self::accept())
    }
}

/// Mock 知识检索：固定返回一组片段
#[derive(Default)]
pub struct MockKnowledge {
    snippets: Vec<String>,
    fail_with: Option<String>,
    calls: AtomicUsize,
}

impl MockKnowledge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snippets(snippets: Vec<String>) -> Self {
        Self {
            snippets,
            ..Self::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KnowledgeLookup for MockKnowledge {
    async fn lookup(&self, _keys: &[String]) -> Result<Vec<String>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = &self.fail_with {
            return Err(msg.clone());
        }
        Ok(self.snippets.clone())
    }
}

/// Mock 澄清通道：固定回答 / 空回答 / 永不回答（触发编排器超时）
pub struct MockClarifier {
    answer: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockClarifier {
    pub fn with_answer(answer: &str) -> Self {
        Self {
            answer: Some(answer.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// 立即返回空回答（等价于过期）
    pub fn empty() -> Self {
        Self {
            answer: Some(String::new()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// 永不回答；编排器侧的超时负责解除等待
    pub fn never() -> Self {
        Self {
            answer: None,
            delay: Some(Duration::from_secs(3600)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClarificationChannel for MockClarifier {
    async fn ask(&self, _question: &str) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.answer.clone().unwrap_or_default())
    }
}
