//! 任务单元：Job / JobResult 与载荷类型
//!
//! 每次提交生成唯一 JobId；结果表中每个 id 的结果恰好被提交方认领一次。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::RequestContext;
use crate::providers::{Analysis, Candidate};

/// 任务 ID（进程内全局递增）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct JobId(u64);

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(0);

impl JobId {
    pub fn new() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job_{}", self.0)
    }
}

/// 任务类别
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum JobKind {
    Perceive,
    Reason,
    LookupKnowledge,
}

/// 任务载荷：各阶段所需输入
#[derive(Debug, Clone)]
pub enum JobPayload {
    /// 感知：请求快照
    Perceive { snapshot: RequestContext },
    /// 推理：快照 + 感知结果 + 知识片段 + 可选调整提示
    Reason {
        snapshot: RequestContext,
        analysis: Analysis,
        snippets: Vec<String>,
        hint: Option<String>,
    },
    /// 知识检索
    LookupKnowledge { keys: Vec<String> },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Perceive { .. } => JobKind::Perceive,
            JobPayload::Reason { .. } => JobKind::Reason,
            JobPayload::LookupKnowledge { .. } => JobKind::LookupKnowledge,
        }
    }
}

/// 提交给分发器的任务
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: JobPayload,
    /// 数值越大越先出队；同优先级按提交顺序
    pub priority: i32,
}

impl Job {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            id: JobId::new(),
            kind: payload.kind(),
            payload,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// 任务产出：与 JobKind 一一对应
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Analysis(Analysis),
    Candidate(Candidate),
    Snippets(Vec<String>),
}

/// 任务结果：由 worker 产出，结果表中由唯一等待者认领
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: JobId,
    /// 协作者错误与 worker panic 统一折叠为 Err
    pub payload: Result<JobOutcome, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_payload_kind() {
        let payload = JobPayload::LookupKnowledge {
            keys: vec!["k".to_string()],
        };
        assert_eq!(payload.kind(), JobKind::LookupKnowledge);
        let job = Job::new(payload).with_priority(3);
        assert_eq!(job.kind, JobKind::LookupKnowledge);
        assert_eq!(job.priority, 3);
    }
}
