//! 纠错记忆：按错误类别存取修复记录
//!
//! 只追加的环形日志；lookup 优先返回同类别最近一次成功的记录，
//! 否则退回同类别最近一次任意结果的记录（失败经验同样可供参考）。
//! append 是唯一的修改点，内部自行加锁，调用方无需关心同步。

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// 修复策略描述：名称 + 注入下一轮推理的调整提示
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    pub name: String,
    pub adjustment_hint: String,
}

/// 修复尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionOutcome {
    Success,
    Failure,
}

/// 一次修复尝试的记录（写入后不可变）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub error_category: String,
    pub strategy: StrategyDescriptor,
    pub outcome: CorrectionOutcome,
    /// 供后续同类错误参考的预防提示
    pub prevention_note: String,
    /// 毫秒时间戳
    pub created_at: i64,
}

impl CorrectionRecord {
    pub fn new(
        error_category: impl Into<String>,
        strategy: StrategyDescriptor,
        outcome: CorrectionOutcome,
        prevention_note: impl Into<String>,
    ) -> Self {
        Self {
            error_category: error_category.into(),
            strategy,
            outcome,
            prevention_note: prevention_note.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 纠错记忆：容量有限，最旧条目先淘汰
pub struct CorrectionMemory {
    records: Mutex<VecDeque<CorrectionRecord>>,
    capacity: usize,
}

impl CorrectionMemory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// 追加一条记录；超出容量时淘汰最旧的
    pub fn record(&self, rec: CorrectionRecord) {
        let mut records = self.records.lock().expect("correction memory lock poisoned");
        if records.len() == self.capacity {
            records.pop_front();
        }
        tracing::debug!(
            category = %rec.error_category,
            outcome = ?rec.outcome,
            "Correction recorded"
        );
        records.push_back(rec);
    }

    /// 查询指定类别：优先最近一次成功，否则最近一次任意记录，没有则 None
    pub fn lookup(&self, error_category: &str) -> Option<CorrectionRecord> {
        let records = self.records.lock().expect("correction memory lock poisoned");
        records
            .iter()
            .rev()
            .find(|r| {
                r.error_category == error_category && r.outcome == CorrectionOutcome::Success
            })
            .or_else(|| records.iter().rev().find(|r| r.error_category == error_category))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("correction memory lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 指定类别的记录数（测试与诊断用）
    pub fn count_for(&self, error_category: &str) -> usize {
        self.records
            .lock()
            .expect("correction memory lock poisoned")
            .iter()
            .filter(|r| r.error_category == error_category)
            .count()
    }
}
