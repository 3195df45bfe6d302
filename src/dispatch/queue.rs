//! 有界优先队列
//!
//! 优先级高者先出，同优先级按提交顺序 FIFO；容量满时入队失败（背压信号），
//! 已接收的任务不会被静默丢弃。

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::dispatch::Job;

struct QueuedJob {
    priority: i32,
    /// 提交序号，同优先级下序号小者先出
    seq: u64,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // 最大堆：先比优先级，再让较早的提交排前
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// 有界优先队列（非线程安全，由外层分发器加锁）
pub(crate) struct BoundedPriorityQueue {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
    capacity: usize,
}

impl BoundedPriorityQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            next_seq: 0,
            capacity,
        }
    }

    /// 入队；容量已满时原样退回任务
    pub fn push(&mut self, job: Job) -> Result<(), Job> {
        if self.heap.len() >= self.capacity {
            return Err(job);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedJob {
            priority: job.priority,
            seq,
            job,
        });
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.heap.pop().map(|q| q.job)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// 丢弃所有未开始的任务（shutdown 强制取消时）
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
