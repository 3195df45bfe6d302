//! 管线错误类型
//!
//! 协作者错误在 worker 边界折叠为 JobFailure；QueueFull 是背压信号而非故障；
//! Timeout 与 JobFailure 区分（任务可能仍在运行）；BoundExhausted 是唯一改变终态的错误。

use thiserror::Error;

use crate::dispatch::JobId;

/// 管线运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum CoreError {
    /// 协作者调用失败（可重试，消耗一次重试预算）
    #[error("Job failed: {0}")]
    JobFailure(String),

    /// 队列已满：由调用方决定削峰或稍后重试
    #[error("Dispatch queue is full")]
    QueueFull,

    /// 限时等待到期；任务可能仍在运行，之后的等待仍可能认领一次
    #[error("Result wait timed out")]
    ResultTimeout,

    /// 结果已被认领或 id 未知
    #[error("Result not found or already claimed: {0}")]
    ResultNotFound(JobId),

    /// 审查否决：正常业务结果，不是故障
    #[error("Policy review rejected the candidate: {0}")]
    PolicyRejected(String),

    /// 重试或澄清预算耗尽，请求转入 Halted
    #[error("Retry or clarification budget exhausted: {0}")]
    BoundExhausted(String),

    #[error("Cancelled")]
    Cancelled,

    /// 分发器已开始关闭，不再接收新任务
    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}
