//! Wasp - 推理编排内核
//!
//! 驱动单个用户请求走完 感知 → 推理 → 策略审查 的固定阶段序列，
//! 低置信时有界重试，歧义时发起澄清子对话，推理工作经异步 worker 池执行。
//! 本 crate 是纯库：宿主进程注入协作者（感知 / 推理 / 审查 / 知识 / 澄清）后嵌入使用。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 请求上下文、阶段编排、纠错记忆、错误类型与构建器
//! - **dispatch**: 有界优先队列 + worker 池的任务分发器
//! - **providers**: 外部协作者接口与 Mock 实现
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod dispatch;
pub mod observability;
pub mod providers;

pub use crate::core::{Pipeline, PipelineBuilder, RequestContext, Stage};
