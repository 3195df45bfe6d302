//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WASP__*` 覆盖（双下划线表示嵌套，
//! 如 `WASP__PIPELINE__MAX_RETRIES=5`）。所有键都有显式默认值，宿主不配置也可直接运行。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub memory: MemorySection,
}

/// [pipeline] 段：重试 / 澄清预算、置信度门槛与各类等待上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// 单个请求的重试预算（感知、推理、知识检索与审查失败共用）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 澄清子对话的轮数上限
    #[serde(default = "default_max_clarifications")]
    pub max_clarifications: u32,
    /// 低于该置信度的候选不进入审查，触发带提示的重试
    #[serde(default = "default_min_confidence_to_review")]
    pub min_confidence_to_review: f64,
    /// 等待用户澄清回答的上限（秒）
    #[serde(default = "default_clarification_timeout_secs")]
    pub clarification_timeout_secs: u64,
    /// 等待单个任务结果的上限（秒）
    #[serde(default = "default_result_wait_timeout_secs")]
    pub result_wait_timeout_secs: u64,
    /// Halted 时返回给调用方的回退输出，不允许为空
    #[serde(default = "default_fallback_output")]
    pub fallback_output: String,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_clarifications() -> u32 {
    2
}

fn default_min_confidence_to_review() -> f64 {
    0.5
}

fn default_clarification_timeout_secs() -> u64 {
    30
}

fn default_result_wait_timeout_secs() -> u64 {
    60
}

fn default_fallback_output() -> String {
    "The request could not be completed; no reviewed answer was produced.".to_string()
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_clarifications: default_max_clarifications(),
            min_confidence_to_review: default_min_confidence_to_review(),
            clarification_timeout_secs: default_clarification_timeout_secs(),
            result_wait_timeout_secs: default_result_wait_timeout_secs(),
            fallback_output: default_fallback_output(),
        }
    }
}

/// [dispatcher] 段：队列容量、worker 数与关闭时的排空上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    /// 等待队列容量；满载时 submit 快速失败（背压信号）
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// shutdown 时等待在途任务完成的上限（秒），超时后强制取消
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_worker_count() -> usize {
    4
}

fn default_drain_timeout_secs() -> u64 {
    5
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            worker_count: default_worker_count(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// [memory] 段：纠错记忆容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// 纠错记录环形日志容量；超出时淘汰最旧条目
    #[serde(default = "default_correction_capacity")]
    pub correction_capacity: usize,
}

fn default_correction_capacity() -> usize {
    256
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            correction_capacity: default_correction_capacity(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineSection::default(),
            dispatcher: DispatcherSection::default(),
            memory: MemorySection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 WASP__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WASP__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WASP")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
