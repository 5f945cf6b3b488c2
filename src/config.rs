//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `COUNCIL__*` 覆盖（双下划线表示嵌套，如 `COUNCIL__CONSENSUS__THRESHOLD=0.75`）。
//! 所有字段都有默认值，缺省配置即可运行。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::capability::{default_catalog, BreakerConfig, CapabilityDescriptor};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub breaker: BreakerSection,
    /// 能力目录（[[capabilities]]）；未配置时使用内置目录
    pub capabilities: CapabilityCatalog,
    pub consensus: ConsensusConfig,
    pub learning: LearningConfig,
    pub memory: MemoryConfig,
    pub metacognition: MetacognitionConfig,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 情景/语义记忆快照路径；未设置时不持久化
    pub memory_snapshot: Option<PathBuf>,
    /// 自定义执行计划（TOML）；未设置时使用默认三阶段流水线
    pub plan_file: Option<PathBuf>,
}

/// [llm] 段：推理服务后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// mock / openai
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// API Key；未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
        }
    }
}

/// [capabilities]：包装一层以便提供非空默认值
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct CapabilityCatalog(pub Vec<CapabilityDescriptor>);

impl Default for CapabilityCatalog {
    fn default() -> Self {
        Self(default_catalog())
    }
}

/// [breaker] 段：全局默认阈值，按角色调整后再叠加 overrides.<capability_id>
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub max_failures: u32,
    pub cooldown_ms: u64,
    pub half_open_tests: u32,
    pub reset_timeout_ms: u64,
    /// 周期清扫间隔
    pub sweep_interval_ms: u64,
    pub overrides: HashMap<String, BreakerOverride>,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            max_failures: 5,
            cooldown_ms: 30_000,
            half_open_tests: 2,
            reset_timeout_ms: 300_000,
            sweep_interval_ms: 5_000,
            overrides: HashMap::new(),
        }
    }
}

/// 单个能力的熔断阈值覆盖（未给出的字段沿用角色默认值）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BreakerOverride {
    pub max_failures: Option<u32>,
    pub cooldown_ms: Option<u64>,
    pub half_open_tests: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
}

impl BreakerSection {
    pub fn base(&self) -> BreakerConfig {
        BreakerConfig {
            max_failures: self.max_failures.max(1),
            cooldown: Duration::from_millis(self.cooldown_ms),
            half_open_tests: self.half_open_tests.max(1),
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
        }
    }

    /// 每个能力的最终配置：角色默认值 + 覆盖
    pub fn resolve(&self, capabilities: &[CapabilityDescriptor]) -> HashMap<String, BreakerConfig> {
        let base = self.base();
        capabilities
            .iter()
            .map(|d| {
                let mut c = BreakerConfig::for_role(d.role, base);
                if let Some(o) = self.overrides.get(&d.id) {
                    if let Some(v) = o.max_failures {
                        c.max_failures = v.max(1);
                    }
                    if let Some(v) = o.cooldown_ms {
                        c.cooldown = Duration::from_millis(v);
                    }
                    if let Some(v) = o.half_open_tests {
                        c.half_open_tests = v.max(1);
                    }
                    if let Some(v) = o.reset_timeout_ms {
                        c.reset_timeout = Duration::from_millis(v);
                    }
                }
                (d.id.clone(), c)
            })
            .collect()
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// [consensus] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// 主导组权重占比阈值
    pub threshold: f64,
    pub max_debate_rounds: usize,
    /// 保留的投票轮次数
    pub history_capacity: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            max_debate_rounds: 5,
            history_capacity: 100,
        }
    }
}

/// [learning] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub exploration_rate: f64,
    pub exploration_floor: f64,
    pub exploration_cap: f64,
    pub learning_rate: f64,
    pub learning_rate_floor: f64,
    pub learning_rate_cap: f64,
    /// 每个能力保留的奖励条数（仅用于趋势判断）
    pub reward_history: usize,
    /// 优先级变化超过该值才发出更新
    pub emit_threshold: f64,
    /// 固定随机种子（测试与复现）
    pub seed: Option<u64>,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            exploration_rate: 0.15,
            exploration_floor: 0.05,
            exploration_cap: 0.3,
            learning_rate: 0.1,
            learning_rate_floor: 0.01,
            learning_rate_cap: 0.2,
            reward_history: 20,
            emit_threshold: 0.5,
            seed: None,
        }
    }
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub short_term_capacity: usize,
    pub max_hypotheses: usize,
    pub episodic_capacity: usize,
    pub semantic_capacity: usize,
    /// 模式在情景记忆中出现多少次后提升为语义洞察
    pub promotion_threshold: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_capacity: 10,
            max_hypotheses: 5,
            episodic_capacity: 500,
            semantic_capacity: 200,
            promotion_threshold: 3,
        }
    }
}

/// [metacognition] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetacognitionConfig {
    pub interval_ms: u64,
    /// 平均置信度低于该值视为异常
    pub low_confidence: f64,
    pub threshold_step: f64,
    pub threshold_min: f64,
    pub threshold_max: f64,
    /// 调整共识阈值前至少需要的投票轮次
    pub min_rounds: usize,
    /// 打开的熔断器占比达到该值视为异常
    pub open_breaker_ratio: f64,
}

impl Default for MetacognitionConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            low_confidence: 40.0,
            threshold_step: 0.05,
            threshold_min: 0.55,
            threshold_max: 0.85,
            min_rounds: 5,
            open_breaker_ratio: 0.5,
        }
    }
}

impl MetacognitionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// 从 config 目录加载配置，环境变量 COUNCIL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 COUNCIL__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("COUNCIL")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 从 TOML 文本解析（测试与嵌入式宿主使用）
pub fn from_toml_str(text: &str) -> Result<AppConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::from_str(text, config::FileFormat::Toml))
        .build()?
        .try_deserialize()
}
