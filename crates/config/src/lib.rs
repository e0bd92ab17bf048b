//! courier-config - 配置加载库
//!
//! 所有开关都在这里显式加载，再通过构造函数传给各组件，运行期不读取进程级环境变量

use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] figment::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 消息后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// librdkafka
    #[default]
    Kafka,
    /// 进程内 broker（测试、本地开发）
    Memory,
}

/// 消费模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerMode {
    /// 单连接轮询，手动提交
    Poll,
    /// 消费组，分区认领回调
    #[default]
    Group,
}

/// 自动偏移重置策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoOffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl AutoOffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoOffsetReset::Earliest => "earliest",
            AutoOffsetReset::Latest => "latest",
        }
    }
}

/// 生产者确认模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerAcks {
    /// 等待所有 ISR 副本
    #[default]
    All,
    /// 仅 leader
    Leader,
    /// 不等待
    None,
}

impl ProducerAcks {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProducerAcks::All => "all",
            ProducerAcks::Leader => "1",
            ProducerAcks::None => "0",
        }
    }
}

/// SASL 认证机制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SaslMechanism {
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SASL 配置
#[derive(Debug, Clone, Deserialize)]
pub struct SaslConfig {
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: Secret<String>,
}

/// SSL 配置
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SslConfig {
    /// CA 证书路径
    pub ca_location: Option<String>,
    /// 客户端证书路径
    pub certificate_location: Option<String>,
    /// 客户端私钥路径
    pub key_location: Option<String>,
    /// 私钥密码
    pub key_password: Option<Secret<String>>,
    /// 是否校验服务端主机名
    #[serde(default = "default_true")]
    pub verify_hostname: bool,
}

fn default_true() -> bool {
    true
}

/// 退避配置
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_backoff_initial_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

/// 消息队列配置
#[derive(Debug, Clone, Deserialize)]
pub struct MessagingConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub consumer_mode: ConsumerMode,
    /// Broker 地址列表（逗号分隔）
    #[serde(default = "default_brokers")]
    pub brokers: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    pub client_id: Option<String>,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub auto_offset_reset: AutoOffsetReset,
    #[serde(default)]
    pub producer_acks: ProducerAcks,
    #[serde(default = "default_producer_retries")]
    pub producer_retries: u32,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    /// 消费组已标记 offset 的提交间隔
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,
    /// 轮询遇到瞬时错误后的退避
    #[serde(default)]
    pub transient_backoff: BackoffConfig,
    /// 消费组会话失败后重新加入的退避
    #[serde(default)]
    pub rejoin_backoff: BackoffConfig,
    pub sasl: Option<SaslConfig>,
    pub ssl: Option<SslConfig>,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_group_id() -> String {
    "courier-consumer".to_string()
}

fn default_session_timeout_ms() -> u64 {
    6000
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_producer_retries() -> u32 {
    5
}

fn default_delivery_timeout_ms() -> u64 {
    30000
}

fn default_commit_interval_ms() -> u64 {
    1000
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            consumer_mode: ConsumerMode::default(),
            brokers: default_brokers(),
            group_id: default_group_id(),
            client_id: None,
            session_timeout_ms: default_session_timeout_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            auto_offset_reset: AutoOffsetReset::default(),
            producer_acks: ProducerAcks::default(),
            producer_retries: default_producer_retries(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            commit_interval_ms: default_commit_interval_ms(),
            transient_backoff: BackoffConfig::default(),
            rejoin_backoff: BackoffConfig::default(),
            sasl: None,
            ssl: None,
        }
    }
}

impl MessagingConfig {
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            ..Default::default()
        }
    }

    /// 进程内 broker 配置
    pub fn memory(group_id: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Memory,
            group_id: group_id.into(),
            ..Default::default()
        }
    }

    pub fn with_consumer_mode(mut self, mode: ConsumerMode) -> Self {
        self.consumer_mode = mode;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_auto_offset_reset(mut self, reset: AutoOffsetReset) -> Self {
        self.auto_offset_reset = reset;
        self
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == BackendKind::Kafka && self.brokers.trim().is_empty() {
            return Err(ConfigError::Invalid("brokers must not be empty".to_string()));
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::Invalid("group_id must not be empty".to_string()));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.session_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "session_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// 遥测配置
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// JSON 格式日志（生产环境）
    #[serde(default)]
    pub json: bool,
    /// 安装 Prometheus recorder
    #[serde(default)]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
            metrics_enabled: false,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_name: String,
    #[serde(default = "default_app_env")]
    pub app_env: String,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_app_env() -> String {
    "development".to_string()
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 依次合并 `default.toml`、`{env}.toml` 和 `COURIER_` 前缀的环境变量
    /// （嵌套字段用 `__` 分隔，例如 `COURIER_MESSAGING__BROKERS`）
    pub fn load(config_dir: &str, env: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Toml::file(format!("{}/default.toml", config_dir)))
            .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
            .merge(Env::prefixed("COURIER_").split("__"));

        Self::from_figment(figment)
    }

    /// 从已组装好的 Figment 提取并校验
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.messaging.validate()?;
        Ok(config)
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }
}
