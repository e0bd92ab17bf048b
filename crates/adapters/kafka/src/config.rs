//! Kafka 配置模块
//!
//! 把 `MessagingConfig` 翻译成 librdkafka 的配置项

use std::time::Duration;

use courier_config::{AutoOffsetReset, MessagingConfig, ProducerAcks, SaslConfig, SslConfig};
use rdkafka::config::ClientConfig;
use secrecy::ExposeSecret;

/// Kafka 安全协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityProtocol {
    /// 明文（默认）
    #[default]
    Plaintext,
    /// SSL
    Ssl,
    /// SASL 明文
    SaslPlaintext,
    /// SASL SSL
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    /// 根据是否配置了 SASL / SSL 推导协议
    pub fn infer(sasl: bool, ssl: bool) -> Self {
        match (sasl, ssl) {
            (false, false) => SecurityProtocol::Plaintext,
            (false, true) => SecurityProtocol::Ssl,
            (true, false) => SecurityProtocol::SaslPlaintext,
            (true, true) => SecurityProtocol::SaslSsl,
        }
    }
}

/// Kafka 基础配置
///
/// 密码保存在 `Secret` 中，只在生成配置项时展开，`Debug` 输出不会泄露
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Broker 地址列表
    pub brokers: String,
    /// 客户端 ID
    pub client_id: Option<String>,
    /// 安全协议
    pub security_protocol: SecurityProtocol,
    /// SASL 配置
    pub sasl: Option<SaslConfig>,
    /// SSL 配置
    pub ssl: Option<SslConfig>,
    /// 额外配置
    pub extra: Vec<(String, String)>,
}

impl KafkaConfig {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            client_id: None,
            security_protocol: SecurityProtocol::default(),
            sasl: None,
            ssl: None,
            extra: Vec::new(),
        }
    }

    pub fn from_messaging(config: &MessagingConfig) -> Self {
        Self {
            brokers: config.brokers.clone(),
            client_id: config.client_id.clone(),
            security_protocol: SecurityProtocol::infer(config.sasl.is_some(), config.ssl.is_some()),
            sasl: config.sasl.clone(),
            ssl: config.ssl.clone(),
            extra: Vec::new(),
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    /// 转换为 rdkafka ClientConfig 的配置项
    pub fn to_client_config_entries(&self) -> Vec<(String, String)> {
        let mut entries = vec![
            ("bootstrap.servers".to_string(), self.brokers.clone()),
            (
                "security.protocol".to_string(),
                self.security_protocol.as_str().to_string(),
            ),
        ];

        if let Some(client_id) = &self.client_id {
            entries.push(("client.id".to_string(), client_id.clone()));
        }

        if let Some(sasl) = &self.sasl {
            entries.push((
                "sasl.mechanism".to_string(),
                sasl.mechanism.as_str().to_string(),
            ));
            entries.push(("sasl.username".to_string(), sasl.username.clone()));
            entries.push((
                "sasl.password".to_string(),
                sasl.password.expose_secret().clone(),
            ));
        }

        if let Some(ssl) = &self.ssl {
            if let Some(ca) = &ssl.ca_location {
                entries.push(("ssl.ca.location".to_string(), ca.clone()));
            }
            if let Some(cert) = &ssl.certificate_location {
                entries.push(("ssl.certificate.location".to_string(), cert.clone()));
            }
            if let Some(key) = &ssl.key_location {
                entries.push(("ssl.key.location".to_string(), key.clone()));
            }
            if let Some(password) = &ssl.key_password {
                entries.push((
                    "ssl.key.password".to_string(),
                    password.expose_secret().clone(),
                ));
            }
            if !ssl.verify_hostname {
                entries.push((
                    "ssl.endpoint.identification.algorithm".to_string(),
                    "none".to_string(),
                ));
            }
        }

        entries.extend(self.extra.iter().cloned());
        entries
    }
}

/// Producer 配置
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// 基础配置
    pub base: KafkaConfig,
    /// 确认模式
    pub acks: ProducerAcks,
    /// 客户端内部重试次数
    pub retries: u32,
    /// 单条消息的投递超时
    pub delivery_timeout: Duration,
}

impl ProducerConfig {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            base: KafkaConfig::new(brokers),
            acks: ProducerAcks::default(),
            retries: 5,
            delivery_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_messaging(config: &MessagingConfig) -> Self {
        Self {
            base: KafkaConfig::from_messaging(config),
            acks: config.producer_acks,
            retries: config.producer_retries,
            delivery_timeout: config.delivery_timeout(),
        }
    }

    /// 转换为 rdkafka ClientConfig 的配置项
    ///
    /// 每次发送都等待确认，所以关闭 linger 和幂等性
    pub fn to_client_config_entries(&self) -> Vec<(String, String)> {
        let mut entries = self.base.to_client_config_entries();

        entries.push(("acks".to_string(), self.acks.as_str().to_string()));
        entries.push(("retries".to_string(), self.retries.to_string()));
        entries.push(("linger.ms".to_string(), "0".to_string()));
        entries.push(("enable.idempotence".to_string(), "false".to_string()));
        entries.push((
            "message.timeout.ms".to_string(),
            self.delivery_timeout.as_millis().to_string(),
        ));

        entries
    }
}

/// Consumer 配置
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// 基础配置
    pub base: KafkaConfig,
    /// 消费者组 ID
    pub group_id: String,
    /// 自动偏移重置策略
    pub auto_offset_reset: AutoOffsetReset,
    /// 会话超时
    pub session_timeout: Duration,
    /// 由调用方显式 `store_offset`（消费组后端）
    pub manual_offset_store: bool,
}

impl ConsumerConfig {
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            base: KafkaConfig::new(brokers),
            group_id: group_id.into(),
            auto_offset_reset: AutoOffsetReset::default(),
            session_timeout: Duration::from_secs(6),
            manual_offset_store: false,
        }
    }

    pub fn from_messaging(config: &MessagingConfig) -> Self {
        Self {
            base: KafkaConfig::from_messaging(config),
            group_id: config.group_id.clone(),
            auto_offset_reset: config.auto_offset_reset,
            session_timeout: config.session_timeout(),
            manual_offset_store: false,
        }
    }

    pub fn with_manual_offset_store(mut self) -> Self {
        self.manual_offset_store = true;
        self
    }

    /// 转换为 rdkafka ClientConfig 的配置项
    ///
    /// 自动提交始终关闭
    pub fn to_client_config_entries(&self) -> Vec<(String, String)> {
        let mut entries = self.base.to_client_config_entries();

        entries.push(("group.id".to_string(), self.group_id.clone()));
        entries.push(("enable.auto.commit".to_string(), "false".to_string()));
        entries.push((
            "auto.offset.reset".to_string(),
            self.auto_offset_reset.as_str().to_string(),
        ));
        entries.push((
            "session.timeout.ms".to_string(),
            self.session_timeout.as_millis().to_string(),
        ));
        entries.push(("enable.partition.eof".to_string(), "false".to_string()));
        if self.manual_offset_store {
            entries.push(("enable.auto.offset.store".to_string(), "false".to_string()));
        }

        entries
    }
}

pub(crate) fn client_config(entries: Vec<(String, String)>) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    for (key, value) in entries {
        client_config.set(key, value);
    }
    client_config
}
