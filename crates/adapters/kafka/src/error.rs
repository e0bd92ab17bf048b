//! rdkafka 错误到 `MqError` 的映射

use courier_errors::MqError;
use courier_ports::ConsumedRecord;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};

/// librdkafka 判定为不可恢复的错误码
fn is_fatal_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::Fatal
            | RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
    )
}

/// 收消息时的错误：致命错误关闭连接，其余视为瞬时
///
/// 主题不存在只在 `subscribe` 时算订阅失败；轮询中报告的主题缺失可能随主题创建恢复
pub(crate) fn receive_error(e: KafkaError) -> MqError {
    match e.rdkafka_error_code() {
        Some(code) if is_fatal_code(code) => MqError::connection(e.to_string()),
        _ => MqError::transient(e.to_string()),
    }
}

/// 提交时没有可提交的 offset 不算失败
pub(crate) fn is_no_offset(e: &KafkaError) -> bool {
    e.rdkafka_error_code() == Some(RDKafkaErrorCode::NoOffset)
}

/// 把借用的消息拷贝成与连接无关的记录
pub(crate) fn detach(message: &BorrowedMessage<'_>) -> ConsumedRecord {
    ConsumedRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(|k| k.to_vec()),
        payload: message.payload().map(|p| p.to_vec()).unwrap_or_default(),
        timestamp: message.timestamp().to_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_codes_map_to_connection() {
        let err = receive_error(KafkaError::MessageConsumption(RDKafkaErrorCode::Fatal));
        assert!(matches!(err, MqError::Connection(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_topic_while_receiving_is_transient() {
        for code in [
            RDKafkaErrorCode::UnknownTopicOrPartition,
            RDKafkaErrorCode::UnknownTopic,
        ] {
            let err = receive_error(KafkaError::MessageConsumption(code));
            assert!(err.is_transient());
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn test_broker_transport_is_transient() {
        let err = receive_error(KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure,
        ));
        assert!(err.is_transient());
    }

    #[test]
    fn test_no_offset_detected() {
        assert!(is_no_offset(&KafkaError::ConsumerCommit(
            RDKafkaErrorCode::NoOffset
        )));
        assert!(!is_no_offset(&KafkaError::ConsumerCommit(
            RDKafkaErrorCode::RequestTimedOut
        )));
    }
}
