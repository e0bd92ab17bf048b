//! Topic 列表解析

use courier_errors::{MqError, MqResult};

/// 解析逗号分隔的 topic 列表
///
/// 去掉空白与空项，保留首次出现的顺序去重；结果为空时返回 `InvalidArgument`
pub fn parse_topic_list(list: &str) -> MqResult<Vec<String>> {
    let mut topics: Vec<String> = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !topics.iter().any(|t| t == name) {
            topics.push(name.to_string());
        }
    }

    if topics.is_empty() {
        return Err(MqError::invalid_argument(format!(
            "topic list '{}' names no topic",
            list
        )));
    }
    Ok(topics)
}
