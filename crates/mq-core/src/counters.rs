//! metrics 指标名称
//!
//! 未安装 recorder 时所有计数都是空操作

pub const MESSAGES_PRODUCED: &str = "courier_messages_produced_total";
pub const DELIVERY_FAILURES: &str = "courier_delivery_failures_total";
pub const MESSAGES_CONSUMED: &str = "courier_messages_consumed_total";
pub const OFFSETS_COMMITTED: &str = "courier_offsets_committed_total";
pub const DECODE_FAILURES: &str = "courier_decode_failures_total";
pub const HANDLER_FAILURES: &str = "courier_handler_failures_total";
pub const TRANSIENT_ERRORS: &str = "courier_transient_errors_total";
pub const GROUP_SESSIONS: &str = "courier_group_sessions_total";
pub const GROUP_SESSION_FAILURES: &str = "courier_group_session_failures_total";

pub(crate) fn topic(name: &'static str, topic: &str) {
    ::metrics::counter!(name, "topic" => topic.to_owned()).increment(1);
}

pub(crate) fn group(name: &'static str, group_id: &str) {
    ::metrics::counter!(name, "group_id" => group_id.to_owned()).increment(1);
}

pub(crate) fn failure(name: &'static str, topic: &str, kind: &'static str) {
    ::metrics::counter!(name, "topic" => topic.to_owned(), "kind" => kind).increment(1);
}
