//! 核心对外发布的领域事件
//!
//! 事件以类型字符串为主题在事件总线上发布，供传输层和
//! 通知层消费。

use serde::{Deserialize, Serialize};

use crate::value_objects::{MessageId, SessionId, Timestamp, UserId};

/// 在线状态变化事件主题
pub const TOPIC_PRESENCE_CHANGED: &str = "presence.changed";
/// 消息送达事件主题
pub const TOPIC_MESSAGE_DELIVERED: &str = "message.delivered";

/// 核心领域事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatEvent {
    /// 用户聚合在线状态发生翻转（边沿触发，冗余连接不产生事件）
    PresenceChanged {
        user_id: UserId,
        online: bool,
        /// 同一用户内严格递增的边沿序号，发布顺序被并发打乱时
        /// 消费者可据此丢弃旧边沿
        seq: u64,
        at: Timestamp,
    },

    /// 消息成功送达某个在线会话
    MessageDelivered {
        message_id: MessageId,
        recipient_id: UserId,
        session_id: SessionId,
        at: Timestamp,
    },
}

impl ChatEvent {
    /// 事件所属主题
    pub fn topic(&self) -> &'static str {
        match self {
            ChatEvent::PresenceChanged { .. } => TOPIC_PRESENCE_CHANGED,
            ChatEvent::MessageDelivered { .. } => TOPIC_MESSAGE_DELIVERED,
        }
    }

    /// 创建在线状态变化事件
    pub fn presence_changed(user_id: UserId, online: bool, seq: u64, at: Timestamp) -> Self {
        ChatEvent::PresenceChanged {
            user_id,
            online,
            seq,
            at,
        }
    }

    /// 创建消息送达事件
    pub fn message_delivered(
        message_id: MessageId,
        recipient_id: UserId,
        session_id: SessionId,
        at: Timestamp,
    ) -> Self {
        ChatEvent::MessageDelivered {
            message_id,
            recipient_id,
            session_id,
            at,
        }
    }
}
