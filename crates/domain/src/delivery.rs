//! 消息投递状态机与逐接收者投递记录
//!
//! 聚合状态（发送者可见的摘要）只能沿以下转换图前进：
//!
//! ```text
//! sending -> sent | failed
//! sent    -> delivered | failed | recalled
//! delivered -> read | recalled
//! read    -> recalled
//! ```
//!
//! 软删除是独立于该状态轴的布尔标记，群聊中一方删除不影响
//! 其他接收者的已读进度。

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{MessageId, SessionId, Timestamp, UserId};

/// 消息聚合投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// 发送中，消息刚创建尚未落库确认
    Sending,
    /// 已持久化，但没有任何在线接收者收到
    Sent,
    /// 至少一个在线接收者会话确认收到
    Delivered,
    /// 至少一个接收者已读
    Read,
    /// 发送失败（持久化失败）
    Failed,
    /// 已被发送者撤回
    Recalled,
}

impl Default for DeliveryStatus {
    fn default() -> Self {
        Self::Sending
    }
}

impl DeliveryStatus {
    /// 判断从当前状态到目标状态的转换是否合法
    pub fn can_transition_to(self, to: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, to),
            (Sending, Sent)
                | (Sending, Failed)
                | (Sent, Delivered)
                | (Sent, Failed)
                | (Sent, Recalled)
                | (Delivered, Read)
                | (Delivered, Recalled)
                | (Read, Recalled)
        )
    }

    /// 执行状态转换，非法转换返回错误且不产生任何变化
    pub fn transition_to(self, to: DeliveryStatus) -> DomainResult<DeliveryStatus> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(DomainError::invalid_transition(self, to))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Recalled => "recalled",
        }
    }
}

/// 单次扇出中某个接收者的投递结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DeliveryOutcome {
    /// 某个在线会话确认收到
    Delivered { session_id: SessionId },
    /// 接收者没有在线会话，消息留待下次连接拉取
    Offline,
    /// 所有在线会话的发送均失败
    Failed { reason: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// 逐 (消息, 接收者) 的投递记录
///
/// 接收者维度的已读状态以此为准，聚合状态只是发送者可见的摘要。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: MessageId,
    pub recipient_id: UserId,
    pub outcome: DeliveryOutcome,
    /// 该接收者的已读时间
    pub read_at: Option<Timestamp>,
    pub recorded_at: Timestamp,
}

impl DeliveryRecord {
    /// 建立已送达记录
    pub fn delivered(
        message_id: MessageId,
        recipient_id: UserId,
        session_id: SessionId,
        at: Timestamp,
    ) -> Self {
        Self {
            message_id,
            recipient_id,
            outcome: DeliveryOutcome::Delivered { session_id },
            read_at: None,
            recorded_at: at,
        }
    }

    /// 建立离线待取记录
    pub fn offline(message_id: MessageId, recipient_id: UserId, at: Timestamp) -> Self {
        Self {
            message_id,
            recipient_id,
            outcome: DeliveryOutcome::Offline,
            read_at: None,
            recorded_at: at,
        }
    }

    /// 建立失败记录
    pub fn failed(
        message_id: MessageId,
        recipient_id: UserId,
        reason: impl Into<String>,
        at: Timestamp,
    ) -> Self {
        Self {
            message_id,
            recipient_id,
            outcome: DeliveryOutcome::Failed {
                reason: reason.into(),
            },
            read_at: None,
            recorded_at: at,
        }
    }

    /// 标记该接收者已读
    pub fn mark_read(&mut self, at: Timestamp) {
        if self.read_at.is_none() {
            self.read_at = Some(at);
        }
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

/// 根据一次扇出的全部记录计算聚合状态：
/// 只要有一个在线会话确认收到即为 delivered，否则消息已持久化记为 sent。
pub fn aggregate_fanout_status(records: &[DeliveryRecord]) -> DeliveryStatus {
    if records.iter().any(|r| r.outcome.is_delivered()) {
        DeliveryStatus::Delivered
    } else {
        DeliveryStatus::Sent
    }
}
