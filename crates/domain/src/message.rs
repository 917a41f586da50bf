//! 消息实体定义
//!
//! 私聊与群聊消息统一为一种带标签目标的消息类型，
//! 对外暴露公开ID，内部序列ID不泄露给接收者。

use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryStatus;
use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{GroupId, MessageId, Timestamp, UserId};

/// 消息目标，私聊或群聊
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum MessageTarget {
    User(UserId),
    Group(GroupId),
}

impl MessageTarget {
    /// 公开ID的类型前缀，私聊 pm、群聊 gm
    pub fn kind_prefix(&self) -> &'static str {
        match self {
            MessageTarget::User(_) => "pm",
            MessageTarget::Group(_) => "gm",
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, MessageTarget::Group(_))
    }
}

/// 消息内容格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    PlainText,
    RichText,
    Image,
    File,
    Url,
}

impl Default for ContentType {
    fn default() -> Self {
        Self::PlainText
    }
}

/// 生成公开消息ID，格式 {类型前缀}_{unix时间戳}_{随机后缀}
pub fn generate_public_id(target: &MessageTarget, at: Timestamp) -> String {
    let suffix: u32 = rand::random();
    format!("{}_{}_{:08x}", target.kind_prefix(), at.timestamp(), suffix)
}

/// 消息实体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// 内部序列ID，单调递增
    pub id: MessageId,
    /// 对外公开ID
    pub public_id: String,
    /// 发送者
    pub sender_id: UserId,
    /// 投递目标
    pub target: MessageTarget,
    /// 消息内容
    pub content: String,
    /// 内容格式
    pub content_type: ContentType,
    /// 聚合投递状态，只能由状态机推进
    pub status: DeliveryStatus,
    /// 软删除标记，独立于状态轴，不暴露给客户端
    #[serde(skip_serializing, default)]
    pub is_deleted: bool,
    /// 创建时间
    pub created_at: Timestamp,
    /// 最近一次状态变更时间
    pub updated_at: Option<Timestamp>,
}

impl Message {
    /// 创建新消息，初始状态为发送中
    pub fn create(
        id: MessageId,
        sender_id: UserId,
        target: MessageTarget,
        content: impl Into<String>,
        content_type: ContentType,
        created_at: Timestamp,
    ) -> DomainResult<Self> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(DomainError::invalid_argument("content", "不能为空"));
        }

        Ok(Self {
            id,
            public_id: generate_public_id(&target, created_at),
            sender_id,
            target,
            content,
            content_type,
            status: DeliveryStatus::Sending,
            is_deleted: false,
            created_at,
            updated_at: None,
        })
    }

    /// 推进聚合状态，非法转换不产生任何变化
    pub fn transition_to(&mut self, to: DeliveryStatus, at: Timestamp) -> DomainResult<()> {
        self.status = self.status.transition_to(to)?;
        self.updated_at = Some(at);
        Ok(())
    }

    /// 软删除。物理删除归存储协作方所有，本核心只打标记。
    pub fn mark_deleted(&mut self, at: Timestamp) {
        self.is_deleted = true;
        self.updated_at = Some(at);
    }

    /// 对客户端可见
    pub fn is_visible(&self) -> bool {
        !self.is_deleted && self.status != DeliveryStatus::Recalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn new_private_message() -> Message {
        Message::create(
            MessageId::new(1),
            UserId::from(Uuid::new_v4()),
            MessageTarget::User(UserId::from(Uuid::new_v4())),
            "hello",
            ContentType::PlainText,
            chrono::Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn created_message_is_sending() {
        let message = new_private_message();
        assert_eq!(message.status, DeliveryStatus::Sending);
        assert!(!message.is_deleted);
    }

    #[test]
    fn empty_content_is_rejected() {
        let result = Message::create(
            MessageId::new(1),
            UserId::from(Uuid::new_v4()),
            MessageTarget::User(UserId::from(Uuid::new_v4())),
            "   ",
            ContentType::PlainText,
            chrono::Utc::now(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn public_id_carries_kind_prefix() {
        let message = new_private_message();
        assert!(message.public_id.starts_with("pm_"));

        let group = Message::create(
            MessageId::new(2),
            UserId::from(Uuid::new_v4()),
            MessageTarget::Group(GroupId::from(Uuid::new_v4())),
            "hi all",
            ContentType::PlainText,
            chrono::Utc::now(),
        )
        .unwrap();
        assert!(group.public_id.starts_with("gm_"));
    }

    #[test]
    fn illegal_transition_leaves_status_unchanged() {
        let mut message = new_private_message();
        let err = message
            .transition_to(DeliveryStatus::Read, chrono::Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
        assert_eq!(message.status, DeliveryStatus::Sending);
        assert!(message.updated_at.is_none());
    }

    #[test]
    fn serialized_message_round_trips_without_deleted_flag() {
        let mut message = new_private_message();
        message.mark_deleted(chrono::Utc::now());

        let json = serde_json::to_value(&message).unwrap();
        // 删除标记不对外序列化
        assert!(json.get("is_deleted").is_none());

        // 自己序列化出的值必须能反序列化回来
        let back: Message = serde_json::from_value(json).unwrap();
        assert!(!back.is_deleted);
        assert_eq!(back.public_id, message.public_id);
    }

    #[test]
    fn soft_delete_is_independent_of_status() {
        let mut message = new_private_message();
        message.mark_deleted(chrono::Utc::now());
        assert!(message.is_deleted);
        // 状态轴不受影响
        assert_eq!(message.status, DeliveryStatus::Sending);
        assert!(!message.is_visible());
    }
}
