//! 出站传输层端口
//!
//! 每次调用对应向一个活跃会话推送一帧消息。普通投递失败
//! 通过 SendOutcome 返回，Err 只用于契约违反（未知会话）。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use domain::{ContentType, Message, MessageId, SessionId, Timestamp, UserId};

/// 传输层契约违反
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 会话ID不在传输层的连接表中
    #[error("未知会话: {0}")]
    UnknownSession(SessionId),
}

/// 单次发送结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// 对端确认收到
    Ok,
    /// 普通投递失败，不中断对其他会话的扇出
    Failed { reason: String },
}

/// 推送给会话的消息帧，公开ID对外、内部ID不泄露到 content 之外的语义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub public_id: String,
    pub sender_id: UserId,
    pub content: String,
    pub content_type: ContentType,
    pub sent_at: Timestamp,
}

impl MessagePayload {
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.id,
            public_id: message.public_id.clone(),
            sender_id: message.sender_id,
            content: message.content.clone(),
            content_type: message.content_type,
            sent_at: message.created_at,
        }
    }
}

/// 出站传输端口接口
#[async_trait]
pub trait TransportPort: Send + Sync {
    async fn send(
        &self,
        session_id: SessionId,
        payload: MessagePayload,
    ) -> Result<SendOutcome, TransportError>;
}

/// 记录型传输实现（用于测试）
///
/// 记录每次发送，可按会话注入失败或延迟。
pub struct RecordingTransport {
    sent: Mutex<Vec<(SessionId, MessagePayload)>>,
    failing_sessions: Mutex<HashSet<SessionId>>,
    delay: Option<Duration>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing_sessions: Mutex::new(HashSet::new()),
            delay: None,
        }
    }

    /// 每次发送前等待固定时长，用于测试超时路径
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    /// 让指定会话的发送失败
    pub async fn fail_session(&self, session_id: SessionId) {
        self.failing_sessions.lock().await.insert(session_id);
    }

    /// 成功送达过的会话列表（按完成顺序）
    pub async fn delivered_sessions(&self) -> Vec<SessionId> {
        self.sent.lock().await.iter().map(|(sid, _)| *sid).collect()
    }

    /// 送达的消息帧快照
    pub async fn sent_payloads(&self) -> Vec<(SessionId, MessagePayload)> {
        self.sent.lock().await.clone()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportPort for RecordingTransport {
    async fn send(
        &self,
        session_id: SessionId,
        payload: MessagePayload,
    ) -> Result<SendOutcome, TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_sessions.lock().await.contains(&session_id) {
            return Ok(SendOutcome::Failed {
                reason: "连接中断".to_owned(),
            });
        }
        self.sent.lock().await.push((session_id, payload));
        Ok(SendOutcome::Ok)
    }
}
