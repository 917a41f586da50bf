//! 消息持久化存储端口
//!
//! 状态机的每次转换都要先经过本端口落库才算提交。
//! 物理删除和事务纪律归存储协作方所有。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use domain::{DeliveryRecord, DeliveryStatus, Message, MessageId, Timestamp, UserId};

/// 消息存储错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// 底层存储故障
    #[error("存储失败: {0}")]
    Backend(String),

    /// 消息不存在
    #[error("消息不存在: {0}")]
    NotFound(MessageId),

    /// 条件更新失败：提交时的状态与期望不符（输给并发转换）
    #[error("状态提交冲突: {message_id} 当前为 {actual:?}")]
    StatusConflict {
        message_id: MessageId,
        actual: DeliveryStatus,
    },
}

/// 消息存储端口接口
#[async_trait]
pub trait MessageStorePort: Send + Sync {
    /// 持久化新消息
    async fn persist(&self, message: &Message) -> Result<(), StoreError>;

    /// 按内部ID查找消息
    async fn find(&self, message_id: MessageId) -> Result<Option<Message>, StoreError>;

    /// 条件更新消息聚合状态：仅当存储中的当前状态等于 from
    /// 时提交，否则返回 StatusConflict，调用方基于最新状态
    /// 重新校验
    async fn update_status(
        &self,
        message_id: MessageId,
        from: DeliveryStatus,
        to: DeliveryStatus,
        at: Timestamp,
    ) -> Result<(), StoreError>;

    /// 打软删除标记
    async fn mark_deleted(&self, message_id: MessageId, at: Timestamp) -> Result<(), StoreError>;

    /// 追加一次扇出产生的逐接收者投递记录
    async fn append_deliveries(
        &self,
        message_id: MessageId,
        records: Vec<DeliveryRecord>,
    ) -> Result<(), StoreError>;

    /// 读取某条消息的全部投递记录
    async fn deliveries_for(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<DeliveryRecord>, StoreError>;

    /// 给某个接收者的投递记录盖已读时间戳，
    /// 该接收者没有记录时返回 false
    async fn mark_delivery_read(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
        at: Timestamp,
    ) -> Result<bool, StoreError>;

    /// 用户离线期间积压的待取消息，按内部ID升序
    async fn pending_for_user(&self, user_id: UserId) -> Result<Vec<Message>, StoreError>;
}

/// 内存实现的消息存储（用于测试和单进程部署）
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<MessageId, Message>>,
    deliveries: RwLock<HashMap<MessageId, Vec<DeliveryRecord>>>,
    /// 测试辅助：让下一次 persist 失败一次
    fail_next_persist: AtomicBool,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            deliveries: RwLock::new(HashMap::new()),
            fail_next_persist: AtomicBool::new(false),
        }
    }

    /// 注入一次持久化失败（用于测试失败路径）
    pub fn fail_next_persist(&self) {
        self.fail_next_persist.store(true, Ordering::SeqCst);
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStorePort for InMemoryMessageStore {
    async fn persist(&self, message: &Message) -> Result<(), StoreError> {
        if self.fail_next_persist.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("注入的持久化失败".to_owned()));
        }
        let mut messages = self.messages.write().await;
        messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn find(&self, message_id: MessageId) -> Result<Option<Message>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages.get(&message_id).cloned())
    }

    async fn update_status(
        &self,
        message_id: MessageId,
        from: DeliveryStatus,
        to: DeliveryStatus,
        at: Timestamp,
    ) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(&message_id)
            .ok_or(StoreError::NotFound(message_id))?;
        if message.status != from {
            return Err(StoreError::StatusConflict {
                message_id,
                actual: message.status,
            });
        }
        message.status = to;
        message.updated_at = Some(at);
        Ok(())
    }

    async fn mark_deleted(&self, message_id: MessageId, at: Timestamp) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(&message_id)
            .ok_or(StoreError::NotFound(message_id))?;
        message.mark_deleted(at);
        Ok(())
    }

    async fn append_deliveries(
        &self,
        message_id: MessageId,
        records: Vec<DeliveryRecord>,
    ) -> Result<(), StoreError> {
        let mut deliveries = self.deliveries.write().await;
        deliveries.entry(message_id).or_default().extend(records);
        Ok(())
    }

    async fn deliveries_for(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        let deliveries = self.deliveries.read().await;
        Ok(deliveries.get(&message_id).cloned().unwrap_or_default())
    }

    async fn mark_delivery_read(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
        at: Timestamp,
    ) -> Result<bool, StoreError> {
        let mut deliveries = self.deliveries.write().await;
        let Some(records) = deliveries.get_mut(&message_id) else {
            return Ok(false);
        };
        let mut stamped = false;
        for record in records.iter_mut() {
            if record.recipient_id == recipient_id {
                record.mark_read(at);
                stamped = true;
            }
        }
        Ok(stamped)
    }

    async fn pending_for_user(&self, user_id: UserId) -> Result<Vec<Message>, StoreError> {
        let deliveries = self.deliveries.read().await;
        let mut pending_ids: Vec<MessageId> = deliveries
            .iter()
            .filter(|(_, records)| {
                records.iter().any(|r| {
                    r.recipient_id == user_id && !r.outcome.is_delivered() && !r.is_read()
                })
            })
            .map(|(id, _)| *id)
            .collect();
        pending_ids.sort();
        drop(deliveries);

        let messages = self.messages.read().await;
        Ok(pending_ids
            .into_iter()
            .filter_map(|id| messages.get(&id).cloned())
            .filter(|m| m.is_visible())
            .collect())
    }
}
