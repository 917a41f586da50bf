//! 投递状态机
//!
//! 消息聚合状态的唯一变更入口。每次被接受的转换都先通过
//! 消息存储端口落库才算提交；持久化失败原样上抛，绝不静默
//! 丢弃。非法转换被拒绝且不产生任何部分变更。

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use domain::{
    aggregate_fanout_status, ContentType, DeliveryRecord, DeliveryStatus, DomainError, Message,
    MessageId, MessageTarget, UserId,
};

use crate::error::{ApplicationError, ApplicationResult};
use crate::ports::{MessageStorePort, StoreError};

/// 投递状态机
pub struct DeliveryStatusMachine {
    store: Arc<dyn MessageStorePort>,
    /// 内部序列ID分配器，单调递增
    sequence: AtomicI64,
}

impl DeliveryStatusMachine {
    pub fn new(store: Arc<dyn MessageStorePort>) -> Self {
        Self {
            store,
            sequence: AtomicI64::new(0),
        }
    }

    async fn load(&self, message_id: MessageId) -> ApplicationResult<Message> {
        self.store
            .find(message_id)
            .await?
            .ok_or(ApplicationError::MessageNotFound(message_id))
    }

    /// 创建消息并以发送中状态持久化。
    /// 持久化失败同步上抛给调用方，消息视为未创建。
    pub async fn create(
        &self,
        sender_id: UserId,
        target: MessageTarget,
        content: impl Into<String>,
        content_type: ContentType,
    ) -> ApplicationResult<Message> {
        let id = MessageId::new(self.sequence.fetch_add(1, Ordering::SeqCst) + 1);
        let message = Message::create(
            id,
            sender_id,
            target,
            content,
            content_type,
            chrono::Utc::now(),
        )?;

        self.store.persist(&message).await?;

        tracing::debug!(
            message_id = %message.id,
            public_id = %message.public_id,
            sender_id = %sender_id,
            "消息已创建并持久化"
        );
        Ok(message)
    }

    /// 推进聚合状态。先做领域校验，再以条件更新提交：
    /// 提交时发现状态已被并发修改则基于最新状态重新校验，
    /// 存储中不会出现转换图之外的顺序。
    pub async fn advance(
        &self,
        message_id: MessageId,
        to: DeliveryStatus,
    ) -> ApplicationResult<Message> {
        loop {
            let mut message = self.load(message_id).await?;
            let from = message.status;
            let now = chrono::Utc::now();

            message.transition_to(to, now)?;
            match self.store.update_status(message_id, from, to, now).await {
                Ok(()) => {
                    tracing::debug!(
                        message_id = %message_id,
                        status = to.as_str(),
                        "消息状态已推进"
                    );
                    return Ok(message);
                }
                // 提交输给了并发转换，重新加载校验
                Err(StoreError::StatusConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// 记录一次扇出的逐接收者结果并推进聚合状态：
    /// 至少一个在线会话确认即 delivered，否则已持久化记为 sent。
    ///
    /// 聚合推进要跨过 sent，整条路径先在实体上逐步校验，
    /// 校验通过后才追加投递记录，状态以单次条件更新落库。
    /// 校验失败不产生任何部分变更。
    pub async fn record_fanout(
        &self,
        message_id: MessageId,
        records: Vec<DeliveryRecord>,
    ) -> ApplicationResult<Message> {
        let mut message = self.load(message_id).await?;
        let from = message.status;
        let now = chrono::Utc::now();

        let aggregate = aggregate_fanout_status(&records);
        message.transition_to(DeliveryStatus::Sent, now)?;
        if aggregate != DeliveryStatus::Sent {
            message.transition_to(aggregate, now)?;
        }

        self.store.append_deliveries(message_id, records).await?;
        self.store
            .update_status(message_id, from, message.status, now)
            .await?;

        tracing::debug!(
            message_id = %message_id,
            status = message.status.as_str(),
            "扇出结果已记录"
        );
        Ok(message)
    }

    /// 接收者维度的已读标记。
    ///
    /// 首个接收者已读把聚合状态推到 read（发送者可见摘要）；
    /// 之后其他接收者的已读只盖各自投递记录的时间戳。
    pub async fn mark_read(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
    ) -> ApplicationResult<Message> {
        let message = self.load(message_id).await?;
        let now = chrono::Utc::now();

        match message.status {
            DeliveryStatus::Delivered | DeliveryStatus::Read => {}
            from => {
                return Err(DomainError::invalid_transition(from, DeliveryStatus::Read).into());
            }
        }

        let stamped = self
            .store
            .mark_delivery_read(message_id, recipient_id, now)
            .await?;
        if !stamped {
            return Err(DomainError::operation_not_allowed(
                "该接收者没有此消息的投递记录",
            )
            .into());
        }

        if message.status == DeliveryStatus::Delivered {
            self.advance(message_id, DeliveryStatus::Read).await
        } else {
            Ok(message)
        }
    }

    /// 发送者撤回。仅发送者本人可撤回，且状态图允许时才能撤回。
    pub async fn recall(
        &self,
        message_id: MessageId,
        requested_by: UserId,
    ) -> ApplicationResult<Message> {
        let message = self.load(message_id).await?;
        if message.sender_id != requested_by {
            return Err(DomainError::operation_not_allowed("只能撤回自己的消息").into());
        }
        self.advance(message_id, DeliveryStatus::Recalled).await
    }

    /// 软删除，独立于状态轴的终态标记。物理删除归存储协作方。
    pub async fn soft_delete(&self, message_id: MessageId) -> ApplicationResult<()> {
        // 确认消息存在再打标记
        self.load(message_id).await?;
        self.store
            .mark_deleted(message_id, chrono::Utc::now())
            .await?;
        Ok(())
    }

    /// 某条消息的全部投递记录
    pub async fn deliveries_for(
        &self,
        message_id: MessageId,
    ) -> ApplicationResult<Vec<DeliveryRecord>> {
        Ok(self.store.deliveries_for(message_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{InMemoryMessageStore, StoreError};
    use domain::SessionId;
    use uuid::Uuid;

    fn setup() -> (DeliveryStatusMachine, Arc<InMemoryMessageStore>) {
        let store = Arc::new(InMemoryMessageStore::new());
        (
            DeliveryStatusMachine::new(Arc::clone(&store) as Arc<dyn MessageStorePort>),
            store,
        )
    }

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    async fn create_private(
        machine: &DeliveryStatusMachine,
        sender: UserId,
        recipient: UserId,
    ) -> Message {
        machine
            .create(
                sender,
                MessageTarget::User(recipient),
                "hi",
                ContentType::PlainText,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_persists_as_sending_with_monotonic_ids() {
        let (machine, store) = setup();
        let sender = user();

        let m1 = create_private(&machine, sender, user()).await;
        let m2 = create_private(&machine, sender, user()).await;

        assert!(m1.id < m2.id);
        let stored = store.find(m1.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sending);
    }

    #[tokio::test]
    async fn persistence_failure_surfaces_and_message_is_not_created() {
        let (machine, store) = setup();
        store.fail_next_persist();

        let err = machine
            .create(
                user(),
                MessageTarget::User(user()),
                "hi",
                ContentType::PlainText,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Store(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn read_from_sending_is_rejected_without_mutation() {
        let (machine, store) = setup();
        let recipient = user();
        let message = create_private(&machine, user(), recipient).await;

        let err = machine.mark_read(message.id, recipient).await.unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::Domain(DomainError::InvalidTransition {
                from: DeliveryStatus::Sending,
                to: DeliveryStatus::Read,
            })
        ));

        let stored = store.find(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sending);
    }

    #[tokio::test]
    async fn fanout_with_delivery_advances_to_delivered() {
        let (machine, store) = setup();
        let recipient = user();
        let message = create_private(&machine, user(), recipient).await;

        let record = DeliveryRecord::delivered(
            message.id,
            recipient,
            SessionId::generate(),
            chrono::Utc::now(),
        );
        // 从 sending 出发也能跨过 sent 推进到 delivered
        let updated = machine
            .record_fanout(message.id, vec![record])
            .await
            .unwrap();
        assert_eq!(updated.status, DeliveryStatus::Delivered);
        let stored = store.find(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn second_fanout_is_rejected_without_appending_records() {
        let (machine, store) = setup();
        let recipient = user();
        let message = create_private(&machine, user(), recipient).await;
        let record = DeliveryRecord::delivered(
            message.id,
            recipient,
            SessionId::generate(),
            chrono::Utc::now(),
        );
        machine
            .record_fanout(message.id, vec![record.clone()])
            .await
            .unwrap();

        let err = machine
            .record_fanout(message.id, vec![record])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::Domain(DomainError::InvalidTransition { .. })
        ));

        // 校验失败不留下任何部分变更
        let records = store.deliveries_for(message.id).await.unwrap();
        assert_eq!(records.len(), 1);
        let stored = store.find(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn concurrent_read_and_recall_settle_on_recalled() {
        let (machine, store) = setup();
        let machine = Arc::new(machine);
        let sender = user();
        let recipient = user();
        let message = machine
            .create(
                sender,
                MessageTarget::User(recipient),
                "hi",
                ContentType::PlainText,
            )
            .await
            .unwrap();
        machine
            .record_fanout(
                message.id,
                vec![DeliveryRecord::delivered(
                    message.id,
                    recipient,
                    SessionId::generate(),
                    chrono::Utc::now(),
                )],
            )
            .await
            .unwrap();

        let read = {
            let machine = Arc::clone(&machine);
            tokio::spawn(async move { machine.mark_read(message.id, recipient).await })
        };
        let recall = {
            let machine = Arc::clone(&machine);
            tokio::spawn(async move { machine.recall(message.id, sender).await })
        };

        // 已读可能输给撤回而被拒绝，撤回总能成功
        let _ = read.await.unwrap();
        recall.await.unwrap().unwrap();

        // 无论怎样交错，最终落库状态都是 recalled：
        // 撤回先提交则已读被条件更新拒绝，绝不出现 recalled -> read
        let stored = store.find(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Recalled);
    }

    #[tokio::test]
    async fn fanout_without_live_recipient_stays_sent() {
        let (machine, _store) = setup();
        let recipient = user();
        let message = create_private(&machine, user(), recipient).await;

        let record = DeliveryRecord::offline(message.id, recipient, chrono::Utc::now());
        let updated = machine
            .record_fanout(message.id, vec![record])
            .await
            .unwrap();
        assert_eq!(updated.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn read_is_recipient_scoped() {
        let (machine, store) = setup();
        let sender = user();
        let (r1, r2) = (user(), user());
        let message = machine
            .create(
                sender,
                MessageTarget::Group(domain::GroupId::from(Uuid::new_v4())),
                "hi all",
                ContentType::PlainText,
            )
            .await
            .unwrap();

        let now = chrono::Utc::now();
        machine
            .record_fanout(
                message.id,
                vec![
                    DeliveryRecord::delivered(message.id, r1, SessionId::generate(), now),
                    DeliveryRecord::delivered(message.id, r2, SessionId::generate(), now),
                ],
            )
            .await
            .unwrap();

        // 第一个已读推进聚合状态
        let updated = machine.mark_read(message.id, r1).await.unwrap();
        assert_eq!(updated.status, DeliveryStatus::Read);
        let stored = store.find(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Read);

        // 第二个已读只盖自己的时间戳，聚合状态不再变化
        machine.mark_read(message.id, r2).await.unwrap();
        let records = machine.deliveries_for(message.id).await.unwrap();
        assert!(records.iter().all(|r| r.is_read()));
    }

    #[tokio::test]
    async fn only_sender_can_recall() {
        let (machine, _store) = setup();
        let sender = user();
        let recipient = user();
        let message = create_private(&machine, sender, recipient).await;
        machine
            .record_fanout(
                message.id,
                vec![DeliveryRecord::offline(
                    message.id,
                    recipient,
                    chrono::Utc::now(),
                )],
            )
            .await
            .unwrap();

        let err = machine.recall(message.id, recipient).await.unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::Domain(DomainError::OperationNotAllowed { .. })
        ));

        let recalled = machine.recall(message.id, sender).await.unwrap();
        assert_eq!(recalled.status, DeliveryStatus::Recalled);
    }

    #[tokio::test]
    async fn soft_delete_leaves_status_axis_untouched() {
        let (machine, store) = setup();
        let message = create_private(&machine, user(), user()).await;

        machine.soft_delete(message.id).await.unwrap();
        let stored = store.find(message.id).await.unwrap().unwrap();
        assert!(stored.is_deleted);
        assert_eq!(stored.status, DeliveryStatus::Sending);
    }
}
