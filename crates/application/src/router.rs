//! 消息路由器
//!
//! 编排一次发送的完整流程：解析目标会话集合、以发送中状态
//! 持久化、对每个在线会话并发扇出、汇总逐接收者投递记录并
//! 推进聚合状态、逐送达会话发布 message.delivered 事件。
//!
//! 扇出是逐会话尽力而为：单个会话的发送失败或超时被吸收进
//! 该会话所属接收者的投递记录，绝不中断对其余会话的投递。
//! 发送任务派生后与调用方解耦，发起者中途断开不会取消在途
//! 发送。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;

use config::CoreConfig;
use domain::{
    ChatEvent, ContentType, DeliveryRecord, DeliveryStatus, Message, MessageId, MessageTarget,
    SessionId, UserId,
};

use crate::error::{ApplicationError, ApplicationResult};
use crate::event_bus::EventBus;
use crate::ports::{GroupMembershipPort, MessagePayload, SendOutcome, TransportPort};
use crate::session_registry::SessionRegistry;
use crate::status_machine::DeliveryStatusMachine;

/// 一次发送返回给调用方的句柄
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageHandle {
    pub message_id: MessageId,
    pub public_id: String,
    pub status: DeliveryStatus,
}

impl MessageHandle {
    fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.id,
            public_id: message.public_id.clone(),
            status: message.status,
        }
    }
}

/// 单个会话的发送结论
enum SessionSend {
    Delivered,
    Failed(String),
}

/// 消息路由器
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    groups: Arc<dyn GroupMembershipPort>,
    machine: Arc<DeliveryStatusMachine>,
    transport: Arc<dyn TransportPort>,
    bus: Arc<EventBus>,
    /// 扇出并发上限，防止超大群的任务爆炸
    fanout_limit: Arc<Semaphore>,
    send_timeout: Duration,
    allow_self_chat: bool,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        groups: Arc<dyn GroupMembershipPort>,
        machine: Arc<DeliveryStatusMachine>,
        transport: Arc<dyn TransportPort>,
        bus: Arc<EventBus>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            registry,
            groups,
            machine,
            transport,
            bus,
            fanout_limit: Arc::new(Semaphore::new(config.fanout.concurrency)),
            send_timeout: config.fanout.send_timeout(),
            allow_self_chat: config.chat.allow_self_chat,
        }
    }

    /// 路由一条出站消息
    pub async fn route(
        &self,
        sender_id: UserId,
        target: MessageTarget,
        content: impl Into<String>,
        content_type: ContentType,
    ) -> ApplicationResult<MessageHandle> {
        // 1. 目标校验。群组不存在时先行失败，消息不创建。
        let recipients = self.resolve_recipients(sender_id, target).await?;

        // 2. 创建消息并以发送中状态持久化
        let message = self
            .machine
            .create(sender_id, target, content, content_type)
            .await?;

        // 3. 解析在线会话；没有活跃会话的接收者记为离线待取
        let now = chrono::Utc::now();
        let mut live: Vec<(UserId, SessionId)> = Vec::new();
        let mut offline: Vec<UserId> = Vec::new();
        for recipient in &recipients {
            let session_ids = self.registry.session_ids_for_user(*recipient);
            if session_ids.is_empty() {
                offline.push(*recipient);
            } else {
                live.extend(session_ids.into_iter().map(|sid| (*recipient, sid)));
            }
        }

        tracing::info!(
            message_id = %message.id,
            sender_id = %sender_id,
            live_sessions = live.len(),
            offline_recipients = offline.len(),
            "开始扇出"
        );

        // 4. 有界并发、逐会话限时的扇出
        let session_results = self.fan_out(&message, &live).await;

        // 5. 汇总为逐接收者投递记录并推进聚合状态
        let mut delivered_sessions: Vec<(UserId, SessionId)> = Vec::new();
        let mut progress: HashMap<UserId, (Option<SessionId>, Vec<String>)> = HashMap::new();
        for ((recipient, session_id), result) in live.iter().zip(session_results) {
            let slot = progress.entry(*recipient).or_default();
            match result {
                SessionSend::Delivered => {
                    delivered_sessions.push((*recipient, *session_id));
                    slot.0.get_or_insert(*session_id);
                }
                SessionSend::Failed(reason) => slot.1.push(reason),
            }
        }

        let mut records = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            let record = match progress.remove(recipient) {
                Some((Some(session_id), _)) => {
                    DeliveryRecord::delivered(message.id, *recipient, session_id, now)
                }
                Some((None, reasons)) => {
                    DeliveryRecord::failed(message.id, *recipient, reasons.join("; "), now)
                }
                None => DeliveryRecord::offline(message.id, *recipient, now),
            };
            records.push(record);
        }

        let message = self.machine.record_fanout(message.id, records).await?;

        // 6. 逐送达会话发布 message.delivered 事件
        for (recipient_id, session_id) in delivered_sessions {
            self.bus.publish(ChatEvent::message_delivered(
                message.id,
                recipient_id,
                session_id,
                now,
            ));
        }

        tracing::info!(
            message_id = %message.id,
            status = message.status.as_str(),
            "扇出完成"
        );
        Ok(MessageHandle::from_message(&message))
    }

    /// 解析目标的接收者集合：私聊为单个接收者（默认允许自聊），
    /// 群聊为成员集合剔除发送者本人
    async fn resolve_recipients(
        &self,
        sender_id: UserId,
        target: MessageTarget,
    ) -> ApplicationResult<Vec<UserId>> {
        match target {
            MessageTarget::User(user_id) => {
                if user_id == sender_id && !self.allow_self_chat {
                    return Err(ApplicationError::SelfChatDisabled);
                }
                Ok(vec![user_id])
            }
            MessageTarget::Group(group_id) => {
                let members = self.groups.members_of(group_id).await?;
                let mut recipients: Vec<UserId> =
                    members.into_iter().filter(|m| *m != sender_id).collect();
                recipients.sort_by_key(|u| u.0);
                Ok(recipients)
            }
        }
    }

    /// 对所有在线会话派生发送任务，逐个限时，结果按输入顺序返回。
    /// 任务通过 tokio::spawn 与本调用解耦，本 future 被取消也不会
    /// 中止在途发送。
    async fn fan_out(
        &self,
        message: &Message,
        live: &[(UserId, SessionId)],
    ) -> Vec<SessionSend> {
        let payload = MessagePayload::from_message(message);
        let mut handles = Vec::with_capacity(live.len());

        for (_, session_id) in live {
            let session_id = *session_id;
            let limit = Arc::clone(&self.fanout_limit);
            let transport = Arc::clone(&self.transport);
            let payload = payload.clone();
            let timeout = self.send_timeout;

            handles.push(tokio::spawn(async move {
                let _permit = match limit.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return SessionSend::Failed("扇出信号量已关闭".to_owned());
                    }
                };
                match tokio::time::timeout(timeout, transport.send(session_id, payload)).await {
                    Ok(Ok(SendOutcome::Ok)) => SessionSend::Delivered,
                    Ok(Ok(SendOutcome::Failed { reason })) => SessionSend::Failed(reason),
                    Ok(Err(err)) => {
                        // 契约违反：传输层不认识该会话
                        tracing::error!(
                            session_id = %session_id,
                            error = %err,
                            "传输层契约违反"
                        );
                        SessionSend::Failed(err.to_string())
                    }
                    Err(_) => SessionSend::Failed("发送超时".to_owned()),
                }
            }));
        }

        let joined = futures::future::join_all(handles).await;
        joined
            .into_iter()
            .map(|result| match result {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(error = %err, "扇出任务异常退出");
                    SessionSend::Failed("扇出任务异常退出".to_owned())
                }
            })
            .collect()
    }
}
