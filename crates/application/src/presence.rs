//! 在线状态追踪
//!
//! 在会话注册表之上派生用户的聚合在线状态，对外暴露连接握手、
//! 断开和在线查询。在线状态没有独立生命周期：查询时它是注册表
//! 的纯函数，通知则由注册表变更产生的边沿驱动（边沿触发，
//! 冗余的多设备连接/断开不产生广播噪音）。

use std::sync::Arc;

use domain::{ChatEvent, DeviceId, Session, SessionId, UserId};

use crate::error::ApplicationResult;
use crate::event_bus::EventBus;
use crate::session_registry::SessionRegistry;

/// 在线状态追踪器
pub struct PresenceTracker {
    registry: Arc<SessionRegistry>,
    bus: Arc<EventBus>,
}

impl PresenceTracker {
    pub fn new(registry: Arc<SessionRegistry>, bus: Arc<EventBus>) -> Self {
        Self { registry, bus }
    }

    /// 连接握手：分配会话ID并注册，聚合在线状态翻转时
    /// 发布 presence.changed 事件
    pub fn connect(
        &self,
        user_id: UserId,
        device_id: DeviceId,
        ip_address: impl Into<String>,
    ) -> ApplicationResult<SessionId> {
        let session_id = SessionId::generate();
        let now = chrono::Utc::now();
        let session = Session::new(session_id, user_id, device_id, ip_address, now);

        let edge = self.registry.add(session)?;

        tracing::info!(
            session_id = %session_id,
            user_id = %user_id,
            "新连接已注册"
        );

        if let Some(edge) = edge {
            self.bus.publish(ChatEvent::presence_changed(
                edge.user_id,
                edge.online,
                edge.seq,
                now,
            ));
        }
        Ok(session_id)
    }

    /// 断开连接。未知会话ID是无害的空操作；
    /// 最后一台设备下线时恰好发布一次离线事件。
    pub fn disconnect(&self, session_id: SessionId) -> Option<Session> {
        let (session, edge) = self.registry.remove(session_id)?;

        tracing::info!(
            session_id = %session_id,
            user_id = %session.user_id,
            "连接已注销"
        );

        if let Some(edge) = edge {
            self.bus.publish(ChatEvent::presence_changed(
                edge.user_id,
                edge.online,
                edge.seq,
                chrono::Utc::now(),
            ));
        }
        Some(session)
    }

    /// 在线查询：注册表在查询时刻的纯函数
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.registry.is_online(user_id)
    }

    /// 当前在线用户快照（用于用户列表推送）
    pub fn online_users(&self) -> Vec<UserId> {
        self.registry.online_users()
    }
}
