//! 会话实体定义
//!
//! 一个会话对应某个用户的某台设备建立的一条活跃连接。
//! 会话在连接时创建、断开时销毁，期间不可变。

use serde::{Deserialize, Serialize};

use crate::value_objects::{DeviceId, SessionId, Timestamp, UserId};

/// 一条活跃连接
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// 会话ID，连接时分配
    pub session_id: SessionId,
    /// 所属用户
    pub user_id: UserId,
    /// 来源设备
    pub device_id: DeviceId,
    /// 客户端IP地址
    pub ip_address: String,
    /// 连接建立时间
    pub connected_at: Timestamp,
}

impl Session {
    pub fn new(
        session_id: SessionId,
        user_id: UserId,
        device_id: DeviceId,
        ip_address: impl Into<String>,
        connected_at: Timestamp,
    ) -> Self {
        Self {
            session_id,
            user_id,
            device_id,
            ip_address: ip_address.into(),
            connected_at,
        }
    }
}
