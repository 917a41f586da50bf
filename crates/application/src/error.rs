//! 应用层错误定义
//!
//! 核心的任何错误都以类型化结果返回，不会终止进程。
//! 单个扇出目标的失败被吸收进该目标的投递记录，
//! 只有阻止消息创建本身的错误才同步抛给调用方。

use thiserror::Error;

use domain::{DomainError, GroupId, MessageId, SessionId, UserId};

use crate::ports::{MembershipError, StoreError};

/// 应用层错误类型
#[derive(Debug, Error)]
pub enum ApplicationError {
    /// 领域层错误（含非法状态转换）
    #[error("领域错误: {0}")]
    Domain(#[from] DomainError),

    /// 会话ID冲突：同一会话ID被不同用户占用，连接被拒绝
    #[error("会话冲突: {session_id} 已属于用户 {owner}")]
    SessionConflict {
        session_id: SessionId,
        owner: UserId,
    },

    /// 目标群组不存在，消息未创建
    #[error("群组不存在: {0}")]
    GroupNotFound(GroupId),

    /// 消息不存在
    #[error("消息不存在: {0}")]
    MessageNotFound(MessageId),

    /// 配置禁止自聊时拒绝 target.id == sender_id 的私聊
    #[error("不允许给自己发送消息")]
    SelfChatDisabled,

    /// 消息存储协作方失败
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),

    /// 群组成员存储协作方失败（NotFound 之外的后端故障）
    #[error("群组成员存储错误: {0}")]
    Membership(String),
}

impl From<MembershipError> for ApplicationError {
    fn from(value: MembershipError) -> Self {
        match value {
            MembershipError::NotFound(group_id) => ApplicationError::GroupNotFound(group_id),
            MembershipError::Backend(message) => ApplicationError::Membership(message),
        }
    }
}

/// 应用层结果类型
pub type ApplicationResult<T> = Result<T, ApplicationError>;
