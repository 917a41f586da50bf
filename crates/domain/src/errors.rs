//! 领域模型错误定义
//!
//! 定义领域层所有可能的错误类型，提供清晰的错误上下文。

use thiserror::Error;

use crate::delivery::DeliveryStatus;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 非法的投递状态转换，当前状态保持不变
    #[error("非法状态转换: {from:?} -> {to:?}")]
    InvalidTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    /// 参数验证错误
    #[error("验证失败: {field}: {message}")]
    InvalidArgument { field: String, message: String },

    /// 实体当前状态不允许该操作
    #[error("操作不允许: {reason}")]
    OperationNotAllowed { reason: String },
}

impl DomainError {
    /// 创建状态转换错误
    pub fn invalid_transition(from: DeliveryStatus, to: DeliveryStatus) -> Self {
        Self::InvalidTransition { from, to }
    }

    /// 创建验证错误
    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建操作不允许错误
    pub fn operation_not_allowed(reason: impl Into<String>) -> Self {
        Self::OperationNotAllowed {
            reason: reason.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;
