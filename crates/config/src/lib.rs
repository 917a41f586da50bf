//! 统一配置中心
//!
//! 提供核心组件的全局配置管理，包括：
//! - 消息扇出并发与超时
//! - 聊天行为开关

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// 全局核心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// 扇出配置
    pub fanout: FanoutConfig,
    /// 聊天行为配置
    pub chat: ChatConfig,
}

/// 消息扇出配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// 单条消息扇出时的最大并发发送数，防止超大群任务爆炸
    pub concurrency: usize,
    /// 单次传输层发送的超时（毫秒），超时按该会话发送失败记录
    pub send_timeout_ms: u64,
}

impl FanoutConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// 聊天行为配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// 是否允许用户给自己发私聊消息
    pub allow_self_chat: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            fanout: FanoutConfig {
                concurrency: 16,
                send_timeout_ms: 5000,
            },
            chat: ChatConfig {
                allow_self_chat: true,
            },
        }
    }
}

impl CoreConfig {
    /// 从环境变量加载配置，缺失或非法的变量回退到默认值
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            fanout: FanoutConfig {
                concurrency: env::var("FANOUT_CONCURRENCY")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(defaults.fanout.concurrency),
                send_timeout_ms: env::var("SEND_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(defaults.fanout.send_timeout_ms),
            },
            chat: ChatConfig {
                allow_self_chat: env::var("ALLOW_SELF_CHAT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.chat.allow_self_chat),
            },
        }
    }
}
