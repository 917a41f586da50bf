//! 即时通讯系统在线状态与消息投递核心的领域模型
//!
//! 包含会话、消息、投递状态机等核心实体，以及相关的业务规则。

pub mod delivery;
pub mod errors;
pub mod events;
pub mod message;
pub mod session;
pub mod value_objects;

// 重新导出常用类型
pub use delivery::*;
pub use errors::*;
pub use events::*;
pub use message::*;
pub use session::*;
pub use value_objects::*;
