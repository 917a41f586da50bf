//! 在线状态与消息投递核心的应用层实现
//!
//! 这里提供会话注册表、在线状态追踪、事件总线、投递状态机
//! 与消息路由器，并定义对外部协作方（群组成员存储、消息存储、
//! 传输层）的端口抽象。所有组件在进程启动时构造一次，
//! 通过引用注入，不依赖任何全局查找。

pub mod error;
pub mod event_bus;
pub mod ports;
pub mod presence;
pub mod router;
pub mod session_registry;
pub mod status_machine;

pub use error::{ApplicationError, ApplicationResult};
pub use event_bus::{EventBus, Subscription};
pub use ports::{
    GroupMembershipPort, InMemoryGroupDirectory, InMemoryMessageStore, MembershipError,
    MessagePayload, MessageStorePort, RecordingTransport, SendOutcome, StoreError, TransportError,
    TransportPort,
};
pub use presence::PresenceTracker;
pub use router::{MessageHandle, MessageRouter};
pub use session_registry::{PresenceEdge, SessionRegistry};
pub use status_machine::DeliveryStatusMachine;
