//! 外部协作方端口定义
//!
//! 群组成员存储、消息持久化存储和出站传输层都在本核心之外实现，
//! 这里只定义契约，并为单进程部署和测试提供内存实现。

pub mod group_membership;
pub mod message_store;
pub mod transport;

pub use group_membership::{GroupMembershipPort, InMemoryGroupDirectory, MembershipError};
pub use message_store::{InMemoryMessageStore, MessageStorePort, StoreError};
pub use transport::{MessagePayload, RecordingTransport, SendOutcome, TransportError, TransportPort};
