//! 群组成员存储端口

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use domain::{GroupId, UserId};

/// 群组成员查询错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MembershipError {
    /// 群组不存在
    #[error("群组不存在: {0}")]
    NotFound(GroupId),

    /// 成员存储后端故障
    #[error("成员存储访问失败: {0}")]
    Backend(String),
}

/// 群组成员存储端口接口
///
/// 成员关系的写入（建群、加人、踢人）归外部协作方所有，
/// 本核心只在路由时查询。
#[async_trait]
pub trait GroupMembershipPort: Send + Sync {
    /// 查询群组的全部成员，群组不存在返回 NotFound
    async fn members_of(&self, group_id: GroupId) -> Result<HashSet<UserId>, MembershipError>;
}

/// 内存实现的群组目录（用于测试和单进程部署）
pub struct InMemoryGroupDirectory {
    groups: RwLock<HashMap<GroupId, HashSet<UserId>>>,
}

impl InMemoryGroupDirectory {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// 建立群组并设置初始成员
    pub async fn create_group(&self, group_id: GroupId, members: impl IntoIterator<Item = UserId>) {
        let mut groups = self.groups.write().await;
        groups.insert(group_id, members.into_iter().collect());
    }

    /// 追加群组成员
    pub async fn add_member(&self, group_id: GroupId, user_id: UserId) {
        let mut groups = self.groups.write().await;
        groups.entry(group_id).or_default().insert(user_id);
    }
}

impl Default for InMemoryGroupDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GroupMembershipPort for InMemoryGroupDirectory {
    async fn members_of(&self, group_id: GroupId) -> Result<HashSet<UserId>, MembershipError> {
        let groups = self.groups.read().await;
        groups
            .get(&group_id)
            .cloned()
            .ok_or(MembershipError::NotFound(group_id))
    }
}
