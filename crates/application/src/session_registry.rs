//! 活跃连接的权威注册表
//!
//! 两个耦合索引必须保持一致：会话ID到会话实体、用户到其会话集合。
//! 每个用户一个桶，桶粒度加锁（DashMap 分片），不同用户的
//! 连接、断开互不竞争。会话ID到用户的路由索引只在持有对应
//! 用户桶时写入，锁顺序恒为 桶 -> 路由索引，不会死锁。
//!
//! 用户聚合在线状态的上次广播值也存放在桶里，注册表变更和
//! 边沿计算共享同一个临界区，并发变更不会产生重复或丢失的
//! 在线状态事件。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use domain::{Session, SessionId, UserId};

use crate::error::{ApplicationError, ApplicationResult};

/// 一次注册表变更产生的在线状态边沿
///
/// 只有用户的聚合在线状态真正翻转时才会产生；同一用户第二台
/// 设备上线、非最后一台设备下线都不会产生边沿。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEdge {
    pub user_id: UserId,
    pub online: bool,
    /// 边沿序号，在桶临界区内分配。同一用户的边沿序号严格
    /// 递增，发布顺序被并发打乱时消费者可据此丢弃旧边沿。
    pub seq: u64,
}

/// 单个用户的会话桶
#[derive(Default)]
struct UserBucket {
    sessions: HashMap<SessionId, Session>,
    /// 上次对外广播的在线值，边沿触发的比较基准
    broadcast_online: bool,
}

impl UserBucket {
    /// 变更后重算在线值，与上次广播值不同才返回边沿。
    /// 序号取自注册表级计数器：同一用户的边沿都在该用户的
    /// 桶锁下产生，取号顺序即边沿顺序。
    fn presence_edge(&mut self, user_id: UserId, edge_seq: &AtomicU64) -> Option<PresenceEdge> {
        let online = !self.sessions.is_empty();
        if online != self.broadcast_online {
            self.broadcast_online = online;
            Some(PresenceEdge {
                user_id,
                online,
                seq: edge_seq.fetch_add(1, Ordering::Relaxed) + 1,
            })
        } else {
            None
        }
    }
}

/// 会话注册表
pub struct SessionRegistry {
    /// user_id -> 该用户的桶
    buckets: DashMap<UserId, UserBucket>,
    /// session_id -> user_id 路由索引，用于按会话ID断开
    index: DashMap<SessionId, UserId>,
    /// 边沿序号分配器。桶会在空置时被回收，序号不能放在
    /// 桶里，否则重建后会倒退
    edge_seq: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            index: DashMap::new(),
            edge_seq: AtomicU64::new(0),
        }
    }

    /// 注册新会话，返回本次变更产生的在线状态边沿（如有）。
    ///
    /// 对同一 session_id 幂等；同一 session_id 被其他用户占用时
    /// 拒绝并返回冲突错误，注册表不产生任何变化。
    pub fn add(&self, session: Session) -> ApplicationResult<Option<PresenceEdge>> {
        let user_id = session.user_id;
        let session_id = session.session_id;

        let mut bucket = self.buckets.entry(user_id).or_default();

        // 路由索引是会话ID唯一性的裁决点；guard 在 match 结束即释放，
        // 保持 桶 -> 索引 的锁顺序
        let conflict_owner = match self.index.entry(session_id) {
            Entry::Occupied(owner) if *owner.get() != user_id => Some(*owner.get()),
            Entry::Occupied(_) => None, // 同一用户重复 add，幂等
            Entry::Vacant(slot) => {
                slot.insert(user_id);
                None
            }
        };

        if let Some(owner) = conflict_owner {
            let created_empty = bucket.sessions.is_empty() && !bucket.broadcast_online;
            drop(bucket);
            if created_empty {
                self.buckets
                    .remove_if(&user_id, |_, b| b.sessions.is_empty());
            }
            tracing::warn!(
                session_id = %session_id,
                claimed_by = %user_id,
                owner = %owner,
                "会话ID冲突，拒绝连接"
            );
            return Err(ApplicationError::SessionConflict { session_id, owner });
        }

        bucket.sessions.entry(session_id).or_insert(session);
        Ok(bucket.presence_edge(user_id, &self.edge_seq))
    }

    /// 按会话ID注销。未知ID是无害的空操作（断连竞态是常态），
    /// 返回被移除的会话以及可能产生的离线边沿。
    pub fn remove(&self, session_id: SessionId) -> Option<(Session, Option<PresenceEdge>)> {
        let user_id = *self.index.get(&session_id)?;

        let mut result = None;
        let mut prune = false;
        if let Some(mut bucket) = self.buckets.get_mut(&user_id) {
            if let Some(session) = bucket.sessions.remove(&session_id) {
                self.index.remove(&session_id);
                let edge = bucket.presence_edge(user_id, &self.edge_seq);
                prune = bucket.sessions.is_empty();
                result = Some((session, edge));
            }
        }

        // 空桶立即清理，不留悬挂条目
        if prune {
            self.buckets
                .remove_if(&user_id, |_, b| b.sessions.is_empty());
        }

        result
    }

    /// 用户当前全部活跃会话的快照
    pub fn sessions_for_user(&self, user_id: UserId) -> Vec<Session> {
        self.buckets
            .get(&user_id)
            .map(|bucket| bucket.sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 用户当前全部活跃会话ID（扇出路径只需要ID）
    pub fn session_ids_for_user(&self, user_id: UserId) -> Vec<SessionId> {
        self.buckets
            .get(&user_id)
            .map(|bucket| bucket.sessions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// 会话归属的用户
    pub fn user_for_session(&self, session_id: SessionId) -> Option<UserId> {
        self.index.get(&session_id).map(|owner| *owner)
    }

    /// 用户聚合在线状态，注册表的纯函数
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.buckets
            .get(&user_id)
            .map(|bucket| !bucket.sessions.is_empty())
            .unwrap_or(false)
    }

    /// 当前在线用户快照
    pub fn online_users(&self) -> Vec<UserId> {
        self.buckets
            .iter()
            .filter(|entry| !entry.sessions.is_empty())
            .map(|entry| *entry.key())
            .collect()
    }

    /// 活跃会话总数
    pub fn session_count(&self) -> usize {
        self.index.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::DeviceId;
    use uuid::Uuid;

    fn make_session(user_id: UserId, device: &str) -> Session {
        Session::new(
            SessionId::generate(),
            user_id,
            DeviceId::parse(device).unwrap(),
            "127.0.0.1",
            chrono::Utc::now(),
        )
    }

    /// 双索引一致性检查
    fn assert_indices_consistent(registry: &SessionRegistry) {
        for entry in registry.index.iter() {
            let (session_id, user_id) = (*entry.key(), *entry.value());
            let sessions = registry.sessions_for_user(user_id);
            assert!(
                sessions.iter().any(|s| s.session_id == session_id),
                "索引中的会话必须在所属用户的桶里"
            );
        }
        for bucket in registry.buckets.iter() {
            assert!(!bucket.sessions.is_empty(), "空桶必须被立即清理");
            for session_id in bucket.sessions.keys() {
                assert_eq!(registry.user_for_session(*session_id), Some(*bucket.key()));
            }
        }
    }

    #[test]
    fn add_remove_keeps_two_indices_consistent() {
        let registry = SessionRegistry::new();
        let u1 = UserId::from(Uuid::new_v4());
        let u2 = UserId::from(Uuid::new_v4());

        let s1 = make_session(u1, "d1");
        let s2 = make_session(u1, "d2");
        let s3 = make_session(u2, "d1");

        registry.add(s1.clone()).unwrap();
        assert_indices_consistent(&registry);
        registry.add(s2.clone()).unwrap();
        registry.add(s3.clone()).unwrap();
        assert_indices_consistent(&registry);
        assert_eq!(registry.session_count(), 3);

        registry.remove(s1.session_id);
        assert_indices_consistent(&registry);
        registry.remove(s2.session_id);
        assert_indices_consistent(&registry);
        assert!(!registry.is_online(u1));
        assert!(registry.is_online(u2));

        registry.remove(s3.session_id);
        assert_indices_consistent(&registry);
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn duplicate_session_id_for_other_user_is_conflict() {
        let registry = SessionRegistry::new();
        let u1 = UserId::from(Uuid::new_v4());
        let u2 = UserId::from(Uuid::new_v4());

        let session = make_session(u1, "d1");
        registry.add(session.clone()).unwrap();

        let hijack = Session::new(
            session.session_id,
            u2,
            DeviceId::parse("d9").unwrap(),
            "10.0.0.9",
            chrono::Utc::now(),
        );
        let err = registry.add(hijack).unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::SessionConflict { owner, .. } if owner == u1
        ));

        // 冲突不产生任何变化
        assert!(!registry.is_online(u2));
        assert_eq!(registry.user_for_session(session.session_id), Some(u1));
        assert_indices_consistent(&registry);
    }

    #[test]
    fn duplicate_add_same_user_is_idempotent() {
        let registry = SessionRegistry::new();
        let u1 = UserId::from(Uuid::new_v4());
        let session = make_session(u1, "d1");

        let first = registry.add(session.clone()).unwrap();
        assert!(first.is_some());
        let second = registry.add(session.clone()).unwrap();
        assert!(second.is_none(), "重复注册不产生边沿");
        assert_eq!(registry.sessions_for_user(u1).len(), 1);
    }

    #[test]
    fn remove_unknown_session_is_noop() {
        let registry = SessionRegistry::new();
        assert!(registry.remove(SessionId::generate()).is_none());
    }

    #[test]
    fn second_device_produces_no_edge_last_disconnect_produces_one() {
        let registry = SessionRegistry::new();
        let u1 = UserId::from(Uuid::new_v4());
        let s1 = make_session(u1, "d1");
        let s2 = make_session(u1, "d2");

        let edge = registry.add(s1.clone()).unwrap();
        assert!(matches!(
            edge,
            Some(PresenceEdge { user_id, online: true, .. }) if user_id == u1
        ));

        // 第二台设备上线：无边沿
        assert!(registry.add(s2.clone()).unwrap().is_none());

        // 非最后一台设备下线：无边沿
        let (_, edge) = registry.remove(s1.session_id).unwrap();
        assert!(edge.is_none());

        // 最后一台设备下线：恰好一个离线边沿
        let (_, edge) = registry.remove(s2.session_id).unwrap();
        assert!(matches!(
            edge,
            Some(PresenceEdge { user_id, online: false, .. }) if user_id == u1
        ));

        // 再次断开同一会话：无害无边沿
        assert!(registry.remove(s2.session_id).is_none());
    }

    #[test]
    fn presence_edges_carry_increasing_sequence() {
        let registry = SessionRegistry::new();
        let u1 = UserId::from(Uuid::new_v4());

        let s1 = make_session(u1, "d1");
        let e1 = registry.add(s1.clone()).unwrap().unwrap();
        let (_, e2) = registry.remove(s1.session_id).unwrap();
        let e2 = e2.unwrap();

        // 空桶被回收后重连，序号仍然前进
        let s2 = make_session(u1, "d2");
        let e3 = registry.add(s2).unwrap().unwrap();

        assert!(e1.seq < e2.seq);
        assert!(e2.seq < e3.seq);
    }

    #[test]
    fn concurrent_connect_disconnect_keeps_indices_consistent() {
        use std::sync::Arc;

        let registry = Arc::new(SessionRegistry::new());
        let users: Vec<UserId> = (0..8).map(|_| UserId::from(Uuid::new_v4())).collect();

        let mut handles = Vec::new();
        for user_id in users.clone() {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for round in 0..50 {
                    let session = Session::new(
                        SessionId::generate(),
                        user_id,
                        DeviceId::parse(format!("d{round}")).unwrap(),
                        "127.0.0.1",
                        chrono::Utc::now(),
                    );
                    let sid = session.session_id;
                    registry.add(session).unwrap();
                    if round % 2 == 0 {
                        registry.remove(sid);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_indices_consistent(&registry);
        for user_id in users {
            // 每个用户留下 25 个奇数轮会话
            assert_eq!(registry.sessions_for_user(user_id).len(), 25);
        }
    }
}
