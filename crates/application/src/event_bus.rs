//! 进程级事件总线
//!
//! 按事件主题字符串组织订阅者。发布相对发布者的逻辑步骤是
//! 同步的（入队即返回），订阅者通过各自的通道异步消费，
//! 慢订阅者不会拖住路由热路径。
//!
//! 订阅以持有型句柄建模：句柄被显式注销或随组件析构时自动
//! 从总线摘除，不会留下指向已销毁状态的悬挂回调。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tokio::sync::mpsc;

use domain::ChatEvent;

struct SubscriberSlot {
    id: u64,
    tx: mpsc::UnboundedSender<ChatEvent>,
}

/// 事件总线，进程启动时构造一次并注入各组件
pub struct EventBus {
    topics: RwLock<HashMap<String, Vec<SubscriberSlot>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn read_topics(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<SubscriberSlot>>> {
        match self.topics.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_topics(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<SubscriberSlot>>> {
        match self.topics.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 订阅主题，返回持有型订阅句柄
    pub fn subscribe(self: &Arc<Self>, topic: impl Into<String>) -> Subscription {
        let topic = topic.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut topics = self.write_topics();
        topics
            .entry(topic.clone())
            .or_default()
            .push(SubscriberSlot { id, tx });
        drop(topics);

        tracing::debug!(topic = %topic, subscriber_id = id, "订阅事件");
        Subscription {
            id,
            topic,
            rx,
            bus: Arc::downgrade(self),
        }
    }

    /// 发布事件给该主题的全部现有订阅者，返回实际入队的份数。
    /// 已关闭的接收端顺带清理。
    pub fn publish(&self, event: ChatEvent) -> usize {
        let topic = event.topic();
        let mut topics = self.write_topics();
        let Some(slots) = topics.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        slots.retain(|slot| match slot.tx.send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            // 接收端已析构，摘除
            Err(_) => false,
        });
        if slots.is_empty() {
            topics.remove(topic);
        }
        delivered
    }

    /// 注销订阅者，幂等
    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut topics = self.write_topics();
        if let Some(slots) = topics.get_mut(topic) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// 某主题当前的订阅者数量
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.read_topics().get(topic).map_or(0, |slots| slots.len())
    }
}

/// 持有型订阅句柄
///
/// 析构时自动从总线注销，订阅归创建它的组件所有。
pub struct Subscription {
    id: u64,
    topic: String,
    rx: mpsc::UnboundedReceiver<ChatEvent>,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// 等待下一个事件；总线析构且队列耗尽后返回 None
    pub async fn recv(&mut self) -> Option<ChatEvent> {
        self.rx.recv().await
    }

    /// 非阻塞地取一个已入队的事件
    pub fn try_recv(&mut self) -> Option<ChatEvent> {
        self.rx.try_recv().ok()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 显式注销，等价于析构
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.topic, self.id);
        }
    }
}
