//! 通知中枢（NotificationHub）
//!
//! 进程内单例，由启动代码构造并注入编排器；`start` 启动心跳，`shutdown` 关闭所有订阅。
//! 每个订阅者一个有界发件箱：`publish` 只做入队，从不等待慢客户端。
//! 发件箱满时先丢弃同类最旧的一条，没有同类再丢弃最旧的一条；心跳只替换心跳，从不挤掉事件。
//! 不保留断线客户端的积压，重连后收到新的 connection_established，再自行拉取快照。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::Stream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::event::{Event, EventType};
use crate::config::NotificationSection;
use crate::task::ProjectId;

/// 连接 ID
pub type ConnectionId = String;

/// 发给单个连接的消息
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Event(Event),
    /// 心跳（传输层转成 Ping 帧）
    Heartbeat,
}

impl HubMessage {
    fn category(&self) -> Option<EventType> {
        match self {
            HubMessage::Event(e) => Some(e.event_type),
            HubMessage::Heartbeat => None,
        }
    }
}

/// 有界发件箱
struct Outbox {
    queue: Mutex<VecDeque<HubMessage>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<HubMessage>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, message: HubMessage) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.lock();
            if queue.len() >= self.capacity {
                let category = message.category();
                let same = queue.iter().position(|m| m.category() == category);
                let victim = match (category, same) {
                    (_, Some(i)) => i,
                    // 心跳不挤占事件
                    (None, None) => return,
                    (Some(_), None) => queue
                        .iter()
                        .position(|m| matches!(m, HubMessage::Heartbeat))
                        .unwrap_or(0),
                };
                if queue.remove(victim).is_some_and(|m| m != HubMessage::Heartbeat) {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<HubMessage> {
        self.lock().pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    async fn recv(&self) -> Option<HubMessage> {
        loop {
            if let Some(message) = self.pop() {
                return Some(message);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

/// 一个连接对某项目的订阅
pub struct Subscription {
    connection_id: ConnectionId,
    project_id: ProjectId,
    outbox: Arc<Outbox>,
}

impl Subscription {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// 下一条消息；退订或中枢关闭后返回 None
    pub async fn recv(&mut self) -> Option<HubMessage> {
        self.outbox.recv().await
    }

    /// 因发件箱已满而丢弃的消息数
    pub fn dropped(&self) -> u64 {
        self.outbox.dropped.load(Ordering::Relaxed)
    }

    pub fn into_stream(self) -> impl Stream<Item = HubMessage> {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|m| (m, sub))
        })
    }
}

struct Subscriber {
    project_id: ProjectId,
    outbox: Arc<Outbox>,
    last_seen: Mutex<Instant>,
}

impl Subscriber {
    fn seen(&self) {
        if let Ok(mut last) = self.last_seen.lock() {
            *last = Instant::now();
        }
    }

    fn silent_for(&self) -> Duration {
        self.last_seen
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

/// 通知中枢
pub struct NotificationHub {
    subscribers: RwLock<HashMap<ConnectionId, Subscriber>>,
    heartbeat_interval: Duration,
    buffer: usize,
    shutdown: CancellationToken,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationHub {
    pub fn new(config: &NotificationSection) -> Self {
        Self::with_heartbeat(
            Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            config.outbound_buffer,
        )
    }

    pub fn with_heartbeat(heartbeat_interval: Duration, buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            heartbeat_interval,
            buffer: buffer.max(1),
            shutdown: CancellationToken::new(),
            heartbeat_task: Mutex::new(None),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ConnectionId, Subscriber>> {
        match self.subscribers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ConnectionId, Subscriber>> {
        match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// 启动心跳循环：每个周期先清理失联连接，再向其余连接发心跳
    pub fn start(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.heartbeat_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = hub.reap_dead();
                        if !reaped.is_empty() {
                            tracing::info!(count = reaped.len(), "dropped silent connections");
                        }
                        hub.broadcast_heartbeat();
                    }
                }
            }
            tracing::debug!("notification hub heartbeat stopped");
        });
        if let Ok(mut slot) = self.heartbeat_task.lock() {
            *slot = Some(handle);
        }
        tracing::info!(interval = ?self.heartbeat_interval, "notification hub started");
    }

    /// 关闭：停止心跳并结束所有订阅
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.heartbeat_task.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let drained: Vec<Subscriber> = self.write().drain().map(|(_, s)| s).collect();
        for subscriber in &drained {
            subscriber.outbox.close();
        }
        tracing::info!(connections = drained.len(), "notification hub shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 订阅项目；同一连接重复订阅时替换旧订阅。新订阅首先收到 connection_established
    pub fn subscribe(&self, project_id: &str, connection_id: &str) -> Subscription {
        let outbox = Arc::new(Outbox::new(self.buffer));
        if self.is_shutdown() {
            outbox.close();
        } else {
            outbox.push(HubMessage::Event(Event::new(
                EventType::ConnectionEstablished,
                project_id,
                serde_json::json!({
                    "connectionId": connection_id,
                    "heartbeatIntervalSecs": self.heartbeat_interval.as_secs_f64(),
                }),
            )));
            let previous = self.write().insert(
                connection_id.to_string(),
                Subscriber {
                    project_id: project_id.to_string(),
                    outbox: Arc::clone(&outbox),
                    last_seen: Mutex::new(Instant::now()),
                },
            );
            if let Some(previous) = previous {
                previous.outbox.close();
            }
            tracing::debug!(project_id, connection_id, "subscribed");
        }
        Subscription {
            connection_id: connection_id.to_string(),
            project_id: project_id.to_string(),
            outbox,
        }
    }

    /// 退订；返回连接是否存在
    pub fn unsubscribe(&self, connection_id: &str) -> bool {
        match self.write().remove(connection_id) {
            Some(subscriber) => {
                subscriber.outbox.close();
                tracing::debug!(connection_id, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// 向项目的所有订阅者入队事件，立即返回投递的连接数
    pub fn publish(&self, project_id: &str, event: Event) -> usize {
        let subscribers = self.read();
        let mut delivered = 0;
        for subscriber in subscribers.values().filter(|s| s.project_id == project_id) {
            subscriber.outbox.push(HubMessage::Event(event.clone()));
            delivered += 1;
        }
        delivered
    }

    /// 刷新连接的存活时间（收到任意客户端帧时调用）
    pub fn touch(&self, connection_id: &str) {
        if let Some(subscriber) = self.read().get(connection_id) {
            subscriber.seen();
        }
    }

    /// 退订沉默超过两个心跳周期的连接
    pub fn reap_dead(&self) -> Vec<ConnectionId> {
        let limit = self.heartbeat_interval * 2;
        let dead: Vec<ConnectionId> = self
            .read()
            .iter()
            .filter(|(_, s)| s.silent_for() > limit)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dead {
            self.unsubscribe(id);
        }
        dead
    }

    fn broadcast_heartbeat(&self) {
        for subscriber in self.read().values() {
            subscriber.outbox.push(HubMessage::Heartbeat);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.read().len()
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.read()
            .values()
            .filter(|s| s.project_id == project_id)
            .count()
    }
}
