//! 共享资源池
//!
//! 按 (组件类型, 实例标识) 缓存昂贵的外部句柄 (连接、服务器),
//! 多个节点或同一节点热重启前后的实例共享同一句柄。
//! 句柄在首次 `get` 时构建 (或初始化时立即构建), 采用读写锁双重检查,
//! 同一键最多成功构建一次。持有者计数归零时关闭并移除。

use crate::types::{EngineConfig, RuleError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 共享资源的构建函数
pub type SharedFactory<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// 可放入资源池的资源
#[async_trait]
pub trait SharedResource: Send + Sync + 'static {
    async fn close(&self) -> Result<(), RuleError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedKey {
    pub component_type: String,
    pub instance_id: String,
}

impl SharedKey {
    pub fn new(component_type: &str, instance_id: &str) -> Self {
        Self {
            component_type: component_type.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

impl fmt::Display for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.component_type, self.instance_id)
    }
}

struct SharedSlot<T> {
    key: SharedKey,
    instance: RwLock<Option<Arc<T>>>,
    factory: OnceLock<SharedFactory<T>>,
    holders: AtomicUsize,
    initialized: AtomicBool,
    /// 资源池关闭后不再构建
    closed: AtomicBool,
}

impl<T: SharedResource> SharedSlot<T> {
    fn new(key: SharedKey) -> Self {
        Self {
            key,
            instance: RwLock::new(None),
            factory: OnceLock::new(),
            holders: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    async fn get(&self, timeout: Duration) -> Result<Arc<T>, RuleError> {
        self.ensure_open()?;
        if let Some(instance) = self.instance.read().await.as_ref() {
            return Ok(instance.clone());
        }

        let mut guard = self.instance.write().await;
        self.ensure_open()?;
        if let Some(instance) = guard.as_ref() {
            return Ok(instance.clone());
        }

        let factory = self
            .factory
            .get()
            .ok_or_else(|| RuleError::SharedResource(format!("{} 未设置构建函数", self.key)))?;

        debug!(key = %self.key, "构建共享资源");
        match tokio::time::timeout(timeout, factory()).await {
            Ok(Ok(value)) => {
                let instance = Arc::new(value);
                *guard = Some(instance.clone());
                self.initialized.store(true, Ordering::Release);
                Ok(instance)
            }
            Ok(Err(e)) => Err(RuleError::SharedResource(format!("{}: {}", self.key, e))),
            Err(_) => Err(RuleError::SharedInitTimeout(self.key.to_string())),
        }
    }

    fn ensure_open(&self) -> Result<(), RuleError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RuleError::SharedResource(format!("{} 所在资源池已关闭", self.key)));
        }
        Ok(())
    }

    async fn invalidate(&self) -> Result<(), RuleError> {
        let old = {
            let mut guard = self.instance.write().await;
            self.initialized.store(false, Ordering::Release);
            guard.take()
        };
        match old {
            Some(instance) => instance.close().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
trait PooledSlot: Send + Sync {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn holders(&self) -> usize;
    /// 减少一个持有者, 返回剩余数量
    fn release_one(&self) -> usize;
    fn is_init(&self) -> bool;
    async fn close(&self) -> Result<(), RuleError>;
    /// 关闭并拒绝之后的构建
    async fn shutdown(&self) -> Result<(), RuleError>;
}

#[async_trait]
impl<T: SharedResource> PooledSlot for SharedSlot<T> {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }

    fn release_one(&self) -> usize {
        let prev = self
            .holders
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    fn is_init(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), RuleError> {
        self.invalidate().await
    }

    async fn shutdown(&self) -> Result<(), RuleError> {
        self.closed.store(true, Ordering::Release);
        self.invalidate().await
    }
}

/// 引擎持有的共享资源池
#[derive(Default)]
pub struct ResourcePool {
    slots: RwLock<HashMap<SharedKey, Arc<dyn PooledSlot>>>,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    async fn acquire<T: SharedResource>(&self, key: &SharedKey) -> Result<Arc<SharedSlot<T>>, RuleError> {
        let mut slots = self.slots.write().await;
        let slot = match slots.get(key) {
            Some(existing) => existing.clone().as_any().downcast::<SharedSlot<T>>().map_err(|_| {
                RuleError::SharedResource(format!("{} 已被其他类型的资源占用", key))
            })?,
            None => {
                let slot = Arc::new(SharedSlot::<T>::new(key.clone()));
                slots.insert(key.clone(), slot.clone());
                slot
            }
        };
        slot.holders.fetch_add(1, Ordering::AcqRel);
        Ok(slot)
    }

    async fn release(&self, key: &SharedKey) {
        let removed = {
            let mut slots = self.slots.write().await;
            let Some(slot) = slots.get(key) else {
                return;
            };
            if slot.release_one() == 0 {
                slots.remove(key)
            } else {
                None
            }
        };
        match removed {
            Some(slot) => {
                info!(key = %key, "最后一个持有者已释放, 关闭共享资源");
                if let Err(e) = slot.close().await {
                    warn!(key = %key, "关闭共享资源失败: {}", e);
                }
            }
            None => debug!(key = %key, "释放共享资源持有者"),
        }
    }

    /// 强制关闭资源, 仍有持有者时下次 `get` 会重新构建
    pub async fn close(&self, key: &SharedKey) -> Result<(), RuleError> {
        let slot = self.slots.read().await.get(key).cloned();
        match slot {
            Some(slot) => slot.close().await,
            None => Err(RuleError::SharedResource(format!("{} 不存在", key))),
        }
    }

    /// 关闭并移除所有资源; 仍持有资源的节点之后 `get` 返回错误
    pub async fn close_all(&self) {
        let slots: Vec<_> = self.slots.write().await.drain().collect();
        for (key, slot) in slots {
            if let Err(e) = slot.shutdown().await {
                warn!(key = %key, "关闭共享资源失败: {}", e);
            }
        }
    }

    pub async fn contains(&self, key: &SharedKey) -> bool {
        self.slots.read().await.contains_key(key)
    }

    pub async fn holders(&self, key: &SharedKey) -> usize {
        self.slots
            .read()
            .await
            .get(key)
            .map(|slot| slot.holders())
            .unwrap_or(0)
    }

    pub async fn is_init(&self, key: &SharedKey) -> bool {
        self.slots
            .read()
            .await
            .get(key)
            .map(|slot| slot.is_init())
            .unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }
}

/// 节点持有的共享资源句柄
///
/// 实例标识为空时资源为节点私有, 不进入资源池。
pub struct SharedNode<T: SharedResource> {
    key: Option<SharedKey>,
    slot: Option<Arc<SharedSlot<T>>>,
    pool: Option<Arc<ResourcePool>>,
    timeout: Duration,
    released: AtomicBool,
}

impl<T: SharedResource> Default for SharedNode<T> {
    fn default() -> Self {
        Self {
            key: None,
            slot: None,
            pool: None,
            timeout: Duration::from_millis(4000),
            released: AtomicBool::new(true),
        }
    }
}

impl<T: SharedResource> SharedNode<T> {
    /// 登记到资源池; `init_now` 为真时立即构建, 构建失败则初始化失败
    pub async fn init(
        &mut self,
        config: &EngineConfig,
        component_type: &str,
        instance_id: &str,
        init_now: bool,
        factory: SharedFactory<T>,
    ) -> Result<(), RuleError> {
        self.release().await;

        let key = SharedKey::new(component_type, instance_id);
        let (slot, pool) = if instance_id.is_empty() {
            (Arc::new(SharedSlot::new(key.clone())), None)
        } else {
            (
                config.pool.acquire::<T>(&key).await?,
                Some(config.pool.clone()),
            )
        };
        // 同一键以首个登记者的构建函数为准
        let _ = slot.factory.set(factory);

        self.key = Some(key);
        self.slot = Some(slot);
        self.pool = pool;
        self.timeout = config.shared_init_timeout();
        self.released.store(false, Ordering::Release);

        if init_now {
            if let Err(e) = self.get().await {
                self.release().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// 获取资源, 未构建时按超时限制构建
    pub async fn get(&self) -> Result<Arc<T>, RuleError> {
        let slot = self
            .slot
            .as_ref()
            .ok_or_else(|| RuleError::SharedResource("共享资源未初始化".into()))?;
        if self.released.load(Ordering::Acquire) {
            return Err(RuleError::SharedResource(format!("{} 已释放", slot.key)));
        }
        slot.get(self.timeout).await
    }

    pub fn is_init(&self) -> bool {
        self.slot
            .as_ref()
            .map(|slot| slot.initialized.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn key(&self) -> Option<&SharedKey> {
        self.key.as_ref()
    }

    /// 关闭当前资源, 下次 `get` 时重新构建
    pub async fn invalidate(&self) -> Result<(), RuleError> {
        match &self.slot {
            Some(slot) => slot.invalidate().await,
            None => Ok(()),
        }
    }

    /// 关闭当前资源并重新构建
    pub async fn restart(&self) -> Result<Arc<T>, RuleError> {
        if let Some(slot) = &self.slot {
            slot.invalidate().await?;
        }
        self.get().await
    }

    /// 释放持有; 多次调用只生效一次
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let (Some(key), Some(slot)) = (&self.key, &self.slot) else {
            return;
        };
        match &self.pool {
            Some(pool) => pool.release(key).await,
            None => {
                if let Err(e) = slot.invalidate().await {
                    warn!(key = %key, "关闭私有资源失败: {}", e);
                }
            }
        }
    }
}
