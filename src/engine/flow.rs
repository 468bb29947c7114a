//! 一条消息的执行过程
//!
//! 计数器从 1 开始 (入口节点), 每个要派发的子分支先加一, 节点处理完成后减一,
//! 归零时整条消息处理结束, 完成回调只触发一次。
//! 节点不上报任何关系时不减计数, 该消息的完成回调不会触发。

use crate::aop::{AspectList, Next};
use crate::engine::{RuleChainCtx, RuleNodeCtx};
use crate::types::{Message, Outcome, RuleContext, RuleError};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// 分支结束 (没有后续连线或显式结束) 时的回调
pub type OnEndFn = Arc<dyn Fn(&Outcome) + Send + Sync>;

/// 所有分支结束时的回调, 参数为记录的第一个错误
pub type OnCompletedFn = Arc<dyn Fn(Option<&RuleError>) + Send + Sync>;

/// 消息处理选项
#[derive(Clone, Default)]
pub struct MsgOptions {
    pub(crate) on_end: Option<OnEndFn>,
    pub(crate) on_completed: Option<OnCompletedFn>,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) start_node: Option<String>,
}

impl MsgOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_end(mut self, f: impl Fn(&Outcome) + Send + Sync + 'static) -> Self {
        self.on_end = Some(Arc::new(f));
        self
    }

    pub fn on_completed(mut self, f: impl Fn(Option<&RuleError>) + Send + Sync + 'static) -> Self {
        self.on_completed = Some(Arc::new(f));
        self
    }

    /// 调用方的取消信号, 仅作用于需要等待的调用
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// 从指定节点开始处理
    pub fn start_at(mut self, node_id: &str) -> Self {
        self.start_node = Some(node_id.to_string());
        self
    }
}

pub struct MsgFlow {
    chain_id: String,
    origin: Message,
    /// 第一跳分支在调用方任务内并发执行并等待
    join_first_hop: bool,
    caller: CancellationToken,
    stop: CancellationToken,
    pending: AtomicUsize,
    error: OnceLock<RuleError>,
    completed: AtomicBool,
    on_end: Option<OnEndFn>,
    on_completed: Option<OnCompletedFn>,
    aspects: AspectList,
}

impl MsgFlow {
    pub(crate) fn new(
        chain_id: &str,
        origin: Message,
        join_first_hop: bool,
        opts: &MsgOptions,
        shutdown: &CancellationToken,
        aspects: AspectList,
    ) -> Arc<Self> {
        let stop = shutdown.child_token();
        let caller = match (&opts.cancel, join_first_hop) {
            (Some(token), true) => token.clone(),
            _ => stop.clone(),
        };
        Arc::new(Self {
            chain_id: chain_id.to_string(),
            origin,
            join_first_hop,
            caller,
            stop,
            pending: AtomicUsize::new(1),
            error: OnceLock::new(),
            completed: AtomicBool::new(false),
            on_end: opts.on_end.clone(),
            on_completed: opts.on_completed.clone(),
            aspects,
        })
    }

    /// 指定跳数节点所在的取消作用域
    pub(crate) fn scope(&self, depth: usize) -> CancellationToken {
        if self.join_first_hop && depth <= 1 {
            self.caller.clone()
        } else {
            self.stop.clone()
        }
    }

    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn is_cancelled(&self, scope: &CancellationToken) -> bool {
        scope.is_cancelled() || self.stop.is_cancelled()
    }

    async fn cancelled(&self, scope: &CancellationToken) {
        tokio::select! {
            _ = scope.cancelled() => {}
            _ = self.stop.cancelled() => {}
        }
    }

    pub(crate) fn record_error(&self, err: RuleError) {
        let _ = self.error.set(err);
    }

    pub(crate) fn error(&self) -> Option<RuleError> {
        self.error.get().cloned()
    }

    fn notify_end(&self, outcome: &Outcome) {
        if let Some(on_end) = &self.on_end {
            on_end(outcome);
        }
    }

    async fn release(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.complete().await;
        }
    }

    async fn complete(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let err = self.error.get();
        debug!(chain = %self.chain_id, msg_id = %self.origin.id, "消息处理完成");
        self.aspects
            .after_process(&self.chain_id, &self.origin, err)
            .await;
        if let Some(on_completed) = &self.on_completed {
            on_completed(err);
        }
    }

    /// 按上报的关系派发后续节点, 然后释放当前节点的计数
    async fn dispatch(self: &Arc<Self>, chain: &Arc<RuleChainCtx>, outcome: &Outcome, depth: usize) {
        if let Some(err) = &outcome.err {
            self.record_error(err.clone());
        }

        let targets = chain.targets(&outcome.node_id, &outcome.relations).await;
        if targets.is_empty() {
            self.notify_end(outcome);
        }

        self.pending.fetch_add(targets.len(), Ordering::AcqRel);
        if self.join_first_hop && depth == 0 {
            let branches = targets.into_iter().map(|target| {
                execute(
                    self.clone(),
                    chain.clone(),
                    target,
                    outcome.msg.clone(),
                    depth + 1,
                )
            });
            join_all(branches).await;
        } else {
            for target in targets {
                tokio::spawn(execute(
                    self.clone(),
                    chain.clone(),
                    target,
                    outcome.msg.clone(),
                    depth + 1,
                ));
            }
        }

        self.release().await;
    }
}

/// 执行一个节点并派发后续分支, 返回该节点上报的结果
pub(crate) fn execute(
    flow: Arc<MsgFlow>,
    chain: Arc<RuleChainCtx>,
    node: Arc<RuleNodeCtx>,
    msg: Message,
    depth: usize,
) -> BoxFuture<'static, Option<Outcome>> {
    async move {
        let scope = flow.scope(depth);
        if flow.is_cancelled(&scope) {
            debug!(chain = %chain.id(), node = %node.id(), "消息处理已取消, 跳过节点");
            flow.record_error(RuleError::Canceled);
            flow.release().await;
            return None;
        }

        let (instance, definition, aspects) = node.snapshot().await;
        let Some(instance) = instance else {
            let err = RuleError::NodeNotInit(node.id().to_string());
            error!(chain = %chain.id(), node = %node.id(), "{}", err);
            flow.record_error(err.clone());
            flow.notify_end(&Outcome {
                node_id: node.id().to_string(),
                msg,
                relations: Vec::new(),
                err: Some(err),
            });
            flow.release().await;
            return None;
        };

        let mut ctx = RuleContext::new(flow.clone(), chain.clone(), node.clone(), definition, depth);
        let selected = aspects.select(&ctx, &msg);
        AspectList::before_node(&selected, &ctx, &msg).await;

        let result = {
            let run = Next::new(&selected, instance.as_ref(), &ctx).run(msg.clone());
            tokio::select! {
                result = AssertUnwindSafe(run).catch_unwind() => Some(result),
                _ = flow.cancelled(&scope) => None,
            }
        };

        match result {
            None => {
                debug!(chain = %chain.id(), node = %node.id(), "节点执行被取消");
                flow.record_error(RuleError::Canceled);
                flow.release().await;
                None
            }
            Some(Err(panic)) => {
                error!(
                    chain = %chain.id(),
                    node = %node.id(),
                    "节点执行发生panic: {}",
                    panic_message(panic.as_ref())
                );
                flow.release().await;
                None
            }
            Some(Ok(Err(err))) => {
                AspectList::node_error(&selected, &ctx, &err).await;
                flow.record_error(err.clone());
                flow.notify_end(&Outcome {
                    node_id: node.id().to_string(),
                    msg,
                    relations: Vec::new(),
                    err: Some(err),
                });
                flow.release().await;
                None
            }
            Some(Ok(Ok(()))) => match ctx.take_outcome() {
                Some(outcome) => {
                    AspectList::after_node(&selected, &ctx, Some(&outcome)).await;
                    flow.dispatch(&chain, &outcome, depth).await;
                    Some(outcome)
                }
                None => {
                    AspectList::after_node(&selected, &ctx, None).await;
                    debug!(chain = %chain.id(), node = %node.id(), "节点未上报关系, 分支停止");
                    None
                }
            },
        }
    }
    .boxed()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
