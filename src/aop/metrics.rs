use super::{NodeAspect, Next};
use crate::types::{Message, Outcome, RuleContext, RuleError};
use async_trait::async_trait;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::time::Instant;

/// 节点执行指标: 按组件类型与关系计数, 以及执行耗时
#[derive(Clone)]
pub struct MetricsAspect {
    executions: IntCounterVec,
    errors: IntCounterVec,
    latency: HistogramVec,
}

impl MetricsAspect {
    pub fn new(registry: &Registry) -> Result<Self, RuleError> {
        let map_err = |e: prometheus::Error| RuleError::ConfigError(format!("注册指标失败: {}", e));

        let executions = IntCounterVec::new(
            Opts::new("rule_node_executions_total", "节点执行次数"),
            &["node_type", "relation"],
        )
        .map_err(map_err)?;
        let errors = IntCounterVec::new(
            Opts::new("rule_node_errors_total", "节点执行错误次数"),
            &["node_type"],
        )
        .map_err(map_err)?;
        let latency = HistogramVec::new(
            HistogramOpts::new("rule_node_duration_seconds", "节点执行耗时"),
            &["node_type"],
        )
        .map_err(map_err)?;

        registry.register(Box::new(executions.clone())).map_err(map_err)?;
        registry.register(Box::new(errors.clone())).map_err(map_err)?;
        registry.register(Box::new(latency.clone())).map_err(map_err)?;

        Ok(Self {
            executions,
            errors,
            latency,
        })
    }
}

impl std::fmt::Debug for MetricsAspect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAspect").finish_non_exhaustive()
    }
}

#[async_trait]
impl NodeAspect for MetricsAspect {
    fn order(&self) -> i32 {
        -100
    }

    async fn around(&self, ctx: &RuleContext, msg: Message, next: Next<'_>) -> Result<(), RuleError> {
        let start = Instant::now();
        let result = next.run(msg).await;
        self.latency
            .with_label_values(&[ctx.self_definition().type_name.as_str()])
            .observe(start.elapsed().as_secs_f64());
        result
    }

    async fn after(&self, ctx: &RuleContext, outcome: Option<&Outcome>) -> Result<(), RuleError> {
        let type_name = ctx.self_definition().type_name.as_str();
        match outcome {
            Some(outcome) if outcome.relations.is_empty() => {
                self.executions.with_label_values(&[type_name, "End"]).inc();
            }
            Some(outcome) => {
                for relation in &outcome.relations {
                    self.executions
                        .with_label_values(&[type_name, relation.as_str()])
                        .inc();
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn error(&self, ctx: &RuleContext, _error: &RuleError) -> Result<(), RuleError> {
        self.errors
            .with_label_values(&[ctx.self_definition().type_name.as_str()])
            .inc();
        Ok(())
    }
}
