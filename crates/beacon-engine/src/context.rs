use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use beacon_core::domain::{ContextLevel, ContextStatus, Priority, Suggestion};
use beacon_core::{emit_json, topics, EventChannel};

use crate::error::{EngineError, Result};
use crate::ContextService;

const DEFAULT_TARGET_PERCENT: f64 = 50.0;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeReport {
    pub freed_tokens: u64,
    pub status: ContextStatus,
}

#[derive(Default)]
struct Usage {
    used: u64,
    last_source: Option<String>,
    last_optimized_at: Option<String>,
}

/// In-memory token accounting against a fixed budget.
pub struct ContextManager {
    budget: u64,
    usage: Mutex<Usage>,
    events: Arc<dyn EventChannel>,
}

impl ContextManager {
    pub fn new(budget: u64, events: Arc<dyn EventChannel>) -> Self {
        Self {
            budget: budget.max(1),
            usage: Mutex::new(Usage::default()),
            events,
        }
    }

    fn snapshot(&self, usage: &Usage) -> ContextStatus {
        let percent_used = usage.used as f64 * 100.0 / self.budget as f64;
        ContextStatus {
            used_tokens: usage.used,
            budget_tokens: self.budget,
            percent_used,
            level: ContextLevel::for_percent(percent_used),
            last_source: usage.last_source.clone(),
            last_optimized_at: usage.last_optimized_at.clone(),
        }
    }
}

#[async_trait]
impl ContextService for ContextManager {
    async fn track(&self, tokens: u64, source: Option<&str>) -> Result<ContextStatus> {
        let (before, status) = {
            let mut usage = self.usage.lock();
            let before = self.snapshot(&usage).level;
            usage.used = usage.used.saturating_add(tokens);
            if let Some(source) = source {
                usage.last_source = Some(source.to_string());
            }
            (before, self.snapshot(&usage))
        };
        debug!(tokens, used = status.used_tokens, level = ?status.level, "context tracked");

        emit_json(self.events.as_ref(), topics::CONTEXT_STATUS, &status);
        if status.level == ContextLevel::Critical && before != ContextLevel::Critical {
            let suggestion = Suggestion {
                kind: "context".into(),
                message: format!(
                    "Context usage at {:.0}%; run optimizeContext before continuing",
                    status.percent_used
                ),
                priority: Priority::High,
            };
            emit_json(self.events.as_ref(), topics::AGENT_SUGGESTIONS, &[suggestion]);
        }
        Ok(status)
    }

    /// Compact usage down to `target_percent` of the budget. Usage already
    /// under the target is left alone.
    async fn optimize(&self, target_percent: Option<f64>) -> Result<OptimizeReport> {
        let target = target_percent.unwrap_or(DEFAULT_TARGET_PERCENT);
        if !(0.0..=100.0).contains(&target) {
            return Err(EngineError::InvalidInput(format!(
                "targetPercent must be between 0 and 100, got {target}"
            )));
        }
        let target_tokens = (self.budget as f64 * target / 100.0).floor() as u64;

        let report = {
            let mut usage = self.usage.lock();
            let freed = usage.used.saturating_sub(target_tokens);
            usage.used -= freed;
            usage.last_optimized_at = Some(Utc::now().to_rfc3339());
            OptimizeReport {
                freed_tokens: freed,
                status: self.snapshot(&usage),
            }
        };
        info!(freed = report.freed_tokens, target, "context optimized");

        emit_json(self.events.as_ref(), topics::CONTEXT_STATUS, &report.status);
        Ok(report)
    }

    async fn get_status(&self) -> Result<ContextStatus> {
        Ok(self.snapshot(&self.usage.lock()))
    }
}
