use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use beacon_core::domain::{Discrepancy, Severity};
use beacon_core::ids::DiscrepancyId;
use beacon_core::{emit_json, topics, EventChannel};

use crate::error::{EngineError, Result};
use crate::RealityService;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixReport {
    pub fixed: usize,
    pub remaining: usize,
}

/// Compares what a project claims to contain against the files on disk.
///
/// A check takes a list of glob patterns relative to the project root;
/// every pattern with no matching path becomes an open discrepancy. Each
/// check replaces the previous result set.
pub struct RealityManager {
    default_root: Option<PathBuf>,
    discrepancies: Mutex<Vec<Discrepancy>>,
    events: Arc<dyn EventChannel>,
}

impl RealityManager {
    pub fn new(default_root: Option<PathBuf>, events: Arc<dyn EventChannel>) -> Self {
        Self {
            default_root,
            discrepancies: Mutex::new(Vec::new()),
            events,
        }
    }

    fn open(&self) -> Vec<Discrepancy> {
        self.discrepancies
            .lock()
            .iter()
            .filter(|d| !d.resolved)
            .cloned()
            .collect()
    }

    fn publish_open(&self) {
        emit_json(self.events.as_ref(), topics::REALITY_CHECKS, &self.open());
    }
}

fn pattern_matches(root: &Path, pattern: &str) -> Result<bool> {
    let full = root.join(pattern);
    let paths = glob::glob(&full.to_string_lossy())
        .map_err(|e| EngineError::InvalidInput(format!("bad pattern `{pattern}`: {e}")))?;
    for entry in paths {
        match entry {
            Ok(_) => return Ok(true),
            Err(e) => warn!(pattern, error = %e, "unreadable path during reality check"),
        }
    }
    Ok(false)
}

fn severity_for(pattern: &str) -> Severity {
    if pattern.contains('*') {
        Severity::Medium
    } else {
        Severity::High
    }
}

#[async_trait]
impl RealityService for RealityManager {
    async fn perform_check(&self, project_path: Option<&str>, expected: &[String]) -> Result<Vec<Discrepancy>> {
        let root = project_path
            .map(PathBuf::from)
            .or_else(|| self.default_root.clone())
            .ok_or_else(|| EngineError::InvalidInput("projectPath is required".into()))?;
        if !root.is_dir() {
            return Err(EngineError::NotFound(format!("project path {}", root.display())));
        }

        let detected_at = Utc::now().to_rfc3339();
        let mut found = Vec::new();
        for pattern in expected {
            if pattern_matches(&root, pattern)? {
                continue;
            }
            found.push(Discrepancy {
                id: DiscrepancyId::new(),
                pattern: pattern.clone(),
                description: format!("expected `{pattern}` but nothing matches under {}", root.display()),
                severity: severity_for(pattern),
                detected_at: detected_at.clone(),
                resolved: false,
            });
        }
        info!(root = %root.display(), checked = expected.len(), missing = found.len(), "reality check done");

        *self.discrepancies.lock() = found.clone();
        self.publish_open();
        Ok(found)
    }

    /// Mark discrepancies resolved. `None` resolves every open one.
    async fn apply_fixes(&self, ids: Option<&[DiscrepancyId]>) -> Result<FixReport> {
        let report = {
            let mut all = self.discrepancies.lock();
            let mut fixed = 0;
            for d in all.iter_mut().filter(|d| !d.resolved) {
                if ids.map_or(true, |ids| ids.contains(&d.id)) {
                    d.resolved = true;
                    fixed += 1;
                }
            }
            FixReport {
                fixed,
                remaining: all.iter().filter(|d| !d.resolved).count(),
            }
        };
        info!(fixed = report.fixed, remaining = report.remaining, "fixes applied");
        self.publish_open();
        Ok(report)
    }

    async fn get_discrepancies(&self) -> Result<Vec<Discrepancy>> {
        Ok(self.open())
    }
}
