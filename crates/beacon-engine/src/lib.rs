//! Domain collaborators behind the tool dispatcher.
//!
//! Each manager owns one slice of developer-workflow state, persists what
//! needs persisting through the injected [`Database`], and reports every
//! state change through an [`EventChannel`] so the server can push it to
//! subscribed clients.

pub mod context;
pub mod docs;
pub mod error;
pub mod project;
pub mod reality;
pub mod sessions;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use beacon_core::domain::{
    Checkpoint, ContextStatus, Discrepancy, DocStatus, ProjectStatus, ProjectTask, Session,
    TaskStatus, Velocity,
};
use beacon_core::ids::{DiscrepancyId, TaskId};
use beacon_core::EventChannel;
use beacon_store::Database;

pub use context::{ContextManager, OptimizeReport};
pub use docs::DocumentationManager;
pub use error::{EngineError, Result};
pub use project::ProjectManager;
pub use reality::{FixReport, RealityManager};
pub use sessions::SessionManager;

#[async_trait]
pub trait SessionService: Send + Sync {
    async fn start(&self, name: &str, project_path: Option<&str>) -> Result<Session>;
    async fn get_active(&self) -> Result<Option<Session>>;
    async fn create_checkpoint(&self, description: &str, context_tokens: Option<u64>) -> Result<Checkpoint>;
    async fn complete(&self, summary: Option<&str>) -> Result<Session>;
}

#[async_trait]
pub trait ContextService: Send + Sync {
    async fn track(&self, tokens: u64, source: Option<&str>) -> Result<ContextStatus>;
    async fn optimize(&self, target_percent: Option<f64>) -> Result<OptimizeReport>;
    async fn get_status(&self) -> Result<ContextStatus>;
}

#[async_trait]
pub trait RealityService: Send + Sync {
    async fn perform_check(&self, project_path: Option<&str>, expected: &[String]) -> Result<Vec<Discrepancy>>;
    async fn apply_fixes(&self, ids: Option<&[DiscrepancyId]>) -> Result<FixReport>;
    async fn get_discrepancies(&self) -> Result<Vec<Discrepancy>>;
}

#[async_trait]
pub trait ProjectService: Send + Sync {
    async fn track(&self, task: &str, status: TaskStatus, blocker: Option<&str>) -> Result<ProjectTask>;
    async fn get_status(&self) -> Result<ProjectStatus>;
    async fn analyze_velocity(&self, window_hours: u32) -> Result<Velocity>;
    async fn resolve_blocker(&self, task_id: &TaskId, resolution: Option<&str>) -> Result<ProjectTask>;
}

#[async_trait]
pub trait DocumentationService: Send + Sync {
    async fn generate(&self, target: &str, content: Option<&str>) -> Result<DocStatus>;
    async fn update(&self, target: &str, content: &str) -> Result<DocStatus>;
    async fn check_status(&self) -> Result<Vec<DocStatus>>;
}

/// Tunables for the default collaborators.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub token_budget: u64,
    pub stale_after_hours: u32,
    /// Base directory for reality checks when a call names none.
    pub default_project_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            token_budget: 200_000,
            stale_after_hours: 24,
            default_project_path: None,
        }
    }
}

/// The full set of collaborators, constructed once and shared by reference.
#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionService>,
    pub context: Arc<dyn ContextService>,
    pub reality: Arc<dyn RealityService>,
    pub project: Arc<dyn ProjectService>,
    pub docs: Arc<dyn DocumentationService>,
}

impl Collaborators {
    /// Build the default managers over one database and one event channel.
    pub fn build(db: Database, events: Arc<dyn EventChannel>, config: EngineConfig) -> Self {
        Self {
            sessions: Arc::new(SessionManager::new(db.clone(), Arc::clone(&events))),
            context: Arc::new(ContextManager::new(config.token_budget, Arc::clone(&events))),
            reality: Arc::new(RealityManager::new(
                config.default_project_path.clone(),
                Arc::clone(&events),
            )),
            project: Arc::new(ProjectManager::new(db, Arc::clone(&events))),
            docs: Arc::new(DocumentationManager::new(config.stale_after_hours, events)),
        }
    }
}
