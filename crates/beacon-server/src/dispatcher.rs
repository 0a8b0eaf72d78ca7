//! Tool name to collaborator call.
//!
//! Incoming params are first normalized to one snake_case shape, then
//! deserialized into a typed struct per tool. Every failure, including a
//! handler panic, comes back as a failed [`ToolOutcome`].

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use beacon_core::domain::TaskStatus;
use beacon_core::ids::{DiscrepancyId, TaskId};
use beacon_core::ToolOutcome;
use beacon_engine::{Collaborators, EngineError};

const DEFAULT_VELOCITY_WINDOW_HOURS: u32 = 24;

/// Alternate spellings accepted on the wire, mapped to the canonical key.
const PARAM_ALIASES: &[(&str, &str)] = &[
    ("projectPath", "project_path"),
    ("contextTokens", "context_tokens"),
    ("targetPercent", "target_percent"),
    ("windowHours", "window_hours"),
    ("taskId", "task_id"),
    ("session_name", "name"),
    ("sessionName", "name"),
    ("desc", "description"),
];

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid params for {tool}: {reason}")]
    InvalidParams { tool: String, reason: String },

    #[error("{0}")]
    Handler(#[from] EngineError),

    #[error("failed to encode result: {0}")]
    Encode(String),
}

/// Rewrite alias keys to their canonical name. A canonical key already
/// present wins and the alias is discarded.
pub fn normalize_params(params: &Map<String, Value>) -> Map<String, Value> {
    let mut result = params.clone();
    for &(alias, canonical) in PARAM_ALIASES {
        if result.contains_key(canonical) {
            let _ = result.remove(alias);
        } else if let Some(val) = result.remove(alias) {
            let _ = result.insert(canonical.to_string(), val);
        }
    }
    result
}

#[derive(Deserialize)]
struct NoParams {}

#[derive(Deserialize)]
struct StartSession {
    name: String,
    project_path: Option<String>,
}

#[derive(Deserialize)]
struct CreateCheckpoint {
    description: String,
    context_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct CompleteSession {
    summary: Option<String>,
}

#[derive(Deserialize)]
struct TrackContext {
    tokens: u64,
    source: Option<String>,
}

#[derive(Deserialize)]
struct OptimizeContext {
    target_percent: Option<f64>,
}

#[derive(Deserialize)]
struct RealityCheck {
    project_path: Option<String>,
    #[serde(default)]
    expected: Vec<String>,
}

#[derive(Deserialize)]
struct ApplyFixes {
    ids: Option<Vec<DiscrepancyId>>,
}

#[derive(Deserialize)]
struct TrackProgress {
    task: String,
    status: TaskStatus,
    blocker: Option<String>,
}

#[derive(Deserialize)]
struct AnalyzeVelocity {
    window_hours: Option<u32>,
}

#[derive(Deserialize)]
struct ResolveBlocker {
    task_id: TaskId,
    resolution: Option<String>,
}

#[derive(Deserialize)]
struct GenerateDocs {
    target: String,
    content: Option<String>,
}

#[derive(Deserialize)]
struct UpdateDocs {
    target: String,
    content: String,
}

fn parse<T: DeserializeOwned>(tool: &str, params: Map<String, Value>) -> Result<T, DispatchError> {
    serde_json::from_value(Value::Object(params)).map_err(|e| DispatchError::InvalidParams {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(value: T) -> Result<Value, DispatchError> {
    serde_json::to_value(value).map_err(|e| DispatchError::Encode(e.to_string()))
}

pub struct ToolDispatcher {
    collaborators: Collaborators,
}

impl ToolDispatcher {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    /// Run a tool and fold any failure into the outcome.
    pub async fn execute(&self, tool: &str, params: &Map<String, Value>) -> ToolOutcome {
        let call = AssertUnwindSafe(self.dispatch(tool, params)).catch_unwind();
        match call.await {
            Ok(Ok(result)) => ToolOutcome::success(result),
            Ok(Err(e)) => {
                tracing::warn!(tool, error = %e, "tool failed");
                ToolOutcome::failure(e.to_string())
            }
            Err(_) => {
                tracing::error!(tool, "tool handler panicked");
                ToolOutcome::failure(format!("Tool {tool} failed unexpectedly"))
            }
        }
    }

    pub async fn dispatch(&self, tool: &str, params: &Map<String, Value>) -> Result<Value, DispatchError> {
        let p = normalize_params(params);
        let c = &self.collaborators;

        match tool {
            // Sessions
            "startSession" => {
                let args: StartSession = parse(tool, p)?;
                encode(c.sessions.start(&args.name, args.project_path.as_deref()).await?)
            }
            "getActiveSession" => {
                let _: NoParams = parse(tool, p)?;
                encode(c.sessions.get_active().await?)
            }
            "createCheckpoint" => {
                let args: CreateCheckpoint = parse(tool, p)?;
                encode(c.sessions.create_checkpoint(&args.description, args.context_tokens).await?)
            }
            "completeSession" => {
                let args: CompleteSession = parse(tool, p)?;
                encode(c.sessions.complete(args.summary.as_deref()).await?)
            }

            // Context
            "trackContext" => {
                let args: TrackContext = parse(tool, p)?;
                encode(c.context.track(args.tokens, args.source.as_deref()).await?)
            }
            "optimizeContext" => {
                let args: OptimizeContext = parse(tool, p)?;
                encode(c.context.optimize(args.target_percent).await?)
            }
            "getContextStatus" => encode(c.context.get_status().await?),

            // Reality
            "performRealityCheck" => {
                let args: RealityCheck = parse(tool, p)?;
                encode(c.reality.perform_check(args.project_path.as_deref(), &args.expected).await?)
            }
            "applyFixes" => {
                let args: ApplyFixes = parse(tool, p)?;
                encode(c.reality.apply_fixes(args.ids.as_deref()).await?)
            }
            "getDiscrepancies" => encode(c.reality.get_discrepancies().await?),

            // Project
            "trackProgress" => {
                let args: TrackProgress = parse(tool, p)?;
                encode(c.project.track(&args.task, args.status, args.blocker.as_deref()).await?)
            }
            "getProjectStatus" => encode(c.project.get_status().await?),
            "analyzeVelocity" => {
                let args: AnalyzeVelocity = parse(tool, p)?;
                let window = args.window_hours.unwrap_or(DEFAULT_VELOCITY_WINDOW_HOURS);
                encode(c.project.analyze_velocity(window).await?)
            }
            "resolveBlocker" => {
                let args: ResolveBlocker = parse(tool, p)?;
                encode(c.project.resolve_blocker(&args.task_id, args.resolution.as_deref()).await?)
            }

            // Documentation
            "generateDocs" => {
                let args: GenerateDocs = parse(tool, p)?;
                encode(c.docs.generate(&args.target, args.content.as_deref()).await?)
            }
            "updateDocs" => {
                let args: UpdateDocs = parse(tool, p)?;
                encode(c.docs.update(&args.target, &args.content).await?)
            }
            "checkDocStatus" => encode(c.docs.check_status().await?),

            other => Err(DispatchError::UnknownTool(other.to_string())),
        }
    }
}
