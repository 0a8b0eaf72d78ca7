//! Topic names shared by the server router and the client reducer.

pub const SESSION_STATUS: &str = "session.status";
pub const CONTEXT_STATUS: &str = "context.status";
pub const REALITY_CHECKS: &str = "reality.checks";
pub const PROJECT_STATUS: &str = "project.status";
pub const SUGGESTIONS_ACTIONS: &str = "suggestions.actions";

pub const TOOL_EXECUTION: &str = "tool:execution";
pub const AGENT_SUGGESTIONS: &str = "agent:suggestions";
pub const SESSION_CHECKPOINT: &str = "session:checkpoint";

/// Topics a client subscribes to after every successful authentication.
pub const CANONICAL: [&str; 5] = [
    SESSION_STATUS,
    CONTEXT_STATUS,
    REALITY_CHECKS,
    PROJECT_STATUS,
    SUGGESTIONS_ACTIONS,
];

/// What a client subscribes to by default: the canonical topics plus
/// checkpoint history, which is routed like any other subscribed topic.
pub const DEFAULT_SUBSCRIPTIONS: [&str; 6] = [
    SESSION_STATUS,
    CONTEXT_STATUS,
    REALITY_CHECKS,
    PROJECT_STATUS,
    SUGGESTIONS_ACTIONS,
    SESSION_CHECKPOINT,
];

/// Diagnostic topics pushed to every authenticated connection without a subscription.
pub const OUT_OF_BAND: [&str; 2] = [TOOL_EXECUTION, AGENT_SUGGESTIONS];

pub fn is_out_of_band(topic: &str) -> bool {
    OUT_OF_BAND.contains(&topic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_and_out_of_band_are_disjoint() {
        for topic in CANONICAL {
            assert!(!is_out_of_band(topic), "{topic}");
        }
        assert!(is_out_of_band("tool:execution"));
        assert!(is_out_of_band("agent:suggestions"));
        assert!(!is_out_of_band("session:checkpoint"));
    }

    #[test]
    fn default_subscriptions_cover_every_routed_topic() {
        for topic in CANONICAL {
            assert!(DEFAULT_SUBSCRIPTIONS.contains(&topic), "{topic}");
        }
        assert!(DEFAULT_SUBSCRIPTIONS.contains(&SESSION_CHECKPOINT));
        assert!(!DEFAULT_SUBSCRIPTIONS.iter().any(|t| is_out_of_band(t)));
    }
}
