//! Completion-kind eligibility checks, run after the throttle limits pass.

use super::task::{RewardTask, TaskPayload};
use crate::error::PortalError;
use std::collections::HashMap;
use std::sync::Arc;

pub const WATCH_VIDEO: &str = "watch_video";
pub const DAILY_CHECK_IN: &str = "daily_check_in";

pub trait CompletionVerifier: Send + Sync {
    fn verify(&self, task: &RewardTask, payload: &TaskPayload) -> Result<(), PortalError>;
}

/// For task kinds that need no evidence.
pub struct AcceptAll;

impl CompletionVerifier for AcceptAll {
    fn verify(&self, _task: &RewardTask, _payload: &TaskPayload) -> Result<(), PortalError> {
        Ok(())
    }
}

/// Requires `video_id` and a `watch_duration` (seconds) of at least the configured minimum.
pub struct VideoWatchVerifier {
    min_watch_seconds: f64,
}

impl VideoWatchVerifier {
    pub fn new(min_watch_seconds: u64) -> Self {
        Self {
            min_watch_seconds: min_watch_seconds as f64,
        }
    }
}

impl CompletionVerifier for VideoWatchVerifier {
    fn verify(&self, task: &RewardTask, payload: &TaskPayload) -> Result<(), PortalError> {
        let has_video = payload
            .get("video_id")
            .and_then(|v| v.as_str())
            .is_some_and(|id| !id.is_empty());
        if !has_video {
            return Err(PortalError::ValidationError(format!(
                "task {} requires a video_id",
                task.id
            )));
        }
        let watched = payload
            .get("watch_duration")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| {
                PortalError::ValidationError(format!(
                    "task {} requires a watch_duration",
                    task.id
                ))
            })?;
        if watched < self.min_watch_seconds {
            return Err(PortalError::ValidationError(format!(
                "watched {watched}s of the required {}s",
                self.min_watch_seconds
            )));
        }
        Ok(())
    }
}

/// Verifiers by task key. Unknown keys fall back to [`AcceptAll`].
#[derive(Clone)]
pub struct VerifierRegistry {
    by_key: HashMap<String, Arc<dyn CompletionVerifier>>,
    fallback: Arc<dyn CompletionVerifier>,
}

impl Default for VerifierRegistry {
    fn default() -> Self {
        Self {
            by_key: HashMap::new(),
            fallback: Arc::new(AcceptAll),
        }
    }
}

impl VerifierRegistry {
    /// The built-in task kinds.
    pub fn standard(min_watch_seconds: u64) -> Self {
        Self::default()
            .with(DAILY_CHECK_IN, AcceptAll)
            .with(WATCH_VIDEO, VideoWatchVerifier::new(min_watch_seconds))
    }

    pub fn with(mut self, key: impl Into<String>, verifier: impl CompletionVerifier + 'static) -> Self {
        self.by_key.insert(key.into(), Arc::new(verifier));
        self
    }

    pub fn verify(&self, task: &RewardTask, payload: &TaskPayload) -> Result<(), PortalError> {
        self.by_key
            .get(&task.key)
            .unwrap_or(&self.fallback)
            .verify(task, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(key: &str) -> RewardTask {
        RewardTask {
            id: 9,
            key: key.to_string(),
            name: "Watch a video".to_string(),
            reward: 100,
            daily_limit: 5,
            interval_seconds: 0,
            repeatable: true,
            valid_from: None,
            valid_to: None,
            enabled: true,
        }
    }

    fn payload(value: serde_json::Value) -> TaskPayload {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_video_watch_requirements() {
        let registry = VerifierRegistry::standard(15);
        let task = task(WATCH_VIDEO);

        assert!(
            registry
                .verify(&task, &payload(json!({"video_id": "v1", "watch_duration": 30})))
                .is_ok()
        );
        assert!(
            registry
                .verify(&task, &payload(json!({"video_id": "v1", "watch_duration": 3.5})))
                .is_err()
        );
        assert!(
            registry
                .verify(&task, &payload(json!({"watch_duration": 30})))
                .is_err()
        );
        assert!(
            registry
                .verify(&task, &payload(json!({"video_id": "v1"})))
                .is_err()
        );
    }

    #[test]
    fn test_unknown_kind_accepts() {
        let registry = VerifierRegistry::standard(15);
        assert!(
            registry
                .verify(&task("share"), &TaskPayload::new())
                .is_ok()
        );
    }

    #[test]
    fn test_custom_verifier() {
        struct Deny;
        impl CompletionVerifier for Deny {
            fn verify(&self, _: &RewardTask, _: &TaskPayload) -> Result<(), PortalError> {
                Err(PortalError::ValidationError("denied".into()))
            }
        }
        let registry = VerifierRegistry::default().with("feedback", Deny);
        assert!(registry.verify(&task("feedback"), &TaskPayload::new()).is_err());
    }
}
