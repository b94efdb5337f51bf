//! User-initiated build cancellation.
//!
//! Cancellation is cooperative: the agent checks its token at turn
//! boundaries and skips persistence once it is tripped.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;
use crate::model::{BuildPayload, JobState, ProjectStatus};
use crate::progress::{EventKind, ProgressBus, ProgressEvent};
use crate::queue::WorkQueue;
use crate::store::ProjectStore;

#[derive(Default)]
struct Tokens {
    active: HashMap<String, (u64, CancellationToken)>,
    /// Projects cancelled while their build was still queued.
    pending: HashSet<String>,
    next: u64,
}

/// Cancellation tokens of running builds, keyed by project.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<Tokens>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tokens> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token for a build attempt that is starting. The registration ends
    /// when the returned guard drops, including when the attempt's future is
    /// dropped by a job timeout.
    pub fn register(&self, project_id: &str) -> Registration<'_> {
        let mut tokens = self.lock();
        tokens.next += 1;
        let id = tokens.next;
        let token = CancellationToken::new();
        if tokens.pending.remove(project_id) {
            token.cancel();
        }
        tokens
            .active
            .insert(project_id.to_string(), (id, token.clone()));
        Registration {
            registry: self,
            project_id: project_id.to_string(),
            id,
            token,
        }
    }

    fn release(&self, project_id: &str, id: u64) {
        let mut tokens = self.lock();
        if tokens.active.get(project_id).is_some_and(|(current, _)| *current == id) {
            tokens.active.remove(project_id);
        }
    }

    /// Trip the running build's token. Returns whether one was running.
    pub fn cancel(&self, project_id: &str) -> bool {
        match self.lock().active.get(project_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the next build of `project_id` as soon as it starts.
    pub fn cancel_pending(&self, project_id: &str) {
        self.lock().pending.insert(project_id.to_string());
    }

    pub fn is_running(&self, project_id: &str) -> bool {
        self.lock().active.contains_key(project_id)
    }
}

/// A running build's entry in the [`CancelRegistry`].
pub struct Registration<'a> {
    registry: &'a CancelRegistry,
    project_id: String,
    id: u64,
    token: CancellationToken,
}

impl Registration<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.project_id, self.id);
    }
}

/// Cancel a project's build: trip the running agent or mark the queued job,
/// set the project failed and tell live viewers. Returns whether a build
/// was found.
pub async fn cancel_build(
    project_id: &str,
    registry: &CancelRegistry,
    projects: &dyn ProjectStore,
    build_queue: &dyn WorkQueue,
    bus: &ProgressBus,
) -> Result<bool> {
    let mut found = registry.cancel(project_id);
    if !found {
        for state in [JobState::Waiting, JobState::Delayed] {
            let queued = build_queue.list(state).await?.into_iter().any(|job| {
                job.payload_as::<BuildPayload>()
                    .is_ok_and(|p| p.project_id == project_id)
            });
            if queued {
                registry.cancel_pending(project_id);
                found = true;
                break;
            }
        }
    }

    projects
        .set_status(project_id, ProjectStatus::Failed, Some("Build cancelled"))
        .await?;
    bus.publish(ProgressEvent::new(
        project_id,
        EventKind::Error,
        "cancelled",
        0,
        "Build cancelled",
    ));
    info!(project_id, found, "build cancelled");
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_a_stale_registration_keeps_the_newer_one() {
        let registry = CancelRegistry::new();
        let first = registry.register("p1");
        let second = registry.register("p1");
        drop(first);
        assert!(registry.cancel("p1"));
        assert!(second.token().is_cancelled());
        drop(second);
        assert!(!registry.is_running("p1"));
    }

    #[test]
    fn pending_cancel_trips_next_registration() {
        let registry = CancelRegistry::new();
        registry.cancel_pending("p1");
        assert!(registry.register("p1").token().is_cancelled());
        assert!(!registry.register("p1").token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn registration_ends_when_the_attempt_is_dropped() {
        let registry = CancelRegistry::new();
        let attempt = async {
            let _registration = registry.register("p1");
            std::future::pending::<()>().await;
        };
        let timed_out = tokio::time::timeout(std::time::Duration::from_secs(1), attempt).await;
        assert!(timed_out.is_err());
        assert!(!registry.is_running("p1"));
        assert!(!registry.cancel("p1"));
    }
}
