use std::sync::Arc;
use std::thread;

use super::{Generator, SessionReport, SessionSpec};
use crate::control::ControlPlane;
use crate::error::Result;

/// What a fleet does when one of its sessions fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Let the other sessions run to completion.
    #[default]
    Continue,
    /// Shut the generator down, draining every other session.
    AbortAll,
}

impl Generator {
    /// Run every session of `specs` in parallel, one thread each.
    ///
    /// Results are returned in the order of `specs`.
    pub fn run_fleet(
        &self,
        control: &Arc<dyn ControlPlane>,
        specs: &[SessionSpec],
        policy: FailurePolicy,
    ) -> Vec<Result<SessionReport>> {
        tracing::info!(sessions = specs.len(), ?policy, "starting session fleet");

        let results: Vec<Result<SessionReport>> = thread::scope(|scope| {
            let handles: Vec<_> = specs
                .iter()
                .map(|spec| {
                    thread::Builder::new()
                        .name(format!("session-{}", spec.instance_id))
                        .spawn_scoped(scope, move || {
                            let result = self.run_session(control, spec);
                            if result.is_err() && policy == FailurePolicy::AbortAll {
                                tracing::warn!(instance_id = %spec.instance_id, "session failed, aborting fleet");
                                self.shutdown();
                            }
                            result
                        })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| match handle {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or_else(|payload| std::panic::resume_unwind(payload)),
                    Err(e) => Err(e.into()),
                })
                .collect()
        });

        let failed = results.iter().filter(|r| r.is_err()).count();
        tracing::info!(sessions = results.len(), failed, "session fleet finished");
        results
    }
}
