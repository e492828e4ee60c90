//! A named wrapper over [`tokio::task::JoinHandle`] plus a join-on-shutdown
//! helper for the gateway's static background tasks.

use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{StreamExt, stream::FuturesUnordered};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, error, info, warn};

use crate::shutdown::ShutdownChannel;

#[derive(Debug, Error)]
pub enum Error {
    /// A task meant to run for the whole process lifetime returned early.
    #[error("static task finished prematurely: {name}")]
    PrematureFinish { name: String },
    #[error("tasks failed to finish before the shutdown deadline: {names:?}")]
    Hung { names: Vec<String> },
}

/// A named task handle.
///
/// - Panics inside the task are resumed at the join site instead of being
///   swallowed, so a crashing background service takes the process down
///   visibly rather than silently going dark.
/// - `#[must_use]` pushes callers to either join the task or explicitly
///   [`detach`](NamedTask::detach) it.
/// - The spawned future inherits the caller's tracing span.
#[must_use]
pub struct NamedTask<T> {
    handle: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T: Send + 'static> NamedTask<T> {
    pub fn spawn<F>(name: impl Into<Cow<'static, str>>, future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let name = name.into();
        debug!("spawning task: {name}");
        let span = tracing::Span::current();
        Self {
            handle: tokio::spawn(future.instrument(span)),
            name,
        }
    }
}

impl<T> NamedTask<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Drop the handle and let the task run unsupervised. Use sparingly;
    /// a detached task's panics are only surfaced by the runtime.
    pub fn detach(self) {
        drop(self);
    }
}

impl<T> Future for NamedTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        Poll::Ready(match result {
            Ok(value) => Ok(value),
            Err(join_err) => match join_err.try_into_panic() {
                Ok(reason) => {
                    error!("task '{name}' panicked", name = self.name());
                    std::panic::resume_unwind(reason)
                }
                Err(join_err) => Err(join_err),
            },
        })
    }
}

/// Runs a set of static tasks until a shutdown signal arrives, then waits up
/// to `deadline` for them to wind down.
///
/// If any static task returns before shutdown was requested, that is a
/// partial failure: shutdown is triggered for everyone and an error is
/// returned. Tasks that outlive the deadline are reported by name.
pub async fn join_tasks_on_shutdown(
    tasks: Vec<NamedTask<()>>,
    shutdown: ShutdownChannel,
    deadline: Duration,
) -> Result<(), Error> {
    let mut shutdown_rx = shutdown.clone();
    if tasks.is_empty() {
        shutdown_rx.recv().await;
        return Ok(());
    }

    let mut outstanding = tasks
        .iter()
        .map(|task| task.name().to_owned())
        .collect::<std::collections::BTreeSet<_>>();
    let mut running = tasks
        .into_iter()
        .map(|task| {
            let name = task.name().to_owned();
            async move { (name, task.await) }
        })
        .collect::<FuturesUnordered<_>>();

    let mut result = Ok(());

    tokio::select! {
        biased;
        () = shutdown_rx.recv() => info!("shutdown signal received"),
        maybe_finished = running.next() => {
            if let Some((name, task_result)) = maybe_finished {
                if let Err(e) = task_result {
                    warn!("task '{name}' join error: {e:#}");
                }
                outstanding.remove(&name);
                warn!("static task finished prematurely: {name}");
                result = Err(Error::PrematureFinish { name });
                shutdown.send();
            }
        }
    }

    let drain = async {
        while let Some((name, task_result)) = running.next().await {
            if let Err(e) = task_result {
                warn!("task '{name}' join error during shutdown: {e:#}");
            }
            outstanding.remove(&name);
        }
    };

    let drained = tokio::time::timeout(deadline, drain).await;
    if drained.is_err() {
        return Err(Error::Hung {
            names: outstanding.into_iter().collect(),
        });
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn joins_tasks_after_shutdown() {
        let shutdown = ShutdownChannel::new();
        let task = {
            let shutdown = shutdown.clone();
            NamedTask::spawn("listener", shutdown.recv_owned())
        };

        shutdown.send();
        join_tasks_on_shutdown(
            vec![task],
            shutdown,
            Duration::from_secs(1),
        )
        .await
        .expect("clean shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn premature_finish_is_an_error() {
        let shutdown = ShutdownChannel::new();
        let task = NamedTask::spawn("oneshot", async {});

        let result = join_tasks_on_shutdown(
            vec![task],
            shutdown,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(Error::PrematureFinish { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_tasks_are_reported() {
        let shutdown = ShutdownChannel::new();
        let task =
            NamedTask::spawn("sleeper", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            });

        shutdown.send();
        let result = join_tasks_on_shutdown(
            vec![task],
            shutdown.clone(),
            Duration::from_secs(1),
        )
        .await;
        match result {
            Err(Error::Hung { names }) => assert_eq!(names, vec!["sleeper"]),
            other => panic!("expected hung error, got {other:?}"),
        }
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn panics_propagate_to_the_join_site() {
        let task = NamedTask::spawn("bomb", async { panic!("boom") });
        let _ = task.await;
    }
}
