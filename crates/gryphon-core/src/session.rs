//! Session lifecycle and per-session execution.
//!
//! Each session owns one worker task and a bounded command queue, so requests
//! bound to the same session execute strictly in arrival order while separate
//! sessions run in parallel. Sessionless requests bypass this module entirely
//! and go straight through [`evaluate_with_timeout`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::graph::GraphBackend;
use crate::script::{Bindings, EvalContext, ResultIter, ScriptEngine, ScriptError};
use crate::settings::{Settings, TransactionMode};
use crate::value::Value;

/// Why a session-bound evaluation produced no results. A force-closed
/// session is reported distinctly from script failures so it is never
/// mistaken for a timeout.
#[derive(Debug, Error)]
pub enum EvalFailure {
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("session was force-closed before the request completed")]
    SessionClosed,
}

/// One script evaluation handed to a session worker (or run directly for
/// sessionless requests).
pub struct EvalJob {
    pub script: String,
    /// Request-scoped bindings, merged into the session's bindings before the
    /// script runs.
    pub bindings: HashMap<String, Value>,
    /// Effective soft timeout: the request override or the server default.
    pub timeout: Duration,
    pub reply: oneshot::Sender<std::result::Result<ResultIter, EvalFailure>>,
}

enum SessionCommand {
    Eval(EvalJob),
    Close { reply: oneshot::Sender<()> },
}

/// Runs a script on the blocking pool under a soft timeout. When the timeout
/// fires the cancellation token flips and the evaluation is awaited to
/// completion anyway; the script observes the token at its next statement
/// boundary and unwinds with [`ScriptError::Cancelled`].
pub async fn evaluate_with_timeout(
    engine: Arc<ScriptEngine>,
    graph: Option<Arc<dyn GraphBackend>>,
    mut bindings: Bindings,
    script: String,
    timeout: Duration,
    cancel: CancellationToken,
) -> (Bindings, std::result::Result<ResultIter, ScriptError>) {
    let eval_cancel = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || {
        let ctx = EvalContext {
            bindings: &mut bindings,
            graph,
            cancel: eval_cancel,
        };
        let result = engine.evaluate(&script, ctx);
        (bindings, result)
    });

    let joined = tokio::select! {
        joined = &mut handle => joined,
        () = tokio::time::sleep(timeout) => {
            cancel.cancel();
            handle.await
        }
    };
    match joined {
        Ok((bindings, result)) => (bindings, result),
        Err(err) => (Bindings::new(), Err(join_failure(err))),
    }
}

fn join_failure(err: JoinError) -> ScriptError {
    // A panic inside an evaluation is isolated to that request.
    ScriptError::Runtime(format!("script evaluation aborted: {err}"))
}

/// Tracks live sessions and routes jobs to their workers.
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
    settings: Settings,
    engine: Arc<ScriptEngine>,
    graph: Arc<dyn GraphBackend>,
}

struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
}

impl SessionRegistry {
    pub fn new(settings: Settings, engine: Arc<ScriptEngine>, graph: Arc<dyn GraphBackend>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            settings,
            engine,
            graph,
        }
    }

    /// Queues a job on the named session, creating it on first use. Rejects
    /// with [`Error::SessionQueueFull`] rather than blocking when the
    /// session's queue is at capacity.
    pub async fn submit(&self, session_id: &str, job: EvalJob) -> Result<()> {
        let tx = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(session_id) {
                Some(handle) => handle.tx.clone(),
                None => {
                    let handle = self.spawn_session(session_id);
                    let tx = handle.tx.clone();
                    sessions.insert(session_id.to_string(), handle);
                    info!(session_id, "session created");
                    tx
                }
            }
        };
        tx.try_send(SessionCommand::Eval(job))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(session_id, "session queue full, rejecting request");
                    Error::SessionQueueFull {
                        session_id: session_id.to_string(),
                        limit: self.settings.session_queue_depth,
                    }
                }
                mpsc::error::TrySendError::Closed(_) => Error::SessionClosed {
                    session_id: session_id.to_string(),
                },
            })
    }

    /// Closes a session. A graceful close lets already-queued work drain; a
    /// forced close cancels the running evaluation as well.
    pub async fn close(&self, session_id: &str, force: bool) -> Result<()> {
        let handle = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if force {
            handle.cancel.cancel();
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = handle
            .tx
            .send(SessionCommand::Close { reply: reply_tx })
            .await;
        // A forced worker exits without acknowledging; that is fine.
        let _ = reply_rx.await;
        info!(session_id, force, "session closed");
        Ok(())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn spawn_session(&self, session_id: &str) -> SessionHandle {
        let (tx, rx) = mpsc::channel(self.settings.session_queue_depth);
        let cancel = CancellationToken::new();
        let worker = SessionWorker {
            session_id: session_id.to_string(),
            rx,
            tx: tx.clone(),
            cancel: cancel.clone(),
            engine: Arc::clone(&self.engine),
            graph: Arc::clone(&self.graph),
            settings: self.settings.clone(),
            registry: Arc::clone(&self.sessions),
        };
        tokio::spawn(worker.run());
        SessionHandle { tx, cancel }
    }
}

struct SessionWorker {
    session_id: String,
    rx: mpsc::Receiver<SessionCommand>,
    /// Kept for channel-identity checks when deregistering.
    tx: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
    engine: Arc<ScriptEngine>,
    graph: Arc<dyn GraphBackend>,
    settings: Settings,
    registry: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl SessionWorker {
    async fn run(mut self) {
        let idle = self.settings.session_idle_timeout();
        let mut bindings = Bindings::new();
        loop {
            let command = tokio::select! {
                () = self.cancel.cancelled() => break,
                received = tokio::time::timeout(idle, self.rx.recv()) => match received {
                    Ok(Some(command)) => command,
                    Ok(None) => break,
                    Err(_) => {
                        info!(session_id = %self.session_id, "evicting idle session");
                        break;
                    }
                },
            };
            match command {
                SessionCommand::Close { reply } => {
                    let _ = reply.send(());
                    break;
                }
                SessionCommand::Eval(job) => {
                    bindings = self.run_job(bindings, job).await;
                }
            }
        }
        self.deregister().await;
    }

    async fn run_job(&self, mut bindings: Bindings, job: EvalJob) -> Bindings {
        debug!(session_id = %self.session_id, "evaluating session request");
        let managed = self.settings.session_transaction_mode == TransactionMode::Managed;
        if managed {
            self.graph.tx_begin();
        }
        for (name, value) in job.bindings {
            bindings.insert_value(name, value);
        }
        let (returned, result) = evaluate_with_timeout(
            Arc::clone(&self.engine),
            Some(Arc::clone(&self.graph)),
            std::mem::take(&mut bindings),
            job.script,
            job.timeout,
            self.cancel.child_token(),
        )
        .await;
        if managed {
            if result.is_ok() {
                self.graph.tx_commit();
            } else {
                self.graph.tx_rollback();
            }
        }
        // The soft timeout cancels only the job's child token; a cancelled
        // session token means the whole session was force-closed.
        let result = result.map_err(|err| {
            if matches!(err, ScriptError::Cancelled) && self.cancel.is_cancelled() {
                EvalFailure::SessionClosed
            } else {
                EvalFailure::Script(err)
            }
        });
        let _ = job.reply.send(result);
        returned
    }

    async fn deregister(&self) {
        let mut sessions = self.registry.lock().await;
        // A fresh session may already have replaced this one; only remove the
        // entry if it still points at this worker's channel.
        if let Some(handle) = sessions.get(&self.session_id)
            && handle.tx.same_channel(&self.tx)
        {
            sessions.remove(&self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    fn registry(settings: Settings) -> SessionRegistry {
        let engine = Arc::new(ScriptEngine::from_settings(&settings));
        let graph: Arc<dyn GraphBackend> = Arc::new(MemoryGraph::new());
        SessionRegistry::new(settings, engine, graph)
    }

    async fn submit_and_wait(
        registry: &SessionRegistry,
        session_id: &str,
        script: &str,
    ) -> std::result::Result<Vec<Value>, EvalFailure> {
        let (reply_tx, reply_rx) = oneshot::channel();
        registry
            .submit(
                session_id,
                EvalJob {
                    script: script.to_string(),
                    bindings: HashMap::new(),
                    timeout: Duration::from_secs(5),
                    reply: reply_tx,
                },
            )
            .await
            .unwrap();
        reply_rx.await.unwrap().map(Iterator::collect)
    }

    #[tokio::test]
    async fn bindings_persist_within_a_session() {
        let registry = registry(Settings::default());
        submit_and_wait(&registry, "s1", "x = 41").await.unwrap();
        let result = submit_and_wait(&registry, "s1", "x + 1").await.unwrap();
        assert_eq!(result, vec![Value::Int(42)]);
    }

    #[tokio::test]
    async fn sessions_are_isolated_from_each_other() {
        let registry = registry(Settings::default());
        submit_and_wait(&registry, "s1", "x = 1").await.unwrap();
        let err = submit_and_wait(&registry, "s2", "x").await.unwrap_err();
        assert_eq!(err.to_string(), "No such property: x");
    }

    #[tokio::test]
    async fn soft_timeout_cancels_a_long_evaluation() {
        let registry = registry(Settings::default());
        let (reply_tx, reply_rx) = oneshot::channel();
        registry
            .submit(
                "s1",
                EvalJob {
                    script: "sleep(30000)".to_string(),
                    bindings: HashMap::new(),
                    timeout: Duration::from_millis(100),
                    reply: reply_tx,
                },
            )
            .await
            .unwrap();
        let err = reply_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, EvalFailure::Script(ScriptError::Cancelled)));
    }

    #[tokio::test]
    async fn full_queue_rejects_rather_than_blocks() {
        let settings = Settings {
            session_queue_depth: 1,
            ..Settings::default()
        };
        let registry = registry(settings);

        // First job occupies the worker, second fills the queue.
        let (tx1, _rx1) = oneshot::channel();
        registry
            .submit(
                "s1",
                EvalJob {
                    script: "sleep(2000)".to_string(),
                    bindings: HashMap::new(),
                    timeout: Duration::from_secs(5),
                    reply: tx1,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (tx2, _rx2) = oneshot::channel();
        registry
            .submit(
                "s1",
                EvalJob {
                    script: "1".to_string(),
                    bindings: HashMap::new(),
                    timeout: Duration::from_secs(5),
                    reply: tx2,
                },
            )
            .await
            .unwrap();

        let (tx3, _rx3) = oneshot::channel();
        let err = registry
            .submit(
                "s1",
                EvalJob {
                    script: "1".to_string(),
                    bindings: HashMap::new(),
                    timeout: Duration::from_secs(5),
                    reply: tx3,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionQueueFull { limit: 1, .. }));
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted() {
        let settings = Settings {
            session_idle_timeout_ms: 50,
            ..Settings::default()
        };
        let registry = registry(settings);
        submit_and_wait(&registry, "s1", "1").await.unwrap();
        assert_eq!(registry.session_count().await, 1);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn closing_an_unknown_session_is_an_error() {
        let registry = registry(Settings::default());
        let err = registry.close("nope", false).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn force_close_cancels_the_running_evaluation() {
        let registry = registry(Settings::default());
        let (reply_tx, reply_rx) = oneshot::channel();
        registry
            .submit(
                "s1",
                EvalJob {
                    script: "sleep(30000)".to_string(),
                    bindings: HashMap::new(),
                    timeout: Duration::from_secs(60),
                    reply: reply_tx,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.close("s1", true).await.unwrap();
        let err = reply_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, EvalFailure::SessionClosed));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn managed_transactions_roll_back_failed_scripts() {
        let settings = Settings::default();
        let engine = Arc::new(ScriptEngine::from_settings(&settings));
        let graph = Arc::new(MemoryGraph::new());
        let backend: Arc<dyn GraphBackend> = Arc::clone(&graph) as Arc<dyn GraphBackend>;
        let registry = SessionRegistry::new(settings, engine, backend);

        let err = submit_and_wait(&registry, "s1", "g.addVertex(); nope()")
            .await
            .unwrap_err();
        assert!(matches!(err, EvalFailure::Script(ScriptError::Runtime(_))));
        assert!(graph.vertices().unwrap().is_empty());

        submit_and_wait(&registry, "s1", "g.addVertex()").await.unwrap();
        assert_eq!(graph.vertices().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn request_bindings_merge_into_the_session() {
        let registry = registry(Settings::default());
        let (reply_tx, reply_rx) = oneshot::channel();
        registry
            .submit(
                "s1",
                EvalJob {
                    script: "x + y".to_string(),
                    bindings: HashMap::from([
                        ("x".to_string(), Value::Int(40)),
                        ("y".to_string(), Value::Int(2)),
                    ]),
                    timeout: Duration::from_secs(5),
                    reply: reply_tx,
                },
            )
            .await
            .unwrap();
        let items: Vec<_> = reply_rx.await.unwrap().unwrap().collect();
        assert_eq!(items, vec![Value::Int(42)]);
    }
}
