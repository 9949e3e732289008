//! Routes validated requests to evaluation and session management.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use gryphon_core::Settings;
use gryphon_core::graph::GraphBackend;
use gryphon_core::message::{
    RequestMessage, RequestOp, ResponseMessage, StatusCode, validate_request,
};
use gryphon_core::script::{Bindings, ScriptEngine, ScriptError};
use gryphon_core::session::{EvalFailure, EvalJob, SessionRegistry, evaluate_with_timeout};
use gryphon_core::value::Value;

use crate::channel::stream_results;
use crate::writer::ResponseWriter;

/// Per-server dispatcher shared across all connections. Sessionless
/// evaluations run on the blocking pool behind a semaphore sized by
/// `evaluation_pool_size`; session-bound requests are queued on their
/// session's worker instead.
pub struct Dispatcher {
    settings: Settings,
    engine: Arc<ScriptEngine>,
    graph: Arc<dyn GraphBackend>,
    sessions: Arc<SessionRegistry>,
    eval_permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        settings: Settings,
        engine: Arc<ScriptEngine>,
        graph: Arc<dyn GraphBackend>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        let eval_permits = Arc::new(Semaphore::new(settings.evaluation_pool_size));
        Self {
            settings,
            engine,
            graph,
            sessions,
            eval_permits,
        }
    }

    pub async fn dispatch(&self, msg: RequestMessage, writer: ResponseWriter) {
        if let Err(rejection) = validate_request(&msg) {
            debug!(request_id = %msg.request_id, code = ?rejection.code, "rejecting request");
            writer
                .send_best_effort(&ResponseMessage::error(
                    msg.request_id,
                    rejection.code,
                    rejection.message,
                ))
                .await;
            return;
        }
        match msg.op {
            RequestOp::Eval => self.dispatch_eval(msg, writer).await,
            RequestOp::Close => self.dispatch_close(msg, writer).await,
        }
    }

    async fn dispatch_close(&self, msg: RequestMessage, writer: ResponseWriter) {
        // Validation guarantees the session id is present.
        let session_id = msg.args.session_id.unwrap_or_default();
        let force = msg.args.force_close.unwrap_or(false);
        match self.sessions.close(&session_id, force).await {
            Ok(()) => {
                writer
                    .send_best_effort(&ResponseMessage::no_content(msg.request_id))
                    .await;
            }
            Err(err) => {
                writer
                    .send_best_effort(&ResponseMessage::error(
                        msg.request_id,
                        StatusCode::InvalidRequestArguments,
                        err.to_string(),
                    ))
                    .await;
            }
        }
    }

    async fn dispatch_eval(&self, msg: RequestMessage, writer: ResponseWriter) {
        let request_id = msg.request_id;
        let script = msg.args.script.unwrap_or_default();
        let timeout_ms = msg
            .args
            .eval_timeout_ms
            .unwrap_or(self.settings.script_evaluation_timeout_ms);
        let batch_size = msg
            .args
            .batch_size
            .unwrap_or(self.settings.result_iteration_batch_size);
        let bindings = msg.args.bindings.unwrap_or_default();

        let result = match msg.args.session_id {
            Some(session_id) => {
                self.run_in_session(&session_id, script, bindings, timeout_ms, &writer, request_id)
                    .await
            }
            None => Some(self.run_sessionless(script, bindings, timeout_ms).await),
        };

        match result {
            None => {}
            Some(Ok(results)) => {
                stream_results(
                    request_id,
                    results,
                    batch_size,
                    self.settings.serialized_response_timeout(),
                    &writer,
                )
                .await;
            }
            Some(Err(err)) => {
                let (code, message) = eval_failure(&err, timeout_ms, request_id);
                warn!(%request_id, code = ?code, "evaluation failed");
                writer
                    .send_best_effort(&ResponseMessage::error(request_id, code, message))
                    .await;
            }
        }
    }

    /// Queues the job on its session. Returns `None` when the rejection has
    /// already been reported.
    async fn run_in_session(
        &self,
        session_id: &str,
        script: String,
        bindings: HashMap<String, Value>,
        timeout_ms: u64,
        writer: &ResponseWriter,
        request_id: Uuid,
    ) -> Option<std::result::Result<gryphon_core::script::ResultIter, ScriptError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = EvalJob {
            script,
            bindings,
            timeout: Duration::from_millis(timeout_ms),
            reply: reply_tx,
        };
        if let Err(err) = self.sessions.submit(session_id, job).await {
            writer
                .send_best_effort(&ResponseMessage::error(
                    request_id,
                    StatusCode::ServerError,
                    err.to_string(),
                ))
                .await;
            return None;
        }
        match reply_rx.await {
            Ok(Ok(results)) => Some(Ok(results)),
            Ok(Err(EvalFailure::Script(err))) => Some(Err(err)),
            // A dropped reply means the worker exited before the job ran.
            Ok(Err(EvalFailure::SessionClosed)) | Err(_) => {
                writer
                    .send_best_effort(&ResponseMessage::error(
                        request_id,
                        StatusCode::ServerError,
                        format!(
                            "session {session_id} was force-closed before the request completed"
                        ),
                    ))
                    .await;
                None
            }
        }
    }

    async fn run_sessionless(
        &self,
        script: String,
        bindings: HashMap<String, Value>,
        timeout_ms: u64,
    ) -> std::result::Result<gryphon_core::script::ResultIter, ScriptError> {
        let Ok(_permit) = Arc::clone(&self.eval_permits).acquire_owned().await else {
            // Only possible during shutdown.
            return Err(ScriptError::Cancelled);
        };
        let mut scratch = Bindings::new();
        for (name, value) in bindings {
            scratch.insert_value(name, value);
        }
        let (_, result) = evaluate_with_timeout(
            Arc::clone(&self.engine),
            Some(Arc::clone(&self.graph)),
            scratch,
            script,
            Duration::from_millis(timeout_ms),
            CancellationToken::new(),
        )
        .await;
        result
    }
}

fn eval_failure(err: &ScriptError, timeout_ms: u64, request_id: Uuid) -> (StatusCode, String) {
    match err {
        ScriptError::Cancelled => (
            StatusCode::ServerTimeout,
            format!(
                "Script evaluation exceeded the configured 'scriptEvaluationTimeout' threshold \
                 of {timeout_ms} ms for request [{request_id}]"
            ),
        ),
        ScriptError::Interrupted => (StatusCode::ServerTimeout, err.to_string()),
        ScriptError::SandboxViolation(_)
        | ScriptError::Compile(_)
        | ScriptError::Runtime(_) => (StatusCode::ScriptEvaluationError, err.to_string()),
    }
}
