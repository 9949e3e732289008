use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How session-bound evaluations interact with the graph transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// The server opens a transaction around each evaluation, committing on
    /// success and rolling back on failure or cancellation.
    Managed,
    /// Evaluations apply directly; partial mutations from a failed script are
    /// left in place.
    None,
}

/// Server tunables consumed by the dispatcher, script engine, and response
/// channel. Loaded from configuration by the launcher; the core only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the server listens on.
    pub listen_addr: String,
    /// Soft wall-clock limit for a single script evaluation, in milliseconds.
    /// Overridable per request.
    pub script_evaluation_timeout_ms: u64,
    /// Wall-clock limit for serializing one request's entire response stream.
    pub serialized_response_timeout_ms: u64,
    /// Maximum serialized request size in bytes. Oversize frames reset the
    /// connection before any parsing occurs.
    pub max_content_length: usize,
    /// Number of results per `PartialContent` chunk unless the request
    /// overrides it.
    pub result_iteration_batch_size: usize,
    /// Pause response writing when this many unflushed bytes are outstanding.
    pub write_buffer_high_water_mark: usize,
    /// Resume response writing once outstanding bytes drain below this.
    pub write_buffer_low_water_mark: usize,
    /// Sessions idle longer than this are evicted.
    pub session_idle_timeout_ms: u64,
    /// Maximum queued requests per session before rejection.
    pub session_queue_depth: usize,
    /// Transaction scope applied to session-bound evaluations.
    pub session_transaction_mode: TransactionMode,
    /// Elapsed-time budget enforced by the timed interrupt guard inside the
    /// interpreter loop, independent of the soft timeout. `None` disables the
    /// guard.
    pub timed_interrupt_ms: Option<u64>,
    /// Call names the sandbox refuses at compile time.
    pub sandbox_deny_list: Vec<String>,
    /// When set, declared locals and their inferred types persist across
    /// requests within a session.
    pub interpreter_mode: bool,
    /// Maximum concurrent script evaluations across all connections.
    pub evaluation_pool_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8182".to_string(),
            script_evaluation_timeout_ms: 30_000,
            serialized_response_timeout_ms: 30_000,
            max_content_length: 65_536,
            result_iteration_batch_size: 64,
            write_buffer_high_water_mark: 65_536,
            write_buffer_low_water_mark: 32_768,
            session_idle_timeout_ms: 600_000,
            session_queue_depth: 64,
            session_transaction_mode: TransactionMode::Managed,
            timed_interrupt_ms: None,
            sandbox_deny_list: default_deny_list(),
            interpreter_mode: false,
            evaluation_pool_size: 8,
        }
    }
}

impl Settings {
    pub fn script_evaluation_timeout(&self) -> Duration {
        Duration::from_millis(self.script_evaluation_timeout_ms)
    }

    pub fn serialized_response_timeout(&self) -> Duration {
        Duration::from_millis(self.serialized_response_timeout_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }

    pub fn timed_interrupt(&self) -> Option<Duration> {
        self.timed_interrupt_ms.map(Duration::from_millis)
    }
}

fn default_deny_list() -> Vec<String> {
    ["exit", "exec", "eval", "load"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_water_marks_ordered() {
        let settings = Settings::default();
        assert!(settings.write_buffer_low_water_mark < settings.write_buffer_high_water_mark);
    }

    #[test]
    fn deserializes_partial_settings() {
        let settings: Settings =
            serde_json::from_str(r#"{"script_evaluation_timeout_ms": 200}"#).unwrap();
        assert_eq!(settings.script_evaluation_timeout_ms, 200);
        assert_eq!(settings.result_iteration_batch_size, 64);
    }
}
