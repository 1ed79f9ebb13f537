//! Local LLM inference: a subprocess-backed engine plus the gate that
//! serializes access to it.
//!
//! The host has room for exactly one inference at a time, so every
//! completion in the process goes through [`InferenceGate`]. The gate's
//! `tokio::sync::Mutex` hands the engine out in FIFO order, and the
//! per-call timeout runs while the lock is held: a timed-out call drops
//! its future, which kills the engine subprocess before the next caller
//! starts.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{error, info};

use dbcritic_core::diff::estimate_tokens;
use dbcritic_core::review::{COMPLETION_TEMPERATURE, MAX_COMPLETION_TOKENS, STOP_SEQUENCES};

use crate::config::EngineSettings;

/// Errors from the inference engine.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The completion exceeded the configured wall-clock budget.
    #[error("inference timed out after {0}s")]
    Timeout(u64),
    /// The engine itself failed: spawn failure, non-zero exit, bad output.
    #[error("inference engine failed: {0}")]
    Engine(String),
}

/// One finished completion with its token accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Capability to run one completion. Implementations need not tolerate
/// concurrent calls; [`InferenceGate`] provides the serialization.
#[async_trait]
pub trait CompletionEngine: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<Completion, InferenceError>;
}

/// Runs completions by spawning a llama.cpp CLI per call.
///
/// The model file stays on disk between calls and loads via mmap, so the
/// per-call cost is acceptable for the small models this targets. Killing
/// the process releases all of its memory, which is what makes the small
/// resource tier workable.
pub struct LlamaCppEngine {
    binary: String,
    model_path: PathBuf,
    settings: EngineSettings,
}

impl LlamaCppEngine {
    pub fn new(binary: String, model_path: PathBuf, settings: EngineSettings) -> Self {
        Self {
            binary,
            model_path,
            settings,
        }
    }
}

#[async_trait]
impl CompletionEngine for LlamaCppEngine {
    async fn complete(&self, prompt: &str) -> Result<Completion, InferenceError> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-m")
            .arg(&self.model_path)
            .args(["--ctx-size", &self.settings.context_size.to_string()])
            .args(["--batch-size", &self.settings.batch_size.to_string()])
            .args(["--threads", &self.settings.thread_count.to_string()])
            .args(["--n-predict", &MAX_COMPLETION_TOKENS.to_string()])
            .args(["--temp", &COMPLETION_TEMPERATURE.to_string()])
            .args(["--no-display-prompt", "--simple-io"]);
        for stop in STOP_SEQUENCES {
            cmd.args(["--reverse-prompt", stop]);
        }
        cmd.arg("-p")
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| {
            error!("Failed to spawn {}: {}", self.binary, e);
            InferenceError::Engine(format!("failed to spawn {}: {}", self.binary, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                "{} exited with {:?}: {}",
                self.binary,
                output.status.code(),
                stderr.trim()
            );
            return Err(InferenceError::Engine(format!(
                "{} exited with status {:?}: {}",
                self.binary,
                output.status.code(),
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        // llama.cpp only logs exact token counts; whitespace words are a
        // close-enough approximation for aggregate metrics.
        let completion = Completion {
            tokens_in: estimate_tokens(prompt) as u64,
            tokens_out: estimate_tokens(&text) as u64,
            text,
        };
        info!(
            "Completion finished in {}ms ({} tokens out)",
            start.elapsed().as_millis(),
            completion.tokens_out
        );
        Ok(completion)
    }
}

/// Owns the only engine handle in the process and serializes completions
/// through it.
pub struct InferenceGate {
    engine: Mutex<Box<dyn CompletionEngine>>,
    timeout_secs: u64,
}

impl InferenceGate {
    pub fn new(engine: Box<dyn CompletionEngine>, timeout_secs: u64) -> Self {
        Self {
            engine: Mutex::new(engine),
            timeout_secs,
        }
    }

    /// Run one completion, waiting in line for the engine to become free.
    /// Waiting for the lock does not count against the timeout.
    pub async fn submit(&self, prompt: &str) -> Result<Completion, InferenceError> {
        let engine = self.engine.lock().await;
        match timeout(Duration::from_secs(self.timeout_secs), engine.complete(prompt)).await {
            Ok(result) => result,
            Err(_) => {
                error!("Inference call exceeded its {}s budget", self.timeout_secs);
                Err(InferenceError::Timeout(self.timeout_secs))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    struct SlowEngine {
        delay: Duration,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        completed_prompts: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl CompletionEngine for SlowEngine {
        async fn complete(&self, prompt: &str) -> Result<Completion, InferenceError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed_prompts
                .lock()
                .expect("test mutex poisoned")
                .push(prompt.to_string());
            Ok(Completion {
                text: "NONE".to_string(),
                tokens_in: estimate_tokens(prompt) as u64,
                tokens_out: 1,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_never_runs_two_completions_at_once() {
        let max_active = Arc::new(AtomicUsize::new(0));
        let engine = SlowEngine {
            delay: Duration::from_secs(3),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: max_active.clone(),
            completed_prompts: Arc::new(StdMutex::new(Vec::new())),
        };
        let gate = Arc::new(InferenceGate::new(Box::new(engine), 60));

        let mut handles = Vec::new();
        for i in 0..8 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.submit(&format!("prompt {}", i)).await
            }));
        }
        for handle in handles {
            handle.await.expect("task panicked").expect("completion should succeed");
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1, "completions must not overlap");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_serves_waiters_in_arrival_order() {
        let completed = Arc::new(StdMutex::new(Vec::new()));
        let engine = SlowEngine {
            delay: Duration::from_secs(5),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            completed_prompts: completed.clone(),
        };
        let gate = Arc::new(InferenceGate::new(Box::new(engine), 60));

        let mut handles = Vec::new();
        for i in 0..4 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.submit(&format!("{}", i)).await
            }));
            // Give each task time to reach the lock before the next spawns.
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        for handle in handles {
            handle.await.expect("task panicked").expect("completion should succeed");
        }
        let order = completed.lock().expect("test mutex poisoned").clone();
        assert_eq!(order, vec!["0", "1", "2", "3"], "the gate should be FIFO");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_times_out_slow_completions() {
        let engine = SlowEngine {
            delay: Duration::from_secs(600),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            completed_prompts: Arc::new(StdMutex::new(Vec::new())),
        };
        let gate = InferenceGate::new(Box::new(engine), 2);

        let err = gate.submit("prompt").await.expect_err("should time out");
        match err {
            InferenceError::Timeout(secs) => assert_eq!(secs, 2),
            other => panic!("expected timeout, got {:?}", other),
        }

        // The gate must be usable again after a timeout.
        let engine_calls = gate.engine.lock().await;
        drop(engine_calls);
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_engine_error() {
        let engine = LlamaCppEngine::new(
            "definitely-not-a-real-llama-binary".to_string(),
            PathBuf::from("/nonexistent/model.gguf"),
            EngineSettings {
                context_size: 512,
                batch_size: 4,
                thread_count: 2,
            },
        );
        let err = engine.complete("prompt").await.expect_err("spawn should fail");
        match err {
            InferenceError::Engine(msg) => {
                assert!(msg.contains("failed to spawn"), "unexpected message: {}", msg)
            }
            other => panic!("expected engine error, got {:?}", other),
        }
    }
}
