//! Integration tests for the completion subsystem.
//!
//! Queue discipline and cancellation run against an in-process stub
//! provider; error classification runs against real `/bin/sh` subprocesses
//! through the CLI provider.

mod common;

use async_trait::async_trait;
use common::{fabric, journal, wait_for_entry};
use ksi_core::config::CompletionConfig;
use ksi_core::envelope::EventContext;
use ksi_core::tool_use::format_tool_use_block;
use ksi_daemon::completion::provider::{CliProvider, CompletionProvider};
use ksi_daemon::completion::types::{
    CompletionRequest, ProviderFailure, ProviderInvocation, ProviderResponse,
};
use ksi_daemon::completion::{self, CompletionService};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn test_completion_config() -> CompletionConfig {
    CompletionConfig {
        timeout_attempts: vec![5],
        progress_timeout_secs: 5,
        retry_backoff_secs: 0,
        ..Default::default()
    }
}

fn request(id: &str, key: Option<&str>) -> CompletionRequest {
    CompletionRequest::from_value(
        &json!({
            "request_id": id,
            "prompt": format!("prompt for {id}"),
            "session_id": key,
        }),
        &EventContext::default(),
        "sonnet",
    )
    .unwrap()
}

async fn wait_for_result(f: &common::TestFabric, request_id: &str) -> Value {
    wait_for_entry(&f.monitor, "completion:result", Duration::from_secs(10), |e| {
        e["data"]["request_id"] == request_id
    })
    .await
}

// ── Stub providers ───────────────────────────────────────────────────────────

/// Records (prompt, start, end) for every invocation.
struct RecordingProvider {
    delay: Duration,
    runs: Arc<Mutex<Vec<(String, Instant, Instant)>>>,
    response_text: String,
    session_id: Option<String>,
}

impl RecordingProvider {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            runs: Arc::new(Mutex::new(Vec::new())),
            response_text: "stub response".to_string(),
            session_id: None,
        }
    }
}

#[async_trait]
impl CompletionProvider for RecordingProvider {
    async fn complete(
        &self,
        invocation: ProviderInvocation,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, ProviderFailure> {
        let start = Instant::now();
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => {
                self.runs
                    .lock()
                    .unwrap()
                    .push((invocation.prompt.clone(), start, Instant::now()));
                return Err(ProviderFailure::Cancelled);
            }
        }
        self.runs
            .lock()
            .unwrap()
            .push((invocation.prompt.clone(), start, Instant::now()));
        Ok(ProviderResponse {
            text: self.response_text.clone(),
            session_id: self.session_id.clone(),
            ..Default::default()
        })
    }
}

/// Fails with a timeout a fixed number of times, recording the session id
/// of each invocation, then succeeds.
struct FlakyProvider {
    failures_left: Arc<Mutex<usize>>,
    sessions_seen: Arc<Mutex<Vec<Option<String>>>>,
}

#[async_trait]
impl CompletionProvider for FlakyProvider {
    async fn complete(
        &self,
        invocation: ProviderInvocation,
        _cancel: CancellationToken,
    ) -> Result<ProviderResponse, ProviderFailure> {
        self.sessions_seen
            .lock()
            .unwrap()
            .push(invocation.session_id.clone());
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(ProviderFailure::Timeout {
                elapsed_secs: 0,
                reason: "stub".into(),
            });
        }
        Ok(ProviderResponse {
            text: "recovered".into(),
            ..Default::default()
        })
    }
}

fn start_service(
    f: &common::TestFabric,
    provider: Arc<dyn CompletionProvider>,
) -> Arc<CompletionService> {
    let service = CompletionService::start(
        provider,
        f.dispatcher.clone(),
        test_completion_config(),
        f.limits.clone(),
        CancellationToken::new(),
    );
    completion::register_handlers(&f.dispatcher, service.clone(), "sonnet".to_string());
    completion::register_extraction(&f.dispatcher);
    service
}

// ── Queue discipline ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_same_session_runs_strictly_serially() {
    let f = fabric();
    let provider = Arc::new(RecordingProvider::new(Duration::from_millis(120)));
    let runs = provider.runs.clone();
    let service = start_service(&f, provider);

    for i in 0..4 {
        service
            .submit(request(&format!("req_{i}"), Some("shared-session")))
            .await
            .unwrap();
    }
    for i in 0..4 {
        wait_for_result(&f, &format!("req_{i}")).await;
    }

    let runs = runs.lock().unwrap();
    assert_eq!(runs.len(), 4);
    // FIFO order within the key.
    let prompts: Vec<&str> = runs.iter().map(|(p, _, _)| p.as_str()).collect();
    assert_eq!(
        prompts,
        vec![
            "prompt for req_0",
            "prompt for req_1",
            "prompt for req_2",
            "prompt for req_3",
        ]
    );
    // Intervals are pairwise disjoint: peak concurrency one.
    for window in runs.windows(2) {
        let (_, _, prev_end) = &window[0];
        let (_, next_start, _) = &window[1];
        assert!(next_start >= prev_end, "overlapping runs for one session");
    }
}

#[tokio::test]
async fn test_distinct_keys_run_in_parallel() {
    let f = fabric();
    let provider = Arc::new(RecordingProvider::new(Duration::from_millis(300)));
    let runs = provider.runs.clone();
    let service = start_service(&f, provider);

    service.submit(request("par_a", Some("session-a"))).await.unwrap();
    service.submit(request("par_b", Some("session-b"))).await.unwrap();
    wait_for_result(&f, "par_a").await;
    wait_for_result(&f, "par_b").await;

    let runs = runs.lock().unwrap();
    assert_eq!(runs.len(), 2);
    let (_, start_a, end_a) = &runs[0];
    let (_, start_b, end_b) = &runs[1];
    let overlap = start_a.max(start_b) < end_a.min(end_b);
    assert!(overlap, "distinct keys should run concurrently");
}

#[tokio::test]
async fn test_exactly_one_terminal_event_per_request() {
    let f = fabric();
    let provider = Arc::new(RecordingProvider::new(Duration::from_millis(10)));
    let service = start_service(&f, provider);

    for i in 0..5 {
        service
            .submit(request(&format!("one_{i}"), Some("terminal-session")))
            .await
            .unwrap();
    }
    for i in 0..5 {
        wait_for_result(&f, &format!("one_{i}")).await;
    }
    // Settle, then count terminals per request.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for i in 0..5 {
        let id = format!("one_{i}");
        let terminals: Vec<Value> = journal(&f.monitor, "completion:result")
            .into_iter()
            .filter(|e| e["data"]["request_id"] == id.as_str())
            .collect();
        assert_eq!(terminals.len(), 1, "request {id} must have one terminal");
        assert_eq!(terminals[0]["data"]["status"], "completed");
    }
}

// ── Retry & session handling ─────────────────────────────────────────────────

#[tokio::test]
async fn test_timeout_retries_drop_the_session() {
    let f = fabric();
    let provider = Arc::new(FlakyProvider {
        failures_left: Arc::new(Mutex::new(1)),
        sessions_seen: Arc::new(Mutex::new(Vec::new())),
    });
    let sessions = provider.sessions_seen.clone();
    let service = CompletionService::start(
        provider,
        f.dispatcher.clone(),
        CompletionConfig {
            timeout_attempts: vec![1, 1],
            retry_backoff_secs: 0,
            ..Default::default()
        },
        f.limits.clone(),
        CancellationToken::new(),
    );

    let mut req = request("retry_1", Some("resume-me"));
    req.session_id = Some("resume-me".into());
    service.submit(req).await.unwrap();

    let result = wait_for_result(&f, "retry_1").await;
    assert_eq!(result["data"]["status"], "completed");
    assert_eq!(result["data"]["attempts"], 2);

    let sessions = sessions.lock().unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].as_deref(), Some("resume-me"));
    // A fresh session after the timeout: the stuck process may have
    // poisoned the old one.
    assert_eq!(sessions[1], None);
}

#[tokio::test]
async fn test_retries_exhausted_end_in_timeout_error() {
    let f = fabric();
    let provider = Arc::new(FlakyProvider {
        failures_left: Arc::new(Mutex::new(99)),
        sessions_seen: Arc::new(Mutex::new(Vec::new())),
    });
    let sessions = provider.sessions_seen.clone();
    let service = CompletionService::start(
        provider,
        f.dispatcher.clone(),
        CompletionConfig {
            timeout_attempts: vec![1, 1],
            retry_backoff_secs: 0,
            ..Default::default()
        },
        f.limits.clone(),
        CancellationToken::new(),
    );

    service.submit(request("retry_dead", None)).await.unwrap();
    let result = wait_for_result(&f, "retry_dead").await;
    assert_eq!(result["data"]["status"], "error");
    assert_eq!(result["data"]["error"]["code"], "timeout");
    assert_eq!(sessions.lock().unwrap().len(), 2);
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_running_request() {
    let f = fabric();
    let provider = Arc::new(RecordingProvider::new(Duration::from_secs(30)));
    let service = start_service(&f, provider);

    service.submit(request("cancel_me", None)).await.unwrap();
    // Let the supervisor start it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let reply = service.cancel("cancel_me").await.unwrap();
    assert_eq!(reply["status"], "cancelling");

    let result = wait_for_result(&f, "cancel_me").await;
    assert_eq!(result["data"]["status"], "cancelled");
}

#[tokio::test]
async fn test_cancel_queued_request() {
    let f = fabric();
    let provider = Arc::new(RecordingProvider::new(Duration::from_secs(30)));
    let service = start_service(&f, provider);

    // Same key: the second stays queued behind the first.
    service.submit(request("q_running", Some("k"))).await.unwrap();
    service.submit(request("q_waiting", Some("k"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reply = service.cancel("q_waiting").await.unwrap();
    assert_eq!(reply["status"], "cancelled");
    let result = wait_for_result(&f, "q_waiting").await;
    assert_eq!(result["data"]["status"], "cancelled");

    // The running one is unaffected until its own cancel.
    service.cancel("q_running").await.unwrap();
    let result = wait_for_result(&f, "q_running").await;
    assert_eq!(result["data"]["status"], "cancelled");
}

#[tokio::test]
async fn test_cancel_unknown_request_is_precondition() {
    let f = fabric();
    let provider = Arc::new(RecordingProvider::new(Duration::from_millis(10)));
    let service = start_service(&f, provider);
    let err = service.cancel("never_submitted").await.unwrap_err();
    assert_eq!(err.code(), "precondition");
}

// ── Event surface ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_completion_async_event_round_trip() {
    let f = fabric();
    let provider = Arc::new(RecordingProvider::new(Duration::from_millis(10)));
    start_service(&f, provider);

    let reply = f
        .dispatcher
        .request(
            "completion:async",
            json!({"request_id": "evt_req", "prompt": "hello"}),
            EventContext::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply["status"], "queued");
    assert_eq!(reply["request_id"], "evt_req");

    let result = wait_for_result(&f, "evt_req").await;
    assert_eq!(result["data"]["status"], "completed");
    assert_eq!(result["data"]["response"], "stub response");
}

#[tokio::test]
async fn test_status_reports_queue_and_request_states() {
    let f = fabric();
    let provider = Arc::new(RecordingProvider::new(Duration::from_millis(200)));
    let service = start_service(&f, provider);

    service.submit(request("st_a", Some("k"))).await.unwrap();
    service.submit(request("st_b", Some("k"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = f
        .dispatcher
        .request("completion:status", json!({}), EventContext::default())
        .await
        .unwrap();
    assert_eq!(status["running"], 1);
    assert_eq!(status["queued"], 1);
    assert_eq!(status["requests"]["st_a"], "running");
    assert_eq!(status["requests"]["st_b"], "queued");

    wait_for_result(&f, "st_a").await;
    wait_for_result(&f, "st_b").await;
    // The supervisor records the terminal state just after the result event.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = f
        .dispatcher
        .request("completion:status", json!({}), EventContext::default())
        .await
        .unwrap();
    assert_eq!(status["requests"]["st_b"], "completed");
}

#[tokio::test]
async fn test_tool_use_extraction_round_trip() {
    let f = fabric();
    let mut provider = RecordingProvider::new(Duration::from_millis(10));
    let input = json!({"note": "from the agent", "n": 3});
    provider.response_text = format!(
        "Here you go:\n{}\nDone.",
        format_tool_use_block("test:extracted", &input, "abc123")
    );
    let service = start_service(&f, Arc::new(provider));

    let mut req = request("extract_req", None);
    req.agent_id = Some("agent_x".into());
    service.submit(req).await.unwrap();
    wait_for_result(&f, "extract_req").await;

    let extracted =
        wait_for_entry(&f.monitor, "test:extracted", Duration::from_secs(5), |_| true).await;
    assert_eq!(extracted["data"]["note"], "from the agent");
    assert_eq!(extracted["data"]["n"], 3);
    assert_eq!(extracted["data"]["_tool_use_id"], "ksiu_abc123");
    assert_eq!(extracted["data"]["_extracted_from_response"], true);
    assert_eq!(extracted["agent_id"], "agent_x");

    // Exactly one re-emission for the one block.
    assert_eq!(journal(&f.monitor, "test:extracted").len(), 1);
}

// ── Subprocess classification (real /bin/sh providers) ───────────────────────

#[cfg(unix)]
fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(unix)]
#[tokio::test]
async fn test_subprocess_timeout_retries_then_fails() {
    let tmp = tempfile::TempDir::new().unwrap();
    let spawn_log = tmp.path().join("spawns.log");
    let script = write_script(
        tmp.path(),
        "hang.sh",
        &format!(
            "#!/bin/sh\necho spawn >> {}\nexec sleep 30\n",
            spawn_log.display()
        ),
    );

    let f = fabric();
    let provider = Arc::new(CliProvider::new(script, None));
    let service = CompletionService::start(
        provider,
        f.dispatcher.clone(),
        CompletionConfig {
            timeout_attempts: vec![1, 2],
            progress_timeout_secs: 1,
            retry_backoff_secs: 0,
            ..Default::default()
        },
        f.limits.clone(),
        CancellationToken::new(),
    );

    service.submit(request("hang_req", None)).await.unwrap();
    let result = wait_for_entry(
        &f.monitor,
        "completion:result",
        Duration::from_secs(20),
        |e| e["data"]["request_id"] == "hang_req",
    )
    .await;

    assert_eq!(result["data"]["status"], "error");
    assert_eq!(result["data"]["error"]["code"], "timeout");
    assert_eq!(result["data"]["attempts"], 2);
    let spawns = std::fs::read_to_string(&spawn_log).unwrap();
    assert_eq!(spawns.lines().count(), 2, "one subprocess per attempt");
}

#[cfg(unix)]
#[tokio::test]
async fn test_subprocess_logical_error_is_not_retried() {
    let tmp = tempfile::TempDir::new().unwrap();
    let spawn_log = tmp.path().join("spawns.log");
    let script = write_script(
        tmp.path(),
        "reject.sh",
        &format!(
            "#!/bin/sh\necho spawn >> {}\necho 'bad prompt' >&2\nexit 1\n",
            spawn_log.display()
        ),
    );

    let f = fabric();
    let provider = Arc::new(CliProvider::new(script, None));
    let service = CompletionService::start(
        provider,
        f.dispatcher.clone(),
        CompletionConfig {
            timeout_attempts: vec![60, 60],
            retry_backoff_secs: 0,
            ..Default::default()
        },
        f.limits.clone(),
        CancellationToken::new(),
    );

    service.submit(request("logical_req", None)).await.unwrap();
    let result = wait_for_result(&f, "logical_req").await;
    assert_eq!(result["data"]["status"], "error");
    assert_eq!(result["data"]["error"]["code"], "provider_logical");
    assert_eq!(result["data"]["attempts"], 1);
    let spawns = std::fs::read_to_string(&spawn_log).unwrap();
    assert_eq!(spawns.lines().count(), 1, "logical errors never retry");
}

#[cfg(unix)]
#[tokio::test]
async fn test_subprocess_success_parses_provider_json() {
    let tmp = tempfile::TempDir::new().unwrap();
    let doc = json!({
        "type": "assistant",
        "message": {"content": [{"text": "hello from the provider"}]},
        "sessionId": "sess-new",
        "usage": {"output_tokens": 5},
    });
    let script = write_script(
        tmp.path(),
        "ok.sh",
        &format!("#!/bin/sh\ncat <<'PAYLOAD'\n{}\nPAYLOAD\n", doc),
    );

    let f = fabric();
    let provider = Arc::new(CliProvider::new(script, None));
    let service = CompletionService::start(
        provider,
        f.dispatcher.clone(),
        test_completion_config(),
        f.limits.clone(),
        CancellationToken::new(),
    );

    service.submit(request("ok_req", None)).await.unwrap();
    let result = wait_for_result(&f, "ok_req").await;
    assert_eq!(result["data"]["status"], "completed");
    assert_eq!(result["data"]["response"], "hello from the provider");
    assert_eq!(result["data"]["session_id"], "sess-new");
    assert_eq!(result["data"]["usage"]["output_tokens"], 5);
    assert!(result["data"].get("json_decode_error").is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn test_subprocess_malformed_output_is_still_delivered() {
    let tmp = tempfile::TempDir::new().unwrap();
    let script = write_script(
        tmp.path(),
        "garble.sh",
        "#!/bin/sh\necho 'this is not json'\n",
    );

    let f = fabric();
    let provider = Arc::new(CliProvider::new(script, None));
    let service = CompletionService::start(
        provider,
        f.dispatcher.clone(),
        test_completion_config(),
        f.limits.clone(),
        CancellationToken::new(),
    );

    service.submit(request("garble_req", None)).await.unwrap();
    let result = wait_for_result(&f, "garble_req").await;
    assert_eq!(result["data"]["status"], "completed");
    assert_eq!(result["data"]["response"], "this is not json");
    assert!(result["data"]["json_decode_error"].is_string());
}

#[cfg(unix)]
#[tokio::test]
async fn test_missing_binary_is_provider_unavailable() {
    let f = fabric();
    let provider = Arc::new(CliProvider::new(
        PathBuf::from("/nonexistent/claude-bin"),
        None,
    ));
    let service = CompletionService::start(
        provider,
        f.dispatcher.clone(),
        test_completion_config(),
        f.limits.clone(),
        CancellationToken::new(),
    );

    service.submit(request("missing_bin", None)).await.unwrap();
    let result = wait_for_result(&f, "missing_bin").await;
    assert_eq!(result["data"]["status"], "error");
    assert_eq!(result["data"]["error"]["code"], "provider_unavailable");
}
