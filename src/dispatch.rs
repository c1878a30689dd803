//! Asynchronous request dispatch with retry, backoff, and rate limiting.
//!
//! One [`Dispatcher`] wraps one model endpoint with its injected
//! [`RateLimiter`]. Every call runs the same state machine: acquire both
//! rate-limit resources, post, classify the status. A 503 is retried without
//! consuming the attempt budget; other 5xx statuses and transport errors
//! consume one of `max_attempts`; any other non-2xx status is terminal
//! immediately. Backoff doubles on every retry.
//!
//! Every attempt is appended to the durable per-identifier backlog before
//! the caller sees the result — the audit trail that makes indexing runs
//! replay-safe. Upstream failures are surfaced as failed [`RequestRecord`]s,
//! never as errors, so batch siblings share no fate.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::endpoint::ModelEndpoint;
use crate::limiter::RateLimiter;
use crate::models::{CallContext, RequestRecord, RequestStatus};
use crate::store::{read_json, write_json, BlobStore};
use crate::tokenizer::Tokenizer;

/// Store key of the append-only backlog for one request identifier.
pub fn backlog_key(identifier: &str) -> String {
    format!("backlog/{identifier}")
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry budget for counted (non-503) retryable failures.
    pub max_attempts: u32,
    /// Initial backoff; doubles on every retry.
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

enum Disposition {
    Done,
    RetryCounted,
    RetryFree,
}

pub struct Dispatcher {
    endpoint: Arc<dyn ModelEndpoint>,
    limiter: RateLimiter,
    tokenizer: Arc<Tokenizer>,
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    pool: Mutex<Vec<(CallContext, String)>>,
}

impl Dispatcher {
    pub fn new(
        endpoint: Arc<dyn ModelEndpoint>,
        limiter: RateLimiter,
        tokenizer: Arc<Tokenizer>,
        store: Arc<dyn BlobStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            endpoint,
            limiter,
            tokenizer,
            store,
            retry,
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Dispatch one call and return its record.
    ///
    /// `Ok` covers upstream failures too (inspect the record's status);
    /// `Err` means the call could never run — a request larger than the
    /// rate-limit capacity, or a backlog write failure.
    pub async fn dispatch(
        &self,
        context: CallContext,
        identifier: Option<String>,
    ) -> Result<RequestRecord> {
        let identifier = identifier.unwrap_or_else(|| Uuid::new_v4().to_string());
        let input_tokens = self.tokenizer.count_context(&context) as u32;

        let mut attempts_left = self.retry.max_attempts;
        let mut backoff = self.retry.base_backoff;
        let mut retries = 0u32;

        loop {
            self.limiter.acquire(input_tokens).await?;

            let started = chrono::Utc::now();
            let outcome = self.endpoint.call(&context).await;
            let finished = chrono::Utc::now();

            let mut record = RequestRecord {
                identifier: identifier.clone(),
                model: self.endpoint.spec().name.clone(),
                status: RequestStatus::Terminal,
                http_status: None,
                output: None,
                usage: None,
                error: None,
                retries,
                started_at: started.timestamp_millis(),
                finished_at: finished.timestamp_millis(),
                duration_ms: (finished - started).num_milliseconds(),
            };

            let disposition = match outcome {
                Ok(raw) => {
                    record.http_status = Some(raw.status);
                    record.error = raw.error;

                    if (200..300).contains(&raw.status) {
                        match self.endpoint.parse_success(&raw.body) {
                            Ok((output, usage)) => {
                                // The true output volume is only known now;
                                // charge it back post-hoc (may overdraw).
                                self.limiter.charge_output(usage.output_tokens).await;
                                record.status = RequestStatus::Success;
                                record.output = Some(output);
                                record.usage = Some(usage);
                            }
                            Err(e) => {
                                record.error = Some(e.to_string());
                            }
                        }
                        Disposition::Done
                    } else if raw.status == 503 {
                        record.status = RequestStatus::Retrying;
                        Disposition::RetryFree
                    } else if (500..600).contains(&raw.status) {
                        if attempts_left == 0 {
                            record.status = RequestStatus::Exhausted;
                            Disposition::Done
                        } else {
                            record.status = RequestStatus::Retrying;
                            Disposition::RetryCounted
                        }
                    } else {
                        Disposition::Done
                    }
                }
                Err(e) => {
                    record.error = Some(e.to_string());
                    if attempts_left == 0 {
                        record.status = RequestStatus::Exhausted;
                        Disposition::Done
                    } else {
                        record.status = RequestStatus::Retrying;
                        Disposition::RetryCounted
                    }
                }
            };

            // Durable before the caller sees it.
            self.append_backlog(&record).await?;

            match disposition {
                Disposition::Done => {
                    debug!(
                        identifier = %record.identifier,
                        status = ?record.status,
                        retries = record.retries,
                        "dispatch finished"
                    );
                    return Ok(record);
                }
                Disposition::RetryCounted => attempts_left -= 1,
                Disposition::RetryFree => {}
            }

            warn!(
                identifier = %identifier,
                http_status = ?record.http_status,
                backoff_ms = backoff.as_millis() as u64,
                attempts_left,
                "retrying after upstream failure"
            );
            retries += 1;
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    /// Queue a call for the next [`flush`](Self::flush).
    pub fn enqueue(&self, context: CallContext, identifier: impl Into<String>) {
        let mut pool = self.pool.lock().expect("pool lock poisoned");
        pool.push((context, identifier.into()));
    }

    /// Dispatch all queued calls concurrently and return their records in
    /// enqueue order.
    ///
    /// Failures are independent: one bad call never cancels its siblings.
    /// A call that could not run at all (capacity, storage) is returned as
    /// a terminal failed record.
    pub async fn flush(&self) -> Vec<RequestRecord> {
        let queued: Vec<(CallContext, String)> = {
            let mut pool = self.pool.lock().expect("pool lock poisoned");
            std::mem::take(&mut *pool)
        };
        if queued.is_empty() {
            return Vec::new();
        }

        let tasks = queued.into_iter().map(|(context, identifier)| async move {
            let id = identifier.clone();
            match self.dispatch(context, Some(identifier)).await {
                Ok(record) => record,
                Err(e) => self.unrunnable_record(id, e),
            }
        });

        join_all(tasks).await
    }

    /// Record for a call that never reached the endpoint.
    fn unrunnable_record(&self, identifier: String, error: anyhow::Error) -> RequestRecord {
        let now = chrono::Utc::now().timestamp_millis();
        RequestRecord {
            identifier,
            model: self.endpoint.spec().name.clone(),
            status: RequestStatus::Terminal,
            http_status: None,
            output: None,
            usage: None,
            error: Some(error.to_string()),
            retries: 0,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        }
    }

    async fn append_backlog(&self, record: &RequestRecord) -> Result<()> {
        let key = backlog_key(&record.identifier);
        let mut records: Vec<RequestRecord> = read_json(self.store.as_ref(), &key)
            .await?
            .unwrap_or_default();
        records.push(record.clone());
        write_json(self.store.as_ref(), &key, &records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RawResponse;
    use crate::models::{ModelKind, ModelSpec, Output, Usage};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec() -> ModelSpec {
        ModelSpec {
            name: "scripted".to_string(),
            endpoint: "https://example.test".to_string(),
            context_window: 8192,
            tokens_per_minute: 100_000,
            requests_per_minute: 1_000,
            input_cost_per_1k: 0.001,
            output_cost_per_1k: 0.002,
            dims: None,
        }
    }

    /// Endpoint that replays scripted status codes, or reacts to the
    /// request text (`"status:<code>"`) so concurrent calls stay
    /// deterministic regardless of scheduling.
    struct ScriptedEndpoint {
        spec: ModelSpec,
        script: Mutex<VecDeque<u16>>,
        calls: AtomicUsize,
    }

    impl ScriptedEndpoint {
        fn new(script: Vec<u16>) -> Self {
            Self {
                spec: spec(),
                script: Mutex::new(script.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn response(status: u16) -> RawResponse {
            if (200..300).contains(&status) {
                RawResponse {
                    status,
                    body: json!({
                        "embedding": [1.0, 0.0],
                        "usage": {"completion_tokens": 7},
                    }),
                    error: None,
                }
            } else {
                RawResponse {
                    status,
                    body: Value::Null,
                    error: Some(format!("upstream said {status}")),
                }
            }
        }
    }

    #[async_trait]
    impl ModelEndpoint for ScriptedEndpoint {
        fn spec(&self) -> &ModelSpec {
            &self.spec
        }

        fn kind(&self) -> ModelKind {
            ModelKind::Embedding
        }

        async fn call(&self, context: &CallContext) -> Result<RawResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if let CallContext::Text(text) = context {
                if let Some(code) = text.strip_prefix("status:") {
                    return Ok(Self::response(code.parse().unwrap()));
                }
            }

            let status = self
                .script
                .lock()
                .expect("script lock poisoned")
                .pop_front()
                .unwrap_or(200);
            Ok(Self::response(status))
        }

        fn parse_success(&self, body: &Value) -> Result<(Output, Usage)> {
            let vector: Vec<f32> = body["embedding"]
                .as_array()
                .map(|a| a.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
                .unwrap_or_default();
            let output_tokens = body
                .pointer("/usage/completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            Ok((
                Output::Vector(vector),
                Usage {
                    output_tokens,
                    ..Usage::default()
                },
            ))
        }
    }

    fn dispatcher(endpoint: Arc<ScriptedEndpoint>, max_attempts: u32) -> Dispatcher {
        let limiter = RateLimiter::for_spec(endpoint.spec());
        Dispatcher::new(
            endpoint,
            limiter,
            Arc::new(Tokenizer::new().unwrap()),
            Arc::new(MemoryStore::new()),
            RetryPolicy {
                max_attempts,
                base_backoff: Duration::from_secs(1),
            },
        )
    }

    fn dispatcher_with_store(
        endpoint: Arc<ScriptedEndpoint>,
        store: Arc<MemoryStore>,
    ) -> Dispatcher {
        let limiter = RateLimiter::for_spec(endpoint.spec());
        Dispatcher::new(
            endpoint,
            limiter,
            Arc::new(Tokenizer::new().unwrap()),
            store,
            RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_503_retries_without_consuming_budget() {
        // Three 503s then a 200: success with three recorded retries,
        // doubling backoff, and four backlog records.
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![503, 503, 503, 200]));
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher_with_store(endpoint.clone(), store.clone());

        let start = tokio::time::Instant::now();
        let record = dispatcher
            .dispatch(CallContext::Text("hello".to_string()), Some("id-1".to_string()))
            .await
            .unwrap();
        let waited = start.elapsed().as_secs_f64();

        assert_eq!(record.status, RequestStatus::Success);
        assert_eq!(record.retries, 3);
        assert_eq!(endpoint.calls(), 4);
        // 1s + 2s + 4s of backoff.
        assert!((6.9..=7.5).contains(&waited), "backoff total: {waited}s");

        let backlog: Vec<RequestRecord> = read_json(store.as_ref(), &backlog_key("id-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(backlog.len(), 4);
        assert_eq!(backlog[0].status, RequestStatus::Retrying);
        assert_eq!(backlog[3].status, RequestStatus::Success);
        assert_eq!(
            backlog.iter().map(|r| r.retries).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_5xx_exhausts_attempt_budget() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![500, 500, 502]));
        let dispatcher = dispatcher(endpoint.clone(), 2);

        let start = tokio::time::Instant::now();
        let record = dispatcher
            .dispatch(CallContext::Text("hello".to_string()), None)
            .await
            .unwrap();
        let waited = start.elapsed().as_secs_f64();

        assert_eq!(record.status, RequestStatus::Exhausted);
        assert_eq!(record.retries, 2);
        assert_eq!(endpoint.calls(), 3);
        // 1s + 2s — the final failure does not back off.
        assert!((2.9..=3.5).contains(&waited), "backoff total: {waited}s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_4xx_is_terminal_immediately() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![404]));
        let dispatcher = dispatcher(endpoint.clone(), 3);

        let start = tokio::time::Instant::now();
        let record = dispatcher
            .dispatch(CallContext::Text("hello".to_string()), None)
            .await
            .unwrap();

        assert_eq!(record.status, RequestStatus::Terminal);
        assert_eq!(record.http_status, Some(404));
        assert_eq!(record.retries, 0);
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_charges_output_tokens_post_hoc() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![]));
        let dispatcher = dispatcher(endpoint, 3);
        let input = dispatcher.tokenizer.count_text("status:200") as f64;

        // The scripted 200 body reports 7 completion tokens; both the input
        // acquisition and the post-hoc output charge must land.
        let before = dispatcher.limiter().token_level().await;
        dispatcher
            .dispatch(CallContext::Text("status:200".to_string()), None)
            .await
            .unwrap();
        let after = dispatcher.limiter().token_level().await;

        assert!(
            (before - after - (input + 7.0)).abs() < 0.5,
            "expected input + output charge, saw {}",
            before - after
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_preserves_order_and_isolates_failures() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![]));
        let dispatcher = dispatcher(endpoint.clone(), 3);

        dispatcher.enqueue(CallContext::Text("status:200".to_string()), "first");
        dispatcher.enqueue(CallContext::Text("status:404".to_string()), "second");
        dispatcher.enqueue(CallContext::Text("status:200".to_string()), "third");

        let results = dispatcher.flush().await;

        assert_eq!(
            results.iter().map(|r| r.identifier.as_str()).collect::<Vec<_>>(),
            vec!["first", "second", "third"]
        );
        assert_eq!(results[0].status, RequestStatus::Success);
        assert_eq!(results[1].status, RequestStatus::Terminal);
        assert_eq!(results[2].status, RequestStatus::Success);
        assert_eq!(endpoint.calls(), 3);

        // The pool drained; a second flush is a no-op.
        assert!(dispatcher.flush().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_exceeded_is_fatal() {
        let mut small = spec();
        small.tokens_per_minute = 5;
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![]));
        let limiter = RateLimiter::for_spec(&small);
        let dispatcher = Dispatcher::new(
            endpoint.clone(),
            limiter,
            Arc::new(Tokenizer::new().unwrap()),
            Arc::new(MemoryStore::new()),
            RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_secs(1),
            },
        );

        let oversized = vec!["word"; 50].join(" ");
        let err = dispatcher
            .dispatch(CallContext::Text(oversized.clone()), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds bucket capacity"));
        assert_eq!(endpoint.calls(), 0);

        // In a batch the same failure becomes a terminal record so the
        // sibling call still runs.
        dispatcher.enqueue(CallContext::Text(oversized), "big");
        dispatcher.enqueue(CallContext::Text("ok".to_string()), "small");
        let results = dispatcher.flush().await;
        assert_eq!(results[0].status, RequestStatus::Terminal);
        assert_eq!(results[1].status, RequestStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_consumes_attempt() {
        struct FailingEndpoint {
            spec: ModelSpec,
            calls: AtomicUsize,
        }

        #[async_trait]
        impl ModelEndpoint for FailingEndpoint {
            fn spec(&self) -> &ModelSpec {
                &self.spec
            }
            fn kind(&self) -> ModelKind {
                ModelKind::Embedding
            }
            async fn call(&self, _context: &CallContext) -> Result<RawResponse> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("connection refused")
            }
            fn parse_success(&self, _body: &Value) -> Result<(Output, Usage)> {
                unreachable!("never succeeds")
            }
        }

        let endpoint = Arc::new(FailingEndpoint {
            spec: spec(),
            calls: AtomicUsize::new(0),
        });
        let limiter = RateLimiter::for_spec(&endpoint.spec);
        let dispatcher = Dispatcher::new(
            endpoint.clone(),
            limiter,
            Arc::new(Tokenizer::new().unwrap()),
            Arc::new(MemoryStore::new()),
            RetryPolicy {
                max_attempts: 1,
                base_backoff: Duration::from_millis(100),
            },
        );

        let record = dispatcher
            .dispatch(CallContext::Text("hello".to_string()), None)
            .await
            .unwrap();
        assert_eq!(record.status, RequestStatus::Exhausted);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
        assert!(record.error.unwrap().contains("connection refused"));
    }
}
