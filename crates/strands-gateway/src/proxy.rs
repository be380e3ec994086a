//! Prefix routing and request forwarding with retries and per-downstream
//! circuit breakers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use strands_types::StrandError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Methods safe to retry against a downstream.
fn is_idempotent(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "OPTIONS")
}

fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(250) * 2u32.pow(attempt)
}

/// One routing table entry: requests whose path starts with `prefix` go to
/// `target`, with `strip` removed from the front of the path first.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub prefix: String,
    pub target: String,
    pub strip: Option<String>,
    pub service: String,
}

impl RouteRule {
    pub fn new(prefix: &str, target: &str, strip: Option<&str>, service: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            target: target.trim_end_matches('/').to_string(),
            strip: strip.map(ToString::to_string),
            service: service.to_string(),
        }
    }

    fn downstream_path(&self, path: &str) -> String {
        match &self.strip {
            Some(strip) => {
                let stripped = path.strip_prefix(strip.as_str()).unwrap_or(path);
                if stripped.is_empty() {
                    "/".to_string()
                } else {
                    stripped.to_string()
                }
            }
            None => path.to_string(),
        }
    }
}

/// Per-downstream breaker, simpler than the pipeline's: a failure counter
/// opens it, the reset timeout half-opens it, one success closes it.
#[derive(Debug)]
struct DownstreamBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    failure_count: u32,
    open: bool,
    last_failure: Option<Instant>,
}

impl DownstreamBreaker {
    fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            failure_count: 0,
            open: false,
            last_failure: None,
        }
    }

    fn is_open(&mut self) -> bool {
        if self.open {
            let elapsed = self
                .last_failure
                .map(|at| at.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed >= self.reset_timeout {
                // Half-open: admit the next request as a probe.
                self.open = false;
                self.failure_count = self.failure_threshold.saturating_sub(1);
            }
        }
        self.open
    }

    fn retry_after_secs(&self) -> u64 {
        let elapsed = self
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or_default();
        self.reset_timeout
            .saturating_sub(elapsed)
            .as_secs()
            .max(1)
    }

    fn record_success(&mut self) {
        self.failure_count = 0;
        self.open = false;
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        if self.failure_count >= self.failure_threshold {
            self.open = true;
        }
    }
}

/// A forwarded response as seen by the gateway handler.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub retry_after: Option<u64>,
}

impl ForwardedResponse {
    fn error(status: u16, error: &str, message: &str, retry_after: Option<u64>) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: json!({"error": error, "message": message}).to_string().into_bytes(),
            retry_after,
        }
    }
}

pub struct ProxyRouter {
    client: reqwest::Client,
    routes: Vec<RouteRule>,
    breakers: Mutex<HashMap<String, DownstreamBreaker>>,
    retry_attempts: u32,
    breaker_failure_threshold: u32,
    breaker_reset_timeout: Duration,
}

impl std::fmt::Debug for ProxyRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRouter")
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl ProxyRouter {
    pub fn new(
        routes: Vec<RouteRule>,
        retry_attempts: u32,
        request_timeout: Duration,
        breaker_failure_threshold: u32,
        breaker_reset_timeout: Duration,
    ) -> Result<Self, StrandError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .build()
            .map_err(|e| StrandError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            routes,
            breakers: Mutex::new(HashMap::new()),
            retry_attempts,
            breaker_failure_threshold,
            breaker_reset_timeout,
        })
    }

    pub fn find_route(&self, path: &str) -> Option<&RouteRule> {
        self.routes.iter().find(|r| path.starts_with(&r.prefix))
    }

    fn breaker_is_open(&self, service: &str) -> Option<u64> {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers.entry(service.to_string()).or_insert_with(|| {
            DownstreamBreaker::new(self.breaker_failure_threshold, self.breaker_reset_timeout)
        });
        breaker.is_open().then(|| breaker.retry_after_secs())
    }

    fn record(&self, service: &str, success: bool) {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers.entry(service.to_string()).or_insert_with(|| {
            DownstreamBreaker::new(self.breaker_failure_threshold, self.breaker_reset_timeout)
        });
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    /// Forward one request. Retries only idempotent methods, with
    /// exponential backoff; open breakers short-circuit to 503 with a
    /// computed `Retry-After`.
    pub async fn forward(
        &self,
        method: &str,
        path: &str,
        query: Option<&str>,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> ForwardedResponse {
        let Some(route) = self.find_route(path) else {
            return ForwardedResponse::error(404, "not_found", "no route for path", None);
        };
        let service = route.service.clone();

        if let Some(retry_after) = self.breaker_is_open(&service) {
            tracing::warn!(service, "breaker open, short-circuiting");
            return ForwardedResponse::error(
                503,
                "service_unavailable",
                &format!("{service} temporarily unavailable"),
                Some(retry_after),
            );
        }

        let mut url = format!("{}{}", route.target, route.downstream_path(path));
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        let Ok(method) = reqwest::Method::from_bytes(method.as_bytes()) else {
            return ForwardedResponse::error(400, "validation_failed", "bad method", None);
        };

        let max_attempts = if is_idempotent(method.as_str()) {
            self.retry_attempts + 1
        } else {
            1
        };

        let mut last_error = String::new();
        let mut timed_out = false;
        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(retry_delay(attempt - 1)).await;
            }
            let mut request = self.client.request(method.clone(), url.as_str());
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }
            request = request
                .header("x-gateway-request-id", format!("gw_{}", uuid::Uuid::new_v4()))
                .header("x-gateway-timestamp", chrono::Utc::now().to_rfc3339());
            if !body.is_empty() {
                request = request.body(body.clone());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let content_type = response
                        .headers()
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                        .map(ToString::to_string);
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok());
                    let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                    // 5xx counts against the breaker; 4xx is the caller's
                    // problem.
                    self.record(&service, status < 500);
                    return ForwardedResponse {
                        status,
                        content_type,
                        body,
                        retry_after,
                    };
                }
                Err(e) => {
                    timed_out = e.is_timeout();
                    last_error = e.to_string();
                    tracing::warn!(service, attempt, error = %last_error, "forward attempt failed");
                }
            }
        }

        self.record(&service, false);
        if timed_out {
            ForwardedResponse::error(504, "timeout", &format!("{service} timed out"), None)
        } else {
            ForwardedResponse::error(
                502,
                "internal",
                &format!("{service} unreachable: {last_error}"),
                None,
            )
        }
    }

    /// Downstream health overview for `/services/status`.
    pub fn breaker_status(&self) -> serde_json::Value {
        let breakers = lock(&self.breakers);
        let statuses: serde_json::Map<String, serde_json::Value> = breakers
            .iter()
            .map(|(service, b)| {
                (
                    service.clone(),
                    json!({"open": b.open, "failure_count": b.failure_count}),
                )
            })
            .collect();
        statuses.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with(routes: Vec<RouteRule>) -> ProxyRouter {
        ProxyRouter::new(
            routes,
            2,
            Duration::from_secs(5),
            5,
            Duration::from_secs(60),
        )
        .unwrap()
    }

    #[test]
    fn path_transform_strips_the_gateway_prefix() {
        let rule = RouteRule::new("/chat/", "http://chat:8002", Some("/chat"), "chat-service");
        assert_eq!(
            rule.downstream_path("/chat/conversation/start"),
            "/conversation/start"
        );

        let rule = RouteRule::new("/npc", "http://npc:8003", None, "npc-service");
        assert_eq!(rule.downstream_path("/npc/abc"), "/npc/abc");
    }

    #[test]
    fn first_matching_prefix_wins() {
        let router = router_with(vec![
            RouteRule::new(
                "/summary/queue/",
                "http://summary:8004",
                Some("/summary"),
                "summary-service",
            ),
            RouteRule::new("/summary/", "http://summary:8004", None, "summary-service"),
        ]);
        let rule = router.find_route("/summary/queue/status").unwrap();
        assert_eq!(rule.downstream_path("/summary/queue/status"), "/queue/status");

        let rule = router.find_route("/summary/generate").unwrap();
        assert_eq!(rule.downstream_path("/summary/generate"), "/summary/generate");
    }

    #[test]
    fn idempotency_rules() {
        assert!(is_idempotent("GET"));
        assert!(is_idempotent("HEAD"));
        assert!(is_idempotent("OPTIONS"));
        assert!(!is_idempotent("POST"));
        assert!(!is_idempotent("PUT"));
        assert!(!is_idempotent("DELETE"));
    }

    #[test]
    fn retry_backoff_doubles() {
        assert_eq!(retry_delay(0), Duration::from_millis(250));
        assert_eq!(retry_delay(1), Duration::from_millis(500));
        assert_eq!(retry_delay(2), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_at_threshold_and_half_opens_after_reset() {
        let mut breaker = DownstreamBreaker::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            breaker.record_failure();
            assert!(!breaker.is_open());
        }
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(breaker.retry_after_secs() > 0 && breaker.retry_after_secs() <= 60);

        tokio::time::advance(Duration::from_secs(61)).await;
        // Probe admitted; one success closes, one failure re-opens.
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!breaker.is_open());
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn unknown_path_is_404_without_downstream_call() {
        let router = router_with(vec![RouteRule::new(
            "/chat/",
            "http://127.0.0.1:1",
            Some("/chat"),
            "chat-service",
        )]);
        let response = router
            .forward("GET", "/nowhere", None, &[], Vec::new())
            .await;
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_with_retry_after() {
        let router = router_with(vec![RouteRule::new(
            "/chat/",
            "http://chat.invalid",
            Some("/chat"),
            "chat-service",
        )]);
        for _ in 0..5 {
            router.record("chat-service", false);
        }
        let response = router
            .forward("GET", "/chat/x", None, &[], Vec::new())
            .await;
        assert_eq!(response.status, 503);
        assert!(response.retry_after.is_some());
    }
}
