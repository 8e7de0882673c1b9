//! Retry, circuit breaker and token renewal behaviour against a stub transport.

mod common;

use async_trait::async_trait;
use common::{client_with, fast_config, status, text, StubTransport};
use freeseek::{
    CircuitState, Client, ClientConfig, ConfigUpdate, CredentialSource, FreeseekError,
    InferenceRequest, Model, RawResponse, Result, Token,
};
use reqwest::header::HeaderValue;
use serde_json::json;
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn ask(prompt: &str) -> InferenceRequest {
    InferenceRequest::new(Model::V3, prompt)
}

#[tokio::test]
async fn test_identical_calls_return_transport_answer() {
    let transport = StubTransport::new(|_, _| async { text("same answer") });
    let client = client_with(fast_config(), transport.clone());

    for _ in 0..3 {
        let response = client.infer(ask("hello")).await.unwrap();
        assert_eq!(response.text(), "same answer");
        assert_eq!(response.tokens_used(), Some(1));
    }
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_rate_limited_three_times_then_success() {
    let transport = StubTransport::new(|_, i| async move {
        if i < 3 { status(429) } else { text("finally") }
    });
    let config = fast_config();
    let factor = config.backoff_factor;
    let client = client_with(config, transport.clone());

    let response = client.infer(ask("retry me")).await.unwrap();
    assert_eq!(response.text(), "finally");
    assert_eq!(transport.calls(), 4);

    let seen = transport.seen();
    for n in 1..=3 {
        let waited = seen[n].at.duration_since(seen[n - 1].at);
        let minimum = Duration::from_secs_f64(factor * 2f64.powi(n as i32));
        assert!(
            waited >= minimum,
            "retry {n} waited {waited:?}, expected at least {minimum:?}"
        );
    }

    let metrics = client.metrics();
    assert_eq!(metrics.retry_count, 3);
    assert_eq!(metrics.rate_limited, 3);
    assert_eq!(client.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_retries_exhausted_surface_last_error() {
    let transport = StubTransport::new(|_, _| async { status(503) });
    let mut config = fast_config();
    config.max_retries = 2;
    config.circuit_failure_threshold = 10;
    let client = client_with(config, transport.clone());

    let err = client.infer(ask("down")).await.unwrap_err();
    assert!(matches!(err, FreeseekError::ServiceUnavailable { status: 503, .. }));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_bad_request_is_not_retried() {
    let transport = StubTransport::new(|_, _| async { status(400) });
    let client = client_with(fast_config(), transport.clone());

    let err = client.infer(ask("bad")).await.unwrap_err();
    assert_eq!(err.status(), Some(400));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_breaker_opens_and_admits_single_trial() {
    let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = Arc::clone(&healthy);
    let transport = StubTransport::new(move |_, _| {
        let healthy = flag.load(Ordering::SeqCst);
        async move {
            if healthy {
                tokio::time::sleep(Duration::from_millis(100)).await;
                text("recovered")
            } else {
                status(500)
            }
        }
    });

    let mut config = fast_config();
    config.max_retries = 0;
    config.circuit_failure_threshold = 3;
    config.circuit_recovery_timeout = Duration::from_millis(200);
    let client = client_with(config, transport.clone());

    for _ in 0..3 {
        let err = client.infer(ask("x")).await.unwrap_err();
        assert!(matches!(err, FreeseekError::ServiceUnavailable { .. }));
    }
    assert_eq!(client.circuit_state(), CircuitState::Open);

    let err = client.infer(ask("x")).await.unwrap_err();
    assert!(matches!(err, FreeseekError::CircuitOpen { .. }));
    assert_eq!(transport.calls(), 3);

    tokio::time::sleep(Duration::from_millis(250)).await;
    healthy.store(true, Ordering::SeqCst);
    assert_eq!(client.circuit_state(), CircuitState::HalfOpen);

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.infer(ask("trial")).await })
        })
        .collect();

    let mut admitted = 0;
    let mut rejected = 0;
    for call in calls {
        match call.await.unwrap() {
            Ok(response) => {
                assert_eq!(response.text(), "recovered");
                admitted += 1;
            }
            Err(FreeseekError::CircuitOpen { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(rejected, 4);
    assert_eq!(transport.calls(), 4);
    assert_eq!(client.circuit_state(), CircuitState::Closed);
    assert_eq!(client.metrics().circuit_rejections, 5);
}

#[tokio::test]
async fn test_client_errors_do_not_trip_breaker() {
    let transport = StubTransport::new(|_, _| async { status(404) });
    let mut config = fast_config();
    config.circuit_failure_threshold = 1;
    let client = client_with(config, transport.clone());

    for _ in 0..3 {
        assert!(client.get_model_info(Model::Pro).await.is_err());
    }
    assert_eq!(client.circuit_state(), CircuitState::Closed);
    assert_eq!(transport.calls(), 3);
}

/// Issues `tok-1`, `tok-2`, ... and counts how often it was asked.
struct CountingCredentials {
    issued: AtomicUsize,
}

#[async_trait]
impl CredentialSource for CountingCredentials {
    async fn fetch_token(&self, _config: &ClientConfig) -> Result<Token> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Token::new(format!("tok-{n}"), Duration::from_secs(3600)))
    }
}

fn counting_client(
    transport: Arc<dyn freeseek::Transport>,
) -> (Client, Arc<CountingCredentials>) {
    let credentials = Arc::new(CountingCredentials {
        issued: AtomicUsize::new(0),
    });
    let client = Client::builder(fast_config())
        .transport(transport)
        .credentials(credentials.clone())
        .build()
        .unwrap();
    (client, credentials)
}

#[tokio::test]
async fn test_concurrent_unauthorized_refresh_once() {
    let transport = StubTransport::new(|request, _| async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        match request.bearer_token() {
            Some("tok-1") => status(401),
            Some(_) => text("authorized"),
            None => status(400),
        }
    });
    let (client, credentials) = counting_client(transport.clone());

    // Issue the first token up front so every caller starts from it.
    client.refresh_token().await.unwrap();
    assert_eq!(credentials.issued.load(Ordering::SeqCst), 1);

    let calls: Vec<_> = (0..8)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.infer(ask(&format!("call {i}"))).await })
        })
        .collect();
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap().text(), "authorized");
    }

    assert_eq!(credentials.issued.load(Ordering::SeqCst), 2);
    assert_eq!(client.metrics().token_refreshes, 2);
    assert_eq!(transport.calls(), 16);
}

#[tokio::test]
async fn test_second_unauthorized_surfaces_auth_error() {
    let transport = StubTransport::new(|_, _| async { status(401) });
    let (client, credentials) = counting_client(transport.clone());

    let err = client.infer(ask("nope")).await.unwrap_err();
    assert!(matches!(err, FreeseekError::Auth { status: 401, .. }));
    assert_eq!(transport.calls(), 2);
    assert_eq!(credentials.issued.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unauthorized_retry_uses_new_token() {
    let transport = StubTransport::new(|_, i| async move {
        if i == 0 { status(401) } else { text("ok") }
    });
    let (client, _) = counting_client(transport.clone());

    client.infer(ask("renew")).await.unwrap();
    let seen = transport.seen();
    assert_eq!(seen[0].request.bearer_token(), Some("tok-1"));
    assert_eq!(seen[1].request.bearer_token(), Some("tok-2"));
    assert_eq!(client.metrics().retry_count, 0);
}

#[tokio::test]
async fn test_default_credentials_use_api_key() {
    let transport = StubTransport::new(|_, _| async { text("ok") });
    let client = client_with(fast_config(), transport.clone());

    client.infer(ask("hi")).await.unwrap();
    assert_eq!(transport.seen()[0].request.bearer_token(), Some("test-key"));
    assert_eq!(client.config().api_key.expose_secret(), "test-key");
}

#[tokio::test]
async fn test_update_config_leaves_in_flight_snapshot() {
    let transport = StubTransport::new(|_, i| async move {
        if i == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            status(503)
        } else {
            text("second attempt")
        }
    });
    let mut config = fast_config();
    config.max_retries = 1;
    let client = client_with(config, transport.clone());

    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move { client.infer(ask("slow")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    client
        .update_config(&ConfigUpdate {
            max_retries: Some(0),
            ..ConfigUpdate::default()
        })
        .unwrap();

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.text(), "second attempt");
    assert_eq!(client.config().max_retries, 0);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_exhausted_quota_delays_next_request() {
    let transport = StubTransport::new(|_, i| async move {
        let mut response = RawResponse::json(&json!({ "text": "ok" }));
        if i == 0 {
            let headers = &mut response.headers;
            headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
            headers.insert("x-ratelimit-reset", HeaderValue::from_static("1"));
        }
        Ok(response)
    });
    let mut config = fast_config();
    config.max_backoff = Duration::from_secs(5);
    let client = client_with(config, transport.clone());

    client.infer(ask("first")).await.unwrap();
    client.infer(ask("second")).await.unwrap();

    let seen = transport.seen();
    let gap = seen[1].at.duration_since(seen[0].at);
    assert!(gap >= Duration::from_millis(950), "second call after {gap:?}");
    assert!(gap < Duration::from_secs(3), "second call after {gap:?}");
}

#[tokio::test]
async fn test_quota_pacing_is_capped_by_max_backoff() {
    let transport = StubTransport::new(|_, i| async move {
        let mut response = RawResponse::json(&json!({ "text": "ok" }));
        if i == 0 {
            let headers = &mut response.headers;
            headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
            headers.insert("x-ratelimit-reset", HeaderValue::from_static("3600"));
        }
        Ok(response)
    });
    let mut config = fast_config();
    config.max_backoff = Duration::from_millis(300);
    let client = client_with(config, transport.clone());

    client.infer(ask("first")).await.unwrap();
    client.infer(ask("second")).await.unwrap();

    let seen = transport.seen();
    let gap = seen[1].at.duration_since(seen[0].at);
    assert!(gap >= Duration::from_millis(300), "second call after {gap:?}");
    assert!(gap < Duration::from_secs(2), "second call after {gap:?}");
}

#[tokio::test]
async fn test_oversized_reset_header_does_not_panic() {
    let transport = StubTransport::new(|_, i| async move {
        let mut response = RawResponse::json(&json!({ "text": "ok" }));
        if i == 0 {
            let headers = &mut response.headers;
            headers.insert("x-ratelimit-remaining", HeaderValue::from_static("1"));
            headers.insert(
                "x-ratelimit-reset",
                HeaderValue::from_static("18446744073709551615"),
            );
        }
        Ok(response)
    });
    let mut config = fast_config();
    config.max_backoff = Duration::from_millis(50);
    let client = client_with(config, transport.clone());

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.infer(ask("first")).await })
    };
    assert_eq!(call.await.unwrap().unwrap().text(), "ok");
    assert_eq!(client.infer(ask("second")).await.unwrap().text(), "ok");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_unusable_retry_after_still_retries() {
    let transport = StubTransport::new(|_, i| async move {
        if i == 0 {
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert("retry-after", HeaderValue::from_static("1e30"));
            Err(FreeseekError::from_status(429, &headers, "slow"))
        } else {
            text("ok")
        }
    });
    let client = client_with(fast_config(), transport.clone());

    assert_eq!(client.infer(ask("again")).await.unwrap().text(), "ok");
    assert_eq!(transport.calls(), 2);
}
