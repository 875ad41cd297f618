use gatekeeper::client::GrpcClient;
use gatekeeper::config::Config;
use gatekeeper::envelope::{seal, Envelope, EnvelopeOpener};
use gatekeeper::jwt::{self, Subject};
use gatekeeper::pipeline::{secure_pipeline, Pipeline, RouteRules};
use gatekeeper::publisher::TokenPublisher;
use gatekeeper::rate_limiter::RateLimiter;
use gatekeeper::replay::ReplayCache;
use gatekeeper::server::{create_app, create_pipeline};
use reqwest::Client;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> Config {
    let mut config = Config::default();
    config.jwt.token_key = "integration-test-key-0123456789-0123456789".to_string();
    config
}

async fn spawn_app(config: Config) -> (String, Arc<Pipeline>) {
    let pipeline = create_pipeline(config).await.unwrap();
    let app = create_app(Arc::clone(&pipeline));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), pipeline)
}

fn issue_token(config: &Config, sub: &str) -> (String, String) {
    let token = Subject::create(sub).generate(&config.jwt).unwrap();
    let secret = jwt::token_secret(&token, &config.jwt.token_key).unwrap();
    (token, secret)
}

fn fresh_opener(config: &Config) -> EnvelopeOpener {
    EnvelopeOpener::new(config.envelope.clock_skew, Arc::new(ReplayCache::new()))
}

#[tokio::test]
async fn enveloped_echo_roundtrip() {
    let config = test_config();
    let (base_url, _pipeline) = spawn_app(config.clone()).await;
    let (token, secret) = issue_token(&config, "user-42");

    let body = br#"{"order":7}"#;
    let envelope = seal(body, &secret, true).unwrap();

    let client = Client::new();
    let response = client
        .post(format!("{}/api/echo", base_url))
        .bearer_auth(&token)
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // The response body is itself an envelope, encrypted because the
    // request was, and opens under the same session secret
    let sealed: Envelope = response.json().await.unwrap();
    assert_eq!(sealed.p, 1);
    let plaintext = fresh_opener(&config)
        .open(&sealed, &secret, "user-42")
        .unwrap();
    let echoed: serde_json::Value = serde_json::from_slice(&plaintext).unwrap();
    assert_eq!(echoed["subject"], "user-42");
    assert_eq!(echoed["echo"], json!({"order": 7}));
}

#[tokio::test]
async fn plain_envelope_gets_plain_response() {
    let config = test_config();
    let (base_url, _pipeline) = spawn_app(config.clone()).await;
    let (token, secret) = issue_token(&config, "user-42");

    let envelope = seal(br#"{"ping":true}"#, &secret, false).unwrap();
    let response = Client::new()
        .post(format!("{}/api/echo", base_url))
        .bearer_auth(&token)
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let sealed: Envelope = response.json().await.unwrap();
    assert_eq!(sealed.p, 0);
    assert!(fresh_opener(&config)
        .open(&sealed, &secret, "user-42")
        .is_ok());
}

#[tokio::test]
async fn missing_token_is_401() {
    let config = test_config();
    let (base_url, _pipeline) = spawn_app(config.clone()).await;
    let secret = jwt::derive_secret("", &config.jwt.token_key);
    let envelope = seal(b"{}", &secret, false).unwrap();

    let response = Client::new()
        .post(format!("{}/api/echo", base_url))
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn garbage_token_is_401() {
    let config = test_config();
    let (base_url, _pipeline) = spawn_app(config.clone()).await;

    let response = Client::new()
        .post(format!("{}/api/echo", base_url))
        .bearer_auth("not.a.token")
        .json(&json!({"d": "", "t": 0, "n": "abcdef01", "p": 0, "g": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn replayed_envelope_is_400() {
    let config = test_config();
    let (base_url, _pipeline) = spawn_app(config.clone()).await;
    let (token, secret) = issue_token(&config, "user-42");
    let envelope = seal(b"{}", &secret, false).unwrap();

    let client = Client::new();
    let first = client
        .post(format!("{}/api/echo", base_url))
        .bearer_auth(&token)
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let second = client
        .post(format!("{}/api/echo", base_url))
        .bearer_auth(&token)
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 400);
}

#[tokio::test]
async fn stale_envelope_is_400() {
    let config = test_config();
    let (base_url, _pipeline) = spawn_app(config.clone()).await;
    let (token, secret) = issue_token(&config, "user-42");

    let mut envelope = seal(b"{}", &secret, false).unwrap();
    envelope.t -= 301_000;
    envelope.g = gatekeeper::envelope::signature(
        &envelope.d,
        &envelope.n,
        envelope.t,
        envelope.p,
        &secret,
    );

    let response = Client::new()
        .post(format!("{}/api/echo", base_url))
        .bearer_auth(&token)
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn method_bucket_exhaustion_is_429() {
    let mut config = test_config();
    config.rate.capacity = 2;
    config.rate.rate = 0.1;
    let (base_url, _pipeline) = spawn_app(config).await;

    let client = Client::new();
    for _ in 0..2 {
        let response = client
            .get(format!("{}/health", base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let response = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
}

#[tokio::test]
async fn guest_route_seals_under_the_guest_secret() {
    let config = test_config();
    let guest_secret = jwt::derive_secret("", &config.jwt.token_key);

    // Embed the pipeline around a custom router with an unauthenticated
    // but still enveloped route
    let config = Arc::new(config);
    let limiter = Arc::new(
        RateLimiter::connect(&config.rate, &config.redis_url)
            .await
            .unwrap(),
    );
    let rules = RouteRules::new().unauthenticated("/guest/echo");
    let pipeline = Arc::new(Pipeline::new(Arc::clone(&config), limiter).rules(rules));
    let app = axum::Router::new()
        .route("/guest/echo", axum::routing::post(gatekeeper::handlers::echo))
        .with_state(Arc::clone(&pipeline))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&pipeline),
            secure_pipeline,
        ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let envelope = seal(br#"{"hello":"guest"}"#, &guest_secret, false).unwrap();
    let response = Client::new()
        .post(format!("http://{}/guest/echo", addr))
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let sealed: Envelope = response.json().await.unwrap();
    let plaintext = EnvelopeOpener::new(config.envelope.clock_skew, Arc::new(ReplayCache::new()))
        .open(&sealed, &guest_secret, "guest")
        .unwrap();
    let echoed: serde_json::Value = serde_json::from_slice(&plaintext).unwrap();
    assert_eq!(echoed["subject"], "guest");
}

#[tokio::test]
async fn filters_run_before_every_stage() {
    use gatekeeper::error::GatekeeperError;
    use gatekeeper::pipeline::Filter;

    struct BlockDebugHeader;

    #[async_trait::async_trait]
    impl Filter for BlockDebugHeader {
        async fn apply(&self, request: &axum::extract::Request) -> gatekeeper::Result<()> {
            if request.headers().contains_key("x-debug") {
                return Err(GatekeeperError::HandlerFailure {
                    status: 403,
                    message: "debug requests are not accepted".to_string(),
                });
            }
            Ok(())
        }
    }

    let config = test_config();
    let limiter = Arc::new(
        RateLimiter::connect(&config.rate, &config.redis_url)
            .await
            .unwrap(),
    );
    let rules = RouteRules::new().unauthenticated("/ping").raw("/ping");
    let pipeline = Arc::new(
        Pipeline::new(Arc::new(config), limiter)
            .rules(rules)
            .with_filter(Arc::new(BlockDebugHeader)),
    );
    let app = axum::Router::new()
        .route("/ping", axum::routing::get(|| async { "pong" }))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&pipeline),
            secure_pipeline,
        ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = Client::new();
    let ok = client
        .get(format!("http://{}/ping", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);

    let blocked = client
        .get(format!("http://{}/ping", addr))
        .header("x-debug", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), 403);
}

#[tokio::test]
async fn health_reports_pipeline_metrics() {
    let config = test_config();
    let (base_url, _pipeline) = spawn_app(config).await;

    let client = Client::new();
    client.get(format!("{}/health", base_url)).send().await.unwrap();
    let response = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let health: serde_json::Value = response.json().await.unwrap();
    assert_eq!(health["status"], "healthy");
    assert!(health["pipeline"]["admitted"].as_u64().unwrap() >= 1);
}

async fn spawn_publisher(config: Config) -> SocketAddr {
    let publisher = TokenPublisher::new(config).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(publisher.into_service())
            .serve_with_incoming(incoming)
            .await
            .unwrap();
    });
    addr
}

#[tokio::test]
async fn client_bootstrap_grants_and_attaches_a_token() {
    let mut config = test_config();
    config
        .apps
        .insert("svc-orders".to_string(), "orders-app-key".to_string());
    let addr = spawn_publisher(config.clone()).await;

    let mut client_config = config.client.clone();
    client_config.app_id = "svc-orders".to_string();
    client_config.app_key = "orders-app-key".to_string();
    client_config.server_addrs = vec![format!("http://{}", addr)];

    let client = Arc::new(GrpcClient::new(
        client_config,
        config.pool.clone(),
        config.rate.clone(),
    ));
    client.bootstrap().await.unwrap();

    // The granted token verifies against the publisher's server key and
    // is bound to the appid with the GRPC device marker
    let token = client.token().expect("token after bootstrap");
    let subject = Subject::verify(&token, &config.jwt.token_key).unwrap();
    assert_eq!(subject.payload.sub, "svc-orders");
    assert_eq!(subject.payload.dev, "GRPC");

    // Subsequent outbound RPCs carry the token in request metadata
    use tonic::service::Interceptor;
    let mut interceptor = client.interceptor();
    let request = interceptor.call(tonic::Request::new(())).unwrap();
    assert_eq!(
        request.metadata().get("authorization").unwrap(),
        format!("Bearer {}", token).as_str()
    );
}

#[tokio::test]
async fn bootstrap_with_wrong_app_key_fails() {
    let mut config = test_config();
    config
        .apps
        .insert("svc-orders".to_string(), "orders-app-key".to_string());
    let addr = spawn_publisher(config.clone()).await;

    let mut client_config = config.client.clone();
    client_config.app_id = "svc-orders".to_string();
    client_config.app_key = "wrong-key".to_string();
    client_config.server_addrs = vec![format!("http://{}", addr)];

    let client = GrpcClient::new(client_config, config.pool.clone(), config.rate.clone());
    assert!(client.bootstrap().await.is_err());
    assert!(client.token().is_none());
}

#[tokio::test]
async fn generated_ids_are_unique() {
    let config = test_config();
    let addr = spawn_publisher(config).await;

    let mut client =
        gatekeeper::pb::pubworker::pub_worker_client::PubWorkerClient::connect(format!(
            "http://{}",
            addr
        ))
        .await
        .unwrap();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..10 {
        let id = client
            .generate_id(gatekeeper::pb::pubworker::GenerateIdRequest { node: 3 })
            .await
            .unwrap()
            .into_inner()
            .value;
        assert!(seen.insert(id));
    }
}

#[tokio::test]
async fn admin_reset_refills_a_method_bucket() {
    let mut config = test_config();
    config.rate.capacity = 1;
    config.rate.rate = 0.01;
    let (base_url, _pipeline) = spawn_app(config.clone()).await;
    let (token, _secret) = issue_token(&config, "admin-user");

    let client = Client::new();
    let ok = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);

    let denied = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 429);
    // The local backend estimates when a token comes back
    assert!(denied.headers().get("Retry-After").is_some());

    let reset = client
        .post(format!("{}/admin/limits/reset", base_url))
        .bearer_auth(&token)
        .json(&json!({"resource": "GET /health"}))
        .send()
        .await
        .unwrap();
    assert_eq!(reset.status(), 204);

    let refilled = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(refilled.status(), 200);
}

#[tokio::test]
async fn renewal_loop_bootstraps_until_granted() {
    let mut config = test_config();
    config
        .apps
        .insert("svc-orders".to_string(), "orders-app-key".to_string());
    let addr = spawn_publisher(config.clone()).await;

    let mut client_config = config.client.clone();
    client_config.app_id = "svc-orders".to_string();
    client_config.app_key = "orders-app-key".to_string();
    client_config.server_addrs = vec![format!("http://{}", addr)];
    client_config.renewal_interval = Duration::from_millis(100);

    let client = Arc::new(GrpcClient::new(
        client_config,
        config.pool.clone(),
        config.rate.clone(),
    ));
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = client.spawn_renewal(rx);

    // The loop starts unbooted, so it must obtain a token on its own
    let mut granted = false;
    for _ in 0..50 {
        if client.token().is_some() {
            granted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(granted, "renewal loop never obtained a token");

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("renewal task should stop on shutdown")
        .unwrap();
}

#[tokio::test]
async fn renewal_decision_matches_the_floor() {
    // Poll-loop decision: a token at the floor renews now, a fresh one
    // waits for the next tick
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    assert!(gatekeeper::client::should_renew(
        now + 2400,
        now,
        Duration::from_secs(2400)
    ));
    assert!(!gatekeeper::client::should_renew(
        now + 3600,
        now,
        Duration::from_secs(2400)
    ));
}
