//! Integration tests using wiremock to simulate a CouchDB server.

use async_trait::async_trait;
use couchwire::changes::ChangeRow;
use couchwire::interceptor::{
    RequestAction, RequestContext, RequestInterceptor, ResponseAction, ResponseContext,
    ResponseInterceptor,
};
use couchwire::{BackoffPolicy, Client, Error, ErrorKind, IfExists, Request};
use futures_util::StreamExt;
use http::{HeaderValue, Method};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Animal {
    #[serde(rename = "_id")]
    id: String,
    class: String,
}

fn zebra() -> Animal {
    Animal {
        id: "zebra".to_string(),
        class: "mammal".to_string(),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client(server: &MockServer) -> Client {
    Client::builder()
        .base_url(server.uri())
        .unwrap()
        .build()
        .unwrap()
}

async fn mount_login(server: &MockServer) -> Arc<AtomicUsize> {
    let logins = Arc::new(AtomicUsize::new(0));
    let counter = logins.clone();
    Mock::given(method("POST"))
        .and(path("/_session"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .respond_with(move |_req: &wiremock::Request| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            ResponseTemplate::new(200)
                .insert_header(
                    "set-cookie",
                    format!("AuthSession=cookie{}; Version=1; Path=/; HttpOnly", n),
                )
                .set_body_json(json!({"ok": true, "name": "admin", "roles": ["_admin"]}))
        })
        .mount(server)
        .await;
    logins
}

fn cookies_sent(requests: &[wiremock::Request], request_path: &str) -> Vec<String> {
    requests
        .iter()
        .filter(|r| r.url.path() == request_path)
        .map(|r| {
            r.headers
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}

#[tokio::test]
async fn test_successful_get_request() {
    init_tracing();
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/animaldb/zebra"))
        .and(header("accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(zebra()))
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .get::<Animal>(&["animaldb", "zebra"])
        .await
        .unwrap();

    assert_eq!(response.data, zebra());
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.attempts, 1);
    assert!(!response.was_replayed());
    assert!(response.raw_body.contains("mammal"));
}

#[tokio::test]
async fn test_put_sends_json_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/animaldb/zebra"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"_id": "zebra", "class": "mammal"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "ok": true,
            "id": "zebra",
            "rev": "1-a"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .put::<_, serde_json::Value>(&["animaldb", "zebra"], &zebra())
        .await
        .unwrap();

    assert_eq!(response.status.as_u16(), 201);
    assert_eq!(response.data["rev"], "1-a");
}

#[tokio::test]
async fn test_user_agent_is_sent() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/_up"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&mock_server)
        .await;

    client(&mock_server)
        .get::<serde_json::Value>(&["_up"])
        .await
        .unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    let agent = requests[0].headers.get("user-agent").unwrap().to_str().unwrap();
    assert!(agent.starts_with("couchwire/"), "unexpected agent {}", agent);
}

#[tokio::test]
async fn test_execute_returns_unread_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/animaldb/_all_docs"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"rows\":[]}"))
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);
    let url = client.url(&["animaldb", "_all_docs"], &[]).unwrap();
    let body = client.execute(Request::new(Method::GET, url)).await.unwrap();

    assert!(!body.is_closed());
    assert_eq!(body.text().await.unwrap(), "{\"rows\":[]}");
}

#[tokio::test]
async fn test_status_maps_to_error_kind() {
    let mock_server = MockServer::start().await;
    let cases = [
        (404, ErrorKind::NotFound),
        (409, ErrorKind::Conflict),
        (412, ErrorKind::PreconditionFailed),
        (429, ErrorKind::TooManyRequests),
        (400, ErrorKind::Generic),
        (500, ErrorKind::Generic),
    ];

    for (code, _) in cases {
        Mock::given(method("GET"))
            .and(path(format!("/db/{}", code)))
            .respond_with(ResponseTemplate::new(code))
            .mount(&mock_server)
            .await;
    }

    let client = client(&mock_server);
    for (code, kind) in cases {
        let code_segment = code.to_string();
        let url = client.url(&["db", code_segment.as_str()], &[]).unwrap();
        match client.execute(Request::new(Method::GET, url)).await {
            Err(Error::Http(e)) => {
                assert_eq!(e.kind(), kind, "status {}", code);
                assert_eq!(e.status().as_u16(), code);
                assert!(e.url().unwrap().path().ends_with(&code_segment));
            }
            other => panic!("Expected HTTP error for {}, got {:?}", code, other),
        }
    }
}

#[tokio::test]
async fn test_json_error_body_fills_error_and_reason() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/animaldb/zebra"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": "conflict",
            "reason": "document update conflict"
        })))
        .mount(&mock_server)
        .await;

    let result = client(&mock_server)
        .put::<_, serde_json::Value>(&["animaldb", "zebra"], &zebra())
        .await;

    match result {
        Err(Error::Http(e)) => {
            assert_eq!(e.kind(), ErrorKind::Conflict);
            assert_eq!(e.error(), Some("conflict"));
            assert_eq!(e.reason(), Some("document update conflict"));
            let message = e.to_string();
            assert!(message.starts_with("409 Conflict at http://"), "{}", message);
            assert!(message.ends_with(
                "/animaldb/zebra. Error: conflict. Reason: document update conflict."
            ));
        }
        other => panic!("Expected conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn test_plain_text_error_body_is_kept_raw() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/animaldb/zebra"))
        .respond_with(ResponseTemplate::new(500).set_body_string("plain text failure"))
        .mount(&mock_server)
        .await;

    let err = client(&mock_server)
        .get::<Animal>(&["animaldb", "zebra"])
        .await
        .unwrap_err();

    let http = err.as_http().unwrap();
    assert_eq!(http.kind(), ErrorKind::Generic);
    assert_eq!(http.error(), Some("plain text failure"));
    assert_eq!(http.reason(), None);
    assert_eq!(http.raw_body(), Some("plain text failure"));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_deserialization_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/animaldb/zebra"))
        .respond_with(ResponseTemplate::new(200).set_body_string("invalid json"))
        .mount(&mock_server)
        .await;

    let result = client(&mock_server)
        .get::<Animal>(&["animaldb", "zebra"])
        .await;

    match result {
        Err(Error::DeserializationFailed {
            raw_response,
            status,
            ..
        }) => {
            assert_eq!(raw_response, "invalid json");
            assert_eq!(status.as_u16(), 200);
        }
        other => panic!("Expected DeserializationFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_server_is_transport_error() {
    let client = Client::builder()
        .base_url("http://127.0.0.1:1")
        .unwrap()
        .connect_timeout(Duration::from_secs(2))
        .build()
        .unwrap();

    let err = client.get::<Animal>(&["animaldb"]).await.unwrap_err();
    assert!(err.is_transport(), "Expected transport error, got {:?}", err);
    assert_eq!(err.kind(), None);
}

#[tokio::test]
async fn test_expired_session_is_renewed_once_and_replayed() {
    init_tracing();
    let mock_server = MockServer::start().await;
    let logins = mount_login(&mock_server).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    Mock::given(method("PUT"))
        .and(path("/animaldb/zebra"))
        .and(body_json(json!({"_id": "zebra", "class": "mammal"})))
        .respond_with(move |_req: &wiremock::Request| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(401).set_body_json(json!({
                    "error": "unauthorized",
                    "reason": "Session expired"
                }))
            } else {
                ResponseTemplate::new(201).set_body_json(json!({"ok": true, "rev": "1-a"}))
            }
        })
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .credentials("admin", "secret")
        .build()
        .unwrap();

    let response = client
        .put::<_, serde_json::Value>(&["animaldb", "zebra"], &zebra())
        .await
        .unwrap();

    assert_eq!(response.status.as_u16(), 201);
    assert_eq!(response.attempts, 2);
    assert_eq!(logins.load(Ordering::SeqCst), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(
        cookies_sent(&requests, "/animaldb/zebra"),
        vec!["AuthSession=cookie1", "AuthSession=cookie2"]
    );
}

#[tokio::test]
async fn test_second_expiry_surfaces_error_without_third_login() {
    let mock_server = MockServer::start().await;
    let logins = mount_login(&mock_server).await;

    Mock::given(method("GET"))
        .and(path("/animaldb/zebra"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "unauthorized",
            "reason": "Session expired"
        })))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .credentials("admin", "secret")
        .build()
        .unwrap();

    let err = client
        .get::<Animal>(&["animaldb", "zebra"])
        .await
        .unwrap_err();

    assert_eq!(err.status().map(|s| s.as_u16()), Some(401));
    assert_eq!(err.kind(), Some(ErrorKind::Generic));
    assert_eq!(logins.load(Ordering::SeqCst), 2);
    assert_eq!(
        client.session_state(),
        Some(couchwire::auth::SessionState::Failed)
    );
}

#[tokio::test]
async fn test_forbidden_without_expiry_marker_is_not_renewed() {
    let mock_server = MockServer::start().await;
    let logins = mount_login(&mock_server).await;

    Mock::given(method("GET"))
        .and(path("/secretdb/doc"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": "forbidden",
            "reason": "You are not allowed to access this db."
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .credentials("admin", "secret")
        .build()
        .unwrap();

    let err = client
        .get::<serde_json::Value>(&["secretdb", "doc"])
        .await
        .unwrap_err();

    assert_eq!(err.as_http().unwrap().error(), Some("forbidden"));
    assert_eq!(logins.load(Ordering::SeqCst), 1);
    assert_eq!(
        client.session_state(),
        Some(couchwire::auth::SessionState::HasSession)
    );
}

#[tokio::test]
async fn test_login_is_backed_off_on_429_and_sends_user_agent() {
    let mock_server = MockServer::start().await;

    let logins = Arc::new(AtomicUsize::new(0));
    let counter = logins.clone();
    Mock::given(method("POST"))
        .and(path("/_session"))
        .respond_with(move |_req: &wiremock::Request| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(429).set_body_json(json!({
                    "error": "too_many_requests",
                    "reason": "You've exceeded your rate limit allowance."
                }))
            } else {
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "AuthSession=fresh; Path=/; HttpOnly")
                    .set_body_json(json!({"ok": true, "name": "admin"}))
            }
        })
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/animaldb/zebra"))
        .and(header("cookie", "AuthSession=fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(zebra()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .credentials("admin", "secret")
        .too_many_requests_backoff(BackoffPolicy {
            initial_delay: Duration::from_millis(10),
            ..BackoffPolicy::default()
        })
        .build()
        .unwrap();

    let response = client.get::<Animal>(&["animaldb", "zebra"]).await.unwrap();

    assert_eq!(response.data, zebra());
    assert_eq!(logins.load(Ordering::SeqCst), 2);
    assert_eq!(
        client.session_state(),
        Some(couchwire::auth::SessionState::HasSession)
    );

    let requests = mock_server.received_requests().await.unwrap();
    let login_agents: Vec<&str> = requests
        .iter()
        .filter(|r| r.url.path() == "/_session")
        .map(|r| {
            r.headers
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
        })
        .collect();
    assert_eq!(login_agents.len(), 2);
    assert!(login_agents.iter().all(|a| a.starts_with("couchwire/")));
}

#[tokio::test]
async fn test_iam_api_key_is_exchanged_for_session_cookie() {
    let mock_server = MockServer::start().await;
    let token = json!({
        "access_token": "eyJraWQiOiIyMDE3",
        "refresh_token": "not-used",
        "token_type": "Bearer",
        "expires_in": 3600
    });

    Mock::given(method("POST"))
        .and(path("/identity/token"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string(
            "grant_type=urn%3Aibm%3Aparams%3Aoauth%3Agrant-type%3Aapikey\
             &response_type=cloud_iam&apikey=my-api-key",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(token.clone()))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/_iam_session"))
        .and(header("content-type", "application/json"))
        .and(body_json(token))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "IAMSession=iam1; Path=/; HttpOnly")
                .set_body_json(json!({"ok": true})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/animaldb/zebra"))
        .and(header("cookie", "IAMSession=iam1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(zebra()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .iam_api_key("my-api-key")
        .iam_server_url(format!("{}/identity/token", mock_server.uri()))
        .unwrap()
        .build()
        .unwrap();

    let response = client.get::<Animal>(&["animaldb", "zebra"]).await.unwrap();

    assert_eq!(response.data, zebra());
    assert_eq!(response.attempts, 1);
    assert_eq!(
        client.session_state(),
        Some(couchwire::auth::SessionState::HasSession)
    );
}

#[tokio::test]
async fn test_too_many_requests_is_replayed_after_backoff() {
    let mock_server = MockServer::start().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    Mock::given(method("GET"))
        .and(path("/animaldb/zebra"))
        .respond_with(move |_req: &wiremock::Request| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "0")
                    .set_body_json(json!({
                        "error": "too_many_requests",
                        "reason": "You've exceeded your rate limit allowance."
                    }))
            } else {
                ResponseTemplate::new(200).set_body_json(zebra())
            }
        })
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .too_many_requests_backoff(BackoffPolicy {
            initial_delay: Duration::from_millis(10),
            ..BackoffPolicy::default()
        })
        .build()
        .unwrap();

    let response = client.get::<Animal>(&["animaldb", "zebra"]).await.unwrap();

    assert_eq!(response.data, zebra());
    assert_eq!(response.attempts, 3);
    assert!(response.was_replayed());
}

#[tokio::test]
async fn test_too_many_requests_surfaces_when_replays_exhausted() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/animaldb/zebra"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": "too_many_requests",
            "reason": "slow down"
        })))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .max_replays(0)
        .too_many_requests_backoff(BackoffPolicy {
            initial_delay: Duration::from_millis(5),
            max_replays: 2,
            ..BackoffPolicy::default()
        })
        .build()
        .unwrap();

    let err = client.get::<Animal>(&["animaldb", "zebra"]).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::TooManyRequests));
    assert_eq!(err.as_http().unwrap().reason(), Some("slow down"));
}

#[tokio::test]
async fn test_without_backoff_429_is_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/animaldb/zebra"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&mock_server)
        .await;

    let err = client(&mock_server)
        .get::<Animal>(&["animaldb", "zebra"])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::TooManyRequests));
}

struct ReadOnly;

#[async_trait]
impl RequestInterceptor for ReadOnly {
    async fn intercept_request(
        &self,
        context: &mut RequestContext<'_>,
    ) -> couchwire::Result<RequestAction> {
        if context.request.method() == Method::GET {
            Ok(RequestAction::Proceed)
        } else {
            Ok(RequestAction::Abort("client is read-only".to_string()))
        }
    }
}

#[tokio::test]
async fn test_request_interceptor_can_abort() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .request_interceptor(Arc::new(ReadOnly))
        .build()
        .unwrap();

    let err = client
        .put::<_, serde_json::Value>(&["animaldb", "zebra"], &zebra())
        .await
        .unwrap_err();
    match err {
        Error::Aborted { reason } => assert_eq!(reason, "client is read-only"),
        other => panic!("Expected Aborted, got {:?}", other),
    }
}

struct Tag(&'static str);

#[async_trait]
impl RequestInterceptor for Tag {
    async fn intercept_request(
        &self,
        context: &mut RequestContext<'_>,
    ) -> couchwire::Result<RequestAction> {
        let value = match context.request.headers().get("x-tags") {
            Some(existing) => format!("{}>{}", existing.to_str().unwrap_or_default(), self.0),
            None => self.0.to_string(),
        };
        context
            .request
            .headers_mut()
            .insert("x-tags", HeaderValue::from_str(&value).unwrap());
        Ok(RequestAction::Proceed)
    }
}

#[tokio::test]
async fn test_client_interceptors_run_before_request_interceptors() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/animaldb"))
        .and(header("x-tags", "client>request"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"db_name": "animaldb"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .request_interceptor(Arc::new(Tag("client")))
        .build()
        .unwrap();

    let url = client.url(&["animaldb"], &[]).unwrap();
    let request = Request::new(Method::GET, url).with_request_interceptor(Arc::new(Tag("request")));
    let response = client.execute_as::<serde_json::Value>(request).await.unwrap();
    assert_eq!(response.data["db_name"], "animaldb");
}

struct AlwaysReplay;

#[async_trait]
impl ResponseInterceptor for AlwaysReplay {
    async fn intercept_response(
        &self,
        _context: &mut ResponseContext<'_>,
    ) -> couchwire::Result<ResponseAction> {
        Ok(ResponseAction::Replay)
    }
}

#[tokio::test]
async fn test_replay_past_budget_is_refused() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .response_interceptor(Arc::new(AlwaysReplay))
        .build()
        .unwrap();

    let err = client
        .get::<serde_json::Value>(&["animaldb"])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReplayLimitExceeded { attempts: 2 }));
}

#[tokio::test]
async fn test_continuous_changes_feed() {
    init_tracing();
    let mock_server = MockServer::start().await;

    let body = concat!(
        "{\"seq\":1,\"id\":\"ant\",\"changes\":[{\"rev\":\"1-a\"}]}\n",
        "\n",
        "\n",
        "{\"seq\":2,\"id\":\"bee\",\"changes\":[{\"rev\":\"2-b\"}],\"deleted\":true}\n",
        "\n",
        "{\"last_seq\":2,\"pending\":0}\n",
    );
    Mock::given(method("GET"))
        .and(path("/animaldb/_changes"))
        .and(query_param("feed", "continuous"))
        .and(query_param("since", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&mock_server)
        .await;

    let mut feed = client(&mock_server)
        .changes("animaldb")
        .since("0")
        .continuous()
        .await
        .unwrap();

    let mut rows: Vec<ChangeRow> = Vec::new();
    while feed.has_next().await.unwrap() {
        rows.push(feed.next().unwrap());
    }

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id, "ant");
    assert_eq!(rows[1].id, "bee");
    assert!(rows[1].deleted);
    assert_eq!(feed.last_seq(), Some(&json!(2)));
    assert!(feed.is_closed());
}

#[tokio::test]
async fn test_continuous_feed_as_stream() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/animaldb/_changes"))
        .and(query_param("feed", "continuous"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"seq\":1,\"id\":\"ant\"}\n{\"seq\":2,\"id\":\"bee\"}\n{\"seq\":3,\"id\":\"cat\"}\n",
        ))
        .mount(&mock_server)
        .await;

    let feed = client(&mock_server)
        .changes("animaldb")
        .continuous()
        .await
        .unwrap();

    let ids: Vec<String> = feed
        .into_stream()
        .map(|row| row.unwrap().id)
        .collect()
        .await;
    assert_eq!(ids, vec!["ant", "bee", "cat"]);
}

#[tokio::test]
async fn test_continuous_feed_stop_discards_remaining_rows() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/animaldb/_changes"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"seq\":1,\"id\":\"ant\"}\n{\"seq\":2,\"id\":\"bee\"}\n",
        ))
        .mount(&mock_server)
        .await;

    let mut feed = client(&mock_server)
        .changes("animaldb")
        .continuous()
        .await
        .unwrap();

    assert!(feed.has_next().await.unwrap());
    assert_eq!(feed.next().unwrap().id, "ant");
    feed.stopper().stop();
    assert!(!feed.has_next().await.unwrap());
    assert!(feed.is_closed());
    assert!(feed.last_seq().is_none());
}

#[tokio::test]
async fn test_continuous_feed_on_missing_database() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/nodb/_changes"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": "not_found",
            "reason": "Database does not exist."
        })))
        .mount(&mock_server)
        .await;

    let err = client(&mock_server)
        .changes("nodb")
        .continuous()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotFound));
}

#[tokio::test]
async fn test_normal_changes() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/animaldb/_changes"))
        .and(query_param("feed", "normal"))
        .and(query_param("include_docs", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"seq": "1-x", "id": "zebra", "changes": [{"rev": "1-a"}],
                 "doc": {"_id": "zebra", "class": "mammal"}}
            ],
            "last_seq": "1-x",
            "pending": 0
        })))
        .mount(&mock_server)
        .await;

    let result = client(&mock_server)
        .changes("animaldb")
        .include_docs(true)
        .normal()
        .await
        .unwrap();

    assert_eq!(result.results.len(), 1);
    assert_eq!(result.results[0].doc.as_ref().unwrap()["class"], "mammal");
    assert_eq!(result.last_seq, json!("1-x"));
    assert_eq!(result.pending, Some(0));
}

#[tokio::test]
async fn test_create_database_if_exists() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/newdb"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true})))
        .mount(&mock_server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(412).set_body_json(json!({
            "error": "file_exists",
            "reason": "The database could not be created, the file already exists."
        })))
        .mount(&mock_server)
        .await;

    let strict = client(&mock_server);
    assert!(strict.create_database("newdb").await.unwrap());
    let err = strict.create_database("animaldb").await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::PreconditionFailed));

    let lenient = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .create_if_exists(IfExists::Ignore)
        .build()
        .unwrap();
    assert!(!lenient.create_database("animaldb").await.unwrap());
}

#[tokio::test]
async fn test_delete_database() {
    let mock_server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/animaldb"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&mock_server)
        .await;

    client(&mock_server).delete_database("animaldb").await.unwrap();
}

#[tokio::test]
async fn test_default_headers() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/animaldb"))
        .and(header("x-cloudant-user", "reader"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .default_header("X-Cloudant-User", "reader")
        .unwrap()
        .build()
        .unwrap();

    client
        .get::<serde_json::Value>(&["animaldb"])
        .await
        .unwrap();
}
