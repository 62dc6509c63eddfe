use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use logfwd_probe::{
    ConnectivityProber, HealthStatus, HttpResponse, HttpTransport, ProbeError, TargetEndpoint,
    TransportError, LOGS_INGEST_SCOPE,
};
use serde_json::Value;

#[derive(Clone)]
enum Reply {
    Respond(u16, &'static str),
    Fail(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
struct Request {
    method: &'static str,
    url: String,
    token: Option<String>,
    body: Option<Value>,
}

#[derive(Clone)]
struct ScriptedTransport {
    replies: Arc<Mutex<Vec<Reply>>>,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl ScriptedTransport {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, request: Request) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request);
        let reply = {
            let mut guard = self.replies.lock().unwrap();
            if guard.is_empty() {
                Reply::Fail("no scripted reply")
            } else {
                guard.remove(0)
            }
        };
        match reply {
            Reply::Respond(status, body) => Ok(HttpResponse::new(status, body)),
            Reply::Fail(msg) => Err(TransportError::timeout(msg)),
        }
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, url: &str, token: Option<&str>) -> Result<HttpResponse, TransportError> {
        self.next(Request {
            method: "GET",
            url: url.to_string(),
            token: token.map(str::to_string),
            body: None,
        })
    }

    async fn post_json(
        &self,
        url: &str,
        token: Option<&str>,
        body: &Value,
    ) -> Result<HttpResponse, TransportError> {
        self.next(Request {
            method: "POST",
            url: url.to_string(),
            token: token.map(str::to_string),
            body: Some(body.clone()),
        })
    }
}

fn prober(replies: Vec<Reply>) -> (ConnectivityProber<ScriptedTransport>, ScriptedTransport) {
    let transport = ScriptedTransport::new(replies);
    let endpoint = TargetEndpoint::parse("https://ag.example.com:9999/e/env-1234/").unwrap();
    (ConnectivityProber::new(transport.clone(), endpoint), transport)
}

#[tokio::test]
async fn health_running_is_ok() {
    let (prober, transport) = prober(vec![Reply::Respond(200, "RUNNING")]);
    assert_eq!(prober.check_health().await, HealthStatus::Ok);

    let requests = transport.requests();
    assert_eq!(requests[0].method, "GET");
    assert_eq!(
        requests[0].url,
        "https://ag.example.com:9999/e/env-1234/rest/health"
    );
}

#[tokio::test]
async fn health_quoted_running_is_ok() {
    let (prober, _) = prober(vec![Reply::Respond(200, "\"RUNNING\"")]);
    assert!(prober.check_health().await.is_ok());
}

#[tokio::test]
async fn health_starting_is_a_soft_warning() {
    let (prober, _) = prober(vec![Reply::Respond(200, "STARTING")]);
    assert_eq!(
        prober.check_health().await,
        HealthStatus::UnexpectedResponse {
            status: 200,
            body: "STARTING".to_string()
        }
    );
}

#[tokio::test]
async fn health_timeout_is_unreachable_not_error() {
    let (prober, _) = prober(vec![Reply::Fail("no response within 30s")]);
    match prober.check_health().await {
        HealthStatus::Unreachable { reason } => {
            assert_eq!(reason, "timed out: no response within 30s")
        }
        other => panic!("expected unreachable, got {other:?}"),
    }
}

#[tokio::test]
async fn token_with_ingest_scope_passes() {
    let (prober, transport) = prober(vec![Reply::Respond(
        200,
        r#"{"id":"dt0c01.X","scopes":["logs.ingest","metrics.ingest"]}"#,
    )]);

    prober
        .check_token_scope("dt0c01.secret", LOGS_INGEST_SCOPE)
        .await
        .expect("token should pass");

    let request = &transport.requests()[0];
    assert_eq!(request.method, "POST");
    assert!(request.url.ends_with("/api/v2/apiTokens/lookup"));
    assert_eq!(request.token.as_deref(), Some("dt0c01.secret"));
    assert_eq!(request.body.as_ref().unwrap()["token"], "dt0c01.secret");
}

#[tokio::test]
async fn token_forbidden_is_hard_failure() {
    let (prober, _) = prober(vec![Reply::Respond(403, "forbidden")]);
    let err = prober
        .check_token_scope("dt0c01.secret", LOGS_INGEST_SCOPE)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ProbeError::TokenRejected {
            status: 403,
            body: "forbidden".to_string()
        }
    );
}

#[tokio::test]
async fn token_without_scope_is_hard_failure() {
    let (prober, _) = prober(vec![Reply::Respond(200, r#"{"scopes":["metrics.read"]}"#)]);
    let err = prober
        .check_token_scope("dt0c01.secret", LOGS_INGEST_SCOPE)
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::MissingPermission { ref scope, .. } if scope == "logs.ingest"));
}

#[tokio::test]
async fn token_lookup_unreachable_is_hard_failure() {
    let (prober, _) = prober(vec![Reply::Fail("connection refused")]);
    let err = prober
        .check_token_scope("dt0c01.secret", LOGS_INGEST_SCOPE)
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::Unreachable { .. }));
}

#[tokio::test]
async fn ingest_accepted_passes() {
    let (prober, transport) = prober(vec![Reply::Respond(204, "")]);
    prober.send_ingest_probe("dt0c01.secret").await.unwrap();

    let request = &transport.requests()[0];
    assert!(request.url.ends_with("/api/v2/logs/ingest"));
    let record = &request.body.as_ref().unwrap()[0];
    assert_eq!(record["cloud.provider"], "azure");
    assert!(record.get("timestamp").is_some());
    assert!(record.get("content").is_some());
    assert!(record.get("severity").is_some());
}

#[tokio::test]
async fn ingest_rejected_is_hard_failure() {
    let (prober, _) = prober(vec![Reply::Respond(400, "bad request")]);
    let err = prober.send_ingest_probe("dt0c01.secret").await.unwrap_err();
    assert_eq!(
        err,
        ProbeError::IngestRejected {
            status: 400,
            body: "bad request".to_string()
        }
    );
}
