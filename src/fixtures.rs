//! Helper methods only available for tests
use crate::{
    Backoff, Context, Diagnostics, Error, Metrics, Result, Settings,
    adapter::{Adapter, Connector, Target, UserRequest},
};
use assert_json_diff::assert_json_include;
use async_trait::async_trait;
use http::{Method, Request, Response, StatusCode};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Client, client::Body, runtime::events::Recorder};
use serde_json::{Value, json};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::RwLock;

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
type Responder = tower_test::mock::SendResponse<Response<Body>>;

const EVENTS: &str = "/apis/events.k8s.io/v1/namespaces/default/events";

/// Answers the requests a reconcile makes, asserting they arrive in order
pub struct ApiServerVerifier(ApiServerHandle);

/// Context backed by a mocked API server
pub fn context() -> (Arc<Context>, ApiServerVerifier) {
    context_with(FakeServer::default())
}

/// Context backed by a mocked API server, opening adapters on `server`
pub fn context_with(server: FakeServer) -> (Arc<Context>, ApiServerVerifier) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    let mock_client = Client::new(mock_service, "default");
    let ctx = Context {
        kube_client: mock_client.clone(),
        recorder: Recorder::new(mock_client, "db-controller-test".into()),
        diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
        metrics: Arc::new(Metrics::default()),
        settings: Arc::new(Settings::default()),
        backoff: Arc::new(Backoff::default()),
        connector: Arc::new(server),
    };
    (Arc::new(ctx), ApiServerVerifier(handle))
}

/// Database server double recording every call made through its adapters
#[derive(Clone, Default)]
pub struct FakeServer {
    calls: Arc<Mutex<Vec<String>>>,
    failing: Option<&'static str>,
}

impl FakeServer {
    /// Server rejecting every call of operation `op`
    pub fn failing(op: &'static str) -> Self {
        FakeServer {
            failing: Some(op),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &'static str, args: &[&str]) -> Result<()> {
        let mut call = vec![op];
        call.extend_from_slice(args);
        self.calls.lock().unwrap().push(call.join(" "));
        if self.failing == Some(op) {
            return Err(Error::InvalidGrant(format!("permission denied for {op}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for FakeServer {
    async fn connect(&self, target: Target<'_>) -> Result<Box<dyn Adapter>> {
        match target {
            Target::Postgresql { database, .. } => {
                self.record("connect", &[database.unwrap_or("postgres")])?
            }
            Target::Mongodb { address, .. } => self.record("connect", &[address])?,
            Target::Atlas { group_id, .. } => self.record("connect", &[group_id])?,
        }
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl Adapter for FakeServer {
    async fn ensure_database(&self, database: &str) -> Result<()> {
        self.record("ensure_database", &[database])
    }

    async fn ensure_user(&self, request: UserRequest<'_>) -> Result<()> {
        self.record("ensure_user", &[request.database, request.username])
    }

    async fn drop_user(&self, database: &str, username: &str) -> Result<()> {
        self.record("drop_user", &[database, username])
    }

    async fn enable_extension(&self, database: &str, extension: &str) -> Result<()> {
        self.record("enable_extension", &[database, extension])
    }

    async fn ensure_schema(&self, database: &str, schema: &str) -> Result<()> {
        self.record("ensure_schema", &[database, schema])
    }

    async fn set_search_path(&self, database: &str, search_path: &[String]) -> Result<()> {
        self.record("set_search_path", &[database, &search_path.join(",")])
    }

    async fn revoke_privileges(&self, database: &str, username: &str) -> Result<()> {
        self.record("revoke", &[database, username])
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.record("close", &[])
    }
}

pub fn deletion_timestamp() -> Time {
    serde_json::from_value(json!("2024-05-01T12:00:00Z")).unwrap()
}

/// Secret manifest with `data` encoded the way the API server returns it
pub fn secret(name: &str, data: &[(&str, &str)]) -> Value {
    let data: serde_json::Map<String, Value> = data
        .iter()
        .map(|(k, v)| {
            let bytes = k8s_openapi::ByteString(v.as_bytes().to_vec());
            (k.to_string(), serde_json::to_value(bytes).unwrap())
        })
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": name, "namespace": "default"},
        "data": data,
    })
}

impl ApiServerVerifier {
    async fn next(&mut self, method: Method, path: &str) -> (Value, Responder) {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), method);
        assert_eq!(request.uri().path(), path);

        let body = request.into_body().collect_bytes().await.unwrap();
        let body = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).expect("json request body")
        };
        (body, send)
    }

    pub async fn get(mut self, path: &str, response: Value) -> Self {
        let (_, send) = self.next(Method::GET, path).await;
        respond(send, StatusCode::OK, &response);
        self
    }

    pub async fn get_not_found(mut self, path: &str) -> Self {
        let (_, send) = self.next(Method::GET, path).await;
        respond(
            send,
            StatusCode::NOT_FOUND,
            &json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": format!("{path} not found"),
                "reason": "NotFound",
                "code": 404,
            }),
        );
        self
    }

    /// Expects a merge patch of the record containing `expected`.
    pub async fn patch(mut self, path: &str, expected: Value, response: Value) -> Self {
        let (body, send) = self.next(Method::PATCH, path).await;
        assert_json_include!(actual: body, expected: expected);
        respond(send, StatusCode::OK, &response);
        self
    }

    pub async fn patch_status(self, path: &str, expected: Value, response: Value) -> Self {
        self.patch(&format!("{path}/status"), expected, response).await
    }

    pub async fn event(mut self, reason: &str) -> Self {
        let (body, send) = self.next(Method::POST, EVENTS).await;
        assert_eq!(body["reason"], reason);
        respond(send, StatusCode::CREATED, &body);
        self
    }
}

fn respond(send: Responder, status: StatusCode, body: &Value) {
    send.send_response(
        Response::builder()
            .status(status)
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap(),
    );
}

/// Wait for the mock API server to finish its scenario
pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}
