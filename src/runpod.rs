/// RunPod pod-management API (GraphQL over HTTPS).
///
/// The watchdog only needs three operations: list the account's pods,
/// stop one, terminate one. They live behind the `PodApi` trait so the
/// termination executor can be tested against a mock.
use serde_json::Value;
use std::time::Duration;

const GRAPHQL_URL: &str = "https://api.runpod.io/graphql";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A pod as reported by the RunPod API.
#[derive(Debug, Clone)]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub desired_status: String,
}

/// Errors from the pod-management API. All of these are transient from
/// the executor's point of view and subject to bounded retry.
#[derive(Debug)]
pub enum RunpodError {
    /// Transport-level failure (connect, timeout, non-2xx status).
    Http(reqwest::Error),
    /// The API answered but reported GraphQL errors.
    Api(String),
}

impl std::fmt::Display for RunpodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunpodError::Http(e) => write!(f, "RunPod HTTP error: {e}"),
            RunpodError::Api(msg) => write!(f, "RunPod API error: {msg}"),
        }
    }
}

impl std::error::Error for RunpodError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunpodError::Http(e) => Some(e),
            RunpodError::Api(_) => None,
        }
    }
}

/// The narrow pod-management surface the watchdog consumes.
#[allow(async_fn_in_trait)]
pub trait PodApi {
    async fn list_pods(&self) -> Result<Vec<Pod>, RunpodError>;
    async fn stop_pod(&self, pod_id: &str) -> Result<(), RunpodError>;
    async fn terminate_pod(&self, pod_id: &str) -> Result<(), RunpodError>;
}

/// Live client against api.runpod.io.
pub struct RunpodClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl RunpodClient {
    pub fn new(api_key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            url: GRAPHQL_URL.to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn graphql(&self, query: &str) -> Result<Value, RunpodError> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(RunpodError::Http)?;
        let body: Value = response.json().await.map_err(RunpodError::Http)?;
        extract_data(body)
    }
}

impl PodApi for RunpodClient {
    async fn list_pods(&self) -> Result<Vec<Pod>, RunpodError> {
        let data = self
            .graphql("{ myself { pods { id name desiredStatus } } }")
            .await?;
        Ok(parse_pods(&data))
    }

    async fn stop_pod(&self, pod_id: &str) -> Result<(), RunpodError> {
        self.graphql(&stop_mutation(pod_id)).await.map(|_| ())
    }

    async fn terminate_pod(&self, pod_id: &str) -> Result<(), RunpodError> {
        self.graphql(&terminate_mutation(pod_id)).await.map(|_| ())
    }
}

fn stop_mutation(pod_id: &str) -> String {
    let pod_id = escape_graphql(pod_id);
    format!("mutation {{ podStop(input: {{podId: \"{pod_id}\"}}) {{ id desiredStatus }} }}")
}

fn terminate_mutation(pod_id: &str) -> String {
    let pod_id = escape_graphql(pod_id);
    format!("mutation {{ podTerminate(input: {{podId: \"{pod_id}\"}}) }}")
}

/// Escape a value for a double-quoted GraphQL string literal. Pod ids come
/// from the environment (RUNPOD_POD_ID), so a stray quote must not be able
/// to rewrite the mutation.
fn escape_graphql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Split a GraphQL response body into data or an API error.
fn extract_data(body: Value) -> Result<Value, RunpodError> {
    if let Some(errors) = body.get("errors") {
        if !errors.is_null() {
            return Err(RunpodError::Api(errors.to_string()));
        }
    }
    Ok(body.get("data").cloned().unwrap_or(Value::Null))
}

/// Pull the pod list out of a `{ myself { pods } }` response. Entries
/// without an id are dropped.
fn parse_pods(data: &Value) -> Vec<Pod> {
    let pods = data
        .pointer("/myself/pods")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    pods.iter()
        .filter_map(|pod| {
            Some(Pod {
                id: pod.get("id")?.as_str()?.to_string(),
                name: pod
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                desired_status: pod
                    .get("desiredStatus")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect()
}
