// One http exchange with the backend, without any retry logic. The real
// implementation uses reqwest; FakeTransport serves canned responses so the
// client and the orchestrator can be tested without a network.

use crate::config::ApiConfig;
use crate::pump::lock;
use anyhow::Context;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    // Multipart form: the JPEG goes in the `image` part, `fields` are sent as
    // plain text parts.
    Image {
        jpeg: Vec<u8>,
        fields: Vec<(String, String)>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    // Relative to the api base url, starting with a slash.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Body,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn post(path: impl Into<String>, body: Body) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body,
        }
    }

    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_str(&self.body)
            .with_context(|| format!("decoding response body {:?}", self.body))
    }
}

// Failures that never produced an http status. All of them are retryable.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportError {
    Timeout,
    Connect(String),
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timeout"),
            TransportError::Connect(msg) => write!(f, "connection error: {msg}"),
            TransportError::Other(msg) => write!(f, "request error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

pub trait Transport {
    fn execute(
        &self,
        request: &ApiRequest,
    ) -> impl Future<Output = Result<ApiResponse, TransportError>>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    // Every request carries the device's bearer token and user agent and is
    // bounded by the configured timeout.
    pub fn new(config: &ApiConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.device_token))
            .context("device token is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("PlantMonitor-RaspberryPi/{}", config.device_id))
                .context("device id is not a valid header value")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build(&self, request: &ApiRequest) -> Result<reqwest::RequestBuilder, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
        };
        let builder = builder.query(&request.query);
        Ok(match &request.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(value),
            Body::Image { jpeg, fields } => {
                let part = reqwest::multipart::Part::bytes(jpeg.clone())
                    .file_name("plant.jpg")
                    .mime_str("image/jpeg")
                    .map_err(classify)?;
                let mut form = reqwest::multipart::Form::new().part("image", part);
                for (key, value) in fields {
                    form = form.text(key.clone(), value.clone());
                }
                builder.multipart(form)
            }
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

impl Transport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let resp = self.build(request)?.send().await.map_err(classify)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(classify)?;
        Ok(ApiResponse { status, body })
    }
}

type Reply = Result<ApiResponse, TransportError>;

// FakeTransport behaves like a healthy backend unless told otherwise: replies
// queued with push() for a method + path are served first, in order, then the
// default reply for that route is used. Every request is recorded.
#[derive(Default)]
pub struct FakeTransport {
    queued: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, method: Method, path: &str, reply: Reply) {
        lock(&self.queued)
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        lock(&self.requests).clone()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    fn default_reply(request: &ApiRequest) -> Reply {
        let path = request.path.as_str();
        Ok(match (request.method, path) {
            (Method::Post, "/telemetry") => ApiResponse::new(201, r#"{"data":{}}"#),
            (Method::Post, "/image") => ApiResponse::new(201, r#"{"data":{"detections":[]}}"#),
            (Method::Get, "/commands") => ApiResponse::new(200, r#"{"data":{"commands":[]}}"#),
            (Method::Post, p) if p.starts_with("/commands/") => {
                ApiResponse::new(200, r#"{"data":{}}"#)
            }
            (Method::Get, p) if p.starts_with("/commands/") => {
                let id = &p["/commands/".len()..];
                ApiResponse::new(
                    200,
                    serde_json::json!({"data": {"id": id, "status": "pending"}}).to_string(),
                )
            }
            _ => ApiResponse::new(404, r#"{"error":"not found"}"#),
        })
    }
}

impl Transport for FakeTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        lock(&self.requests).push(request.clone());
        let queued = lock(&self.queued)
            .get_mut(&(request.method, request.path.clone()))
            .and_then(|q| q.pop_front());
        queued.unwrap_or_else(|| Self::default_reply(request))
    }
}
