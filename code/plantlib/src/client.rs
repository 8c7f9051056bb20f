use crate::config::ApiConfig;
use crate::transport::{ApiRequest, ApiResponse, Body, Transport};
use crate::types::{AckStatus, Command, CommandId, DetectionResult, SensorReading};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

// The link counts as up if a request got any answer from the backend within
// this window.
pub const CONNECTED_WINDOW: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConnectionHealth {
    pub last_success: Option<Instant>,
    // Requests that ran out of attempts since the last answer.
    pub consecutive_failures: u32,
}

#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct HealthReport {
    pub connected: bool,
    pub base_url: String,
    pub device_id: String,
    pub consecutive_failures: u32,
    pub seconds_since_success: Option<u64>,
}

#[derive(Serialize, Debug)]
struct Telemetry<'a> {
    device_id: &'a str,
    timestamp: jiff::Timestamp,
    soil_pct: Option<f64>,
    temperature_c: Option<f64>,
    humidity_pct: Option<f64>,
    lux: Option<f64>,
}

#[derive(Serialize, Debug)]
struct Ack {
    status: AckStatus,
    timestamp: jiff::Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
}

// The backend wraps every payload in {"data": ...}.
#[derive(Deserialize, Debug)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize, Debug, Default)]
struct CommandList {
    #[serde(default)]
    commands: Vec<serde_json::Value>,
}

// Backend client with bounded retries. 5xx answers, timeouts, and connection
// failures are retried with exponential backoff; any other answer is final.
// None of the public operations return an error: a request that could not be
// completed is logged and reported as false/None/empty.
pub struct ResilientClient<T: Transport> {
    transport: T,
    base_url: String,
    device_id: String,
    max_retries: u32,
    base_delay: Duration,
    health: Mutex<ConnectionHealth>,
}

impl<T: Transport> ResilientClient<T> {
    pub fn new(config: &ApiConfig, transport: T) -> Self {
        log::info!("API client initialized: {}", config.base_url);
        Self {
            transport,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            device_id: config.device_id.clone(),
            max_retries: config.max_retries.max(1),
            base_delay: config.retry_delay(),
            health: Mutex::new(ConnectionHealth::default()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn health_lock(&self) -> MutexGuard<'_, ConnectionHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_health(&self) -> ConnectionHealth {
        *self.health_lock()
    }

    pub fn is_connected(&self) -> bool {
        match self.health_lock().last_success {
            Some(t) => t.elapsed() < CONNECTED_WINDOW,
            None => false,
        }
    }

    pub fn health(&self) -> HealthReport {
        let health = self.connection_health();
        HealthReport {
            connected: self.is_connected(),
            base_url: self.base_url.clone(),
            device_id: self.device_id.clone(),
            consecutive_failures: health.consecutive_failures,
            seconds_since_success: health.last_success.map(|t| t.elapsed().as_secs()),
        }
    }

    // Delay after the failed attempt number `attempt` (0 based).
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    // Sends `request` until it gets a final answer or runs out of attempts.
    // Returns None if every attempt failed.
    pub async fn request(&self, request: &ApiRequest) -> Option<ApiResponse> {
        for attempt in 0..self.max_retries {
            log::debug!(
                "API {} {} (attempt {}/{})",
                request.method,
                request.path,
                attempt + 1,
                self.max_retries
            );
            match self.transport.execute(request).await {
                Ok(resp) if resp.status < 500 => {
                    let mut health = self.health_lock();
                    health.last_success = Some(Instant::now());
                    health.consecutive_failures = 0;
                    return Some(resp);
                }
                Ok(resp) => log::warn!("Server error {}: {}", resp.status, resp.body),
                Err(err) => log::warn!("{err} (attempt {})", attempt + 1),
            }

            if attempt + 1 < self.max_retries {
                let delay = self.backoff(attempt);
                log::warn!("Retrying in {}s...", delay.as_secs());
                tokio::time::sleep(delay).await;
            }
        }

        self.health_lock().consecutive_failures += 1;
        log::error!(
            "{} {} failed after {} attempts",
            request.method,
            request.path,
            self.max_retries
        );
        None
    }

    pub async fn send_telemetry(&self, reading: &SensorReading) -> bool {
        let payload = Telemetry {
            device_id: &self.device_id,
            timestamp: reading.timestamp,
            soil_pct: reading.soil_pct,
            temperature_c: reading.temperature_c,
            humidity_pct: reading.humidity_pct,
            lux: reading.lux,
        };
        let body = match serde_json::to_value(&payload) {
            Ok(body) => body,
            Err(err) => {
                log::error!("Could not encode telemetry: {err}");
                return false;
            }
        };
        let resp = self
            .request(&ApiRequest::post("/telemetry", Body::Json(body)))
            .await;
        match resp {
            Some(resp) if resp.status == 201 => {
                log::debug!("Telemetry sent successfully: {}", resp.body);
                true
            }
            Some(resp) => {
                log::warn!("Telemetry failed: {} - {}", resp.status, resp.body);
                false
            }
            None => false,
        }
    }

    // Uploads a JPEG for analysis and returns the backend's detections.
    pub async fn upload_image(&self, jpeg: Vec<u8>) -> Option<DetectionResult> {
        let body = Body::Image {
            jpeg,
            fields: vec![
                ("device_id".to_string(), self.device_id.clone()),
                ("timestamp".to_string(), jiff::Timestamp::now().to_string()),
            ],
        };
        let resp = self.request(&ApiRequest::post("/image", body)).await?;
        if resp.status != 201 {
            log::warn!("Image upload failed: {} - {}", resp.status, resp.body);
            return None;
        }
        match resp.json::<Envelope<DetectionResult>>() {
            Ok(envelope) => {
                log::debug!("Image uploaded successfully: {}", resp.body);
                Some(envelope.data)
            }
            Err(err) => {
                log::warn!("Image upload response not understood: {err:#}");
                None
            }
        }
    }

    // Pending commands for this device. Entries that don't parse as a command
    // are logged and skipped.
    pub async fn poll_commands(&self) -> Vec<Command> {
        let request = ApiRequest::get("/commands").with_query("device_id", &self.device_id);
        let Some(resp) = self.request(&request).await else {
            return Vec::new();
        };
        if resp.status != 200 {
            log::warn!("Command poll failed: {}", resp.status);
            return Vec::new();
        }
        let list = match resp.json::<Envelope<CommandList>>() {
            Ok(envelope) => envelope.data,
            Err(err) => {
                log::warn!("Command poll response not understood: {err:#}");
                return Vec::new();
            }
        };

        let commands: Vec<Command> = list
            .commands
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<Command>(raw.clone()) {
                Ok(cmd) => Some(cmd),
                Err(err) => {
                    log::warn!("Skipping malformed command {raw}: {err}");
                    None
                }
            })
            .collect();
        if !commands.is_empty() {
            log::info!("Received {} pending command(s)", commands.len());
        }
        commands
    }

    pub async fn acknowledge_command(
        &self,
        id: &CommandId,
        status: AckStatus,
        result: Option<serde_json::Value>,
    ) -> bool {
        let ack = Ack {
            status,
            timestamp: jiff::Timestamp::now(),
            result,
        };
        let body = match serde_json::to_value(&ack) {
            Ok(body) => body,
            Err(err) => {
                log::error!("Could not encode command ack: {err}");
                return false;
            }
        };
        let resp = self
            .request(&ApiRequest::post(format!("/commands/{id}"), Body::Json(body)))
            .await;
        match resp {
            Some(resp) if resp.status == 200 => {
                log::debug!("Command {id} acknowledged as {status}");
                true
            }
            Some(resp) => {
                log::warn!("Command acknowledgment failed: {}", resp.status);
                false
            }
            None => false,
        }
    }

    pub async fn get_command_status(&self, id: &CommandId) -> Option<serde_json::Value> {
        let resp = self
            .request(&ApiRequest::get(format!("/commands/{id}")))
            .await?;
        if resp.status != 200 {
            log::warn!("Command status lookup failed: {}", resp.status);
            return None;
        }
        match resp.json::<Envelope<serde_json::Value>>() {
            Ok(envelope) => Some(envelope.data),
            Err(err) => {
                log::warn!("Command status response not understood: {err:#}");
                None
            }
        }
    }
}


#[cfg(test)]
mod endpoints {
    use super::*;
    use crate::transport::{FakeTransport, Method};
    use crate::types::WATER_COMMAND;

    fn client() -> ResilientClient<FakeTransport> {
        ResilientClient::new(&ApiConfig::default(), FakeTransport::new())
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_body() {
        let client = client();
        let reading = SensorReading {
            soil_pct: Some(41.5),
            lux: Some(900.0),
            timestamp: "2025-03-01T12:00:00Z".parse().unwrap(),
            ..Default::default()
        };
        assert!(client.send_telemetry(&reading).await);

        let req = &client.transport().requests()[0];
        let Body::Json(body) = &req.body else {
            panic!("telemetry must be json");
        };
        assert_eq!(
            *body,
            serde_json::json!({
                "device_id": "raspberry-pi-001",
                "timestamp": "2025-03-01T12:00:00Z",
                "soil_pct": 41.5,
                "temperature_c": null,
                "humidity_pct": null,
                "lux": 900.0,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn upload_returns_detections() {
        let client = client();
        client.transport().push(
            Method::Post,
            "/image",
            Ok(ApiResponse::new(
                201,
                r#"{"data":{"detections":[{"label":"basil","confidence":0.9}]}}"#,
            )),
        );
        let result = client.upload_image(vec![0xff, 0xd8]).await.unwrap();
        assert_eq!(result.detections.len(), 1);

        let req = &client.transport().requests()[0];
        let Body::Image { jpeg, fields } = &req.body else {
            panic!("upload must be multipart");
        };
        assert_eq!(jpeg, &vec![0xff, 0xd8]);
        assert_eq!(fields[0], ("device_id".into(), "raspberry-pi-001".into()));
        assert!(fields[1].1.ends_with('Z'));
    }

    #[tokio::test(start_paused = true)]
    async fn upload_without_data_fails() {
        let client = client();
        client
            .transport()
            .push(Method::Post, "/image", Ok(ApiResponse::new(201, "{}")));
        assert_eq!(client.upload_image(vec![0xff, 0xd8]).await, None);
        client
            .transport()
            .push(Method::Post, "/image", Ok(ApiResponse::new(413, "too big")));
        assert_eq!(client.upload_image(vec![0xff, 0xd8]).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_skips_malformed_commands() {
        let client = client();
        client.transport().push(
            Method::Get,
            "/commands",
            Ok(ApiResponse::new(
                200,
                r#"{"data":{"commands":[
                    {"id": 1, "type": "water", "payload": {"duration_seconds": 3}},
                    {"type": "water"},
                    {"id": "abc", "type": "reboot"}
                ]}}"#,
            )),
        );
        let commands = client.poll_commands().await;
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].kind, WATER_COMMAND);
        assert_eq!(commands[1].id, CommandId::Text("abc".into()));

        let req = &client.transport().requests()[0];
        assert_eq!(
            req.query,
            vec![("device_id".to_string(), "raspberry-pi-001".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ack_body() {
        let client = client();
        let id = CommandId::Number(7);
        assert!(
            client
                .acknowledge_command(
                    &id,
                    AckStatus::Completed,
                    Some(serde_json::json!({"duration_executed": 3.0}))
                )
                .await
        );
        assert!(client.acknowledge_command(&id, AckStatus::Started, None).await);

        let requests = client.transport().requests();
        assert_eq!(requests[0].path, "/commands/7");
        let Body::Json(body) = &requests[0].body else {
            panic!("ack must be json");
        };
        assert_eq!(body["status"], "completed");
        assert_eq!(body["result"]["duration_executed"], 3.0);
        let Body::Json(body) = &requests[1].body else {
            panic!("ack must be json");
        };
        assert_eq!(body.get("result"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn command_status() {
        let client = client();
        let status = client
            .get_command_status(&CommandId::Text("c-1".into()))
            .await
            .unwrap();
        assert_eq!(status["status"], "pending");
        client.transport().push(
            Method::Get,
            "/commands/c-2",
            Ok(ApiResponse::new(404, "")),
        );
        assert_eq!(
            client
                .get_command_status(&CommandId::Text("c-2".into()))
                .await,
            None
        );
    }
}
