//! The demoserver implements the same http interface as the plant monitoring
//! backend, but keeps everything in memory and answers every image with a
//! canned plant detection. It lets plantmon run end to end on a laptop.

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    routing::{get, post},
};
use plantlib::config::DeviceConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

type ApiResult = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

#[derive(Serialize, Clone, Debug, PartialEq)]
struct StoredCommand {
    id: i64,
    device_id: String,
    #[serde(rename = "type")]
    kind: String,
    payload: Value,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    created_at: jiff::Timestamp,
    updated_at: jiff::Timestamp,
}

#[derive(Deserialize, Debug)]
struct NewCommand {
    device_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize, Debug)]
struct CommandAck {
    status: String,
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct PollQuery {
    device_id: Option<String>,
}

const ACK_STATUSES: [&str; 3] = ["started", "completed", "failed"];

// Everything the backend remembers.
struct Backend {
    device_token: String,
    next_id: i64,
    commands: Vec<StoredCommand>,
    last_telemetry: Option<Value>,
    images_received: u64,
}

impl Backend {
    fn new(device_token: &str) -> Self {
        Self {
            device_token: device_token.to_string(),
            next_id: 1,
            commands: Vec::new(),
            last_telemetry: None,
            images_received: 0,
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {}", self.device_token);
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected)
    }

    fn enqueue(&mut self, cmd: NewCommand) -> StoredCommand {
        let now = jiff::Timestamp::now();
        let stored = StoredCommand {
            id: self.next_id,
            device_id: cmd.device_id,
            kind: cmd.kind,
            payload: cmd.payload,
            status: "pending".to_string(),
            result: None,
            created_at: now,
            updated_at: now,
        };
        self.next_id += 1;
        self.commands.push(stored.clone());
        stored
    }

    fn pending(&self, device_id: Option<&str>) -> Vec<StoredCommand> {
        self.commands
            .iter()
            .filter(|c| c.status == "pending")
            .filter(|c| device_id.is_none_or(|d| d == c.device_id))
            .cloned()
            .collect()
    }

    fn find(&mut self, id: i64) -> Option<&mut StoredCommand> {
        self.commands.iter_mut().find(|c| c.id == id)
    }

    fn acknowledge(&mut self, id: i64, ack: CommandAck) -> anyhow::Result<Option<StoredCommand>> {
        if !ACK_STATUSES.contains(&ack.status.as_str()) {
            return Err(anyhow::anyhow!("invalid status '{}'", ack.status));
        }
        let Some(cmd) = self.find(id) else {
            return Ok(None);
        };
        cmd.status = ack.status;
        if ack.result.is_some() {
            cmd.result = ack.result;
        }
        cmd.updated_at = jiff::Timestamp::now();
        Ok(Some(cmd.clone()))
    }
}

type SharedBackend = Arc<Mutex<Backend>>;

fn error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": msg.into() })))
}

fn check_auth(backend: &SharedBackend, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    if backend.lock().unwrap().authorized(headers) {
        Ok(())
    } else {
        log::warn!("Rejected request with missing or bad device token");
        Err(error(StatusCode::UNAUTHORIZED, "invalid device token"))
    }
}

fn parse_id(id: &str) -> Result<i64, (StatusCode, Json<Value>)> {
    id.parse()
        .map_err(|_| error(StatusCode::NOT_FOUND, format!("no command {id}")))
}

// Canned answer for every uploaded image.
fn canned_detections() -> Value {
    json!({
        "detections": [{
            "label": "basil",
            "confidence": 0.92,
            "plantType": {
                "name": "Sweet Basil",
                "thresholds": {
                    "soil_min": 40, "soil_max": 75,
                    "temp_min": 18, "temp_max": 30,
                    "humidity_min": 40, "humidity_max": 70,
                    "light_min": 500, "light_max": 2000
                }
            }
        }]
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stderrlog::new()
        .module(module_path!())
        .verbosity(log::Level::Info)
        .init()?;

    log::info!("Starting plant monitor demoserver...");

    // The same environment overrides as the device, so both agree on the token.
    let cfg = DeviceConfig::load(None)?;
    let backend = Arc::new(Mutex::new(Backend::new(&cfg.api.device_token)));

    let api = Router::new()
        .route("/telemetry", post(telemetry))
        .route("/image", post(upload_image))
        .route("/commands", get(poll_commands).post(create_command))
        .route("/commands/{id}", get(command_status).post(ack_command))
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        .with_state(backend);
    let app = Router::new().nest("/api", api);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
    log::info!("Listening on port 3000");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn telemetry(
    State(backend): State<SharedBackend>,
    headers: HeaderMap,
    Json(reading): Json<Value>,
) -> ApiResult {
    check_auth(&backend, &headers)?;
    log::info!("POST /telemetry: {reading}");
    backend.lock().unwrap().last_telemetry = Some(reading.clone());
    Ok((StatusCode::CREATED, Json(json!({ "data": reading }))))
}

async fn upload_image(
    State(backend): State<SharedBackend>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult {
    check_auth(&backend, &headers)?;

    let mut image_len = None;
    let mut device_id = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| error(StatusCode::BAD_REQUEST, err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| error(StatusCode::BAD_REQUEST, err.body_text()))?;
                image_len = Some(bytes.len());
            }
            "device_id" => {
                device_id = field.text().await.ok();
            }
            _ => {}
        }
    }

    let Some(image_len) = image_len else {
        return Err(error(StatusCode::BAD_REQUEST, "missing image part"));
    };
    let total = {
        let mut backend = backend.lock().unwrap();
        backend.images_received += 1;
        backend.images_received
    };
    log::info!(
        "POST /image: {image_len} bytes from {} ({total} images so far)",
        device_id.as_deref().unwrap_or("unknown device")
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": canned_detections() })),
    ))
}

async fn poll_commands(
    State(backend): State<SharedBackend>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> ApiResult {
    check_auth(&backend, &headers)?;
    let commands = backend
        .lock()
        .unwrap()
        .pending(query.device_id.as_deref());
    if !commands.is_empty() {
        log::info!("GET /commands: handing out {} command(s)", commands.len());
    }
    Ok((StatusCode::OK, Json(json!({ "data": { "commands": commands } }))))
}

// Not part of the device interface: lets a developer queue a command, e.g.
//   curl -X POST localhost:3000/api/commands -H 'Authorization: Bearer ...' \
//        -d '{"device_id":"raspberry-pi-001","type":"water","payload":{"duration_seconds":3}}'
async fn create_command(
    State(backend): State<SharedBackend>,
    headers: HeaderMap,
    Json(cmd): Json<NewCommand>,
) -> ApiResult {
    check_auth(&backend, &headers)?;
    let stored = backend.lock().unwrap().enqueue(cmd);
    log::info!("Queued command {} ({}) for {}", stored.id, stored.kind, stored.device_id);
    Ok((StatusCode::CREATED, Json(json!({ "data": stored }))))
}

async fn ack_command(
    State(backend): State<SharedBackend>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(ack): Json<CommandAck>,
) -> ApiResult {
    check_auth(&backend, &headers)?;
    let id = parse_id(&id)?;
    log::info!("POST /commands/{id}: {ack:?}");
    match backend.lock().unwrap().acknowledge(id, ack) {
        Ok(Some(cmd)) => Ok((StatusCode::OK, Json(json!({ "data": cmd })))),
        Ok(None) => Err(error(StatusCode::NOT_FOUND, format!("no command {id}"))),
        Err(err) => Err(error(StatusCode::BAD_REQUEST, err.to_string())),
    }
}

async fn command_status(
    State(backend): State<SharedBackend>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    check_auth(&backend, &headers)?;
    let id = parse_id(&id)?;
    match backend.lock().unwrap().find(id) {
        Some(cmd) => Ok((StatusCode::OK, Json(json!({ "data": cmd })))),
        None => Err(error(StatusCode::NOT_FOUND, format!("no command {id}"))),
    }
}
