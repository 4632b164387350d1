use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use switchboard_engine::{AppConfig, EngineConfig, ProfileSelection, ProxyEngine};
use switchboard_observe::{EventSink, StatusEvent};

const STATUS_SCHEMA: &str = "switchboard-status-v1";
const STATUS_PREFIX: &str = "SWITCHBOARD_STATUS\t";

const ENV_CONFIG_PATH: &str = "SWITCHBOARD_CONFIG_PATH";
const ENV_PROFILE: &str = "SWITCHBOARD_PROFILE";
const ENV_STATUS_PATH: &str = "SWITCHBOARD_STATUS_PATH";
const ENV_CA_CERT_PATH: &str = "SWITCHBOARD_CA_CERT_PATH";
const ENV_CA_KEY_PATH: &str = "SWITCHBOARD_CA_KEY_PATH";

const DEFAULT_CONFIG_PATH: &str = "switchboard-config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitClass {
    Ok,
    ConfigInvalid,
    EngineInitFailed,
    StartFailed,
    RuntimeFailed,
}

impl ExitClass {
    fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::ConfigInvalid => 20,
            Self::EngineInitFailed => 21,
            Self::StartFailed => 22,
            Self::RuntimeFailed => 23,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::ConfigInvalid => "config_invalid",
            Self::EngineInitFailed => "engine_init_failed",
            Self::StartFailed => "start_failed",
            Self::RuntimeFailed => "runtime_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RunOutcome {
    class: ExitClass,
    detail: Option<String>,
}

impl RunOutcome {
    fn ok(detail: Option<String>) -> Self {
        Self {
            class: ExitClass::Ok,
            detail,
        }
    }

    fn error(class: ExitClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: Some(detail.into()),
        }
    }

    fn exit_code(&self) -> i32 {
        self.class.code()
    }

    fn status_record(&self) -> StatusRecord {
        StatusRecord::new(
            "exit",
            if self.class == ExitClass::Ok {
                "ok"
            } else {
                "error"
            },
            self.exit_code(),
            self.class.label(),
            self.detail.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct StatusRecord {
    schema: &'static str,
    stage: &'static str,
    outcome: &'static str,
    exit_code: i32,
    exit_class: &'static str,
    unix_ms: u128,
    detail: Option<String>,
}

impl StatusRecord {
    fn new(
        stage: &'static str,
        outcome: &'static str,
        exit_code: i32,
        exit_class: &'static str,
        detail: Option<String>,
    ) -> Self {
        Self {
            schema: STATUS_SCHEMA,
            stage,
            outcome,
            exit_code,
            exit_class,
            unix_ms: now_unix_ms(),
            detail,
        }
    }
}

/// Writes prefixed JSON status lines to stderr (and optionally a file).
/// Doubles as the engine's event sink so the collaborator reads one stream.
#[derive(Clone, Default)]
struct StatusEmitter {
    inner: Arc<EmitterInner>,
}

#[derive(Default)]
struct EmitterInner {
    status_file: Option<Mutex<BufWriter<File>>>,
}

impl StatusEmitter {
    fn from_env() -> Self {
        let path = env::var(ENV_STATUS_PATH)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let Some(path) = path else {
            return Self::default();
        };

        let status_file = match open_status_file(&path) {
            Ok(file) => Some(Mutex::new(BufWriter::new(file))),
            Err(error) => {
                eprintln!("failed to open status stream file {path}: {error}");
                None
            }
        };
        Self {
            inner: Arc::new(EmitterInner { status_file }),
        }
    }

    fn record(&self, record: StatusRecord) {
        match serde_json::to_value(&record) {
            Ok(json) => self.write_line(&json.to_string()),
            Err(error) => eprintln!("failed to serialize status record: {error}"),
        }
    }

    fn write_line(&self, json: &str) {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{STATUS_PREFIX}{json}");
        let _ = stderr.flush();

        if let Some(status_file) = self.inner.status_file.as_ref() {
            let mut writer = status_file.lock().expect("status file lock poisoned");
            let _ = writeln!(writer, "{json}");
            let _ = writer.flush();
        }
    }
}

impl EventSink for StatusEmitter {
    fn emit(&self, event: StatusEvent) {
        let mut json = match serde_json::to_value(&event) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                eprintln!("failed to serialize status event");
                return;
            }
        };
        json.insert("schema".to_string(), STATUS_SCHEMA.into());
        json.insert("unix_ms".to_string(), (now_unix_ms() as u64).into());
        self.write_line(&serde_json::Value::Object(json).to_string());
    }
}

#[tokio::main]
async fn main() {
    let emitter = StatusEmitter::from_env();
    emitter.record(StatusRecord::new(
        "startup",
        "in_progress",
        0,
        "ok",
        Some("bootstrapping proxy engine".to_string()),
    ));

    let outcome = run(emitter.clone()).await;
    emitter.record(outcome.status_record());
    std::process::exit(outcome.exit_code());
}

async fn run(emitter: StatusEmitter) -> RunOutcome {
    let config_path =
        env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let raw_config = match fs::read_to_string(&config_path) {
        Ok(raw) => raw,
        Err(error) => {
            return RunOutcome::error(
                ExitClass::ConfigInvalid,
                format!("failed to read {config_path}: {error}"),
            )
        }
    };
    let app_config: AppConfig = match serde_json::from_str(&raw_config) {
        Ok(config) => config,
        Err(error) => {
            return RunOutcome::error(
                ExitClass::ConfigInvalid,
                format!("failed to parse {config_path}: {error}"),
            )
        }
    };
    if let Err(error) = app_config.validate() {
        return RunOutcome::error(ExitClass::ConfigInvalid, error.to_string());
    }

    let selection = match parse_profile_selection() {
        Ok(selection) => selection,
        Err(detail) => return RunOutcome::error(ExitClass::ConfigInvalid, detail),
    };

    let mut engine_config = EngineConfig {
        http_port: app_config.http_port(),
        https_port: app_config.https_port(),
        ..EngineConfig::default()
    };
    if let Ok(path) = env::var(ENV_CA_CERT_PATH) {
        engine_config.ca_cert_pem_path = path;
    }
    if let Ok(path) = env::var(ENV_CA_KEY_PATH) {
        engine_config.ca_key_pem_path = path;
    }

    let engine = match ProxyEngine::new(engine_config, emitter.clone()) {
        Ok(engine) => engine,
        Err(error) => return RunOutcome::error(ExitClass::EngineInitFailed, error.to_string()),
    };

    if let Err(error) = engine.start(selection, &app_config.profile).await {
        return RunOutcome::error(ExitClass::StartFailed, error.to_string());
    }

    emitter.record(StatusRecord::new(
        "running",
        "ready",
        0,
        "ok",
        Some(format!(
            "active profile marker {}",
            engine.active_profile_index().await
        )),
    ));

    if let Err(error) = tokio::signal::ctrl_c().await {
        engine.stop().await;
        return RunOutcome::error(
            ExitClass::RuntimeFailed,
            format!("failed to wait for shutdown signal: {error}"),
        );
    }

    engine.stop().await;
    RunOutcome::ok(Some("stopped on interrupt".to_string()))
}

fn parse_profile_selection() -> Result<ProfileSelection, String> {
    let raw = match env::var(ENV_PROFILE) {
        Ok(value) => value.trim().to_string(),
        Err(_) => return Ok(ProfileSelection::Direct),
    };
    if raw.is_empty() || raw.eq_ignore_ascii_case("direct") {
        return Ok(ProfileSelection::Direct);
    }
    raw.parse::<i32>()
        .ok()
        .and_then(ProfileSelection::from_marker)
        .ok_or_else(|| format!("{ENV_PROFILE} must be \"direct\" or a profile index, got {raw:?}"))
}

fn open_status_file(path: &str) -> io::Result<File> {
    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}
