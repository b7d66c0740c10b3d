use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use contact_identity_core::{
    is_plausible_email, is_valid_phone_number, ContactId, IdentifyResponse, IdentityError,
    IntegrityPolicy, NovelPairPolicy, ResolutionReport, ResolveOptions, StoreError,
};
use contact_identity_store_sqlite::{
    database_path_from_url, PoolStatus, SqliteContactStore, StoreConfig,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const WELCOME_TEXT: &str = "Welcome to the Contact Identity API";
const MISSING_FIELDS_MESSAGE: &str = "Either email or phoneNumber must be provided";

#[derive(Clone)]
struct ServiceState {
    store: Arc<SqliteContactStore>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
    expose_error_detail: bool,
}

#[derive(Debug)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    body: Value,
}

/// Validation errors in the `{ "_errors": [..], field: { "_errors": [..] } }`
/// layout clients already parse.
#[derive(Debug, Default, Serialize)]
struct FormattedErrors {
    #[serde(rename = "_errors")]
    errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<FieldErrors>,
    #[serde(rename = "phoneNumber", skip_serializing_if = "Option::is_none")]
    phone_number: Option<FieldErrors>,
}

#[derive(Debug, Default, Serialize)]
struct FieldErrors {
    #[serde(rename = "_errors")]
    errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IdentifyInput {
    email: Option<String>,
    phone_number: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    pool: PoolStatus,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    validation_error_total: AtomicU64,
    integrity_violation_total: AtomicU64,
    write_conflict_total: AtomicU64,
    pool_exhausted_total: AtomicU64,
    internal_error_total: AtomicU64,
    primaries_created_total: AtomicU64,
    secondaries_created_total: AtomicU64,
    clusters_merged_total: AtomicU64,
    repairs_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    validation_error_total: u64,
    integrity_violation_total: u64,
    write_conflict_total: u64,
    pool_exhausted_total: u64,
    internal_error_total: u64,
    primaries_created_total: u64,
    secondaries_created_total: u64,
    clusters_merged_total: u64,
    repairs_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "contact-identity-service")]
#[command(about = "HTTP service for contact identity resolution")]
struct Args {
    /// `SQLite` path or `sqlite://` URL. Required.
    #[arg(long = "db", env = "DATABASE_URL")]
    database_url: String,
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,
    /// `production` hides error chains from 500 responses.
    #[arg(long, env = "APP_ENV", default_value = "development")]
    app_env: String,
    #[arg(long, env = "OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long, env = "POOL_MAX_CONNECTIONS", default_value_t = 8)]
    pool_max_connections: usize,
    #[arg(long, env = "POOL_ACQUIRE_TIMEOUT_MS", default_value_t = 5000)]
    pool_acquire_timeout_ms: u64,
    #[arg(long, env = "IDENTIFY_MAX_ATTEMPTS", default_value_t = 3)]
    identify_max_attempts: u32,
    #[arg(long, env = "INTEGRITY_POLICY", default_value = "reject", value_parser = parse_integrity_policy)]
    integrity_policy: IntegrityPolicy,
    #[arg(long, env = "NOVEL_PAIR_POLICY", default_value = "always", value_parser = parse_novel_pair_policy)]
    novel_pairs: NovelPairPolicy,
}

impl Args {
    /// Store settings whose waits fit inside `operation_timeout`, so pool and
    /// lock timeouts fire inside the transaction before the request gives up.
    /// A commit racing the deadline can still land after the client saw a 500.
    fn store_config(&self) -> StoreConfig {
        let max_attempts = self.identify_max_attempts.max(1);
        let defaults = StoreConfig::default();
        let budget = store_wait_budget(
            Duration::from_millis(self.operation_timeout_ms),
            max_attempts,
            defaults.retry_backoff,
        );
        StoreConfig {
            max_connections: self.pool_max_connections,
            acquire_timeout: Duration::from_millis(self.pool_acquire_timeout_ms).min(budget),
            busy_timeout: defaults.busy_timeout.min(budget),
            max_attempts,
            resolve: ResolveOptions {
                integrity_policy: self.integrity_policy,
                novel_pairs: self.novel_pairs,
            },
            ..defaults
        }
    }

    fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }
}

/// Per-wait share of the request timeout: every attempt may wait once for a
/// pooled connection and once on the write lock, plus the retry backoff.
fn store_wait_budget(operation_timeout: Duration, max_attempts: u32, retry_backoff: Duration) -> Duration {
    let backoff_steps = max_attempts.saturating_mul(max_attempts.saturating_sub(1)) / 2;
    let backoff_total = retry_backoff.checked_mul(backoff_steps).unwrap_or(Duration::MAX);
    let waits = max_attempts.saturating_mul(2).saturating_add(1);
    (operation_timeout.saturating_sub(backoff_total) / waits).max(Duration::from_millis(1))
}

fn parse_integrity_policy(raw: &str) -> Result<IntegrityPolicy, String> {
    IntegrityPolicy::parse(raw).ok_or_else(|| format!("expected reject or repair, got {raw}"))
}

fn parse_novel_pair_policy(raw: &str) -> Result<NovelPairPolicy, String> {
    NovelPairPolicy::parse(raw)
        .ok_or_else(|| format!("expected always, skip_on_merge or never, got {raw}"))
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl FormattedErrors {
    fn root(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
            ..Self::default()
        }
    }

    fn has_field_errors(&self) -> bool {
        self.email.is_some() || self.phone_number.is_some()
    }
}

impl ServiceState {
    fn validation_failure(&self, errors: &FormattedErrors) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        ServiceFailure {
            status: StatusCode::BAD_REQUEST,
            code: "validation_error",
            body: json!({ "errors": errors }),
        }
    }

    fn internal_failure(&self, code: &'static str, message: String, stack: String) -> ServiceFailure {
        error!(code, %message, "request failed");
        let mut body = Map::new();
        body.insert("error".to_string(), json!("Internal Server Error"));
        body.insert("message".to_string(), json!(message));
        if self.expose_error_detail {
            body.insert("stack".to_string(), json!(stack));
        }
        ServiceFailure {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code,
            body: Value::Object(body),
        }
    }

    fn classify_identity_error(&self, err: &IdentityError) -> ServiceFailure {
        let code = match err {
            IdentityError::InvalidInput(message) => {
                return ServiceFailure {
                    status: StatusCode::BAD_REQUEST,
                    code: "validation_error",
                    body: json!({ "errors": FormattedErrors::root(message.clone()) }),
                };
            }
            IdentityError::IntegrityViolation(_) => "integrity_violation",
            IdentityError::Store(StoreError::Conflict(_)) => "write_conflict",
            IdentityError::Store(StoreError::PoolExhausted { .. }) => "pool_exhausted",
            IdentityError::Store(_) => "internal_error",
        };
        self.internal_failure(code, err.to_string(), format!("{err:?}"))
    }

    async fn run_blocking<T, F>(&self, operation_label: &'static str, op: F) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteContactStore) -> Result<T, IdentityError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let store = Arc::clone(&self.store);
        let handle = tokio::task::spawn_blocking(move || op(&store));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure("timeout", true);
                let message = format!(
                    "{operation_label} timed out after {} ms",
                    self.operation_timeout.as_millis()
                );
                self.internal_failure("timeout", message.clone(), message)
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            self.internal_failure(
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                format!("{err:?}"),
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = self.classify_identity_error(&err);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "validation_error" => &self.validation_error_total,
            "integrity_violation" => &self.integrity_violation_total,
            "write_conflict" => &self.write_conflict_total,
            "pool_exhausted" => &self.pool_exhausted_total,
            "timeout" => return,
            _ => &self.internal_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_resolution(&self, report: &ResolutionReport) {
        if report.created_primary.is_some() {
            self.primaries_created_total.fetch_add(1, Ordering::Relaxed);
        }
        if report.created_secondary.is_some() {
            self.secondaries_created_total.fetch_add(1, Ordering::Relaxed);
        }
        let merged = u64::try_from(report.demoted_primaries.len()).unwrap_or(u64::MAX);
        self.clusters_merged_total.fetch_add(merged, Ordering::Relaxed);
        if report.repaired.is_some() {
            self.repairs_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            integrity_violation_total: self.integrity_violation_total.load(Ordering::Relaxed),
            write_conflict_total: self.write_conflict_total.load(Ordering::Relaxed),
            pool_exhausted_total: self.pool_exhausted_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            primaries_created_total: self.primaries_created_total.load(Ordering::Relaxed),
            secondaries_created_total: self.secondaries_created_total.load(Ordering::Relaxed),
            clusters_merged_total: self.clusters_merged_total.load(Ordering::Relaxed),
            repairs_total: self.repairs_total.load(Ordering::Relaxed),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parses and validates an identify body. An empty body counts as `{}`;
/// `null` fields count as absent.
fn validate_identify_body(body: &[u8]) -> Result<IdentifyInput, FormattedErrors> {
    let value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Map::new())
    } else {
        serde_json::from_slice::<Value>(body)
            .map_err(|err| FormattedErrors::root(format!("Malformed JSON body: {err}")))?
    };

    let Value::Object(fields) = value else {
        return Err(FormattedErrors::root(format!(
            "Expected object, received {}",
            json_type_name(&value)
        )));
    };

    let mut errors = FormattedErrors::default();

    let email = match fields.get("email") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) if is_plausible_email(raw) => Some(raw.clone()),
        Some(Value::String(_)) => {
            errors.email = Some(FieldErrors {
                errors: vec!["Invalid email".to_string()],
            });
            None
        }
        Some(other) => {
            errors.email = Some(FieldErrors {
                errors: vec![format!("Expected string, received {}", json_type_name(other))],
            });
            None
        }
    };

    let phone_number = match fields.get("phoneNumber") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) if is_valid_phone_number(raw) => Some(raw.clone()),
        Some(Value::String(raw)) => {
            let mut messages = vec!["Invalid".to_string()];
            if raw.is_empty() {
                messages.push("String must contain at least 1 character(s)".to_string());
            }
            errors.phone_number = Some(FieldErrors { errors: messages });
            None
        }
        Some(other) => {
            errors.phone_number = Some(FieldErrors {
                errors: vec![format!("Expected string, received {}", json_type_name(other))],
            });
            None
        }
    };

    if errors.has_field_errors() {
        return Err(errors);
    }
    if email.is_none() && phone_number.is_none() {
        return Err(FormattedErrors::root(MISSING_FIELDS_MESSAGE));
    }

    Ok(IdentifyInput {
        email,
        phone_number,
    })
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/api", get(welcome))
        .route("/api/health", get(health))
        .route("/api/openapi", get(openapi))
        .route("/api/identify", post(identify).fallback(not_found))
        .route("/api/contacts/:contact_id", get(contact_show))
        .fallback(not_found)
        .with_state(state)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "contact_identity_service=info,contact_identity_store_sqlite=info,contact_identity_core=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to install shutdown signal handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let db_path = database_path_from_url(&args.database_url);
    let store = SqliteContactStore::open(&db_path, args.store_config())
        .with_context(|| format!("failed to initialize store at {}", db_path.display()))?;
    store
        .migrate()
        .context("failed to bootstrap contacts schema")?;
    let store = Arc::new(store);

    let state = ServiceState {
        store: Arc::clone(&store),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
        expose_error_detail: !args.is_production(),
    };

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, db = %db_path.display(), "contact identity service listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close();
    info!("store pool closed");
    Ok(())
}

async fn welcome() -> &'static str {
    WELCOME_TEXT
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "This route does not exist" })),
    )
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse {
        status: "ok",
        timeout_ms,
        pool: state.store.pool_status(),
        telemetry: state.telemetry.snapshot(),
    })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn identify(
    State(state): State<ServiceState>,
    body: Bytes,
) -> Result<Json<IdentifyResponse>, ServiceFailure> {
    let input = validate_identify_body(&body).map_err(|errors| {
        debug!(?errors, "rejected identify body");
        state.validation_failure(&errors)
    })?;

    let resolution = state
        .run_blocking("identify", move |store| {
            store.identify(input.email.as_deref(), input.phone_number.as_deref())
        })
        .await?;

    state.telemetry.record_resolution(&resolution.report);
    if let Some(violation) = &resolution.report.repaired {
        warn!(%violation, primary_id = %resolution.view.primary_contact_id, "identify repaired a cluster");
    }
    Ok(Json(IdentifyResponse::from(resolution.view)))
}

async fn contact_show(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<IdentifyResponse>, ServiceFailure> {
    let Ok(contact_id) = raw_id.parse::<i64>() else {
        return Err(state.validation_failure(&FormattedErrors::root(format!(
            "contact id must be an integer: {raw_id}"
        ))));
    };

    let view = state
        .run_blocking("contact_show", move |store| store.cluster(ContactId(contact_id)))
        .await?;

    match view {
        Some(view) => Ok(Json(IdentifyResponse::from(view))),
        None => Err(ServiceFailure {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            body: json!({ "error": format!("Contact {contact_id} not found") }),
        }),
    }
}
