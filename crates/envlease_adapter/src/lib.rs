#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, ops::RangeInclusive, sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use envlease_contracts::lease::{ExecutionError, LeaseOperation, LeaseStatus};
use envlease_contracts::reclaim::ReclaimPlan;
use envlease_contracts::{saturating_millis, ReasonCodeId};
use envlease_engines::lease_state::{reason_codes, rejection_reason};
use envlease_engines::readiness::{
    CommandReadinessRuntime, HttpReadinessConfig, HttpReadinessRuntime,
};
use envlease_engines::reclaim::{DockerReclaimConfig, DockerReclaimRuntime};
use envlease_os::{
    AcquireOutcome, AlwaysReady, LeaseError, LeasePorts, LeaseService, LeaseServiceConfig,
    NoopResetExecutor, PipelineCounters, ReadinessProbe, ReleaseOutcome, ResetExecutor,
    SystemClock,
};

const DEFAULT_HTTP_BIND: &str = "0.0.0.0:5000";
const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_MONITOR_INTERVAL_MS: u64 = 60_000;
const DEFAULT_READINESS_TIMEOUT_MS: u64 = 2_000;
const HEARTBEAT_TIMEOUT_MS_BOUNDS: RangeInclusive<u64> = 1_000..=86_400_000;
const MONITOR_INTERVAL_MS_BOUNDS: RangeInclusive<u64> = 100..=3_600_000;
const READINESS_TIMEOUT_MS_BOUNDS: RangeInclusive<u64> = 100..=60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetMode {
    Docker { docker_bin: String },
    Noop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessMode {
    Always,
    /// `None` probes the host ports of the reclaim plan.
    Http { urls: Option<Vec<String>> },
    Command { argv: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub bind: SocketAddr,
    pub service: LeaseServiceConfig,
    pub reset: ResetMode,
    pub readiness: ReadinessMode,
    pub readiness_timeout_ms: u64,
}

impl AdapterConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    pub fn from_env_var_map<F>(get: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_raw = get("ENVLEASE_HTTP_BIND").unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());
        let bind = bind_raw
            .trim()
            .parse::<SocketAddr>()
            .map_err(|err| format!("ENVLEASE_HTTP_BIND={bind_raw:?} is not a socket address: {err}"))?;

        let heartbeat_timeout_ms = parse_bounded_ms(
            get("ENVLEASE_HEARTBEAT_TIMEOUT_MS"),
            HEARTBEAT_TIMEOUT_MS_BOUNDS,
            DEFAULT_HEARTBEAT_TIMEOUT_MS,
        );
        let monitor_interval_ms = parse_bounded_ms(
            get("ENVLEASE_MONITOR_INTERVAL_MS"),
            MONITOR_INTERVAL_MS_BOUNDS,
            DEFAULT_MONITOR_INTERVAL_MS,
        );
        let readiness_timeout_ms = parse_bounded_ms(
            get("ENVLEASE_READINESS_TIMEOUT_MS"),
            READINESS_TIMEOUT_MS_BOUNDS,
            DEFAULT_READINESS_TIMEOUT_MS,
        );

        let reset = match normalized(get("ENVLEASE_RESET_MODE")).as_deref() {
            None | Some("docker") => {
                let docker_bin = get("ENVLEASE_DOCKER_BIN")
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| "docker".to_string());
                ResetMode::Docker { docker_bin }
            }
            Some("noop") => ResetMode::Noop,
            Some(other) => {
                return Err(format!(
                    "ENVLEASE_RESET_MODE={other:?} must be one of docker|noop"
                ))
            }
        };

        let readiness = match normalized(get("ENVLEASE_READINESS_MODE")).as_deref() {
            None | Some("always") => ReadinessMode::Always,
            Some("http") => {
                let urls = get("ENVLEASE_READINESS_URLS")
                    .map(|raw| {
                        raw.split(',')
                            .map(str::trim)
                            .filter(|url| !url.is_empty())
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                    })
                    .filter(|urls| !urls.is_empty());
                ReadinessMode::Http { urls }
            }
            Some("command") => {
                let argv = get("ENVLEASE_READINESS_COMMAND")
                    .map(|raw| raw.split_whitespace().map(ToString::to_string).collect::<Vec<_>>())
                    .unwrap_or_default();
                if argv.is_empty() {
                    return Err(
                        "ENVLEASE_READINESS_MODE=command requires ENVLEASE_READINESS_COMMAND"
                            .to_string(),
                    );
                }
                ReadinessMode::Command { argv }
            }
            Some(other) => {
                return Err(format!(
                    "ENVLEASE_READINESS_MODE={other:?} must be one of always|http|command"
                ))
            }
        };

        Ok(Self {
            bind,
            service: LeaseServiceConfig {
                heartbeat_timeout: Duration::from_millis(heartbeat_timeout_ms),
                monitor_interval: Duration::from_millis(monitor_interval_ms),
            },
            reset,
            readiness,
            readiness_timeout_ms,
        })
    }

    /// Resolves the configured executor and probe into service ports.
    pub fn build_ports(&self) -> Result<LeasePorts, String> {
        let executor: Arc<dyn ResetExecutor> = match &self.reset {
            ResetMode::Docker { docker_bin } => {
                Arc::new(DockerResetExecutor::new(docker_bin.clone())?)
            }
            ResetMode::Noop => Arc::new(NoopResetExecutor),
        };
        let probe: Arc<dyn ReadinessProbe> = match &self.readiness {
            ReadinessMode::Always => Arc::new(AlwaysReady),
            ReadinessMode::Http { urls } => {
                let config = match urls {
                    Some(urls) => HttpReadinessConfig {
                        urls: urls.clone(),
                        timeout_ms: self.readiness_timeout_ms,
                    },
                    None => HttpReadinessConfig::from_plan(
                        &ReclaimPlan::benchmark_default(),
                        self.readiness_timeout_ms,
                    ),
                };
                Arc::new(HttpReadinessProbe::new(config)?)
            }
            ReadinessMode::Command { argv } => Arc::new(CommandReadinessProbe::new(argv.clone())?),
        };
        Ok(LeasePorts {
            clock: Arc::new(SystemClock::new()),
            executor,
            probe,
        })
    }

    pub fn reset_mode_label(&self) -> &'static str {
        match self.reset {
            ResetMode::Docker { .. } => "docker",
            ResetMode::Noop => "noop",
        }
    }

    pub fn readiness_mode_label(&self) -> &'static str {
        match self.readiness {
            ReadinessMode::Always => "always",
            ReadinessMode::Http { .. } => "http",
            ReadinessMode::Command { .. } => "command",
        }
    }
}

fn parse_bounded_ms(raw: Option<String>, bounds: RangeInclusive<u64>, default: u64) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| bounds.contains(v))
        .unwrap_or(default)
}

fn normalized(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

/// Recreates the benchmark containers with the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerResetExecutor {
    runtime: DockerReclaimRuntime,
}

impl DockerResetExecutor {
    pub fn new(docker_bin: String) -> Result<Self, String> {
        let config = DockerReclaimConfig {
            docker_bin,
            ..DockerReclaimConfig::mvp_v1()
        };
        let runtime = DockerReclaimRuntime::new(config)
            .map_err(|err| format!("invalid docker reclaim config: {err}"))?;
        Ok(Self { runtime })
    }
}

impl ResetExecutor for DockerResetExecutor {
    fn reclaim(&self) -> Result<(), ExecutionError> {
        let receipt = self.runtime.run()?;
        tracing::info!(
            containers = receipt.containers_recreated,
            "docker reclaim recreated containers"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpReadinessProbe {
    runtime: HttpReadinessRuntime,
}

impl HttpReadinessProbe {
    pub fn new(config: HttpReadinessConfig) -> Result<Self, String> {
        let runtime = HttpReadinessRuntime::new(config)
            .map_err(|err| format!("invalid http readiness config: {err}"))?;
        Ok(Self { runtime })
    }
}

impl ReadinessProbe for HttpReadinessProbe {
    fn check(&self) -> bool {
        let report = self.runtime.run();
        if let Some(failing) = &report.failing {
            tracing::debug!(failing = %failing, "resource not ready");
        }
        report.ready
    }
}

#[derive(Debug, Clone)]
pub struct CommandReadinessProbe {
    runtime: CommandReadinessRuntime,
}

impl CommandReadinessProbe {
    pub fn new(argv: Vec<String>) -> Result<Self, String> {
        let runtime = CommandReadinessRuntime::new(argv)
            .map_err(|err| format!("invalid readiness command: {err}"))?;
        Ok(Self { runtime })
    }
}

impl ReadinessProbe for CommandReadinessProbe {
    fn check(&self) -> bool {
        let report = self.runtime.run();
        if let Some(failing) = &report.failing {
            tracing::debug!(failing = %failing, "resource not ready");
        }
        report.ready
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LeaseOperationResponse {
    pub status: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_epoch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<u32>,
    pub reason: Option<String>,
}

impl LeaseOperationResponse {
    fn ok(status: &str, outcome: &str, code: ReasonCodeId) -> Self {
        Self {
            status: status.to_string(),
            outcome: outcome.to_string(),
            lease_epoch: None,
            reason_code: Some(code.0),
            reason: None,
        }
    }

    fn rejected(operation: LeaseOperation, current: LeaseStatus) -> Self {
        let (code, reason) = rejection_reason(operation, current);
        Self {
            status: current.as_str().to_string(),
            outcome: "REJECTED".to_string(),
            lease_epoch: None,
            reason_code: Some(code.0),
            reason: Some(reason.to_string()),
        }
    }

    fn internal(err: &LeaseError) -> Self {
        Self {
            status: "error".to_string(),
            outcome: "INTERNAL_ERROR".to_string(),
            lease_epoch: None,
            reason_code: match err {
                LeaseError::PipelineClosed => Some(reason_codes::LEASE_INTERNAL_PIPELINE_ERROR.0),
                _ => None,
            },
            reason: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct PipelineCountersResponse {
    pub scheduled: u64,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl From<PipelineCounters> for PipelineCountersResponse {
    fn from(c: PipelineCounters) -> Self {
        Self {
            scheduled: c.scheduled,
            started: c.started,
            succeeded: c.succeeded,
            failed: c.failed,
            skipped: c.skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LeaseStatusDetail {
    pub lease_epoch: u64,
    pub since_heartbeat_ms: u64,
    pub pipeline: PipelineCountersResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LeaseStatusResponse {
    pub status: String,
    #[serde(flatten)]
    pub detail: Option<LeaseStatusDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, serde::Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub detail: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub lease_status: Option<String>,
    pub pipeline: PipelineCountersResponse,
    pub reason: Option<String>,
}

pub fn build_router(service: LeaseService) -> Router {
    Router::new()
        .route("/acquire", post(acquire))
        .route("/release", post(release))
        .route("/heartbeat", post(heartbeat))
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .with_state(service)
}

pub async fn acquire(
    State(service): State<LeaseService>,
) -> (StatusCode, Json<LeaseOperationResponse>) {
    match service.acquire().await {
        Ok(AcquireOutcome::Acquired { lease_epoch }) => {
            let mut response = LeaseOperationResponse::ok("ok", "ACQUIRED", reason_codes::LEASE_OK_ACQUIRED);
            response.lease_epoch = Some(lease_epoch);
            (StatusCode::OK, Json(response))
        }
        Ok(AcquireOutcome::Rejected { current }) => (
            StatusCode::BAD_REQUEST,
            Json(LeaseOperationResponse::rejected(
                LeaseOperation::Acquire,
                current,
            )),
        ),
        Err(err) => internal_error(LeaseOperation::Acquire, &err),
    }
}

pub async fn release(
    State(service): State<LeaseService>,
) -> (StatusCode, Json<LeaseOperationResponse>) {
    match service.release().await {
        Ok(ReleaseOutcome::Accepted) => (
            StatusCode::ACCEPTED,
            Json(LeaseOperationResponse::ok(
                "accepted",
                "RECLAIM_SCHEDULED",
                reason_codes::LEASE_OK_RELEASE_ACCEPTED,
            )),
        ),
        Ok(ReleaseOutcome::Rejected { current }) => (
            StatusCode::BAD_REQUEST,
            Json(LeaseOperationResponse::rejected(
                LeaseOperation::Release,
                current,
            )),
        ),
        Err(err) => internal_error(LeaseOperation::Release, &err),
    }
}

pub async fn heartbeat(
    State(service): State<LeaseService>,
) -> (StatusCode, Json<LeaseOperationResponse>) {
    match service.heartbeat() {
        Ok(()) => (
            StatusCode::OK,
            Json(LeaseOperationResponse::ok(
                "ok",
                "HEARTBEAT_RECORDED",
                reason_codes::LEASE_OK_HEARTBEAT,
            )),
        ),
        Err(err) => internal_error(LeaseOperation::Heartbeat, &err),
    }
}

pub async fn status(
    State(service): State<LeaseService>,
    Query(query): Query<StatusQuery>,
) -> (StatusCode, Json<LeaseStatusResponse>) {
    let result = if query.detail {
        service.snapshot().await.map(|snapshot| LeaseStatusResponse {
            status: snapshot.lease.status.as_str().to_string(),
            detail: Some(LeaseStatusDetail {
                lease_epoch: snapshot.lease.lease_epoch,
                since_heartbeat_ms: saturating_millis(snapshot.since_heartbeat),
                pipeline: snapshot.pipeline.into(),
            }),
            reason: None,
        })
    } else {
        service.status().await.map(|current| LeaseStatusResponse {
            status: current.as_str().to_string(),
            detail: None,
            reason: None,
        })
    };
    match result {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(err) => {
            tracing::error!(operation = LeaseOperation::Status.as_str(), error = %err, "lease operation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(LeaseStatusResponse {
                    status: "error".to_string(),
                    detail: None,
                    reason: Some(err.to_string()),
                }),
            )
        }
    }
}

pub async fn healthz(
    State(service): State<LeaseService>,
) -> (StatusCode, Json<AdapterHealthResponse>) {
    let pipeline = service.pipeline().counters().into();
    match service.status().await {
        Ok(current) => (
            StatusCode::OK,
            Json(AdapterHealthResponse {
                status: "ok".to_string(),
                outcome: "HEALTHY".to_string(),
                lease_status: Some(current.as_str().to_string()),
                pipeline,
                reason: None,
            }),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(AdapterHealthResponse {
                status: "error".to_string(),
                outcome: "UNHEALTHY".to_string(),
                lease_status: None,
                pipeline,
                reason: Some(err.to_string()),
            }),
        ),
    }
}

fn internal_error(
    operation: LeaseOperation,
    err: &LeaseError,
) -> (StatusCode, Json<LeaseOperationResponse>) {
    tracing::error!(operation = operation.as_str(), error = %err, "lease operation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(LeaseOperationResponse::internal(err)),
    )
}
