#![forbid(unsafe_code)]

use std::time::Duration;

use envlease_contracts::reclaim::ReclaimPlan;
use envlease_contracts::ContractViolation;

use crate::reclaim::{CommandRunner, ProcessCommandRunner};

pub const READINESS_MAX_TARGETS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessReport {
    pub ready: bool,
    /// First target that was not ready, with the reason.
    pub failing: Option<String>,
}

impl ReadinessReport {
    fn ready() -> Self {
        Self {
            ready: true,
            failing: None,
        }
    }

    fn not_ready(failing: String) -> Self {
        Self {
            ready: false,
            failing: Some(failing),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReadinessConfig {
    pub urls: Vec<String>,
    pub timeout_ms: u64,
}

impl HttpReadinessConfig {
    /// One `http://127.0.0.1:<host_port>/` target per container of the plan.
    pub fn from_plan(plan: &ReclaimPlan, timeout_ms: u64) -> Self {
        let urls = plan
            .containers
            .iter()
            .filter_map(|c| c.host_port())
            .map(|port| format!("http://127.0.0.1:{port}/"))
            .collect();
        Self { urls, timeout_ms }
    }
}

/// Ready only when every configured endpoint answers with a 2xx status.
#[derive(Debug, Clone)]
pub struct HttpReadinessRuntime {
    urls: Vec<String>,
    agent: ureq::Agent,
}

impl HttpReadinessRuntime {
    pub fn new(config: HttpReadinessConfig) -> Result<Self, ContractViolation> {
        if config.urls.is_empty() || config.urls.len() > READINESS_MAX_TARGETS {
            return Err(ContractViolation::InvalidValue {
                field: "http_readiness_config.urls",
                reason: "must contain 1..=16 urls",
            });
        }
        if config
            .urls
            .iter()
            .any(|u| !(u.starts_with("http://") || u.starts_with("https://")))
        {
            return Err(ContractViolation::InvalidValue {
                field: "http_readiness_config.urls",
                reason: "must use http:// or https://",
            });
        }
        if config.timeout_ms == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "http_readiness_config.timeout_ms",
                reason: "must be > 0",
            });
        }
        let timeout = Duration::from_millis(config.timeout_ms);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .redirects(0)
            .build();
        Ok(Self {
            urls: config.urls,
            agent,
        })
    }

    pub fn run(&self) -> ReadinessReport {
        for url in &self.urls {
            match self.agent.get(url).call() {
                Ok(resp) if (200..=299).contains(&resp.status()) => {}
                Ok(resp) => {
                    return ReadinessReport::not_ready(format!("{url}: http status {}", resp.status()))
                }
                Err(ureq::Error::Status(code, _)) => {
                    return ReadinessReport::not_ready(format!("{url}: http status {code}"))
                }
                Err(ureq::Error::Transport(err)) => {
                    return ReadinessReport::not_ready(format!("{url}: transport error: {err}"))
                }
            }
        }
        ReadinessReport::ready()
    }
}

/// Ready when the configured health-check command exits with status 0.
#[derive(Debug, Clone)]
pub struct CommandReadinessRuntime<R = ProcessCommandRunner>
where
    R: CommandRunner,
{
    argv: Vec<String>,
    runner: R,
}

impl CommandReadinessRuntime<ProcessCommandRunner> {
    pub fn new(argv: Vec<String>) -> Result<Self, ContractViolation> {
        Self::with_runner(argv, ProcessCommandRunner)
    }
}

impl<R> CommandReadinessRuntime<R>
where
    R: CommandRunner,
{
    pub fn with_runner(argv: Vec<String>, runner: R) -> Result<Self, ContractViolation> {
        if argv.first().map(|p| p.trim().is_empty()).unwrap_or(true) {
            return Err(ContractViolation::InvalidValue {
                field: "command_readiness.argv",
                reason: "must name a program",
            });
        }
        Ok(Self { argv, runner })
    }

    pub fn run(&self) -> ReadinessReport {
        let (program, args) = match self.argv.split_first() {
            Some(split) => split,
            None => return ReadinessReport::not_ready("no health-check command".to_string()),
        };
        match self.runner.run(program, args) {
            Ok(output) if output.success => ReadinessReport::ready(),
            Ok(output) => ReadinessReport::not_ready(match output.code {
                Some(code) => format!("{program}: exit status {code}"),
                None => format!("{program}: terminated by signal"),
            }),
            Err(err) => ReadinessReport::not_ready(err),
        }
    }
}
