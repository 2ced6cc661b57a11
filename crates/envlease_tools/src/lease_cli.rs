#![forbid(unsafe_code)]

use std::time::Duration;

use envlease_contracts::lease::LeaseStatus;

pub const DEFAULT_LEASE_URL: &str = "http://127.0.0.1:5000";
pub const LEASE_CLI_USAGE: &str =
    "usage: envlease <acquire|release|heartbeat|status> [--detail] [--url URL]";

const LEASE_CLI_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseCommand {
    Acquire,
    Release,
    Heartbeat,
    Status { detail: bool },
}

impl LeaseCommand {
    fn is_post(self) -> bool {
        !matches!(self, LeaseCommand::Status { .. })
    }

    fn path(self) -> &'static str {
        match self {
            LeaseCommand::Acquire => "/acquire",
            LeaseCommand::Release => "/release",
            LeaseCommand::Heartbeat => "/heartbeat",
            LeaseCommand::Status { detail: false } => "/status",
            LeaseCommand::Status { detail: true } => "/status?detail=true",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseCliArgs {
    pub command: LeaseCommand,
    pub base_url: String,
}

impl LeaseCliArgs {
    pub fn request_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.command.path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseCliOutput {
    pub http_status: u16,
    /// Pretty-printed when the server answered with JSON.
    pub body: String,
    pub lease_status: Option<LeaseStatus>,
}

impl LeaseCliOutput {
    /// 0 on success, 1 when the server rejected the request, 2 on server failure.
    pub fn exit_code(&self) -> i32 {
        match self.http_status {
            200..=299 => 0,
            400..=499 => 1,
            _ => 2,
        }
    }
}

/// `env_url` is the value of `ENVLEASE_URL`; `--url` wins over it.
pub fn parse_lease_args(args: &[String], env_url: Option<String>) -> Result<LeaseCliArgs, String> {
    let mut command = None;
    let mut detail = false;
    let mut base_url = env_url
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--url" => {
                let value = iter
                    .next()
                    .ok_or_else(|| format!("--url requires a value\n{LEASE_CLI_USAGE}"))?;
                base_url = Some(value.trim().to_string());
            }
            "--detail" => detail = true,
            "-h" | "--help" => return Err(LEASE_CLI_USAGE.to_string()),
            other if command.is_none() && !other.starts_with('-') => {
                command = Some(other.to_string());
            }
            other => return Err(format!("unexpected argument: {other}\n{LEASE_CLI_USAGE}")),
        }
    }

    let command = match command.as_deref() {
        Some("acquire") => LeaseCommand::Acquire,
        Some("release") => LeaseCommand::Release,
        Some("heartbeat") => LeaseCommand::Heartbeat,
        Some("status") => LeaseCommand::Status { detail },
        Some(other) => {
            return Err(format!(
                "unknown lease command: {other}. expected one of: acquire, release, heartbeat, status"
            ))
        }
        None => return Err(LEASE_CLI_USAGE.to_string()),
    };
    if detail && !matches!(command, LeaseCommand::Status { .. }) {
        return Err(format!("--detail only applies to status\n{LEASE_CLI_USAGE}"));
    }

    let base_url = base_url.unwrap_or_else(|| DEFAULT_LEASE_URL.to_string());
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(format!("lease url must use http:// or https://: {base_url}"));
    }
    Ok(LeaseCliArgs { command, base_url })
}

pub fn lease_agent() -> ureq::Agent {
    let timeout = Duration::from_millis(LEASE_CLI_TIMEOUT_MS);
    ureq::AgentBuilder::new()
        .timeout_connect(timeout)
        .timeout_read(timeout)
        .timeout_write(timeout)
        .build()
}

pub fn execute_lease_command(
    agent: &ureq::Agent,
    args: &LeaseCliArgs,
) -> Result<LeaseCliOutput, String> {
    let url = args.request_url();
    let result = if args.command.is_post() {
        agent.post(&url).call()
    } else {
        agent.get(&url).call()
    };
    let (http_status, raw) = match result {
        Ok(resp) => (resp.status(), resp.into_string()),
        Err(ureq::Error::Status(code, resp)) => (code, resp.into_string()),
        Err(ureq::Error::Transport(err)) => {
            return Err(format!("lease request to {url} failed: {err}"))
        }
    };
    let raw = raw.map_err(|e| format!("failed to read lease response body: {e}"))?;
    Ok(render_output(http_status, &raw))
}

fn render_output(http_status: u16, raw: &str) -> LeaseCliOutput {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => {
            let lease_status = value
                .get("status")
                .and_then(serde_json::Value::as_str)
                .and_then(LeaseStatus::parse);
            let body = serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string());
            LeaseCliOutput {
                http_status,
                body,
                lease_status,
            }
        }
        Err(_) => LeaseCliOutput {
            http_status,
            body: raw.trim().to_string(),
            lease_status: None,
        },
    }
}
