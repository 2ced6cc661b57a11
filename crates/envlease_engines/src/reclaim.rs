#![forbid(unsafe_code)]

use std::process::Command;

use envlease_contracts::lease::ExecutionError;
use envlease_contracts::reclaim::{ContainerSpec, ReclaimPlan, ReclaimStep};
use envlease_contracts::{ContractViolation, Validate};

const STDERR_SUMMARY_MAX_CHARS: usize = 240;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stderr: String,
}

/// Seam over process spawning so reclaim sequencing is testable without docker.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| format!("failed to spawn {program}: {err}"))?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerReclaimConfig {
    pub docker_bin: String,
    pub plan: ReclaimPlan,
}

impl DockerReclaimConfig {
    pub fn mvp_v1() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            plan: ReclaimPlan::benchmark_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimReceipt {
    pub containers_recreated: u16,
}

/// Recreates every container of the plan from its snapshot image:
/// stop, remove, then run detached with the configured port mapping.
#[derive(Debug, Clone)]
pub struct DockerReclaimRuntime<R = ProcessCommandRunner>
where
    R: CommandRunner,
{
    config: DockerReclaimConfig,
    runner: R,
}

impl DockerReclaimRuntime<ProcessCommandRunner> {
    pub fn new(config: DockerReclaimConfig) -> Result<Self, ContractViolation> {
        Self::with_runner(config, ProcessCommandRunner)
    }
}

impl<R> DockerReclaimRuntime<R>
where
    R: CommandRunner,
{
    pub fn with_runner(config: DockerReclaimConfig, runner: R) -> Result<Self, ContractViolation> {
        if config.docker_bin.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "docker_reclaim_config.docker_bin",
                reason: "must be non-empty",
            });
        }
        config.plan.validate()?;
        Ok(Self { config, runner })
    }

    /// Aborts on the first failing command; earlier containers stay recreated.
    pub fn run(&self) -> Result<ReclaimReceipt, ExecutionError> {
        let mut recreated: u16 = 0;
        for container in &self.config.plan.containers {
            for step in [ReclaimStep::Stop, ReclaimStep::Remove, ReclaimStep::Run] {
                self.run_step(container, step)?;
            }
            recreated = recreated.saturating_add(1);
        }
        Ok(ReclaimReceipt {
            containers_recreated: recreated,
        })
    }

    fn run_step(&self, container: &ContainerSpec, step: ReclaimStep) -> Result<(), ExecutionError> {
        let args = docker_args(container, step);
        let fail = |detail: String| ExecutionError::StepFailed {
            target: container.name.clone(),
            step,
            detail,
        };
        let output = self
            .runner
            .run(&self.config.docker_bin, &args)
            .map_err(fail)?;
        if output.success {
            return Ok(());
        }
        let status = match output.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
        let stderr = summarize_stderr(&output.stderr);
        if stderr.is_empty() {
            Err(fail(status))
        } else {
            Err(fail(format!("{status}: {stderr}")))
        }
    }
}

pub fn docker_args(container: &ContainerSpec, step: ReclaimStep) -> Vec<String> {
    match step {
        ReclaimStep::Stop => vec!["stop".to_string(), container.name.clone()],
        ReclaimStep::Remove => vec!["rm".to_string(), container.name.clone()],
        ReclaimStep::Run => vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container.name.clone(),
            "-p".to_string(),
            container.port_mapping.clone(),
            container.image.clone(),
        ],
    }
}

fn summarize_stderr(stderr: &str) -> String {
    let line = stderr
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    line.chars().take(STDERR_SUMMARY_MAX_CHARS).collect()
}
