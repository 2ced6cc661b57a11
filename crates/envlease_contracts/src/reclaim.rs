#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, Validate};

pub const RECLAIM_PLAN_MAX_CONTAINERS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReclaimStep {
    Stop,
    Remove,
    Run,
}

impl ReclaimStep {
    pub fn as_str(self) -> &'static str {
        match self {
            ReclaimStep::Stop => "STOP",
            ReclaimStep::Remove => "REMOVE",
            ReclaimStep::Run => "RUN",
        }
    }
}

impl fmt::Display for ReclaimStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One container to recreate from its snapshot image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    /// `host:container` port mapping handed to `-p`.
    pub port_mapping: String,
    pub image: String,
}

impl ContainerSpec {
    pub fn v1(
        name: impl Into<String>,
        port_mapping: impl Into<String>,
        image: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        let spec = Self {
            name: name.into(),
            port_mapping: port_mapping.into(),
            image: image.into(),
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn host_port(&self) -> Option<u16> {
        self.port_mapping
            .split_once(':')
            .and_then(|(host, _)| host.parse::<u16>().ok())
    }
}

impl Validate for ContainerSpec {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token_ascii("container_spec.name", &self.name, 64)?;
        validate_token_ascii("container_spec.image", &self.image, 256)?;
        let Some((host, container)) = self.port_mapping.split_once(':') else {
            return Err(ContractViolation::InvalidValue {
                field: "container_spec.port_mapping",
                reason: "must be HOST:CONTAINER",
            });
        };
        for part in [host, container] {
            match part.parse::<u16>() {
                Ok(port) if port > 0 => {}
                _ => {
                    return Err(ContractViolation::InvalidValue {
                        field: "container_spec.port_mapping",
                        reason: "ports must be within 1..=65535",
                    })
                }
            }
        }
        Ok(())
    }
}

/// Ordered set of containers recreated by one reclaim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimPlan {
    pub containers: Vec<ContainerSpec>,
}

impl ReclaimPlan {
    pub fn v1(containers: Vec<ContainerSpec>) -> Result<Self, ContractViolation> {
        let plan = Self { containers };
        plan.validate()?;
        Ok(plan)
    }

    /// The four benchmark environments and their snapshot images.
    pub fn benchmark_default() -> Self {
        let row = |name: &str, ports: &str, image: &str| ContainerSpec {
            name: name.to_string(),
            port_mapping: ports.to_string(),
            image: image.to_string(),
        };
        Self {
            containers: vec![
                row("gitlab", "8023:8023", "snapshot-gitlab:initial"),
                row("shopping", "7770:80", "snapshot-shopping:initial"),
                row("shopping_admin", "7780:80", "snapshot-shopping_admin:initial"),
                row("forum", "9999:80", "snapshot-forum:initial"),
            ],
        }
    }
}

impl Validate for ReclaimPlan {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.containers.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "reclaim_plan.containers",
                reason: "must contain at least one container",
            });
        }
        if self.containers.len() > RECLAIM_PLAN_MAX_CONTAINERS {
            return Err(ContractViolation::InvalidValue {
                field: "reclaim_plan.containers",
                reason: "exceeds RECLAIM_PLAN_MAX_CONTAINERS",
            });
        }
        let mut names = BTreeSet::new();
        for container in &self.containers {
            container.validate()?;
            if !names.insert(container.name.as_str()) {
                return Err(ContractViolation::InvalidValue {
                    field: "reclaim_plan.containers",
                    reason: "container names must be unique",
                });
            }
        }
        Ok(())
    }
}

fn validate_token_ascii(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be non-empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    if value.chars().any(|c| {
        !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':' || c == '.' || c == '/')
    }) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must contain token-safe ASCII only",
        });
    }
    Ok(())
}
