//! Client/daemon compatibility contract.
//!
//! The daemon advertises a `{name, version}` descriptor on `/health`.
//! Clients must pass [`ContractGate::verify`] before speaking the protocol;
//! the only way to obtain a [`VerifiedDaemon`] is through that check.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONTRACT_NAME: &str = "opta-daemon";
pub const CONTRACT_VERSION: &str = "3";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDescriptor {
    pub name: String,
    pub version: String,
}

impl ContractDescriptor {
    /// The descriptor this build speaks.
    pub fn current() -> Self {
        Self {
            name: CONTRACT_NAME.to_string(),
            version: CONTRACT_VERSION.to_string(),
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub daemon_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<ContractDescriptor>,
    #[serde(default)]
    pub uptime_ms: u64,
    #[serde(default)]
    pub sessions: usize,
    #[serde(default)]
    pub background_running: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractMismatch {
    #[error("daemon did not advertise a contract (expected {expected_name} v{expected_version})")]
    Missing {
        expected_name: String,
        expected_version: String,
    },
    #[error("daemon speaks `{actual}`, client expects `{expected}`")]
    Name { expected: String, actual: String },
    #[error("daemon contract version {actual}, client expects {expected}")]
    Version { expected: String, actual: String },
}

/// Compare a remote health report against an expected descriptor.
///
/// Any difference, including a missing contract, is a mismatch.
pub fn validate(
    expected: &ContractDescriptor,
    remote: &HealthReport,
) -> Option<ContractMismatch> {
    let Some(actual) = remote.contract.as_ref() else {
        return Some(ContractMismatch::Missing {
            expected_name: expected.name.clone(),
            expected_version: expected.version.clone(),
        });
    };
    if actual.name != expected.name {
        return Some(ContractMismatch::Name {
            expected: expected.name.clone(),
            actual: actual.name.clone(),
        });
    }
    if actual.version != expected.version {
        return Some(ContractMismatch::Version {
            expected: expected.version.clone(),
            actual: actual.version.clone(),
        });
    }
    None
}

/// Proof that a daemon passed contract validation.
#[derive(Debug, Clone)]
pub struct VerifiedDaemon {
    daemon_id: String,
    contract: ContractDescriptor,
}

impl VerifiedDaemon {
    pub fn daemon_id(&self) -> &str {
        &self.daemon_id
    }

    pub fn contract(&self) -> &ContractDescriptor {
        &self.contract
    }
}

/// Hard gate in front of any protocol use.
#[derive(Debug, Clone)]
pub struct ContractGate {
    expected: ContractDescriptor,
}

impl Default for ContractGate {
    fn default() -> Self {
        Self::new(ContractDescriptor::current())
    }
}

impl ContractGate {
    pub fn new(expected: ContractDescriptor) -> Self {
        Self { expected }
    }

    pub fn verify(&self, remote: &HealthReport) -> Result<VerifiedDaemon, ContractMismatch> {
        match validate(&self.expected, remote) {
            Some(mismatch) => Err(mismatch),
            None => Ok(VerifiedDaemon {
                daemon_id: remote.daemon_id.clone(),
                contract: self.expected.clone(),
            }),
        }
    }
}
