// Common types for dbtunnel

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// SSH authentication method, in the order the resolver offers them
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethodKind {
    /// Private key from an identity file
    PublicKey,
    /// Static password
    Password,
    /// Keys held by a running ssh-agent
    Agent,
}

impl AuthMethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethodKind::PublicKey => "publickey",
            AuthMethodKind::Password => "password",
            AuthMethodKind::Agent => "agent",
        }
    }
}

impl fmt::Display for AuthMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one connection test step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    /// Not applicable to this profile (e.g. DNS for a literal IP)
    Skipped,
    /// Not run because an earlier step failed
    Disabled,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub detail: String,
}

impl StepResult {
    pub fn new(name: impl Into<String>, status: StepStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            duration: Duration::ZERO,
            detail: detail.into(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// Report produced by a connection test
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionTestReport {
    pub steps: Vec<StepResult>,
    #[serde(with = "duration_millis")]
    pub total: Duration,
    /// Endpoint the database client would use (host:port)
    pub endpoint: Option<String>,
    pub error: Option<String>,
}

impl ConnectionTestReport {
    /// True when no step failed
    pub fn healthy(&self) -> bool {
        self.error.is_none() && !self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    pub fn push(&mut self, step: StepResult) {
        self.steps.push(step);
    }

    /// Mark every remaining step name as disabled
    pub fn disable_remaining(&mut self, names: &[&str], reason: &str) {
        for name in names {
            self.steps
                .push(StepResult::new(*name, StepStatus::Disabled, reason));
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
