//! Core identifier and role types shared across the control plane

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of an instance in the three-level hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    /// Top-level planner; spawns Managers
    Executive,
    /// Mid-level coordinator; spawns Specialists
    Manager,
    /// Leaf worker; single-use, never spawns
    Specialist,
}

impl InstanceRole {
    /// Short prefix used in instance ids and session names
    pub fn prefix(&self) -> &'static str {
        match self {
            InstanceRole::Executive => "exec",
            InstanceRole::Manager => "mgr",
            InstanceRole::Specialist => "spec",
        }
    }

    /// Capability table: which child roles this role may spawn
    pub fn can_spawn(&self, child: InstanceRole) -> bool {
        matches!(
            (self, child),
            (InstanceRole::Executive, InstanceRole::Manager)
                | (InstanceRole::Manager, InstanceRole::Specialist)
        )
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Workspace isolation mode for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceMode {
    /// Private working directory and branch
    Isolated,
    /// Shared working directory, coordinated via source control.
    /// Only legal for Managers.
    Shared,
}

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Initializing,
    Active,
    Inactive,
    Restarting,
    Terminated,
}

/// Unique instance identifier
///
/// Rendered as `<role-prefix>_<hex>` so logs and transport session names
/// stay human-readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn generate(role: InstanceRole) -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("{}_{}", role.prefix(), &uuid[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Named job priority levels, mapped to numeric urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Numeric value, higher = more urgent
    pub fn value(&self) -> u8 {
        match self {
            Priority::Critical => 100,
            Priority::High => 75,
            Priority::Medium => 50,
            Priority::Low => 25,
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value().cmp(&other.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_capabilities() {
        assert!(InstanceRole::Executive.can_spawn(InstanceRole::Manager));
        assert!(InstanceRole::Manager.can_spawn(InstanceRole::Specialist));
        assert!(!InstanceRole::Executive.can_spawn(InstanceRole::Specialist));
        assert!(!InstanceRole::Manager.can_spawn(InstanceRole::Manager));
        assert!(!InstanceRole::Specialist.can_spawn(InstanceRole::Specialist));
    }

    #[test]
    fn test_instance_id_prefix() {
        let id = InstanceId::generate(InstanceRole::Manager);
        assert!(id.as_str().starts_with("mgr_"));
        let other = InstanceId::generate(InstanceRole::Manager);
        assert_ne!(id, other);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::Critical.value(), 100);
        assert_eq!(Priority::Low.value(), 25);
    }
}
