//! Resource model: the compute instance owned by the Provisioner.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ResourceId, SessionId};

/// Prefix of every resource name created for a session.
pub const RESOURCE_NAME_PREFIX: &str = "session-";

/// Resource state as reported by the provisioning platform.
///
/// State transitions (platform side):
/// - Created -> Starting -> Started -> Stopping -> Stopped
/// - Stopped -> Destroying -> Destroyed (automatic when auto-destroy is set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
}

impl ResourceState {
    /// States the reaper sweeps.
    pub const LIVE: [ResourceState; 2] = [ResourceState::Starting, ResourceState::Started];

    /// Is the instance (about to be) running?
    pub fn is_live(self) -> bool {
        matches!(self, ResourceState::Starting | ResourceState::Started)
    }

    /// Has the instance stopped for good (no further transitions except destroy)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResourceState::Stopped | ResourceState::Destroying | ResourceState::Destroyed
        )
    }
}

/// A compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub state: ResourceState,
    pub created_at: DateTime<Utc>,
}

impl Resource {
    /// Session encoded in the resource name, if the name follows the convention.
    pub fn session_id(&self) -> Option<SessionId> {
        session_from_name(&self.name)
    }
}

/// Deterministic resource name for a session: `session-<id>`.
///
/// Two concurrent creators for the same session ask for the same name, so the
/// platform (not a lock) settles who wins.
pub fn resource_name(session_id: &SessionId) -> String {
    format!("{RESOURCE_NAME_PREFIX}{session_id}")
}

/// Inverse of [`resource_name`]. Foreign names yield `None`.
pub fn session_from_name(name: &str) -> Option<SessionId> {
    let raw = name.strip_prefix(RESOURCE_NAME_PREFIX)?;
    SessionId::new(raw).ok()
}

/// Graceful stop parameters passed to the platform at create time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopConfig {
    pub timeout: Duration,
    pub signal: String,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            signal: "SIGTERM".to_string(),
        }
    }
}

/// Create-time configuration for a resource.
///
/// `auto_destroy` and `idle_stop_timeout` are advisory: the platform's own
/// cleanup is a first line of defense, the reaper does not rely on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub image: Option<String>,
    pub env: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    pub auto_destroy: bool,
    pub idle_stop_timeout: Duration,
    pub stop: StopConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            image: None,
            env: HashMap::new(),
            metadata: HashMap::new(),
            auto_destroy: true,
            idle_stop_timeout: Duration::from_secs(300),
            stop: StopConfig::default(),
        }
    }
}

/// Filter for `Provisioner::list`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    /// Empty means "any state".
    pub states: Vec<ResourceState>,
    pub name: Option<String>,
}

impl ResourceFilter {
    pub fn live() -> Self {
        Self {
            states: ResourceState::LIVE.to_vec(),
            name: None,
        }
    }

    pub fn live_named(name: impl Into<String>) -> Self {
        Self {
            states: ResourceState::LIVE.to_vec(),
            name: Some(name.into()),
        }
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        let state_ok = self.states.is_empty() || self.states.contains(&resource.state);
        let name_ok = self.name.as_deref().is_none_or(|n| n == resource.name);
        state_ok && name_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrips_through_session_id() {
        let session = SessionId::new("chat-7").unwrap();
        let name = resource_name(&session);
        assert_eq!(name, "session-chat-7");
        assert_eq!(session_from_name(&name), Some(session));
    }

    #[test]
    fn foreign_names_are_not_sessions() {
        assert_eq!(session_from_name("web-frontend"), None);
        assert_eq!(session_from_name("session-"), None);
        assert_eq!(session_from_name("session-a b"), None);
    }

    #[test]
    fn live_filter_matches_only_running_states() {
        let mut resource = Resource {
            id: ResourceId::new("m-1").unwrap(),
            name: "session-s1".to_string(),
            state: ResourceState::Started,
            created_at: Utc::now(),
        };
        let filter = ResourceFilter::live();
        assert!(filter.matches(&resource));

        resource.state = ResourceState::Stopped;
        assert!(!filter.matches(&resource));

        resource.state = ResourceState::Starting;
        assert!(ResourceFilter::live_named("session-s1").matches(&resource));
        assert!(!ResourceFilter::live_named("session-s2").matches(&resource));
    }
}
