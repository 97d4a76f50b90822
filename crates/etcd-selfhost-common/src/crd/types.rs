//! Shared types for EtcdCluster status and the membership registry

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Bootstrap lifecycle phase
///
/// Transitions are owned solely by the orchestrator:
///
/// ```text
/// NotStarted ─┬─► AdoptingBoot ─► ScalingOut ─► RetiringBoot ─► SelfHosted
///             └──────────────────► ScalingOut ─────────────────► SelfHosted
///                       (any phase) ─► Failed
/// ```
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum BootstrapPhase {
    /// Nothing has been done yet
    #[default]
    NotStarted,
    /// Probing the externally started boot member
    AdoptingBoot,
    /// Adding self-hosted members one at a time
    ScalingOut,
    /// Removing the boot member from etcd membership
    RetiringBoot,
    /// Every member is self-hosted and the target size is reached
    SelfHosted,
    /// Bootstrap aborted; partial members are reported in status
    Failed,
}

impl BootstrapPhase {
    /// Whether no further transitions happen from this phase
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::SelfHosted | Self::Failed)
    }
}

impl std::fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NotStarted"),
            Self::AdoptingBoot => write!(f, "AdoptingBoot"),
            Self::ScalingOut => write!(f, "ScalingOut"),
            Self::RetiringBoot => write!(f, "RetiringBoot"),
            Self::SelfHosted => write!(f, "SelfHosted"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Where a member came from
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum MemberRole {
    /// Single-node etcd started outside platform management
    Boot,
    /// Member whose lifecycle the operator manages
    SelfHosted,
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Boot => write!(f, "Boot"),
            Self::SelfHosted => write!(f, "SelfHosted"),
        }
    }
}

/// Member lifecycle state
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum MemberState {
    /// Registered, not yet added to etcd membership
    #[default]
    Pending,
    /// Added to etcd membership, not yet confirmed healthy
    Joining,
    /// Started and answering health probes
    Healthy,
    /// Being removed from etcd membership
    Removing,
    /// Removed from etcd membership
    Removed,
}

impl MemberState {
    /// Whether the member counts towards the active membership
    pub fn is_active(self) -> bool {
        matches!(self, Self::Joining | Self::Healthy)
    }

    /// Whether a membership change for this member is in flight
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::Joining)
    }
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Joining => write!(f, "Joining"),
            Self::Healthy => write!(f, "Healthy"),
            Self::Removing => write!(f, "Removing"),
            Self::Removed => write!(f, "Removed"),
        }
    }
}

/// A single etcd member as tracked by the membership registry
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Member name, unique within the cluster
    pub name: String,

    /// Boot or self-hosted
    pub role: MemberRole,

    /// Lifecycle state
    #[serde(default)]
    pub state: MemberState,

    /// etcd member ID, set once the member is part of etcd membership
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    /// Creation index for self-hosted members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,

    /// URLs the member serves clients on
    #[serde(default)]
    pub client_urls: Vec<String>,

    /// URLs the member serves peers on
    #[serde(default)]
    pub peer_urls: Vec<String>,
}

impl Member {
    /// A self-hosted member that has not been added to etcd yet
    pub fn self_hosted(
        name: impl Into<String>,
        index: usize,
        client_url: impl Into<String>,
        peer_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role: MemberRole::SelfHosted,
            state: MemberState::Pending,
            id: None,
            index: Some(index),
            client_urls: vec![client_url.into()],
            peer_urls: vec![peer_url.into()],
        }
    }

    /// The boot member, already serving as a one-node cluster
    pub fn boot(
        name: impl Into<String>,
        id: u64,
        client_urls: Vec<String>,
        peer_urls: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role: MemberRole::Boot,
            state: MemberState::Healthy,
            id: Some(id),
            index: None,
            client_urls,
            peer_urls,
        }
    }

    /// Set the lifecycle state
    pub fn with_state(mut self, state: MemberState) -> Self {
        self.state = state;
        self
    }

    /// First client URL, if any
    pub fn client_url(&self) -> Option<&str> {
        self.client_urls.first().map(String::as_str)
    }

    /// Whether this is the boot member
    pub fn is_boot(&self) -> bool {
        self.role == MemberRole::Boot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display_and_terminality() {
        assert_eq!(BootstrapPhase::RetiringBoot.to_string(), "RetiringBoot");
        assert!(BootstrapPhase::SelfHosted.is_terminal());
        assert!(BootstrapPhase::Failed.is_terminal());
        assert!(!BootstrapPhase::ScalingOut.is_terminal());
        assert_eq!(BootstrapPhase::default(), BootstrapPhase::NotStarted);
    }

    #[test]
    fn test_active_and_in_flight_states() {
        assert!(MemberState::Joining.is_active());
        assert!(MemberState::Healthy.is_active());
        assert!(!MemberState::Pending.is_active());
        assert!(!MemberState::Removing.is_active());

        assert!(MemberState::Pending.is_in_flight());
        assert!(MemberState::Joining.is_in_flight());
        assert!(!MemberState::Healthy.is_in_flight());
    }

    #[test]
    fn test_member_serializes_camel_case() {
        let member = Member::self_hosted(
            "etcd-0000",
            0,
            "http://etcd-0000.ns.svc:2379",
            "http://etcd-0000.ns.svc:2380",
        );
        let json = serde_json::to_value(&member).unwrap();
        assert_eq!(json["clientUrls"][0], "http://etcd-0000.ns.svc:2379");
        assert_eq!(json["state"], "Pending");
        assert!(json.get("id").is_none());
    }

    #[test]
    fn test_boot_member_starts_healthy() {
        let boot = Member::boot(
            "default",
            42,
            vec!["http://10.0.0.5:2379".into()],
            vec!["http://10.0.0.5:2380".into()],
        );
        assert!(boot.is_boot());
        assert_eq!(boot.state, MemberState::Healthy);
        assert_eq!(boot.client_url(), Some("http://10.0.0.5:2379"));
    }
}
