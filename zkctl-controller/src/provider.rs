//! Connection details published to clients of the ensemble.

use serde::{Deserialize, Serialize};
use zkctl_core::config::{CLIENT_PORT, SECURE_CLIENT_PORT, SUPER_USER};
use zkctl_core::{connection_string, PeerState, Role};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Comma-separated `host:port` list, naturally sorted
    pub endpoints: String,
    pub tls: bool,
    pub username: String,
    pub password: String,
}

impl ServiceEndpoint {
    /// Endpoint for the committed membership. `None` until the admin
    /// account exists and at least one member has an address.
    pub fn from_state(state: &PeerState) -> Option<Self> {
        let password = state.ensemble.credentials.get(SUPER_USER)?.current.clone();
        let tls = &state.ensemble.tls;
        let secure = tls.enabled && tls.is_converged() && tls.active_generation > 0;
        let port = if secure { SECURE_CLIENT_PORT } else { CLIENT_PORT };

        let hosts: Vec<&str> = state
            .ensemble
            .members
            .iter()
            .filter(|(_, role)| **role != Role::Leaving)
            .filter_map(|(id, _)| state.unit(*id)?.address.as_deref())
            .collect();
        if hosts.is_empty() {
            return None;
        }

        Some(Self {
            endpoints: connection_string(hosts, port),
            tls: secure,
            username: SUPER_USER.to_string(),
            password,
        })
    }
}

impl std::fmt::Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("endpoints", &self.endpoints)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}
