//! Rendering of the local unit's server configuration from the peer state.

use zkctl_core::{
    ConfigPaths, PeerState, RenderInput, RenderedConfig, Role, ServerEntry, ServerSettings,
    TlsRender, UnitId,
};

/// Servers of the committed configuration that have registered an address.
/// Leaving members are no longer listed.
pub fn server_entries(state: &PeerState) -> Vec<ServerEntry> {
    state
        .ensemble
        .members
        .iter()
        .filter(|(_, role)| **role != Role::Leaving)
        .filter_map(|(id, role)| {
            let host = state.unit(*id)?.address.clone()?;
            Some(ServerEntry {
                unit: *id,
                host,
                role: *role,
            })
        })
        .collect()
}

pub fn render_local(
    local: UnitId,
    paths: &ConfigPaths,
    state: &PeerState,
    fallback: ServerSettings,
    tls: TlsRender,
) -> RenderedConfig {
    RenderedConfig::render(&RenderInput {
        unit: local,
        paths,
        settings: state.ensemble.settings.unwrap_or(fallback),
        config_version: state.ensemble.config_version,
        servers: server_entries(state),
        credentials: &state.ensemble.credentials,
        tls,
    })
}
