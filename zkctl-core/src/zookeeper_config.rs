//! # ZooKeeper Configuration Rendering
//!
//! Renders the server properties, the dynamic membership file, the JAAS
//! file and `myid` for one unit.

use crate::config::{CLIENT_PORT, ELECTION_PORT, SECURE_CLIENT_PORT, SERVER_PORT, SUPER_USER, SYNC_USER};
use crate::peer_state::ServerSettings;
use crate::{ConfigVersion, Credential, Role, UnitId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const DEFAULT_PROPERTIES: &[&str] = &[
    "clientPort=2181",
    "maxClientCnxns=60",
    "minSessionTimeout=4000",
    "maxSessionTimeout=40000",
    "autopurge.snapRetainCount=3",
    "autopurge.purgeInterval=0",
    "reconfigEnabled=true",
    "standaloneEnabled=false",
    "4lw.commands.whitelist=*",
    "DigestAuthenticationProvider.digestAlg=SHA3-256",
    "quorum.auth.enableSasl=true",
    "quorum.auth.learnerRequireSasl=true",
    "quorum.auth.serverRequireSasl=true",
    "authProvider.sasl=org.apache.zookeeper.server.auth.SASLAuthenticationProvider",
    "audit.enable=true",
];

/// File locations under the unit's data volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl ConfigPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            data_dir: root.join("data"),
            log_dir: root.join("log"),
            config_dir: root.join("config"),
        }
    }

    pub fn properties(&self) -> PathBuf {
        self.config_dir.join("zookeeper.properties")
    }

    pub fn dynamic(&self) -> PathBuf {
        self.config_dir.join("zookeeper-dynamic.properties")
    }

    pub fn jaas(&self) -> PathBuf {
        self.config_dir.join("zookeeper-jaas.cfg")
    }

    pub fn myid(&self) -> PathBuf {
        self.data_dir.join("myid")
    }

    pub fn keystore(&self) -> PathBuf {
        self.config_dir.join("keystore.pem")
    }

    pub fn truststore(&self) -> PathBuf {
        self.config_dir.join("truststore.pem")
    }
}

/// One `server.N=` line of the dynamic configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub unit: UnitId,
    pub host: String,
    pub role: Role,
}

impl ServerEntry {
    pub fn render(&self) -> String {
        let kind = if self.role.is_participant() {
            "participant"
        } else {
            "observer"
        };
        format!(
            "server.{}={}:{}:{}:{};0.0.0.0:{}",
            self.unit.server_id(),
            self.host,
            SERVER_PORT,
            ELECTION_PORT,
            kind,
            CLIENT_PORT
        )
    }
}

/// TLS posture of a rendered configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsRender {
    pub enabled: bool,
    /// Accept plaintext and TLS on the client port while units switch over
    pub port_unification: bool,
    pub generation: u64,
}

/// Everything needed to render one unit's files.
#[derive(Debug, Clone)]
pub struct RenderInput<'a> {
    pub unit: UnitId,
    pub paths: &'a ConfigPaths,
    pub settings: ServerSettings,
    pub config_version: ConfigVersion,
    pub servers: Vec<ServerEntry>,
    pub credentials: &'a BTreeMap<String, Credential>,
    pub tls: TlsRender,
}

/// Rendered files of one unit.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RenderedConfig {
    pub config_version: ConfigVersion,
    pub tls_generation: u64,
    pub properties: String,
    pub dynamic: String,
    pub jaas: String,
    pub myid: String,
}

impl std::fmt::Debug for RenderedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderedConfig")
            .field("config_version", &self.config_version)
            .field("tls_generation", &self.tls_generation)
            .field("properties", &self.properties)
            .field("dynamic", &self.dynamic)
            .field("myid", &self.myid)
            .finish_non_exhaustive()
    }
}

impl RenderedConfig {
    pub fn render(input: &RenderInput<'_>) -> Self {
        Self {
            config_version: input.config_version,
            tls_generation: input.tls.generation,
            properties: render_properties(input),
            dynamic: render_dynamic(&input.servers, input.config_version),
            jaas: render_jaas(input.credentials),
            myid: input.unit.server_id().to_string(),
        }
    }
}

fn render_properties(input: &RenderInput<'_>) -> String {
    let mut lines: Vec<String> = DEFAULT_PROPERTIES.iter().map(|line| line.to_string()).collect();
    lines.push(format!("dynamicConfigFile={}", input.paths.dynamic().display()));
    lines.push(format!("dataDir={}", input.paths.data_dir.display()));
    lines.push(format!("dataLogDir={}", input.paths.log_dir.display()));
    lines.push(format!("tickTime={}", input.settings.tick_time));
    lines.push(format!("initLimit={}", input.settings.init_limit));
    lines.push(format!("syncLimit={}", input.settings.sync_limit));

    if input.tls.enabled {
        let keystore = input.paths.keystore();
        let truststore = input.paths.truststore();
        lines.push(format!("secureClientPort={}", SECURE_CLIENT_PORT));
        lines.push("serverCnxnFactory=org.apache.zookeeper.server.NettyServerCnxnFactory".to_string());
        lines.push("ssl.clientAuth=none".to_string());
        lines.push("sslQuorum=true".to_string());
        for prefix in ["ssl", "ssl.quorum"] {
            lines.push(format!("{prefix}.keyStore.location={}", keystore.display()));
            lines.push(format!("{prefix}.keyStore.type=PEM"));
            lines.push(format!("{prefix}.trustStore.location={}", truststore.display()));
            lines.push(format!("{prefix}.trustStore.type=PEM"));
        }
    }
    if input.tls.port_unification {
        lines.push("portUnification=true".to_string());
    }

    let mut rendered = lines.join("\n");
    rendered.push('\n');
    rendered
}

fn render_dynamic(servers: &[ServerEntry], version: ConfigVersion) -> String {
    let mut lines: Vec<String> = servers.iter().map(ServerEntry::render).collect();
    lines.push(format!("version={:x}", version.value()));
    let mut rendered = lines.join("\n");
    rendered.push('\n');
    rendered
}

fn render_jaas(credentials: &BTreeMap<String, Credential>) -> String {
    let secret = |user: &str| {
        credentials
            .get(user)
            .map(|credential| credential.current.as_str())
            .unwrap_or_default()
    };
    let sync = secret(SYNC_USER);
    let admin = secret(SUPER_USER);

    format!(
        "QuorumServer {{\n    org.apache.zookeeper.server.auth.DigestLoginModule required\n    user_{SYNC_USER}=\"{sync}\";\n}};\n\n\
         QuorumLearner {{\n    org.apache.zookeeper.server.auth.DigestLoginModule required\n    username=\"{SYNC_USER}\"\n    password=\"{sync}\";\n}};\n\n\
         Server {{\n    org.apache.zookeeper.server.auth.DigestLoginModule required\n    user_{SUPER_USER}=\"{admin}\";\n}};\n"
    )
}

/// Compare strings treating embedded digit runs as numbers.
///
/// ```rust
/// use zkctl_core::natural_cmp;
/// use std::cmp::Ordering;
///
/// assert_eq!(natural_cmp("host-2", "host-10"), Ordering::Less);
/// ```
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let take_number = |chars: &mut std::iter::Peekable<std::str::Chars<'_>>| {
                    let mut digits = String::new();
                    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
                        digits.push(c);
                        chars.next();
                    }
                    digits
                };
                let l_digits = take_number(&mut left);
                let r_digits = take_number(&mut right);
                let l_trimmed = l_digits.trim_start_matches('0');
                let r_trimmed = r_digits.trim_start_matches('0');
                let ordering = l_trimmed
                    .len()
                    .cmp(&r_trimmed.len())
                    .then_with(|| l_trimmed.cmp(r_trimmed))
                    .then_with(|| l_digits.len().cmp(&r_digits.len()));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(l), Some(r)) => {
                if l != r {
                    return l.cmp(&r);
                }
                left.next();
                right.next();
            }
        }
    }
}

/// Comma-joined `host:port` list in natural order.
pub fn connection_string<'a>(hosts: impl IntoIterator<Item = &'a str>, port: u16) -> String {
    let mut addresses: Vec<String> = hosts
        .into_iter()
        .map(|host| format!("{host}:{port}"))
        .collect();
    addresses.sort_by(|a, b| natural_cmp(a, b));
    addresses.dedup();
    addresses.join(",")
}
