//! Server endpoints and the coordination-service listener surface.
//!
//! The coordination client itself (ZooKeeper or similar) stays outside this
//! crate; it is handed a [`ServerListListener`] and feeds it the published
//! cache-server list as UTF-8 bytes in the form `"host:port,host:port"`.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{bail, Context};

use crate::client::MemcachedClient;

/// One cache server endpoint. Identity is structural: two addresses with
/// the same host string and port are the same server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stable textual identity, also the seed for virtual-node tokens.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = anyhow::Error;

    /// The last colon splits host from port, which keeps bracketless IPv6
    /// entries like `::1:11211` parseable.
    fn from_str(raw: &str) -> anyhow::Result<Self> {
        let colon = match raw.rfind(':') {
            Some(idx) if idx >= 1 => idx,
            _ => bail!("invalid server entry {raw:?}"),
        };
        let host = &raw[..colon];
        let port: u16 = raw[colon + 1..]
            .parse()
            .with_context(|| format!("invalid port in server entry {raw:?}"))?;
        Ok(ServerAddress::new(host, port))
    }
}

/// Parse `"host:port,host2:port"` (commas or spaces as separators).
pub fn parse_server_list(list: &str) -> anyhow::Result<HashSet<ServerAddress>> {
    if list.trim().is_empty() {
        bail!("no hosts in server list");
    }
    let mut servers = HashSet::new();
    for entry in list.split([',', ' ']) {
        if entry.is_empty() {
            continue;
        }
        servers.insert(entry.parse::<ServerAddress>()?);
    }
    Ok(servers)
}

/// Render a server set back into the published list form.
pub fn format_server_list<'a>(servers: impl IntoIterator<Item = &'a ServerAddress>) -> String {
    let mut entries: Vec<String> = servers.into_iter().map(ServerAddress::identity).collect();
    entries.sort();
    entries.join(",")
}

/// Callbacks the coordination client invokes with the published list.
pub trait ServerListListener: Send + Sync {
    fn on_init(&self, path: &str, data: &[u8]);
    fn on_commit(&self, path: &str, data: &[u8]);
    fn on_destroy(&self, path: &str);
}

/// Keeps a client's server set synchronized with the coordination service.
///
/// With `prefer_remote_config` the locally configured list is discarded in
/// favor of the published one on init; otherwise init only cross-checks the
/// two and warns on divergence, and commits apply the difference.
pub struct CacheServerListListener {
    client: MemcachedClient,
    local: Mutex<HashSet<ServerAddress>>,
    prefer_remote_config: bool,
    /// Callbacks arrive on the coordination client's own threads; membership
    /// changes are dispatched back onto the client's runtime.
    runtime: tokio::runtime::Handle,
}

impl CacheServerListListener {
    pub(crate) fn new(
        client: MemcachedClient,
        local: HashSet<ServerAddress>,
        prefer_remote_config: bool,
    ) -> Self {
        Self {
            client,
            local: Mutex::new(local),
            prefer_remote_config,
            runtime: tokio::runtime::Handle::current(),
        }
    }

    fn apply_remote(&self, remote: HashSet<ServerAddress>) {
        let (added, removed) = {
            let mut local = self.local.lock().unwrap();
            let added: Vec<ServerAddress> = remote.difference(&local).cloned().collect();
            let removed: Vec<ServerAddress> = local.difference(&remote).cloned().collect();
            *local = remote;
            (added, removed)
        };
        for address in added {
            let client = self.client.clone();
            self.runtime.spawn(async move {
                client.add_server(&address).await;
            });
        }
        for address in removed {
            let client = self.client.clone();
            self.runtime.spawn(async move {
                client.remove_server(&address).await;
            });
        }
    }
}

impl ServerListListener for CacheServerListListener {
    fn on_init(&self, path: &str, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let Ok(text) = std::str::from_utf8(data) else {
            tracing::warn!(path, "published server list is not valid UTF-8");
            return;
        };
        let remote = match parse_server_list(text) {
            Ok(remote) => remote,
            Err(err) => {
                tracing::warn!(path, error = ?err, "failed to parse published server list");
                return;
            }
        };
        if self.prefer_remote_config {
            tracing::info!(path, list = %text, "applying remote server list, local config ignored");
            self.apply_remote(remote);
            return;
        }
        let local = self.local.lock().unwrap();
        if *local != remote {
            tracing::warn!(
                path,
                local = %format_server_list(local.iter()),
                remote = %text,
                "local and remote server lists differ; remote information ignored"
            );
        } else {
            tracing::info!(path, list = %text, "server list confirmed");
        }
    }

    fn on_commit(&self, path: &str, data: &[u8]) {
        if data.is_empty() {
            tracing::warn!(path, "published server list update is empty");
            return;
        }
        let Ok(text) = std::str::from_utf8(data) else {
            tracing::warn!(path, "published server list is not valid UTF-8");
            return;
        };
        match parse_server_list(text) {
            Ok(remote) if !remote.is_empty() => self.apply_remote(remote),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(path, error = ?err, "failed to apply published server list");
            }
        }
    }

    fn on_destroy(&self, path: &str) {
        tracing::debug!(path, "server list barrier destroyed");
    }
}
