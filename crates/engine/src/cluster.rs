//! Cluster registry
//!
//! Loads cluster membership from the catalog the first time a cluster name is
//! referenced and keeps it for the life of the process. Membership edits in
//! the catalog are not picked up automatically; callers evict explicitly
//! (`evict`, `clear`, or `evict_stale`).
//!
//! A catalog entry is a flat option list:
//!
//! ```text
//! node_0              = "host=db0 dbname=app"
//! node_1              = "host=db1 dbname=app"
//! isolation_level     = "repeatable read read only"
//! connection_lifetime = "60"
//! ```
//!
//! User-mapping options (credentials) are appended to every node address.

use shardcall_core::{
    ClusterCatalog, ClusterDefinition, DefinitionKind, Limits, ProxyError, ProxyResult, Stamp,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Prefix of node option labels
pub const NODE_LABEL_PREFIX: &str = "node_";

const OPT_ISOLATION_LEVEL: &str = "isolation_level";
const OPT_CONNECTION_LIFETIME: &str = "connection_lifetime";

/// Parse a node label such as `node_3` into its index.
///
/// # Errors
///
/// - `ParseError` if the label is not `node_` followed by ASCII digits
/// - `OutOfRange` if the index is not below `node_count`
pub fn extract_node_number(label: &str, node_count: usize) -> ProxyResult<usize> {
    let digits = label
        .strip_prefix(NODE_LABEL_PREFIX)
        .ok_or_else(|| ProxyError::parse(label, "expected a node label of the form node_<N>"))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProxyError::parse(
            label,
            "node number must be an unsigned decimal integer",
        ));
    }
    // All digits, so the only possible failure is overflow, which is out of range anyway.
    let index = digits.parse::<u64>().unwrap_or(u64::MAX);
    if index >= node_count as u64 {
        return Err(ProxyError::OutOfRange {
            context: format!("node label '{}'", label),
            index: i64::try_from(index).unwrap_or(i64::MAX),
            node_count,
        });
    }
    Ok(index as usize)
}

/// Transaction mode forwarded to remote nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Statements run outside any remote transaction
    AutoCommit,
    /// Remote work is wrapped in a transaction with these modes
    /// (normalized: lowercase, single spaces)
    Transaction(String),
}

impl IsolationLevel {
    /// Parse an isolation level string.
    ///
    /// Accepts `auto commit` or
    /// `{read committed | repeatable read | serializable} [read write | read only] [[not] deferrable]`,
    /// case-insensitively and with any whitespace between words.
    pub fn parse(input: &str, limits: &Limits) -> Result<IsolationLevel, String> {
        let words: Vec<String> = input
            .split_whitespace()
            .map(|w| w.to_ascii_lowercase())
            .collect();
        let normalized = words.join(" ");
        limits
            .check_isolation_level(&normalized)
            .map_err(|e| e.to_string())?;

        if normalized == "auto commit" {
            return Ok(IsolationLevel::AutoCommit);
        }

        let mut rest: &[String] = &words;
        let level_found = ["read committed", "repeatable read", "serializable"]
            .iter()
            .any(|phrase| take_phrase(&mut rest, phrase));
        if !level_found {
            return Err(
                "expected 'auto commit', 'read committed', 'repeatable read' or 'serializable'"
                    .to_string(),
            );
        }
        let _ = take_phrase(&mut rest, "read write") || take_phrase(&mut rest, "read only");
        let _ = take_phrase(&mut rest, "deferrable") || take_phrase(&mut rest, "not deferrable");
        if !rest.is_empty() {
            return Err(format!("unexpected '{}'", rest.join(" ")));
        }
        Ok(IsolationLevel::Transaction(normalized))
    }

    /// Statement that opens a remote transaction, `None` for auto commit
    pub fn begin_statement(&self) -> Option<String> {
        match self {
            IsolationLevel::AutoCommit => None,
            IsolationLevel::Transaction(modes) => {
                Some(format!("begin transaction isolation level {}", modes))
            }
        }
    }

    /// True when remote work is never wrapped in a transaction
    pub fn is_auto_commit(&self) -> bool {
        matches!(self, IsolationLevel::AutoCommit)
    }
}

fn take_phrase(rest: &mut &[String], phrase: &str) -> bool {
    let wanted: Vec<&str> = phrase.split(' ').collect();
    if rest.len() >= wanted.len() && rest.iter().zip(&wanted).all(|(a, b)| a == b) {
        *rest = &rest[wanted.len()..];
        true
    } else {
        false
    }
}

/// A loaded cluster
#[derive(Debug)]
pub struct Cluster {
    id: u32,
    name: String,
    nodes: Vec<String>,
    isolation_level: IsolationLevel,
    connection_lifetime: Option<Duration>,
    stamp: Stamp,
}

impl Cluster {
    /// Catalog id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Address of node `index` (credentials included)
    pub fn node_address(&self, index: usize) -> Option<&str> {
        self.nodes.get(index).map(String::as_str)
    }

    /// Transaction mode for remote work
    pub fn isolation_level(&self) -> &IsolationLevel {
        &self.isolation_level
    }

    /// Maximum age of a pooled connection; `None` never expires
    pub fn connection_lifetime(&self) -> Option<Duration> {
        self.connection_lifetime
    }

    /// Catalog version this cluster was loaded from
    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    /// Validate a node index against this cluster.
    ///
    /// # Errors
    ///
    /// `OutOfRange` unless `0 <= index < node_count`.
    pub fn check_node(&self, index: i64) -> ProxyResult<usize> {
        match usize::try_from(index) {
            Ok(i) if i < self.nodes.len() => Ok(i),
            _ => Err(ProxyError::OutOfRange {
                context: format!("cluster '{}'", self.name),
                index,
                node_count: self.nodes.len(),
            }),
        }
    }
}

/// Defaults applied to clusters that omit an option
#[derive(Debug, Clone)]
pub struct ClusterDefaults {
    /// Isolation level when `isolation_level` is absent
    pub isolation_level: IsolationLevel,
    /// Lifetime when `connection_lifetime` is absent
    pub connection_lifetime: Option<Duration>,
}

impl Default for ClusterDefaults {
    fn default() -> Self {
        ClusterDefaults {
            isolation_level: IsolationLevel::Transaction("read committed".to_string()),
            connection_lifetime: None,
        }
    }
}

/// Interpret a catalog entry.
pub fn build_cluster(
    def: &ClusterDefinition,
    limits: &Limits,
    defaults: &ClusterDefaults,
) -> ProxyResult<Cluster> {
    let invalid = |reason: String| ProxyError::invalid(DefinitionKind::Cluster, &def.name, reason);

    let mut isolation_level = defaults.isolation_level.clone();
    let mut connection_lifetime = defaults.connection_lifetime;
    let mut nodes: BTreeMap<usize, &str> = BTreeMap::new();

    for (key, value) in &def.options {
        match key.as_str() {
            OPT_ISOLATION_LEVEL => {
                isolation_level = IsolationLevel::parse(value, limits)
                    .map_err(|reason| invalid(format!("isolation_level: {}", reason)))?;
            }
            OPT_CONNECTION_LIFETIME => {
                let secs = value.trim().parse::<u64>().map_err(|_| {
                    invalid(format!(
                        "connection_lifetime '{}' is not a whole number of seconds",
                        value
                    ))
                })?;
                connection_lifetime = Some(Duration::from_secs(secs));
            }
            label => {
                let index = extract_node_number(label, limits.max_nodes)
                    .map_err(|e| invalid(format!("option '{}': {}", label, e)))?;
                if nodes.insert(index, value.as_str()).is_some() {
                    return Err(invalid(format!("node {} is defined twice", index)));
                }
            }
        }
    }

    if nodes.is_empty() {
        return Err(invalid("cluster has no nodes".to_string()));
    }
    limits
        .check_nodes(nodes.len())
        .map_err(|e| invalid(e.to_string()))?;

    let credentials: String = def
        .user_options
        .iter()
        .map(|(k, v)| format!(" {}={}", k, v))
        .collect();

    let mut addresses = Vec::with_capacity(nodes.len());
    for (expected, (index, dsn)) in nodes.into_iter().enumerate() {
        if index != expected {
            return Err(invalid(format!("node_{} is missing", expected)));
        }
        let address = format!("{}{}", dsn.trim(), credentials);
        limits
            .check_address(&address)
            .map_err(|e| invalid(format!("node_{}: {}", index, e)))?;
        addresses.push(address);
    }

    Ok(Cluster {
        id: def.id,
        name: def.name.clone(),
        nodes: addresses,
        isolation_level,
        connection_lifetime,
        stamp: def.stamp,
    })
}

/// Process-scoped cache of clusters by name
pub struct ClusterRegistry {
    clusters: HashMap<String, Arc<Cluster>>,
    limits: Limits,
    defaults: ClusterDefaults,
}

impl ClusterRegistry {
    /// Empty registry
    pub fn new(limits: Limits, defaults: ClusterDefaults) -> Self {
        ClusterRegistry {
            clusters: HashMap::new(),
            limits,
            defaults,
        }
    }

    /// Return the cached cluster or load it from the catalog.
    ///
    /// # Errors
    ///
    /// - `DefinitionNotFound` if the catalog has no such cluster
    /// - `DefinitionInvalid` if its options are malformed
    pub fn get(&mut self, name: &str, catalog: &dyn ClusterCatalog) -> ProxyResult<Arc<Cluster>> {
        if let Some(cluster) = self.clusters.get(name) {
            return Ok(Arc::clone(cluster));
        }
        let def = catalog
            .load_cluster(name)?
            .ok_or_else(|| ProxyError::not_found(DefinitionKind::Cluster, name))?;
        let cluster = Arc::new(build_cluster(&def, &self.limits, &self.defaults)?);
        info!(
            target: "shardcall::cluster",
            cluster = name,
            nodes = cluster.node_count(),
            "Cluster loaded"
        );
        self.clusters.insert(name.to_string(), Arc::clone(&cluster));
        Ok(cluster)
    }

    /// Cached cluster, without loading
    pub fn lookup(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.get(name).cloned()
    }

    /// Drop one cluster; returns whether it was cached
    pub fn evict(&mut self, name: &str) -> bool {
        self.clusters.remove(name).is_some()
    }

    /// Drop every cluster whose catalog stamp changed or that no longer
    /// exists. Returns the number evicted.
    pub fn evict_stale(&mut self, catalog: &dyn ClusterCatalog) -> ProxyResult<usize> {
        let mut stale = Vec::new();
        for (name, cluster) in &self.clusters {
            let current = catalog.cluster_stamp(name)?;
            if current.map_or(true, |s| !cluster.stamp().matches(&s)) {
                stale.push(name.clone());
            }
        }
        for name in &stale {
            debug!(target: "shardcall::cluster", cluster = %name, "Evicting stale cluster");
            self.clusters.remove(name);
        }
        Ok(stale.len())
    }

    /// Drop every cluster
    pub fn clear(&mut self) {
        self.clusters.clear();
    }

    /// Number of cached clusters
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}
