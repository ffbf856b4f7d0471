//! In-memory node registry shared by the probe engine, the subscription
//! refresher, and the status recorder.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::FilterConfig;

/// Proxy protocol of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Shadowsocks,
    Trojan,
    Hysteria2,
    Unknown,
}

impl Protocol {
    /// Map a share-link scheme (`vmess`, `ss`, `hy2`, ...) to a protocol.
    pub fn from_scheme(scheme: &str) -> Self {
        match scheme.to_ascii_lowercase().as_str() {
            "vmess" => Protocol::Vmess,
            "vless" => Protocol::Vless,
            "ss" | "shadowsocks" => Protocol::Shadowsocks,
            "trojan" => Protocol::Trojan,
            "hysteria2" | "hy2" => Protocol::Hysteria2,
            _ => Protocol::Unknown,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Vmess => write!(f, "vmess"),
            Protocol::Vless => write!(f, "vless"),
            Protocol::Shadowsocks => write!(f, "shadowsocks"),
            Protocol::Trojan => write!(f, "trojan"),
            Protocol::Hysteria2 => write!(f, "hysteria2"),
            Protocol::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Protocol::from_scheme(s))
    }
}

/// A probe target and its last-known health.
///
/// `latency_ms` and `download_speed` are only meaningful while
/// `last_tested_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub protocol: Protocol,
    pub alias: String,
    pub address: String,
    pub port: u16,
    pub subscription_id: Option<String>,
    pub group: String,
    /// Connect latency in ms, 0 = untested.
    pub latency_ms: u32,
    /// Download speed in MB/s, 0 = untested.
    pub download_speed: f64,
    /// None = never fully tested.
    pub last_tested_at: Option<DateTime<Utc>>,
}

impl Node {
    /// Build an untested node whose id is derived from its endpoint.
    pub fn new(protocol: Protocol, address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        Self {
            id: Self::stable_id(protocol, &address, port),
            protocol,
            alias: String::new(),
            address,
            port,
            subscription_id: None,
            group: String::new(),
            latency_ms: 0,
            download_speed: 0.0,
            last_tested_at: None,
        }
    }

    /// Identity and dedup key: `protocol-address-port`.
    pub fn stable_id(protocol: Protocol, address: &str, port: u16) -> String {
        format!("{}-{}-{}", protocol, address.to_ascii_lowercase(), port)
    }

    pub fn is_tested(&self) -> bool {
        self.last_tested_at.is_some()
    }

    /// `address:port`, bracketing bare IPv6 literals.
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Tested, and within the filter's latency and speed bounds.
    pub fn passes(&self, filter: &FilterConfig) -> bool {
        self.is_tested()
            && self.latency_ms <= filter.max_latency_ms
            && self.download_speed >= filter.min_speed
    }

    /// Copy the health fields from `other` onto `self`.
    pub fn inherit_health(&mut self, other: &Node) {
        self.latency_ms = other.latency_ms;
        self.download_speed = other.download_speed;
        self.last_tested_at = other.last_tested_at;
    }
}

// ---------------------------------------------------------------------------
// NodeRegistry
// ---------------------------------------------------------------------------

/// Thread-safe map of node id to [`Node`].
///
/// Readers always get clones, so a partially-updated node is never
/// observed. The lock is never held across I/O.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every node, sorted by id.
    pub async fn all(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        let mut all: Vec<Node> = nodes.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Nodes with a non-empty `last_tested_at`.
    pub async fn tested(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        let mut tested: Vec<Node> = nodes.values().filter(|n| n.is_tested()).cloned().collect();
        tested.sort_by(|a, b| a.id.cmp(&b.id));
        tested
    }

    /// Tested nodes passing `filter`, fastest first.
    pub async fn filtered(&self, filter: &FilterConfig) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        let mut passing: Vec<Node> = nodes.values().filter(|n| n.passes(filter)).cloned().collect();
        passing.sort_by(|a, b| {
            b.download_speed
                .partial_cmp(&a.download_speed)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        passing
    }

    pub async fn get(&self, id: &str) -> Option<Node> {
        self.nodes.read().await.get(id).cloned()
    }

    /// Insert or replace a node by id.
    pub async fn upsert(&self, node: Node) {
        self.nodes.write().await.insert(node.id.clone(), node);
    }

    /// Mutate a node in place. Returns false when the id is unknown.
    pub async fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Node),
    {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(id) {
            Some(node) => {
                f(node);
                true
            }
            None => false,
        }
    }

    pub async fn delete(&self, id: &str) -> Option<Node> {
        self.nodes.write().await.remove(id)
    }

    /// Replace the whole registry, used once at startup.
    pub async fn replace_all(&self, nodes: Vec<Node>) {
        let mut map = self.nodes.write().await;
        map.clear();
        for node in nodes {
            map.insert(node.id.clone(), node);
        }
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tested_node(address: &str, latency_ms: u32, speed: f64) -> Node {
        let mut node = Node::new(Protocol::Trojan, address, 443);
        node.latency_ms = latency_ms;
        node.download_speed = speed;
        node.last_tested_at = Some(Utc::now());
        node
    }

    #[test]
    fn test_stable_id_is_case_insensitive_on_address() {
        let a = Node::new(Protocol::Vmess, "Edge.Example.com", 443);
        let b = Node::new(Protocol::Vmess, "edge.example.com", 443);
        assert_eq!(a.id, b.id);
        assert_eq!(a.id, "vmess-edge.example.com-443");
    }

    #[test]
    fn test_endpoint_brackets_ipv6() {
        let v6 = Node::new(Protocol::Shadowsocks, "2001:db8::1", 8388);
        assert_eq!(v6.endpoint(), "[2001:db8::1]:8388");
        let v4 = Node::new(Protocol::Shadowsocks, "10.0.0.1", 8388);
        assert_eq!(v4.endpoint(), "10.0.0.1:8388");
    }

    #[test]
    fn test_protocol_from_scheme_aliases() {
        assert_eq!(Protocol::from_scheme("ss"), Protocol::Shadowsocks);
        assert_eq!(Protocol::from_scheme("HY2"), Protocol::Hysteria2);
        assert_eq!(Protocol::from_scheme("socks5"), Protocol::Unknown);
    }

    #[tokio::test]
    async fn test_tested_excludes_never_tested_nodes() {
        let registry = NodeRegistry::new();
        registry.upsert(Node::new(Protocol::Vmess, "a.example", 443)).await;
        registry.upsert(tested_node("b.example", 120, 3.0)).await;

        assert_eq!(registry.len().await, 2);
        let tested = registry.tested().await;
        assert_eq!(tested.len(), 1);
        assert_eq!(tested[0].address, "b.example");
    }

    #[tokio::test]
    async fn test_filtered_applies_thresholds() {
        let registry = NodeRegistry::new();
        registry.upsert(tested_node("fast.example", 80, 5.0)).await;
        registry.upsert(tested_node("slow.example", 80, 0.4)).await;
        registry.upsert(tested_node("far.example", 650, 9.0)).await;
        registry.upsert(Node::new(Protocol::Trojan, "new.example", 443)).await;

        let passing = registry.filtered(&FilterConfig::default()).await;
        assert_eq!(passing.len(), 1);
        assert_eq!(passing[0].address, "fast.example");
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let registry = NodeRegistry::new();
        let node = Node::new(Protocol::Vless, "c.example", 443);
        let id = node.id.clone();
        registry.upsert(node).await;

        assert!(registry.update(&id, |n| n.latency_ms = 42).await);
        assert_eq!(registry.get(&id).await.unwrap().latency_ms, 42);
        assert!(!registry.update("missing", |n| n.latency_ms = 1).await);

        assert!(registry.delete(&id).await.is_some());
        assert!(registry.get(&id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_distinct_keys() {
        let registry = Arc::new(NodeRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32u16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .upsert(Node::new(Protocol::Trojan, format!("n{}.example", i), 443))
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(registry.all().await.len(), 32);
    }
}
