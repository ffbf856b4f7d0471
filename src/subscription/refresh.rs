//! Re-import every subscription into the node registry.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{info, warn};

use super::{Subscription, SubscriptionBook, SubscriptionParser};
use crate::registry::NodeRegistry;
use crate::storage::Persister;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub subscriptions: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub nodes_imported: usize,
}

pub struct SubscriptionRefresher {
    book: Arc<SubscriptionBook>,
    registry: Arc<NodeRegistry>,
    parser: Arc<dyn SubscriptionParser>,
    persister: Persister,
}

impl SubscriptionRefresher {
    pub fn new(
        book: Arc<SubscriptionBook>,
        registry: Arc<NodeRegistry>,
        parser: Arc<dyn SubscriptionParser>,
        persister: Persister,
    ) -> Self {
        Self {
            book,
            registry,
            parser,
            persister,
        }
    }

    /// Refresh every subscription, then save.
    ///
    /// A subscription that fails is logged and skipped. The call only fails
    /// when every subscription failed, or when saving fails.
    pub async fn refresh_all(&self) -> Result<RefreshSummary> {
        let subscriptions = self.book.all().await;
        let mut summary = RefreshSummary {
            subscriptions: subscriptions.len(),
            ..Default::default()
        };
        info!(subscriptions = summary.subscriptions, "Refreshing subscriptions");

        for sub in &subscriptions {
            match self.refresh(sub).await {
                Ok(imported) => {
                    summary.refreshed += 1;
                    summary.nodes_imported += imported;
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(subscription_id = %sub.id, url = %sub.url, error = %format!("{:#}", e), "Subscription refresh failed");
                }
            }
        }

        if summary.refreshed == 0 && summary.failed > 0 {
            bail!("all {} subscriptions failed to refresh", summary.failed);
        }

        self.persister.save().await?;
        info!(
            refreshed = summary.refreshed,
            failed = summary.failed,
            nodes = summary.nodes_imported,
            "Subscription refresh complete"
        );
        Ok(summary)
    }

    async fn refresh(&self, sub: &Subscription) -> Result<usize> {
        let parsed = self.parser.parse(&sub.url).await?;
        let imported = parsed.nodes.len();

        for mut node in parsed.nodes {
            node.subscription_id = Some(sub.id.clone());
            node.group = sub.name.clone();

            // A node seen before keeps its measured health.
            let fresh = node.clone();
            let merged = self
                .registry
                .update(&node.id, move |existing| {
                    let mut fresh = fresh;
                    fresh.inherit_health(existing);
                    *existing = fresh;
                })
                .await;
            if !merged {
                self.registry.upsert(node).await;
            }
        }

        self.book.mark_refreshed(&sub.id, imported).await;
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Node, Protocol};
    use crate::storage::{MemoryStore, Store};
    use crate::subscription::ParsedSubscription;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;

    /// Serves canned node lists by URL; unknown URLs fail.
    struct CannedParser {
        bodies: HashMap<String, Vec<Node>>,
    }

    #[async_trait]
    impl SubscriptionParser for CannedParser {
        async fn parse(&self, url: &str) -> Result<ParsedSubscription> {
            match self.bodies.get(url) {
                Some(nodes) => Ok(ParsedSubscription {
                    nodes: nodes.clone(),
                    ..Default::default()
                }),
                None => bail!("connection refused"),
            }
        }
    }

    struct Fixture {
        book: Arc<SubscriptionBook>,
        registry: Arc<NodeRegistry>,
        store: Arc<MemoryStore>,
        refresher: SubscriptionRefresher,
    }

    fn fixture(bodies: Vec<(&str, Vec<Node>)>) -> Fixture {
        let book = Arc::new(SubscriptionBook::new());
        let registry = Arc::new(NodeRegistry::new());
        let store = Arc::new(MemoryStore::default());
        let parser = CannedParser {
            bodies: bodies.into_iter().map(|(u, n)| (u.to_string(), n)).collect(),
        };
        let persister = Persister::new(store.clone(), registry.clone(), book.clone());
        let refresher = SubscriptionRefresher::new(book.clone(), registry.clone(), Arc::new(parser), persister);
        Fixture {
            book,
            registry,
            store,
            refresher,
        }
    }

    #[tokio::test]
    async fn test_refresh_imports_and_keeps_health() {
        let a = Node::new(Protocol::Trojan, "a.example.net", 443);
        let b = Node::new(Protocol::Vmess, "b.example.net", 8443);
        let f = fixture(vec![("https://sub.example/1", vec![a.clone(), b.clone()])]);
        let sub = Subscription::new("main", "https://sub.example/1");
        let sub_id = sub.id.clone();
        f.book.add(sub).await.unwrap();

        let mut measured = a.clone();
        measured.latency_ms = 120;
        measured.download_speed = 4.5;
        measured.last_tested_at = Some(Utc::now());
        f.registry.upsert(measured).await;

        let summary = f.refresher.refresh_all().await.unwrap();
        assert_eq!(summary.refreshed, 1);
        assert_eq!(summary.nodes_imported, 2);

        let kept = f.registry.get(&a.id).await.unwrap();
        assert_eq!(kept.latency_ms, 120);
        assert!(kept.is_tested());
        assert_eq!(kept.subscription_id.as_deref(), Some(sub_id.as_str()));
        assert_eq!(kept.group, "main");
        assert!(!f.registry.get(&b.id).await.unwrap().is_tested());

        assert_eq!(f.book.get(&sub_id).await.unwrap().node_count, 2);
        assert_eq!(f.store.load().unwrap().nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_rest() {
        let a = Node::new(Protocol::Trojan, "a.example.net", 443);
        let f = fixture(vec![("https://sub.example/ok", vec![a])]);
        f.book.add(Subscription::new("broken", "https://sub.example/down")).await.unwrap();
        f.book.add(Subscription::new("ok", "https://sub.example/ok")).await.unwrap();

        let summary = f.refresher.refresh_all().await.unwrap();
        assert_eq!(summary.subscriptions, 2);
        assert_eq!(summary.refreshed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(f.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_all_failing_is_an_error() {
        let f = fixture(vec![]);
        f.book.add(Subscription::new("broken", "https://sub.example/down")).await.unwrap();
        assert!(f.refresher.refresh_all().await.is_err());
    }

    #[tokio::test]
    async fn test_no_subscriptions_is_ok() {
        let f = fixture(vec![]);
        let summary = f.refresher.refresh_all().await.unwrap();
        assert_eq!(summary, RefreshSummary::default());
    }
}
