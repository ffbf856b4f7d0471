//! Subscription records and the parser seam used to turn a subscription URL
//! into nodes.

pub mod parser;
pub mod refresh;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::registry::Node;

pub use self::parser::HttpSubscriptionParser;
pub use self::refresh::SubscriptionRefresher;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub url: String,
    /// Nodes imported by the last successful refresh.
    pub node_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("sub-{}", uuid::Uuid::new_v4()),
            name: name.into(),
            url: url.into(),
            node_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-link parse counters. `failed` is keyed by link scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    pub total: usize,
    pub success: usize,
    pub failed: HashMap<String, usize>,
}

impl ParseStats {
    pub fn failed_total(&self) -> usize {
        self.failed.values().sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSubscription {
    pub nodes: Vec<Node>,
    pub stats: ParseStats,
}

/// Fetches and decodes one subscription.
///
/// An `Err` means the subscription as a whole could not be read; links
/// that fail individually are counted in [`ParseStats`] instead.
#[async_trait]
pub trait SubscriptionParser: Send + Sync {
    async fn parse(&self, url: &str) -> Result<ParsedSubscription>;
}

/// In-memory set of subscriptions, keyed by id.
#[derive(Debug, Default)]
pub struct SubscriptionBook {
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest first.
    pub async fn all(&self) -> Vec<Subscription> {
        let subs = self.subscriptions.read().await;
        let mut all: Vec<Subscription> = subs.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub async fn get(&self, id: &str) -> Option<Subscription> {
        self.subscriptions.read().await.get(id).cloned()
    }

    /// Add a subscription, rejecting a URL that is already registered.
    pub async fn add(&self, subscription: Subscription) -> Result<()> {
        let mut subs = self.subscriptions.write().await;
        if subs.values().any(|s| s.url == subscription.url) {
            anyhow::bail!("subscription URL '{}' is already registered", subscription.url);
        }
        subs.insert(subscription.id.clone(), subscription);
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Option<Subscription> {
        self.subscriptions.write().await.remove(id)
    }

    /// Record a successful refresh.
    pub async fn mark_refreshed(&self, id: &str, node_count: usize) -> bool {
        let mut subs = self.subscriptions.write().await;
        match subs.get_mut(id) {
            Some(sub) => {
                sub.node_count = node_count;
                sub.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn replace_all(&self, subscriptions: Vec<Subscription>) {
        let mut subs = self.subscriptions.write().await;
        subs.clear();
        for sub in subscriptions {
            subs.insert(sub.id.clone(), sub);
        }
    }

    pub async fn len(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscriptions.read().await.is_empty()
    }
}
