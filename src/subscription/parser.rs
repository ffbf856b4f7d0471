//! Share-link subscription parser.
//!
//! A subscription body is a newline-separated list of share links, either
//! plain or wrapped in one layer of base64. Supported schemes: `vmess`,
//! `vless`, `ss`, `trojan`, `hysteria2` (alias `hy2`).

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use tracing::{debug, info};
use url::Url;

use super::{ParsedSubscription, SubscriptionParser};
use crate::registry::{Node, Protocol};

/// Used when a link carries no explicit port.
const DEFAULT_PORT: u16 = 443;

pub struct HttpSubscriptionParser {
    client: reqwest::Client,
}

impl HttpSubscriptionParser {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nodepulse/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build subscription HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SubscriptionParser for HttpSubscriptionParser {
    async fn parse(&self, url: &str) -> Result<ParsedSubscription> {
        let body = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch subscription {}", url))?
            .error_for_status()
            .with_context(|| format!("Subscription {} returned an error status", url))?
            .text()
            .await
            .with_context(|| format!("Failed to read subscription body from {}", url))?;

        let parsed = parse_body(&body)?;
        info!(
            url,
            total = parsed.stats.total,
            success = parsed.stats.success,
            failed = ?parsed.stats.failed,
            "Subscription parsed"
        );
        Ok(parsed)
    }
}

/// Decode a subscription body into nodes. Links that fail to parse are
/// counted per scheme and skipped; duplicate endpoints keep the first link.
pub fn parse_body(body: &str) -> Result<ParsedSubscription> {
    let text = if body.contains("://") {
        body.to_string()
    } else {
        let decoded = decode_base64(body).context("Subscription body is neither links nor base64")?;
        String::from_utf8(decoded).context("Decoded subscription body is not UTF-8")?
    };

    let mut parsed = ParsedSubscription::default();
    let mut seen = HashSet::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        parsed.stats.total += 1;
        match parse_link(line) {
            Ok(node) => {
                parsed.stats.success += 1;
                if seen.insert(node.id.clone()) {
                    parsed.nodes.push(node);
                }
            }
            Err(e) => {
                let scheme = scheme_of(line).unwrap_or("unknown").to_ascii_lowercase();
                debug!(scheme = %scheme, error = %e, "Skipping share link");
                *parsed.stats.failed.entry(scheme).or_insert(0) += 1;
            }
        }
    }
    Ok(parsed)
}

/// Parse one share link into an untested node.
pub fn parse_link(link: &str) -> Result<Node> {
    let scheme = scheme_of(link).ok_or_else(|| anyhow!("not a share link"))?;
    let protocol = Protocol::from_scheme(scheme);
    match protocol {
        Protocol::Vmess => parse_vmess(&link[scheme.len() + 3..]),
        Protocol::Shadowsocks => parse_shadowsocks(&link[scheme.len() + 3..]),
        Protocol::Vless | Protocol::Trojan | Protocol::Hysteria2 => parse_url_link(protocol, link),
        Protocol::Unknown => bail!("unsupported scheme '{}'", scheme),
    }
}

fn scheme_of(link: &str) -> Option<&str> {
    link.find("://").map(|i| &link[..i])
}

/// Accepts standard or URL-safe alphabets, padded or not.
fn decode_base64(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();
    general_purpose::STANDARD_NO_PAD
        .decode(cleaned.trim_end_matches('='))
        .context("invalid base64")
}

fn decode_alias(fragment: &str) -> String {
    urlencoding::decode(fragment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| fragment.to_string())
}

fn finish(protocol: Protocol, address: &str, port: u16, alias: String) -> Result<Node> {
    let address = address.trim_start_matches('[').trim_end_matches(']');
    if address.is_empty() {
        bail!("missing server address");
    }
    if port == 0 {
        bail!("invalid port 0");
    }
    let mut node = Node::new(protocol, address, port);
    node.alias = if alias.is_empty() { node.endpoint() } else { alias };
    Ok(node)
}

fn parse_vmess(payload: &str) -> Result<Node> {
    let decoded = decode_base64(payload)?;
    let info: serde_json::Value = serde_json::from_slice(&decoded).context("vmess payload is not JSON")?;

    let address = info["add"].as_str().ok_or_else(|| anyhow!("vmess link has no 'add'"))?;
    // Clients emit the port as either a number or a string.
    let port = match &info["port"] {
        serde_json::Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| anyhow!("vmess link has no valid 'port'"))?;
    let alias = info["ps"].as_str().unwrap_or_default().to_string();

    finish(Protocol::Vmess, address, port, alias)
}

/// Both `ss://base64(method:pass@host:port)#tag` and
/// `ss://base64(method:pass)@host:port#tag`.
fn parse_shadowsocks(payload: &str) -> Result<Node> {
    let (body, alias) = match payload.split_once('#') {
        Some((body, tag)) => (body, decode_alias(tag)),
        None => (payload, String::new()),
    };

    if body.contains('@') {
        let url = Url::parse(&format!("ss://{}", body)).context("invalid ss link")?;
        let host = url.host_str().ok_or_else(|| anyhow!("ss link has no host"))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);
        return finish(Protocol::Shadowsocks, host, port, alias);
    }

    let decoded = String::from_utf8(decode_base64(body)?).context("ss payload is not UTF-8")?;
    let (_, server) = decoded
        .rsplit_once('@')
        .ok_or_else(|| anyhow!("ss payload has no server part"))?;
    let (host, port) = server
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("ss server part has no port"))?;
    let port: u16 = port.trim().parse().context("ss port is not a number")?;
    finish(Protocol::Shadowsocks, host, port, alias)
}

fn parse_url_link(protocol: Protocol, link: &str) -> Result<Node> {
    let url = Url::parse(link).with_context(|| format!("invalid {} link", protocol))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("{} link has no host", protocol))?;
    let port = url.port().unwrap_or(DEFAULT_PORT);
    let alias = url.fragment().map(decode_alias).unwrap_or_default();
    finish(protocol, host, port, alias)
}
