/*!
Process-wide pooled HTTP clients, keyed by (proxy URL, timeout). reqwest
clients hold their own connection pools, so sharing one per configuration
tuple keeps sockets warm across fetches and provider calls.
*/

use anyhow::{Context, Result};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

const USER_AGENT: &str = concat!("Feedmill/", env!("CARGO_PKG_VERSION"));

/// A browser-like User-Agent used by the Cloudflare fallback path.
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    proxy: Option<String>,
    timeout_secs: u64,
    browser_like: bool,
}

fn registry() -> &'static Mutex<HashMap<PoolKey, Client>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PoolKey, Client>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn build(key: &PoolKey) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(Duration::from_secs(key.timeout_secs))
        .gzip(true)
        .brotli(true)
        .user_agent(if key.browser_like {
            BROWSER_USER_AGENT
        } else {
            USER_AGENT
        });
    if let Some(proxy) = &key.proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy).context("invalid proxy URL")?);
    }
    builder.build().context("failed to build HTTP client")
}

fn get(key: PoolKey) -> Result<Client> {
    let mut map = registry().lock().expect("http client registry poisoned");
    if let Some(client) = map.get(&key) {
        return Ok(client.clone());
    }
    let client = build(&key)?;
    map.insert(key, client.clone());
    Ok(client)
}

/// Standard client for the given proxy/timeout tuple.
pub fn client(proxy: Option<&str>, timeout_secs: u64) -> Result<Client> {
    get(PoolKey {
        proxy: proxy.map(str::to_string),
        timeout_secs,
        browser_like: false,
    })
}

/// Browser-impersonating client used when a fetch hits a Cloudflare
/// challenge; same pooling rules.
pub fn browser_client(proxy: Option<&str>, timeout_secs: u64) -> Result<Client> {
    get(PoolKey {
        proxy: proxy.map(str::to_string),
        timeout_secs,
        browser_like: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clients_build_for_each_tuple() {
        client(None, 30).unwrap();
        client(None, 60).unwrap();
        browser_client(None, 30).unwrap();
        assert!(client(Some("not a proxy url"), 30).is_err());
    }
}
