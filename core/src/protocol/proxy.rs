//! Discovery proxies — foreign service-discovery protocols feeding the cache
//!
//! The leader of a network starts every registered proxy when it takes the
//! role. A search runs in the background; whatever it finds is registered as
//! this node's services and announced like any local change.

use async_trait::async_trait;

use crate::cache::Service;
use crate::error::MsdResult;

#[async_trait]
pub trait DiscoveryProxy: Send + Sync {
    /// Short protocol name for logs ("slp", "sdp")
    fn name(&self) -> &str;

    /// Search `network` for services. Returned services are owned by the
    /// calling node once registered.
    async fn search(&self, network: &str) -> MsdResult<Vec<Service>>;
}

/// Proxy answering with a fixed list, for tests and static deployments
#[derive(Debug, Clone, Default)]
pub struct StaticProxy {
    services: Vec<Service>,
}

impl StaticProxy {
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl DiscoveryProxy for StaticProxy {
    fn name(&self) -> &str {
        "static"
    }

    async fn search(&self, network: &str) -> MsdResult<Vec<Service>> {
        Ok(self
            .services
            .iter()
            .filter(|s| s.networks.is_empty() || s.networks.contains(network))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_proxy_filters_by_network() {
        let proxy = StaticProxy::new(vec![
            Service::new("anywhere", "x"),
            Service::new("wired", "x").on_network("ethernet"),
        ]);
        let found = proxy.search("bluetooth").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "anywhere");
        assert_eq!(proxy.search("ethernet").await.unwrap().len(), 2);
    }
}
