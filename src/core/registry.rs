use std::{collections::BTreeSet, net::IpAddr, sync::Arc};

use arc_swap::ArcSwap;
use thiserror::Error;

use crate::core::{load_balancer::Balancer, proxy::Proxy, rule_key::RequestKey};

/// Errors raised by registry updates
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("A proxy named '{0}' is already registered")]
    DuplicateName(String),

    #[error("A balancer named '{0}' is already registered")]
    DuplicateBalancer(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Ordered set of proxies.
///
/// Reads load one immutable snapshot; writes publish a new snapshot so a
/// reader never sees a half-applied update.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    proxies: ArcSwap<Vec<Arc<Proxy>>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proxies(proxies: Vec<Arc<Proxy>>) -> RegistryResult<Self> {
        let registry = Self::new();
        registry.replace_all(proxies)?;
        Ok(registry)
    }

    /// Appends a proxy; matching order is registration order.
    pub fn add(&self, proxy: Arc<Proxy>) -> RegistryResult<()> {
        let mut conflict = None;
        self.proxies.rcu(|current| {
            conflict = Self::conflict(current, &proxy);
            let mut next = current.as_ref().clone();
            if conflict.is_none() {
                next.push(Arc::clone(&proxy));
            }
            next
        });
        match conflict {
            Some(e) => Err(e),
            None => {
                tracing::info!("Registered proxy {}", proxy.name());
                Ok(())
            }
        }
    }

    fn conflict(existing: &[Arc<Proxy>], proxy: &Proxy) -> Option<RegistryError> {
        if existing.iter().any(|p| p.name() == proxy.name()) {
            return Some(RegistryError::DuplicateName(proxy.name().to_string()));
        }
        let balancer = proxy.target().balancer()?;
        existing
            .iter()
            .filter_map(|p| p.target().balancer())
            .any(|b| b.name() == balancer.name())
            .then(|| RegistryError::DuplicateBalancer(balancer.name().to_string()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Proxy>> {
        let mut removed = None;
        self.proxies.rcu(|current| {
            removed = current.iter().find(|p| p.name() == name).cloned();
            current
                .iter()
                .filter(|p| p.name() != name)
                .cloned()
                .collect::<Vec<_>>()
        });
        if removed.is_some() {
            tracing::info!("Removed proxy {}", name);
        }
        removed
    }

    /// Swaps in a whole new rule set at once.
    pub fn replace_all(&self, proxies: Vec<Arc<Proxy>>) -> RegistryResult<()> {
        let mut accepted: Vec<Arc<Proxy>> = Vec::with_capacity(proxies.len());
        for proxy in proxies {
            if let Some(e) = Self::conflict(&accepted, &proxy) {
                return Err(e);
            }
            accepted.push(proxy);
        }
        self.proxies.store(Arc::new(accepted));
        Ok(())
    }

    /// First active external proxy whose rule key matches.
    pub fn find_matching(&self, key: &RequestKey<'_>) -> Option<Arc<Proxy>> {
        self.proxies
            .load()
            .iter()
            .find(|p| !p.is_internal() && p.is_active() && p.key().matches(key))
            .cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Proxy>> {
        self.proxies.load().iter().find(|p| p.name() == name).cloned()
    }

    /// Active internal proxy addressed by `internal://name`.
    pub fn get_internal(&self, name: &str) -> Option<Arc<Proxy>> {
        self.proxies
            .load()
            .iter()
            .find(|p| p.is_internal() && p.is_active() && p.name() == name)
            .cloned()
    }

    pub fn proxies(&self) -> Arc<Vec<Arc<Proxy>>> {
        self.proxies.load_full()
    }

    pub fn inactive(&self) -> Vec<Arc<Proxy>> {
        self.proxies
            .load()
            .iter()
            .filter(|p| !p.is_active())
            .cloned()
            .collect()
    }

    pub fn balancers(&self) -> Vec<Arc<Balancer>> {
        self.proxies
            .load()
            .iter()
            .filter_map(|p| p.target().balancer().cloned())
            .collect()
    }

    pub fn balancer(&self, name: &str) -> Option<Arc<Balancer>> {
        self.balancers().into_iter().find(|b| b.name() == name)
    }

    /// Distinct `(ip, port)` pairs external proxies listen on.
    pub fn listen_endpoints(&self) -> BTreeSet<(Option<IpAddr>, u16)> {
        self.proxies
            .load()
            .iter()
            .filter(|p| !p.is_internal())
            .map(|p| (p.key().ip, p.key().port))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        load_balancer::{Balancer, DispatchStrategy, RoundRobinStrategy},
        rule_key::{HostPattern, PathPattern, RuleKey},
        target::Target,
    };

    async fn active(proxy: Proxy) -> Arc<Proxy> {
        proxy.init().await;
        Arc::new(proxy)
    }

    fn request<'a>(host: &'a str, path: &'a str) -> RequestKey<'a> {
        RequestKey {
            ip: None,
            port: 8080,
            method: "GET",
            host,
            path,
        }
    }

    #[tokio::test]
    async fn test_first_match_in_registration_order() {
        let registry = ProxyRegistry::new();
        registry
            .add(active(
                Proxy::builder("api")
                    .key(RuleKey::port(8080).with_path(PathPattern::prefix("/api")))
                    .build(),
            )
            .await)
            .unwrap();
        registry
            .add(active(Proxy::builder("catch-all").key(RuleKey::port(8080)).build()).await)
            .unwrap();

        let hit = registry.find_matching(&request("h", "/api/x")).unwrap();
        assert_eq!(hit.name(), "api");
        let hit = registry.find_matching(&request("h", "/web")).unwrap();
        assert_eq!(hit.name(), "catch-all");
    }

    #[tokio::test]
    async fn test_host_pattern_selects_proxy() {
        let registry = ProxyRegistry::new();
        registry
            .add(active(
                Proxy::builder("predic8")
                    .key(
                        RuleKey::port(8080)
                            .with_host(HostPattern::new("predic8.de *.predic8.de").unwrap()),
                    )
                    .build(),
            )
            .await)
            .unwrap();

        assert!(registry.find_matching(&request("api.predic8.de:8080", "/")).is_some());
        assert!(registry.find_matching(&request("notpredic8.de", "/")).is_none());
    }

    #[tokio::test]
    async fn test_internal_and_inactive_proxies_are_not_matched() {
        let registry = ProxyRegistry::new();
        registry
            .add(active(Proxy::builder("svc").internal().key(RuleKey::port(8080)).build()).await)
            .unwrap();
        registry
            .add(Arc::new(Proxy::builder("cold").key(RuleKey::port(8080)).build()))
            .unwrap();

        assert!(registry.find_matching(&request("h", "/")).is_none());
        assert!(registry.get_internal("svc").is_some());
        assert!(registry.get_internal("cold").is_none());
        assert_eq!(registry.inactive().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let registry = ProxyRegistry::new();
        registry.add(active(Proxy::builder("a").build()).await).unwrap();
        assert_eq!(
            registry.add(active(Proxy::builder("a").build()).await),
            Err(RegistryError::DuplicateName("a".to_string()))
        );
        assert_eq!(registry.len(), 1);

        let duplicated = vec![
            Arc::new(Proxy::builder("x").build()),
            Arc::new(Proxy::builder("x").build()),
        ];
        assert!(registry.replace_all(duplicated).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_balancer_lookup() {
        let pool = Arc::new(Balancer::new("pool", vec![], RoundRobinStrategy::new().boxed()));
        let registry = ProxyRegistry::with_proxies(vec![
            Arc::new(Proxy::builder("lb").target(Target::Balancer(pool)).build()),
            Arc::new(Proxy::builder("other").key(RuleKey::port(9090)).build()),
        ])
        .unwrap();

        assert!(registry.balancer("pool").is_some());
        assert_eq!(registry.listen_endpoints().len(), 2);

        assert!(registry.remove("lb").is_some());
        assert!(registry.remove("lb").is_none());
        assert!(registry.balancer("pool").is_none());
        assert!(registry.get_by_name("other").is_some());
    }
}
