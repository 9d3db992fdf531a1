use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::catalog::TenantCatalog;
use crate::error::Result;
use crate::profile::TenantProfile;

/// Maps request hostnames to tenant profiles.
///
/// Resolution is a pure function of the hostname and the current catalog;
/// the catalog itself is swapped wholesale on refresh, so readers only pay
/// an `Arc` clone on the hot path.
pub struct TenantResolver {
    catalog: RwLock<Arc<TenantCatalog>>,
    /// Reserved hostname that always resolves to the consumer profile,
    /// and the root under which tenant subdomains hang.
    consumer_host: String,
}

impl TenantResolver {
    pub fn new(catalog: TenantCatalog, consumer_host: impl Into<String>) -> Self {
        Self {
            catalog: RwLock::new(Arc::new(catalog)),
            consumer_host: consumer_host.into(),
        }
    }

    /// Resolve a hostname, in order:
    /// 1. the reserved consumer host → consumer profile
    /// 2. `<sub>.<consumer_host>` → tenant by subdomain, consumer on miss
    /// 3. any tenant's custom domain → that tenant
    /// 4. anything else → consumer profile
    ///
    /// Unknown hosts never error; they fall back to the consumer profile.
    pub fn resolve(&self, host: &str) -> Arc<TenantProfile> {
        let catalog = self.snapshot();
        let host = host
            .split(':')
            .next()
            .unwrap_or(host)
            .trim()
            .to_ascii_lowercase();

        if host == self.consumer_host {
            return catalog.consumer();
        }

        if let Some(sub) = host
            .strip_suffix(&self.consumer_host)
            .and_then(|s| s.strip_suffix('.'))
        {
            // Only a single label counts as a tenant subdomain.
            if !sub.is_empty() && !sub.contains('.') {
                if let Some(profile) = catalog.by_subdomain(sub) {
                    return profile;
                }
                debug!(host, sub, "unknown subdomain, consumer fallback");
                return catalog.consumer();
            }
        }

        if let Some(profile) = catalog.by_domain(&host) {
            return profile;
        }

        debug!(host, "unresolved host, consumer fallback");
        catalog.consumer()
    }

    pub fn by_slug(&self, slug: &str) -> Result<Arc<TenantProfile>> {
        self.snapshot().by_slug(slug)
    }

    /// Replace the whole catalog. Existing requests keep their snapshot.
    pub fn refresh(&self, catalog: TenantCatalog) {
        let mut guard = self.catalog.write().unwrap();
        *guard = Arc::new(catalog);
    }

    fn snapshot(&self) -> Arc<TenantCatalog> {
        Arc::clone(&self.catalog.read().unwrap())
    }
}
