use std::collections::HashMap;
use std::sync::Arc;

use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::error::{Result, TenantError};
use crate::merge::deep_merge;
use crate::profile::TenantProfile;

/// Raw catalog file shape: a consumer profile, an enterprise base, and a
/// list of enterprise tenant records that overlay the base.
#[derive(Debug, Deserialize)]
struct RawCatalog {
    consumer: Value,
    #[serde(default)]
    enterprise_base: Value,
    #[serde(default)]
    tenants: Vec<Value>,
}

/// Immutable, fully-resolved tenant catalog. Swapped wholesale on refresh
/// (copy-on-write); readers hold an `Arc` and never block writers.
#[derive(Debug)]
pub struct TenantCatalog {
    consumer: Arc<TenantProfile>,
    by_slug: HashMap<String, Arc<TenantProfile>>,
    by_subdomain: HashMap<String, Arc<TenantProfile>>,
    by_domain: HashMap<String, Arc<TenantProfile>>,
}

impl TenantCatalog {
    /// Load and validate the catalog file. Malformed profiles fail here,
    /// at startup, never at request time.
    pub fn load(path: &str) -> Result<Self> {
        let raw: RawCatalog = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| TenantError::CatalogLoad(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawCatalog) -> Result<Self> {
        let consumer: TenantProfile =
            serde_json::from_value(raw.consumer).map_err(|e| TenantError::ProfileInvalid {
                slug: "consumer".into(),
                reason: e.to_string(),
            })?;
        // The consumer profile does not inherit from the enterprise base.
        let consumer = Arc::new(consumer);

        let mut by_slug = HashMap::new();
        let mut by_subdomain = HashMap::new();
        let mut by_domain = HashMap::new();
        by_slug.insert(consumer.slug.clone(), Arc::clone(&consumer));

        for record in raw.tenants {
            let slug_hint = record
                .get("slug")
                .and_then(Value::as_str)
                .unwrap_or("<missing slug>")
                .to_string();

            let merged = deep_merge(&raw.enterprise_base, &record);
            let profile: TenantProfile =
                serde_json::from_value(merged).map_err(|e| TenantError::ProfileInvalid {
                    slug: slug_hint.clone(),
                    reason: e.to_string(),
                })?;
            validate(&profile)?;

            let profile = Arc::new(profile);
            if by_slug
                .insert(profile.slug.clone(), Arc::clone(&profile))
                .is_some()
            {
                return Err(TenantError::ProfileInvalid {
                    slug: profile.slug.clone(),
                    reason: "duplicate slug".into(),
                });
            }
            if let Some(sub) = &profile.subdomain {
                if by_subdomain
                    .insert(sub.clone(), Arc::clone(&profile))
                    .is_some()
                {
                    return Err(TenantError::ProfileInvalid {
                        slug: profile.slug.clone(),
                        reason: format!("duplicate subdomain '{}'", sub),
                    });
                }
            }
            if let Some(domain) = &profile.custom_domain {
                if by_domain
                    .insert(domain.clone(), Arc::clone(&profile))
                    .is_some()
                {
                    return Err(TenantError::ProfileInvalid {
                        slug: profile.slug.clone(),
                        reason: format!("duplicate custom domain '{}'", domain),
                    });
                }
            }
        }

        info!(tenants = by_slug.len(), "tenant catalog loaded");
        Ok(Self {
            consumer,
            by_slug,
            by_subdomain,
            by_domain,
        })
    }

    pub fn consumer(&self) -> Arc<TenantProfile> {
        Arc::clone(&self.consumer)
    }

    pub fn by_slug(&self, slug: &str) -> Result<Arc<TenantProfile>> {
        self.by_slug
            .get(slug)
            .cloned()
            .ok_or_else(|| TenantError::UnknownSlug(slug.to_string()))
    }

    pub fn by_subdomain(&self, sub: &str) -> Option<Arc<TenantProfile>> {
        self.by_subdomain.get(sub).cloned()
    }

    pub fn by_domain(&self, domain: &str) -> Option<Arc<TenantProfile>> {
        self.by_domain.get(domain).cloned()
    }
}

fn validate(profile: &TenantProfile) -> Result<()> {
    if profile.slug.is_empty() {
        return Err(TenantError::ProfileInvalid {
            slug: profile.slug.clone(),
            reason: "empty slug".into(),
        });
    }
    if profile.auth_methods.is_empty() {
        return Err(TenantError::ProfileInvalid {
            slug: profile.slug.clone(),
            reason: "no auth methods enabled".into(),
        });
    }
    let mut seen = std::collections::HashSet::new();
    for dept in &profile.departments {
        if !seen.insert(dept.slug.as_str()) {
            return Err(TenantError::ProfileInvalid {
                slug: profile.slug.clone(),
                reason: format!("duplicate department '{}'", dept.slug),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_fixture() -> RawCatalog {
        RawCatalog {
            consumer: json!({
                "id": "3b20b0de-41a9-4a39-a338-28e1b5ac6e83",
                "slug": "consumer",
                "display_name": "Cortex",
                "mode": "consumer",
                "auth_methods": ["oidc_consumer", "password"],
                "departments": []
            }),
            enterprise_base: json!({
                "mode": "enterprise",
                "auth_methods": ["oidc_enterprise"],
                "branding": {"primary_color": "#102030"},
                "departments": [
                    {"slug": "it", "display_name": "IT"},
                    {"slug": "hr", "display_name": "HR"}
                ]
            }),
            tenants: vec![json!({
                "id": "a2a3e1de-9f2f-4a05-93fc-6ec3b5f9c001",
                "slug": "acme",
                "display_name": "Acme Corp",
                "subdomain": "acme",
                "branding": {"primary_color": "#ff6600"}
            })],
        }
    }

    #[test]
    fn enterprise_tenant_inherits_base_and_overrides_branding() {
        let catalog = TenantCatalog::from_raw(raw_fixture()).unwrap();
        let acme = catalog.by_slug("acme").unwrap();

        // base values survive
        assert!(acme
            .auth_methods
            .contains(&crate::profile::AuthMethod::OidcEnterprise));
        assert_eq!(acme.departments.len(), 2);
        // override wins
        assert_eq!(acme.branding.primary_color.as_deref(), Some("#ff6600"));
    }

    #[test]
    fn consumer_does_not_inherit_enterprise_base() {
        let catalog = TenantCatalog::from_raw(raw_fixture()).unwrap();
        let consumer = catalog.consumer();
        assert!(consumer.departments.is_empty());
        assert!(!consumer
            .auth_methods
            .contains(&crate::profile::AuthMethod::OidcEnterprise));
    }

    #[test]
    fn duplicate_subdomain_rejected_at_load() {
        let mut raw = raw_fixture();
        raw.tenants.push(json!({
            "id": "b54e9d4c-0e9e-4f05-8b1c-9a6a3c0a7702",
            "slug": "other",
            "display_name": "Other",
            "subdomain": "acme"
        }));
        assert!(TenantCatalog::from_raw(raw).is_err());
    }

    #[test]
    fn missing_display_name_fails_at_load_not_request_time() {
        let mut raw = raw_fixture();
        raw.tenants = vec![json!({
            "id": "b54e9d4c-0e9e-4f05-8b1c-9a6a3c0a7702",
            "slug": "broken"
        })];
        let err = TenantCatalog::from_raw(raw).unwrap_err();
        assert!(matches!(err, TenantError::ProfileInvalid { .. }));
    }
}
