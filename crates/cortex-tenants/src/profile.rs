use std::collections::BTreeSet;

use cortex_core::types::TenantMode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Auth methods a tenant may enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    OidcEnterprise,
    OidcConsumer,
    Password,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Branding {
    pub logo_url: Option<String>,
    pub primary_color: Option<String>,
    pub theme_css_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepartmentDef {
    pub slug: String,
    pub display_name: String,
}

/// Full tenant profile as loaded from the catalog. Read-mostly at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantProfile {
    pub id: Uuid,
    pub slug: String,
    pub display_name: String,
    pub mode: TenantMode,
    pub custom_domain: Option<String>,
    pub subdomain: Option<String>,
    #[serde(default)]
    pub auth_methods: BTreeSet<AuthMethod>,
    #[serde(default)]
    pub features: BTreeSet<String>,
    #[serde(default)]
    pub branding: Branding,
    /// Storage tables owned by this tenant. Internal; never sent to clients.
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub departments: Vec<DepartmentDef>,
    /// Base persona injected into every system prompt for this tenant.
    pub persona: Option<String>,
}

impl TenantProfile {
    pub fn department_slugs(&self) -> Vec<String> {
        self.departments.iter().map(|d| d.slug.clone()).collect()
    }

    pub fn has_department(&self, slug: &str) -> bool {
        self.departments.iter().any(|d| d.slug == slug)
    }

    /// The subset safe to hand to clients. Excludes the tenant UUID, the
    /// owned-table list, and anything else internal.
    pub fn sanitized(&self) -> SanitizedProfile {
        SanitizedProfile {
            slug: self.slug.clone(),
            display_name: self.display_name.clone(),
            auth_methods: self.auth_methods.clone(),
            features: self.features.clone(),
            branding: self.branding.clone(),
            departments: self.departments.clone(),
        }
    }
}

/// Client-visible subset of a tenant profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizedProfile {
    pub slug: String,
    pub display_name: String,
    pub auth_methods: BTreeSet<AuthMethod>,
    pub features: BTreeSet<String>,
    pub branding: Branding,
    pub departments: Vec<DepartmentDef>,
}
