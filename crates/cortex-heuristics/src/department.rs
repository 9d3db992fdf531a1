//! Department context analyzer.
//!
//! Scores the query against per-department signal tables and normalizes
//! into a probability distribution. Tenants configure their own department
//! list; the default table below ships seven and tolerates any subset.

use std::collections::BTreeMap;

use cortex_core::types::DepartmentInference;

/// Raw score below which no department is confidently inferred.
const MIN_PRIMARY_SCORE: f32 = 0.2;

pub struct DepartmentSignals {
    pub slug: &'static str,
    pub signals: &'static [&'static str],
}

/// Default signal table. A tenant's configured departments select (by
/// slug) which rows participate; unknown tenant slugs simply never match.
pub const DEFAULT_SIGNALS: &[DepartmentSignals] = &[
    DepartmentSignals {
        slug: "it",
        signals: &[
            "password", "login", "vpn", "laptop", "computer", "software", "install", "network",
            "printer", "reset",
        ],
    },
    DepartmentSignals {
        slug: "hr",
        signals: &[
            "vacation", "leave", "payroll", "benefits", "onboarding", "holiday", "sick",
            "contract", "salary", "training",
        ],
    },
    DepartmentSignals {
        slug: "sales",
        signals: &[
            "customer", "quote", "deal", "pipeline", "discount", "lead", "crm", "proposal",
            "pricing", "demo",
        ],
    },
    DepartmentSignals {
        slug: "credit",
        signals: &[
            "credit", "limit", "exposure", "risk", "overdue", "collection", "dunning",
            "payment terms", "insolvency", "rating",
        ],
    },
    DepartmentSignals {
        slug: "logistics",
        signals: &[
            "shipment", "delivery", "warehouse", "returns", "carrier", "tracking", "pallet",
            "customs", "freight", "inventory",
        ],
    },
    DepartmentSignals {
        slug: "accounting",
        signals: &[
            "invoice", "booking", "ledger", "vat", "tax", "accrual", "reconciliation",
            "expense", "journal", "close",
        ],
    },
    DepartmentSignals {
        slug: "operations",
        signals: &[
            "process", "workflow", "procedure", "machine", "maintenance", "production",
            "quality", "audit", "shift", "incident",
        ],
    },
];

/// Infer the department distribution for a query.
///
/// Per department: score = matched signals / signal count. Scores are then
/// normalized to sum to 1.0. When nothing matches the map is empty and
/// `primary` is "general"; when the best raw score is below the
/// confidence floor, `primary` is "general" but the distribution is kept.
pub fn infer(text: &str, keywords: &[String], configured: &[String]) -> DepartmentInference {
    let haystack = build_haystack(text, keywords);

    let active: Vec<&DepartmentSignals> = if configured.is_empty() {
        DEFAULT_SIGNALS.iter().collect()
    } else {
        DEFAULT_SIGNALS
            .iter()
            .filter(|d| configured.iter().any(|c| c == d.slug))
            .collect()
    };

    let mut raw: BTreeMap<String, f32> = BTreeMap::new();
    for dept in &active {
        let matched = dept
            .signals
            .iter()
            .filter(|signal| haystack.contains(*signal))
            .count();
        if matched > 0 {
            raw.insert(
                dept.slug.to_string(),
                matched as f32 / dept.signals.len() as f32,
            );
        }
    }

    if raw.is_empty() {
        return DepartmentInference {
            primary: "general".to_string(),
            distribution: BTreeMap::new(),
        };
    }

    let (best_slug, best_score) = raw
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(slug, score)| (slug.clone(), *score))
        .expect("raw is non-empty");

    let total: f32 = raw.values().sum();
    let distribution: BTreeMap<String, f32> =
        raw.into_iter().map(|(k, v)| (k, v / total)).collect();

    let primary = if best_score < MIN_PRIMARY_SCORE {
        "general".to_string()
    } else {
        best_slug
    };

    DepartmentInference {
        primary,
        distribution,
    }
}

fn build_haystack(text: &str, keywords: &[String]) -> String {
    let mut haystack = text.to_lowercase();
    for kw in keywords {
        haystack.push(' ');
        haystack.push_str(&kw.to_lowercase());
    }
    haystack
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_reset_maps_to_it() {
        let inf = infer("How do I reset my password ASAP?", &[], &[]);
        assert_eq!(inf.primary, "it");
        let sum: f32 = inf.distribution.values().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn no_signal_match_is_general_with_empty_map() {
        let inf = infer("hello there", &[], &[]);
        assert_eq!(inf.primary, "general");
        assert!(inf.distribution.is_empty());
    }

    #[test]
    fn distribution_always_normalizes() {
        let inf = infer(
            "invoice for the shipment returns and the vat reconciliation",
            &[],
            &[],
        );
        let sum: f32 = inf.distribution.values().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(inf.distribution.len() >= 2);
    }

    #[test]
    fn weak_single_match_falls_back_to_general_but_keeps_distribution() {
        // one signal out of ten → raw 0.1, below the confidence floor
        let inf = infer("my printer thing", &[], &[]);
        assert_eq!(inf.primary, "general");
        assert!(!inf.distribution.is_empty());
        let sum: f32 = inf.distribution.values().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn tenant_configured_subset_limits_candidates() {
        // "password" is an IT signal, but this tenant has no IT department
        let inf = infer(
            "reset my password",
            &[],
            &["hr".to_string(), "sales".to_string()],
        );
        assert_eq!(inf.primary, "general");
        assert!(inf.distribution.is_empty());
    }

    #[test]
    fn keywords_contribute_to_matching() {
        let inf = infer("need help", &["vacation".to_string(), "payroll".to_string()], &[]);
        assert_eq!(inf.primary, "hr");
    }

    #[test]
    fn renamed_departments_never_panic() {
        let inf = infer(
            "reset my password",
            &[],
            &["helpdesk".to_string()], // tenant renamed IT; no signals exist
        );
        assert_eq!(inf.primary, "general");
    }
}
