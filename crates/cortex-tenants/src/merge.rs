use serde_json::Value;

/// Deep-merge `overlay` onto `base`.
///
/// Map-valued keys merge recursively; scalar and array values from the
/// overlay replace the base outright. Keys absent from the overlay keep
/// the base value. The operation is associative, which lets enterprise
/// tenants stack over the shared base profile in any grouping.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut out = base_map.clone();
            for (key, overlay_val) in overlay_map {
                let merged = match base_map.get(key) {
                    Some(base_val) => deep_merge(base_val, overlay_val),
                    None => overlay_val.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        // Anything that is not two maps: overlay wins.
        (_, overlay_val) => overlay_val.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overlay_scalar_replaces_base() {
        let base = json!({"color": "blue", "depth": 1});
        let overlay = json!({"color": "red"});
        let merged = deep_merge(&base, &overlay);
        assert_eq!(merged, json!({"color": "red", "depth": 1}));
    }

    #[test]
    fn nested_maps_merge_recursively() {
        let base = json!({"auth": {"oidc_enterprise": true, "password": false}});
        let overlay = json!({"auth": {"password": true}});
        let merged = deep_merge(&base, &overlay);
        assert_eq!(
            merged,
            json!({"auth": {"oidc_enterprise": true, "password": true}})
        );
    }

    #[test]
    fn arrays_are_replaced_not_unioned() {
        let base = json!({"features": ["chat", "voice"]});
        let overlay = json!({"features": ["chat"]});
        let merged = deep_merge(&base, &overlay);
        assert_eq!(merged, json!({"features": ["chat"]}));
    }

    #[test]
    fn merge_is_associative_over_the_base() {
        let base = json!({
            "auth": {"oidc_enterprise": true},
            "branding": {"primary_color": "#102030", "logo_url": "base.png"},
            "limits": {"rpm": 60}
        });
        let a = json!({"branding": {"primary_color": "#ff0000"}, "limits": {"rpm": 90}});
        let b = json!({"branding": {"logo_url": "b.png"}});

        let left = deep_merge(&base, &deep_merge(&a, &b));
        let right = deep_merge(&deep_merge(&base, &a), &b);
        assert_eq!(left, right);
    }

    #[test]
    fn missing_overlay_keys_keep_base_values() {
        let base = json!({"a": 1, "b": {"c": 2}});
        let merged = deep_merge(&base, &json!({}));
        assert_eq!(merged, base);
    }
}
