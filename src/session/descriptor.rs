//! Resource descriptors: `<resourceType>` or `<resourceType>:<compact-json-filter>`.

use serde_json::Value;

/// The part before the first `:`.
pub fn base(descriptor: &str) -> &str {
    descriptor.split(':').next().unwrap_or_default()
}

/// Combine a base descriptor with a filter.
///
/// A null or empty filter yields the bare base.
pub fn with_filter(base: &str, filter: &Value) -> String {
    let empty = match filter {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if empty {
        base.to_string()
    } else {
        format!("{base}:{filter}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_strips_filter() {
        assert_eq!(base("devices"), "devices");
        assert_eq!(base(r#"devices:{"a":1}"#), "devices");
        assert_eq!(base(""), "");
    }

    #[test]
    fn test_with_filter_is_compact() {
        assert_eq!(
            with_filter("devices", &json!({"type": "lamp"})),
            r#"devices:{"type":"lamp"}"#
        );
        assert_eq!(with_filter("devices", &json!({})), "devices");
        assert_eq!(with_filter("devices", &Value::Null), "devices");
    }

    #[test]
    fn test_filtered_descriptor_keeps_base() {
        let d = with_filter("users", &json!({"role": "admin"}));
        assert_eq!(base(&d), "users");
    }
}
