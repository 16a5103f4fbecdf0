//! Metadata filters.
//!
//! A filter maps a metadata key to an expected value. A scalar matches by
//! equality; an array matches when the document value equals any element.
//! The reserved key `basket_id` matches the document's owning basket rather
//! than its metadata. All keys must match.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::Meta;

pub const BASKET_FILTER_KEY: &str = "basket_id";

/// Ordered so that cache keys built from filters are deterministic.
pub type Filters = BTreeMap<String, Value>;

pub fn value_matches(actual: Option<&Value>, expected: &Value) -> bool {
    let Some(actual) = actual else { return false };
    match expected {
        Value::Array(options) => options.iter().any(|o| o == actual),
        other => other == actual,
    }
}

pub fn matches(basket_id: &str, metadata: &Meta, filters: &Filters) -> bool {
    filters.iter().all(|(key, expected)| {
        if key == BASKET_FILTER_KEY {
            value_matches(Some(&Value::String(basket_id.to_string())), expected)
        } else {
            value_matches(metadata.get(key), expected)
        }
    })
}

/// Copy `filters` with the basket scope added (or replaced).
pub fn with_basket(filters: Option<&Filters>, basket_id: Option<&str>) -> Option<Filters> {
    match (filters, basket_id) {
        (None, None) => None,
        (f, b) => {
            let mut out = f.cloned().unwrap_or_default();
            if let Some(b) = b {
                out.insert(BASKET_FILTER_KEY.to_string(), Value::String(b.to_string()));
            }
            Some(out)
        }
    }
}

/// The basket scope carried by `filters`, if it names exactly one basket.
pub fn basket_of(filters: &Filters) -> Option<&str> {
    filters.get(BASKET_FILTER_KEY).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(pairs: &[(&str, Value)]) -> Meta {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn scalar_and_any_of() {
        let m = meta(&[("lang", json!("en")), ("year", json!(2023))]);
        let mut f = Filters::new();
        f.insert("lang".into(), json!("en"));
        assert!(matches("b1", &m, &f));
        f.insert("year".into(), json!([2022, 2023]));
        assert!(matches("b1", &m, &f));
        f.insert("missing".into(), json!(1));
        assert!(!matches("b1", &m, &f));
    }

    #[test]
    fn basket_key_checks_owner() {
        let f = with_basket(None, Some("b1")).expect("filters");
        assert!(matches("b1", &Meta::new(), &f));
        assert!(!matches("b2", &Meta::new(), &f));
        assert_eq!(basket_of(&f), Some("b1"));
        assert!(with_basket(None, None).is_none());
    }
}
