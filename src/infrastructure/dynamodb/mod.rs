pub mod job_repo;
pub mod product_repo;

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;

/// Maps a JSON value onto the closest DynamoDB attribute type.
pub(crate) fn json_to_attribute(value: &serde_json::Value) -> AttributeValue {
    match value {
        serde_json::Value::String(s) => AttributeValue::S(s.clone()),
        serde_json::Value::Number(n) => AttributeValue::N(n.to_string()),
        serde_json::Value::Bool(b) => AttributeValue::Bool(*b),
        serde_json::Value::Null => AttributeValue::Null(true),
        serde_json::Value::Array(items) => AttributeValue::L(items.iter().map(json_to_attribute).collect()),
        serde_json::Value::Object(obj) => AttributeValue::M(
            obj.iter()
                .map(|(k, v)| (k.clone(), json_to_attribute(v)))
                .collect::<HashMap<_, _>>(),
        ),
    }
}

pub(crate) fn string_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Option<String> {
    item.get(name).and_then(|v| v.as_s().ok()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_values_are_converted() {
        let attr = json_to_attribute(&json!({"sku": "A-1", "price": 2.5, "cert": null, "tags": [true]}));
        let map = attr.as_m().unwrap();
        assert_eq!(map["sku"], AttributeValue::S("A-1".into()));
        assert_eq!(map["price"], AttributeValue::N("2.5".into()));
        assert_eq!(map["cert"], AttributeValue::Null(true));
        assert_eq!(map["tags"], AttributeValue::L(vec![AttributeValue::Bool(true)]));
    }
}
