use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::{types::AttributeValue, Client};
use chrono::Utc;
use tracing::{debug, error};
use uuid::Uuid;

use super::json_to_attribute;
use crate::domain::{error::ImportError, models::NewProduct, ports::ProductRepository};

/// Products table keyed by `codigo_sku`, which makes SKU uniqueness a
/// conditional-put check.
pub struct DynamoProductRepository {
    client: Client,
    table: String,
}

impl DynamoProductRepository {
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        let table = table.into();
        debug!("Initializing DynamoDB product repository for table: {}", table);
        Self { client, table }
    }

    fn to_item(product: &NewProduct, id: &str) -> Result<HashMap<String, AttributeValue>, ImportError> {
        let document = serde_json::to_value(product).map_err(|e| ImportError::Database(e.to_string()))?;
        let mut item = HashMap::new();
        if let serde_json::Value::Object(obj) = &document {
            for (key, value) in obj {
                item.insert(key.clone(), json_to_attribute(value));
            }
        }
        item.insert("id".to_string(), AttributeValue::S(id.to_string()));
        item.insert("fecha_registro".to_string(), AttributeValue::S(Utc::now().to_rfc3339()));
        Ok(item)
    }
}

#[async_trait]
impl ProductRepository for DynamoProductRepository {
    async fn insert(&self, product: &NewProduct) -> Result<String, ImportError> {
        let id = Uuid::new_v4().to_string();
        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(Self::to_item(product, &id)?))
            .condition_expression("attribute_not_exists(codigo_sku)")
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map_or(false, |se| se.is_conditional_check_failed_exception()) {
                    debug!("SKU {} already stored in {}", product.sku, self.table);
                    ImportError::DuplicateSku {
                        sku: product.sku.clone(),
                    }
                } else {
                    error!("Failed to store product {}: {}", product.sku, e);
                    ImportError::Database(e.to_string())
                }
            })?;
        Ok(id)
    }
}
