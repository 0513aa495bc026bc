use async_trait::async_trait;
use chrono::Utc;
use mongodb::{
    bson::{self, doc, Document},
    error::{ErrorKind, WriteFailure},
    options::IndexOptions,
    Client, Collection, IndexModel,
};
use tracing::{debug, error};
use uuid::Uuid;

use crate::domain::{error::ImportError, models::NewProduct, ports::ProductRepository};

const DUPLICATE_KEY: i32 = 11000;

pub struct MongoProductRepository {
    collection: Collection<Document>,
}

impl MongoProductRepository {
    pub fn new(client: &Client, database: &str) -> Self {
        debug!("Initializing MongoDB product repository for database: {}", database);
        let collection = client.database(database).collection("productos");
        Self { collection }
    }

    /// The unique SKU index is what rejects re-imported rows.
    pub async fn ensure_indexes(&self) -> Result<(), ImportError> {
        let unique_sku = IndexModel::builder()
            .keys(doc! { "codigo_sku": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.collection.create_index(unique_sku, None).await.map_err(|e| {
            error!("Failed to create product indexes: {}", e);
            ImportError::Database(e.to_string())
        })?;
        Ok(())
    }
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    matches!(
        error.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY
    )
}

#[async_trait]
impl ProductRepository for MongoProductRepository {
    async fn insert(&self, product: &NewProduct) -> Result<String, ImportError> {
        let id = Uuid::new_v4().to_string();
        let mut document = bson::to_document(product).map_err(|e| {
            error!("Failed to serialize product {}: {}", product.sku, e);
            ImportError::Database(e.to_string())
        })?;
        document.insert("id", id.as_str());
        document.insert("fecha_registro", Utc::now().to_rfc3339());

        self.collection.insert_one(document, None).await.map_err(|e| {
            if is_duplicate_key(&e) {
                debug!("SKU {} already stored in MongoDB", product.sku);
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
