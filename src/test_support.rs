//! In-memory [`RemoteStore`] with failure injection, used by engine and
//! action tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::RemoteStore;
use crate::error::SyncError;
use crate::models::{
    partition_products, Category, Logo, MenuSnapshot, Product, SiteConfig, SiteConfigEntry,
    LOGO_RECORD_ID, SYSTEM_CATEGORY_ID,
};

const SERVER_TIMESTAMP: &str = "2026-01-01T00:00:00Z";

#[derive(Default)]
struct Tables {
    categories: Vec<Category>,
    products: Vec<Product>,
    failing_fetches: u32,
    failing_pushes: u32,
    fetch_calls: u32,
    push_calls: u32,
    fetch_delay: Option<Duration>,
    push_delay: Option<Duration>,
    last_pushed_products: Option<Vec<Product>>,
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub(crate) fn with_menu(categories: Vec<Category>, products: Vec<Product>) -> Self {
        Self {
            tables: Mutex::new(Tables {
                categories,
                products,
                ..Tables::default()
            }),
        }
    }

    pub(crate) fn fail_next_fetches(&self, n: u32) {
        self.tables.lock().unwrap().failing_fetches = n;
    }

    pub(crate) fn fail_next_pushes(&self, n: u32) {
        self.tables.lock().unwrap().failing_pushes = n;
    }

    pub(crate) fn set_fetch_delay(&self, delay: Duration) {
        self.tables.lock().unwrap().fetch_delay = Some(delay);
    }

    /// Pushes take this long before the server commits them.
    pub(crate) fn set_push_delay(&self, delay: Duration) {
        self.tables.lock().unwrap().push_delay = Some(delay);
    }

    pub(crate) fn fetch_calls(&self) -> u32 {
        self.tables.lock().unwrap().fetch_calls
    }

    pub(crate) fn push_calls(&self) -> u32 {
        self.tables.lock().unwrap().push_calls
    }

    pub(crate) fn server_products(&self) -> Vec<Product> {
        self.tables.lock().unwrap().products.clone()
    }

    /// Product set of the most recent accepted full push.
    pub(crate) fn last_pushed_products(&self) -> Option<Vec<Product>> {
        self.tables.lock().unwrap().last_pushed_products.clone()
    }

    pub(crate) fn server_categories(&self) -> Vec<Category> {
        self.tables.lock().unwrap().categories.clone()
    }

    async fn begin_push(&self) -> Result<(), SyncError> {
        let delay = {
            let mut tables = self.tables.lock().unwrap();
            tables.push_calls += 1;
            if tables.failing_pushes > 0 {
                tables.failing_pushes -= 1;
                return Err(SyncError::Status {
                    status: 503,
                    message: "service unavailable".into(),
                });
            }
            tables.push_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn upsert_product(products: &mut Vec<Product>, product: Product) {
        match products.iter_mut().find(|p| p.id == product.id) {
            Some(existing) => *existing = product,
            None => products.push(product),
        }
    }
}

fn stamp(mut product: Product) -> Product {
    if product.created_at.is_none() {
        product.created_at = Some(SERVER_TIMESTAMP.to_string());
    }
    product
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn fetch_all(&self) -> Result<MenuSnapshot, SyncError> {
        let delay = {
            let mut tables = self.tables.lock().unwrap();
            tables.fetch_calls += 1;
            if tables.failing_fetches > 0 {
                tables.failing_fetches -= 1;
                return Err(SyncError::Connect {
                    url: "memory://menu".into(),
                });
            }
            tables.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let tables = self.tables.lock().unwrap();
        Ok(MenuSnapshot {
            categories: tables.categories.clone(),
            products: tables.products.clone(),
        })
    }

    /// Replace-by-diff: rows absent from the request are deleted, except
    /// reserved system rows, which the server always keeps.
    async fn push_all(
        &self,
        products: &[Product],
        categories: &[Category],
    ) -> Result<(), SyncError> {
        self.begin_push().await?;

        let mut seen = std::collections::HashSet::new();
        for category in categories {
            if !seen.insert(category.name.to_lowercase()) {
                return Err(SyncError::Validation(format!(
                    "duplicate category name: {}",
                    category.name
                )));
            }
        }

        let mut tables = self.tables.lock().unwrap();
        tables.last_pushed_products = Some(products.to_vec());
        let mut next_products: Vec<Product> = products.iter().cloned().map(stamp).collect();
        for kept in tables.products.iter().filter(|p| p.is_reserved()) {
            if !next_products.iter().any(|p| p.id == kept.id) {
                next_products.push(kept.clone());
            }
        }
        let mut next_categories = categories.to_vec();
        for kept in tables.categories.iter().filter(|c| c.id == SYSTEM_CATEGORY_ID) {
            if !next_categories.iter().any(|c| c.id == kept.id) {
                next_categories.push(kept.clone());
            }
        }
        tables.products = next_products;
        tables.categories = next_categories;
        Ok(())
    }

    async fn fetch_logo(&self) -> Result<Option<Logo>, SyncError> {
        let products = self.tables.lock().unwrap().products.clone();
        Ok(partition_products(products).logo)
    }

    async fn push_logo(&self, logo: Option<&Logo>) -> Result<(), SyncError> {
        self.begin_push().await?;
        let mut tables = self.tables.lock().unwrap();
        match logo {
            Some(logo) => Self::upsert_product(&mut tables.products, logo.to_record()),
            None => tables.products.retain(|p| p.id != LOGO_RECORD_ID),
        }
        Ok(())
    }

    async fn fetch_site_config(&self) -> Result<SiteConfig, SyncError> {
        let products = self.tables.lock().unwrap().products.clone();
        Ok(partition_products(products).site_config)
    }

    async fn push_site_config(&self, key: &str, value: &Value) -> Result<(), SyncError> {
        self.begin_push().await?;
        let record = SiteConfigEntry {
            key: key.to_string(),
            value: value.clone(),
        }
        .to_record();
        let mut tables = self.tables.lock().unwrap();
        Self::upsert_product(&mut tables.products, record);
        Ok(())
    }
}
