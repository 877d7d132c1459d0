//! Admin mutations with optimistic update and rollback.
//!
//! Every action follows the same commit flow: snapshot current state, apply
//! the new state optimistically, push it, then either schedule a settling
//! refresh or restore the snapshot and return the error. Referential checks
//! run before anything is applied or sent.

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::api::RemoteStore;
use crate::error::SyncError;
use crate::models::{validate_inline_image, Category, ImageRef, Logo, Product};
use crate::synced::{OptimisticPatch, SyncedData, SyncedState};

pub struct MenuActions<S> {
    synced: SyncedData<S>,
    // one mutation at a time so snapshots never interleave
    write_lock: Mutex<()>,
}

impl<S: RemoteStore> MenuActions<S> {
    pub fn new(synced: SyncedData<S>) -> Self {
        Self {
            synced,
            write_lock: Mutex::new(()),
        }
    }

    pub fn synced(&self) -> &SyncedData<S> {
        &self.synced
    }

    // -----------------------------------------------------------------------
    // Products
    // -----------------------------------------------------------------------

    pub async fn add_product(&self, product: Product) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;
        product.validate()?;
        if product.is_reserved() {
            return Err(SyncError::Validation(format!(
                "product id \"{}\" is reserved",
                product.id
            )));
        }
        let before = self.synced.snapshot();
        if find_product(&before, &product.id).is_some() {
            return Err(SyncError::Validation(format!(
                "product \"{}\" already exists",
                product.id
            )));
        }

        let mut products = before.products.clone();
        products.push(product);
        self.commit_menu(&before, None, Some(products), "Product added")
            .await
    }

    pub async fn update_product(&self, product: Product) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;
        product.validate()?;
        let before = self.synced.snapshot();
        let Some(index) = before.products.iter().position(|p| p.id == product.id) else {
            return Err(not_found("product", &product.id));
        };

        let mut products = before.products.clone();
        products[index] = product;
        self.commit_menu(&before, None, Some(products), "Product updated")
            .await
    }

    pub async fn delete_product(&self, id: &str) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;
        let before = self.synced.snapshot();
        if !before.products.iter().any(|p| p.id == id) {
            return Err(not_found("product", id));
        }

        let products: Vec<Product> = before
            .products
            .iter()
            .filter(|p| p.id != id)
            .cloned()
            .collect();
        self.commit_menu(&before, None, Some(products), "Product deleted")
            .await
    }

    // -----------------------------------------------------------------------
    // Categories
    // -----------------------------------------------------------------------

    pub async fn add_category(&self, category: Category) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;
        validate_category(&category)?;
        let before = self.synced.snapshot();
        if before.categories.iter().any(|c| c.id == category.id) {
            return Err(SyncError::Validation(format!(
                "category \"{}\" already exists",
                category.id
            )));
        }
        ensure_unique_name(&before, &category)?;

        let mut categories = before.categories.clone();
        categories.push(category);
        self.commit_menu(&before, Some(categories), None, "Category added")
            .await
    }

    pub async fn update_category(&self, category: Category) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;
        validate_category(&category)?;
        let before = self.synced.snapshot();
        let Some(index) = before.categories.iter().position(|c| c.id == category.id) else {
            return Err(not_found("category", &category.id));
        };
        ensure_unique_name(&before, &category)?;

        let mut categories = before.categories.clone();
        categories[index] = category;
        self.commit_menu(&before, Some(categories), None, "Category updated")
            .await
    }

    /// Rejected without touching the network while any product, visible or
    /// hidden, still references the category.
    pub async fn delete_category(&self, id: &str) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;
        let before = self.synced.snapshot();
        if !before.categories.iter().any(|c| c.id == id) {
            return Err(not_found("category", id));
        }
        let product_count = before
            .products
            .iter()
            .chain(&before.hidden_products)
            .filter(|p| p.category == id)
            .count();
        if product_count > 0 {
            return Err(SyncError::CategoryInUse {
                category_id: id.to_string(),
                product_count,
            });
        }

        let categories: Vec<Category> = before
            .categories
            .iter()
            .filter(|c| c.id != id)
            .cloned()
            .collect();
        self.commit_menu(&before, Some(categories), None, "Category deleted")
            .await
    }

    // -----------------------------------------------------------------------
    // System records
    // -----------------------------------------------------------------------

    /// Set or clear (`None`) the site logo.
    pub async fn set_logo(&self, logo: Option<Logo>) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;
        if let Some(logo) = &logo {
            match ImageRef::parse(&logo.image) {
                None => return Err(SyncError::Validation("logo image is empty".into())),
                Some(ImageRef::Inline { payload, .. }) => {
                    validate_inline_image(payload)?;
                }
                Some(ImageRef::Url(_)) => {}
            }
        }
        let before = self.synced.snapshot();

        let _write = self.synced.begin_write();
        self.synced
            .apply_optimistic(OptimisticPatch::logo(logo.clone()));
        let result = self.synced.store().push_logo(logo.as_ref()).await;
        let success = if logo.is_some() {
            "Logo updated"
        } else {
            "Logo removed"
        };
        self.settle(&before, result, success)
    }

    pub async fn update_site_config(&self, key: &str, value: Value) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;
        if key.trim().is_empty() {
            return Err(SyncError::Validation("site config key cannot be empty".into()));
        }
        let before = self.synced.snapshot();

        let mut site_config = before.site_config.clone();
        site_config.insert(key.to_string(), value.clone());
        let _write = self.synced.begin_write();
        self.synced
            .apply_optimistic(OptimisticPatch::site_config(site_config));
        let result = self.synced.store().push_site_config(key, &value).await;
        self.settle(&before, result, "Settings saved")
    }

    // -----------------------------------------------------------------------
    // Commit flow
    // -----------------------------------------------------------------------

    /// Apply and push the full desired sets. System rows held in memory are
    /// re-appended so the replace-by-diff push cannot delete them.
    async fn commit_menu(
        &self,
        before: &SyncedState,
        categories: Option<Vec<Category>>,
        products: Option<Vec<Product>>,
        success: &str,
    ) -> Result<(), SyncError> {
        let push_products = before.push_set(products.as_deref().unwrap_or(&before.products));
        let push_categories = categories
            .clone()
            .unwrap_or_else(|| before.categories.clone());

        let _write = self.synced.begin_write();
        self.synced.apply_optimistic(OptimisticPatch {
            categories,
            products,
            ..OptimisticPatch::default()
        });
        let result = self
            .synced
            .store()
            .push_all(&push_products, &push_categories)
            .await;
        self.settle(before, result, success)
    }

    fn settle(
        &self,
        before: &SyncedState,
        result: Result<(), SyncError>,
        success: &str,
    ) -> Result<(), SyncError> {
        match result {
            Ok(()) => {
                info!(action = success, "menu change saved");
                self.synced
                    .schedule_refresh(self.synced.settings().post_write_delay);
                self.synced.notifier().success(success);
                Ok(())
            }
            Err(err) => {
                warn!(action = success, error = %err, "menu change failed, rolling back");
                self.synced
                    .apply_optimistic(OptimisticPatch::restore(before));
                self.synced
                    .notifier()
                    .error(format!("Could not save changes: {err}"));
                Err(err)
            }
        }
    }
}

fn not_found(entity: &'static str, id: &str) -> SyncError {
    SyncError::NotFound {
        entity,
        id: id.to_string(),
    }
}

fn find_product<'a>(state: &'a SyncedState, id: &str) -> Option<&'a Product> {
    state
        .products
        .iter()
        .chain(&state.hidden_products)
        .find(|p| p.id == id)
}

fn validate_category(category: &Category) -> Result<(), SyncError> {
    if category.id.trim().is_empty() {
        return Err(SyncError::Validation("category id cannot be empty".into()));
    }
    if category.name.trim().is_empty() {
        return Err(SyncError::Validation(format!(
            "category \"{}\" has an empty name",
            category.id
        )));
    }
    Ok(())
}

/// Names are unique ignoring case and surrounding whitespace.
fn ensure_unique_name(state: &SyncedState, category: &Category) -> Result<(), SyncError> {
    let wanted = category.name.trim().to_lowercase();
    let clash = state
        .categories
        .iter()
        .any(|c| c.id != category.id && c.name.trim().to_lowercase() == wanted);
    if clash {
        return Err(SyncError::DuplicateCategoryName(category.name.clone()));
    }
    Ok(())
}
