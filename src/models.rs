//! Menu data model: categories, products, and the reserved system records
//! (site logo, site configuration) that share the products table.
//!
//! The backend stores system records as product rows with well-known ids.
//! On the client they are lifted into [`StoredRecord`] so the rest of the
//! crate never has to compare id strings to know what a row is.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Product id of the site logo singleton.
pub const LOGO_RECORD_ID: &str = "__site_logo__";
/// Category id for hidden, system-owned rows.
pub const SYSTEM_CATEGORY_ID: &str = "__system__";
/// Product id prefix for site configuration entries (`__site_config__:hours`).
pub const SITE_CONFIG_ID_PREFIX: &str = "__site_config__:";
/// Label shown for products whose category no longer exists.
pub const ORPHAN_CATEGORY_LABEL: &str = "N/A";
/// Largest decoded inline image the server accepts.
pub const MAX_INLINE_IMAGE_BYTES: usize = 1024 * 1024;

const LOGO_RECORD_NAME: &str = "Logo";

/// Site configuration values keyed by setting name (e.g. `business_hours`).
pub type SiteConfig = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Category {
    pub fn new(id: impl Into<String>, name: impl Into<String>, order: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            order: Some(order),
            created_at: None,
        }
    }

    /// Hidden categories are kept in state but never listed publicly.
    pub fn is_system(&self) -> bool {
        self.id == SYSTEM_CATEGORY_ID
    }

    /// Missing order sorts after every defined order.
    fn sort_key(&self) -> i64 {
        self.order.unwrap_or(i64::MAX)
    }
}

/// Sort ascending by `order`, missing values last. Stable, so categories with
/// equal order keep their server order.
pub fn sort_categories(categories: &mut [Category]) {
    categories.sort_by_key(Category::sort_key);
}

/// Categories suitable for the public catalog.
pub fn public_categories(categories: &[Category]) -> impl Iterator<Item = &Category> {
    categories.iter().filter(|c| !c.is_system())
}

/// Display name of a category id, or `"N/A"` for orphaned references.
pub fn category_label<'a>(categories: &'a [Category], category_id: &str) -> &'a str {
    categories
        .iter()
        .find(|c| c.id == category_id)
        .map(|c| c.name.as_str())
        .unwrap_or(ORPHAN_CATEGORY_LABEL)
}

// ---------------------------------------------------------------------------
// Product
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "deserialize_price")]
    pub price: f64,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default = "default_available", deserialize_with = "deserialize_flag")]
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

fn default_available() -> bool {
    true
}

/// SQLite-backed hosts return booleans as integers or strings.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(match raw {
        Value::Bool(flag) => flag,
        Value::Number(n) => n.as_i64().map(|v| v != 0).unwrap_or(true),
        Value::String(s) => {
            let lower = s.trim().to_ascii_lowercase();
            !(lower == "false" || lower == "0" || lower == "no" || lower == "off")
        }
        Value::Null => true,
        _ => true,
    })
}

/// Prices arrive as numbers, numeric strings ("3.50", "3,50") or null.
/// Anything unreadable counts as 0.
fn deserialize_price<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    let price = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse::<f64>().ok(),
        _ => None,
    };
    Ok(price.filter(|p| p.is_finite()).unwrap_or(0.0))
}

impl Product {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        price: f64,
        category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            price,
            category: category.into(),
            image: None,
            available: true,
            created_at: None,
            updated_at: None,
        }
    }

    /// True for rows with a reserved system id (logo, site config).
    pub fn is_reserved(&self) -> bool {
        self.id == LOGO_RECORD_ID || self.id.starts_with(SITE_CONFIG_ID_PREFIX)
    }

    pub fn image_ref(&self) -> Option<ImageRef<'_>> {
        self.image.as_deref().and_then(ImageRef::parse)
    }

    /// Client-side checks that mirror the server's schema validation.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.id.trim().is_empty() {
            return Err(SyncError::Validation("product id cannot be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(SyncError::Validation(format!(
                "product \"{}\" has an empty name",
                self.id
            )));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(SyncError::Validation(format!(
                "product \"{}\" has an invalid price {}",
                self.id, self.price
            )));
        }
        if let Some(ImageRef::Inline { payload, .. }) = self.image_ref() {
            validate_inline_image(payload)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// Where a product or logo image lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRef<'a> {
    Url(&'a str),
    Inline { mime: &'a str, payload: &'a str },
}

impl<'a> ImageRef<'a> {
    pub fn parse(raw: &'a str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest.split_once(',')?;
                let mime = header.split(';').next().unwrap_or_default();
                Some(ImageRef::Inline { mime, payload })
            }
            None => Some(ImageRef::Url(trimmed)),
        }
    }
}

/// Decode an inline base64 image and check its size and format.
/// Returns the decoded size in bytes.
pub fn validate_inline_image(payload: &str) -> Result<usize, SyncError> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    // base64 inflates by 4/3; reject obviously oversized payloads before decoding
    if compact.len() / 4 * 3 > MAX_INLINE_IMAGE_BYTES + 3 {
        return Err(SyncError::Validation(format!(
            "inline image exceeds {MAX_INLINE_IMAGE_BYTES} bytes"
        )));
    }
    let bytes = BASE64_STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| SyncError::Validation(format!("inline image is not valid base64: {e}")))?;
    if bytes.len() > MAX_INLINE_IMAGE_BYTES {
        return Err(SyncError::Validation(format!(
            "inline image exceeds {MAX_INLINE_IMAGE_BYTES} bytes"
        )));
    }
    image::guess_format(&bytes)
        .map_err(|_| SyncError::Validation("inline image format not recognised".into()))?;
    Ok(bytes.len())
}

// ---------------------------------------------------------------------------
// System records
// ---------------------------------------------------------------------------

/// The site logo, stored as a reserved product row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Logo {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Logo {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            updated_at: None,
        }
    }

    pub fn to_record(&self) -> Product {
        Product {
            id: LOGO_RECORD_ID.to_string(),
            name: LOGO_RECORD_NAME.to_string(),
            description: String::new(),
            price: 0.0,
            category: SYSTEM_CATEGORY_ID.to_string(),
            image: Some(self.image.clone()),
            available: false,
            created_at: None,
            updated_at: self.updated_at.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SiteConfigEntry {
    pub key: String,
    pub value: Value,
}

impl SiteConfigEntry {
    pub fn record_id(key: &str) -> String {
        format!("{SITE_CONFIG_ID_PREFIX}{key}")
    }

    pub fn to_record(&self) -> Product {
        Product {
            id: Self::record_id(&self.key),
            name: self.key.clone(),
            description: self.value.to_string(),
            price: 0.0,
            category: SYSTEM_CATEGORY_ID.to_string(),
            image: None,
            available: false,
            created_at: None,
            updated_at: None,
        }
    }
}

/// A row from the products table, classified by what it represents.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredRecord {
    /// Regular menu item shown in the catalog.
    Menu(Product),
    /// Row filed under the hidden category; kept but never listed.
    Hidden(Product),
    Logo(Logo),
    SiteConfig(SiteConfigEntry),
}

impl StoredRecord {
    pub fn classify(product: Product) -> Self {
        if product.id == LOGO_RECORD_ID {
            let image = product
                .image
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string);
            return match image {
                Some(image) => StoredRecord::Logo(Logo {
                    image,
                    updated_at: product.updated_at,
                }),
                None => StoredRecord::Hidden(product),
            };
        }
        if let Some(key) = product.id.strip_prefix(SITE_CONFIG_ID_PREFIX) {
            let value = serde_json::from_str::<Value>(&product.description)
                .unwrap_or_else(|_| Value::String(product.description.clone()));
            return StoredRecord::SiteConfig(SiteConfigEntry {
                key: key.to_string(),
                value,
            });
        }
        if product.category == SYSTEM_CATEGORY_ID {
            return StoredRecord::Hidden(product);
        }
        StoredRecord::Menu(product)
    }

    pub fn into_product(self) -> Product {
        match self {
            StoredRecord::Menu(p) | StoredRecord::Hidden(p) => p,
            StoredRecord::Logo(logo) => logo.to_record(),
            StoredRecord::SiteConfig(entry) => entry.to_record(),
        }
    }
}

/// Products split by kind, as held in synced state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionedProducts {
    pub visible: Vec<Product>,
    pub hidden: Vec<Product>,
    pub logo: Option<Logo>,
    pub site_config: SiteConfig,
}

pub fn partition_products(products: Vec<Product>) -> PartitionedProducts {
    let mut out = PartitionedProducts::default();
    for product in products {
        match StoredRecord::classify(product) {
            StoredRecord::Menu(p) => out.visible.push(p),
            StoredRecord::Hidden(p) => out.hidden.push(p),
            StoredRecord::Logo(logo) => out.logo = Some(logo),
            StoredRecord::SiteConfig(entry) => {
                out.site_config.insert(entry.key, entry.value);
            }
        }
    }
    out
}

/// Build the full product set for a replace-by-diff push. System rows held in
/// memory are re-appended when the caller's set does not carry them, so a
/// routine product push never deletes the logo or site configuration.
pub fn assemble_push_set(
    visible: &[Product],
    hidden: &[Product],
    logo: Option<&Logo>,
    site_config: &SiteConfig,
) -> Vec<Product> {
    let mut out: Vec<Product> = visible.to_vec();
    let contains = |out: &[Product], id: &str| out.iter().any(|p| p.id == id);

    for product in hidden {
        if !contains(&out, &product.id) {
            out.push(product.clone());
        }
    }
    if let Some(logo) = logo {
        if !contains(&out, LOGO_RECORD_ID) {
            out.push(logo.to_record());
        }
    }
    for (key, value) in site_config {
        if !contains(&out, &SiteConfigEntry::record_id(key)) {
            out.push(
                SiteConfigEntry {
                    key: key.clone(),
                    value: value.clone(),
                }
                .to_record(),
            );
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// Body of `GET`/`POST` on the sync endpoint. Both keys are required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MenuSnapshot {
    pub categories: Vec<Category>,
    pub products: Vec<Product>,
}

impl MenuSnapshot {
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.products.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PNG_1X1: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    #[test]
    fn test_sort_categories_missing_order_last() {
        let mut cats = vec![
            Category {
                order: None,
                ..Category::new("c", "Bebidas", 0)
            },
            Category::new("b", "Bolos", 2),
            Category::new("a", "Pães", 1),
            Category {
                order: None,
                ..Category::new("d", "Salgados", 0)
            },
        ];
        sort_categories(&mut cats);
        let ids: Vec<&str> = cats.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_category_order_accepts_null_and_absent() {
        let cats: Vec<Category> = serde_json::from_value(json!([
            { "id": "a", "name": "A", "order": null },
            { "id": "b", "name": "B" },
            { "id": "c", "name": "C", "order": 3, "createdAt": "2024-05-01T10:00:00Z" }
        ]))
        .expect("categories should parse");
        assert_eq!(cats[0].order, None);
        assert_eq!(cats[1].order, None);
        assert_eq!(cats[2].order, Some(3));
        assert_eq!(cats[2].created_at.as_deref(), Some("2024-05-01T10:00:00Z"));
    }

    #[test]
    fn test_category_label_orphan() {
        let cats = vec![Category::new("cat-1", "Pães", 0)];
        assert_eq!(category_label(&cats, "cat-1"), "Pães");
        assert_eq!(category_label(&cats, "gone"), ORPHAN_CATEGORY_LABEL);
    }

    #[test]
    fn test_public_categories_skip_system() {
        let cats = vec![
            Category::new("cat-1", "Pães", 0),
            Category::new(SYSTEM_CATEGORY_ID, "System", 99),
        ];
        let public: Vec<&str> = public_categories(&cats).map(|c| c.id.as_str()).collect();
        assert_eq!(public, vec!["cat-1"]);
    }

    #[test]
    fn test_product_flag_parsing_is_lenient() {
        let products: Vec<Product> = serde_json::from_value(json!([
            { "id": "p1", "name": "Pão", "price": 1.5, "category": "c", "available": 0 },
            { "id": "p2", "name": "Bolo", "price": 10, "category": "c", "available": "true" },
            { "id": "p3", "name": "Café", "price": 4, "category": "c" }
        ]))
        .expect("products should parse");
        assert!(!products[0].available);
        assert!(products[1].available);
        assert!(products[2].available);
        assert_eq!(products[2].description, "");
    }

    #[test]
    fn test_product_price_parsing_is_lenient() {
        let products: Vec<Product> = serde_json::from_value(json!([
            { "id": "p1", "name": "Pão", "price": "3.50", "category": "c" },
            { "id": "p2", "name": "Bolo", "price": " 12,90 ", "category": "c" },
            { "id": "p3", "name": "Café", "price": null, "category": "c" },
            { "id": "p4", "name": "Broa", "category": "c" },
            { "id": "p5", "name": "Sonho", "price": "a combinar", "category": "c" },
            { "id": "p6", "name": "Torta", "price": 45, "category": "c" }
        ]))
        .expect("products should parse");
        let prices: Vec<f64> = products.iter().map(|p| p.price).collect();
        assert_eq!(prices, vec![3.5, 12.9, 0.0, 0.0, 0.0, 45.0]);
    }

    #[test]
    fn test_classify_reserved_records() {
        let logo = Product {
            image: Some("https://cdn.example/logo.png".into()),
            ..Product::new(LOGO_RECORD_ID, "Logo", 0.0, SYSTEM_CATEGORY_ID)
        };
        assert!(matches!(StoredRecord::classify(logo), StoredRecord::Logo(l) if l.image == "https://cdn.example/logo.png"));

        let hours = Product {
            description: json!({ "mon": "07:00-19:00" }).to_string(),
            ..Product::new(
                SiteConfigEntry::record_id("business_hours"),
                "business_hours",
                0.0,
                SYSTEM_CATEGORY_ID,
            )
        };
        match StoredRecord::classify(hours) {
            StoredRecord::SiteConfig(entry) => {
                assert_eq!(entry.key, "business_hours");
                assert_eq!(entry.value, json!({ "mon": "07:00-19:00" }));
            }
            other => panic!("expected site config, got {other:?}"),
        }

        let hidden = Product::new("internal", "Internal", 0.0, SYSTEM_CATEGORY_ID);
        assert!(matches!(StoredRecord::classify(hidden), StoredRecord::Hidden(_)));

        let bread = Product::new("p1", "Pão francês", 0.8, "cat-1");
        assert!(matches!(StoredRecord::classify(bread), StoredRecord::Menu(_)));
    }

    #[test]
    fn test_logo_without_image_is_not_a_logo() {
        let blank = Product::new(LOGO_RECORD_ID, "Logo", 0.0, SYSTEM_CATEGORY_ID);
        let parts = partition_products(vec![blank]);
        assert!(parts.logo.is_none());
        assert_eq!(parts.hidden.len(), 1);
    }

    #[test]
    fn test_partition_products() {
        let parts = partition_products(vec![
            Product::new("p1", "Pão", 1.0, "cat-1"),
            Logo::new("data:image/png;base64,AAAA").to_record(),
            SiteConfigEntry {
                key: "whatsapp".into(),
                value: json!("+55 11 99999-0000"),
            }
            .to_record(),
            Product::new("p2", "Bolo", 30.0, "orphan"),
        ]);
        assert_eq!(parts.visible.len(), 2);
        assert!(parts.hidden.is_empty());
        assert_eq!(
            parts.logo.map(|l| l.image),
            Some("data:image/png;base64,AAAA".to_string())
        );
        assert_eq!(parts.site_config.get("whatsapp"), Some(&json!("+55 11 99999-0000")));
    }

    #[test]
    fn test_assemble_push_set_reappends_system_rows() {
        let visible = vec![Product::new("p1", "Pão", 1.0, "cat-1")];
        let hidden = vec![Product::new("h1", "Hidden", 0.0, SYSTEM_CATEGORY_ID)];
        let logo = Logo::new("https://cdn.example/logo.png");
        let mut config = SiteConfig::new();
        config.insert("business_hours".into(), json!("07-19"));

        let set = assemble_push_set(&visible, &hidden, Some(&logo), &config);
        let ids: Vec<&str> = set.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["p1", "h1", LOGO_RECORD_ID, "__site_config__:business_hours"]
        );

        // a logo row already in the set is not duplicated
        let with_logo = vec![logo.to_record()];
        let set = assemble_push_set(&with_logo, &[], Some(&logo), &SiteConfig::new());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_image_ref_parse() {
        assert_eq!(
            ImageRef::parse("https://cdn.example/pao.jpg"),
            Some(ImageRef::Url("https://cdn.example/pao.jpg"))
        );
        assert_eq!(
            ImageRef::parse("data:image/png;base64,AAAA"),
            Some(ImageRef::Inline {
                mime: "image/png",
                payload: "AAAA"
            })
        );
        assert_eq!(ImageRef::parse("   "), None);
        assert_eq!(ImageRef::parse("data:broken"), None);
    }

    #[test]
    fn test_validate_inline_image() {
        let size = validate_inline_image(PNG_1X1).expect("png should validate");
        assert!(size > 0);

        let not_image = BASE64_STANDARD.encode(b"hello world, not a picture");
        assert!(matches!(
            validate_inline_image(&not_image),
            Err(SyncError::Validation(_))
        ));

        let oversized = BASE64_STANDARD.encode(vec![0u8; MAX_INLINE_IMAGE_BYTES + 10]);
        let err = validate_inline_image(&oversized).expect_err("oversized should fail");
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_product_validate() {
        assert!(Product::new("p1", "Pão", 0.0, "cat-1").validate().is_ok());
        assert!(Product::new("p1", "Pão", -1.0, "cat-1").validate().is_err());
        assert!(Product::new("p1", "Pão", f64::NAN, "cat-1").validate().is_err());
        assert!(Product::new(" ", "Pão", 1.0, "cat-1").validate().is_err());
        assert!(Product::new("p1", "", 1.0, "cat-1").validate().is_err());

        let with_image = Product {
            image: Some(format!("data:image/png;base64,{PNG_1X1}")),
            ..Product::new("p1", "Pão", 1.0, "cat-1")
        };
        assert!(with_image.validate().is_ok());
    }

    #[test]
    fn test_snapshot_requires_both_keys() {
        let err = serde_json::from_value::<MenuSnapshot>(json!({ "categories": [] }))
            .expect_err("missing products should fail");
        assert!(err.to_string().contains("products"));
        let ok: MenuSnapshot =
            serde_json::from_value(json!({ "categories": [], "products": [] })).unwrap();
        assert!(ok.is_empty());
    }
}
