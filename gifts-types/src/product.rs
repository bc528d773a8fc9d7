use crate::category::Category;
use crate::{Availability, Gender, ProductStatus};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use typesafe_repository::async_ops::{Find, Get, List, Save, Select};
use typesafe_repository::macros::Id;
use typesafe_repository::prelude::*;
use typesafe_repository::{SelectBy, Selector};
use uuid::Uuid;

#[derive(Id, Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Brand {
    #[id]
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub is_active: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    File,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
    pub name: Option<String>,
    pub local_path: Option<String>,
}

/// Resolved `filters/filter` reference of a product
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FilterValue {
    pub type_id: String,
    pub type_name: Option<String>,
    pub filter_id: String,
    pub filter_name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrintInfo {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SizeTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Size chart block of a clothing description: picture, raw table markup and a footnote
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SizeChart {
    pub image: Option<String>,
    pub table_html: String,
    pub note: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Variant {
    pub size: String,
    pub quantity: i64,
    pub price: Decimal,
    pub old_price: Option<Decimal>,
    pub sku: Option<String>,
    pub barcode: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProductFlags {
    pub made_in_russia: bool,
    pub is_eco: bool,
    pub for_kids: bool,
    pub is_profitable: bool,
    pub replaceable_refill: bool,
    pub requires_marking: bool,
    pub individual_packaging: bool,
    pub has_lining: bool,
}

#[derive(Id, Clone, Debug, Serialize, Deserialize)]
pub struct Product {
    /// Supplier `product_id`
    #[id]
    pub product_id: String,
    pub group_id: Option<String>,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub old_price: Option<Decimal>,
    pub small_image: Option<String>,
    pub big_image: Option<String>,
    pub super_big_image: Option<String>,
    pub brand: Option<String>,
    pub brand_id: Option<IdentityOf<Brand>>,
    pub status: ProductStatus,
    pub in_stock: bool,
    pub quantity: i64,
    pub material: Option<String>,
    pub weight: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub barcode: Option<String>,
    pub product_size: Option<String>,
    pub is_featured: bool,
    pub is_bestseller: bool,
    pub gender: Option<Gender>,
    pub sizes_available: Option<String>,
    pub dimensions: Option<String>,
    pub alt_ids: Vec<String>,
    pub flags: ProductFlags,
    pub page_count: Option<i64>,
    /// Free text technical attributes keyed by their feed element name
    pub attributes: BTreeMap<String, String>,
    pub filters: Vec<FilterValue>,
    pub prints: Vec<PrintInfo>,
    pub attachments: Vec<Attachment>,
    pub variants: Vec<Variant>,
    pub size_table: Option<SizeTable>,
    pub size_chart: Option<SizeChart>,
    pub categories: Vec<IdentityOf<Category>>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Product {
    pub fn has_discount(&self) -> bool {
        self.old_price.is_some_and(|old| old > self.price)
    }

    pub fn discount_percent(&self) -> u32 {
        match self.old_price {
            Some(old) if old > self.price && !old.is_zero() => {
                ((Decimal::ONE - self.price / old) * Decimal::ONE_HUNDRED)
                    .trunc()
                    .to_u32()
                    .unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn main_image(&self) -> Option<&str> {
        self.super_big_image
            .as_deref()
            .or(self.big_image.as_deref())
            .or(self.small_image.as_deref())
    }

    pub fn availability(&self) -> Availability {
        Availability::new(self.in_stock, self.quantity)
    }

    pub fn images(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments
            .iter()
            .filter(|a| a.kind == AttachmentKind::Image)
    }

    /// Filters shown on the product page; type `8` duplicates the category and is hidden
    pub fn readable_filters(&self) -> impl Iterator<Item = &FilterValue> {
        self.filters
            .iter()
            .filter(|f| f.type_id != "8" && f.type_name.is_some() && f.filter_name.is_some())
    }
}

/// Stock level computed from `stock.xml` for a single product
#[derive(Debug, Clone, PartialEq)]
pub struct StockUpdate {
    pub product_id: String,
    pub quantity: i64,
    pub sizes: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    PriceAsc,
    PriceDesc,
    NameAsc,
    NameDesc,
    Newest,
}

/// Storefront product query; every `None` means "not filtered"
#[derive(Debug, Clone, Default)]
pub struct ProductQuery {
    pub categories: Option<Vec<IdentityOf<Category>>>,
    pub brand_id: Option<IdentityOf<Brand>>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub status: Option<ProductStatus>,
    pub brands: Vec<String>,
    pub materials: Vec<String>,
    pub sizes: Vec<String>,
    pub is_featured: Option<bool>,
    pub is_bestseller: Option<bool>,
    pub has_discount: bool,
    pub in_stock: bool,
    pub on_order: bool,
    pub text: Option<String>,
    pub sort: Option<SortOrder>,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Facets {
    pub brands: Vec<String>,
    pub materials: Vec<String>,
    pub sizes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

impl<T> Page<T> {
    pub fn pages(&self) -> usize {
        if self.per_page == 0 {
            return 0;
        }
        self.total.div_ceil(self.per_page)
    }
}

pub struct ByCode(pub String);
pub struct InCategory(pub IdentityOf<Category>);

impl Selector for ByCode {}
impl SelectBy<ByCode> for Product {}

impl Selector for InCategory {}
impl SelectBy<InCategory> for Product {}

/// What keyword based category linking looks at: texts and the categories a product already has
#[derive(Debug, Clone, PartialEq)]
pub struct ProductText {
    pub product_id: String,
    pub name: String,
    pub description: Option<String>,
    pub categories: Vec<IdentityOf<Category>>,
}

pub struct BrandByName(pub String);
pub struct BrandBySlug(pub String);

impl Selector for BrandByName {}
impl SelectBy<BrandByName> for Brand {}

impl Selector for BrandBySlug {}
impl SelectBy<BrandBySlug> for Brand {}

#[async_trait]
pub trait ProductRepository:
    Repository<Product, Error = anyhow::Error>
    + Get<Product>
    + Save<Product>
    + Find<Product, ByCode>
    + Select<Product, InCategory>
    + Send
    + Sync
{
    async fn exists(&self, product_id: &str) -> Result<bool, Self::Error>;
    async fn query(&self, query: &ProductQuery) -> Result<(Vec<Product>, usize), Self::Error>;
    async fn facets(&self, query: &ProductQuery) -> Result<Facets, Self::Error>;
    /// `(product_id, code)` of every product, used to match stock rows
    async fn codes(&self) -> Result<Vec<(String, String)>, Self::Error>;
    async fn update_stock(&self, updates: Vec<StockUpdate>) -> Result<usize, Self::Error>;
    async fn link_categories(
        &self,
        product_id: &str,
        categories: Vec<IdentityOf<Category>>,
    ) -> Result<(), Self::Error>;
    async fn texts(&self) -> Result<Vec<ProductText>, Self::Error>;
    async fn uncategorized(&self) -> Result<Vec<String>, Self::Error>;
    async fn set_attachment_path(
        &self,
        product_id: &str,
        url: &str,
        path: &str,
    ) -> Result<(), Self::Error>;
}

#[async_trait]
pub trait BrandRepository:
    Repository<Brand, Error = anyhow::Error>
    + Get<Brand>
    + Save<Brand>
    + List<Brand>
    + Find<Brand, BrandByName>
    + Find<Brand, BrandBySlug>
    + Send
    + Sync
{
    async fn slug_taken(&self, slug: &str) -> Result<bool, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub fn product(product_id: &str) -> Product {
        Product {
            product_id: product_id.to_string(),
            group_id: None,
            code: format!("{product_id}.10"),
            name: "Футболка".to_string(),
            description: None,
            price: dec!(100),
            old_price: None,
            small_image: None,
            big_image: None,
            super_big_image: None,
            brand: None,
            brand_id: None,
            status: ProductStatus::Regular,
            in_stock: true,
            quantity: 0,
            material: None,
            weight: None,
            volume: None,
            barcode: None,
            product_size: None,
            is_featured: false,
            is_bestseller: false,
            gender: None,
            sizes_available: None,
            dimensions: None,
            alt_ids: vec![],
            flags: ProductFlags::default(),
            page_count: None,
            attributes: BTreeMap::new(),
            filters: vec![],
            prints: vec![],
            attachments: vec![],
            variants: vec![],
            size_table: None,
            size_chart: None,
            categories: vec![],
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn computes_discount() {
        let mut p = product("1");
        assert!(!p.has_discount());
        assert_eq!(p.discount_percent(), 0);
        p.old_price = Some(dec!(150));
        assert!(p.has_discount());
        assert_eq!(p.discount_percent(), 33);
        p.old_price = Some(dec!(90));
        assert!(!p.has_discount());
        assert_eq!(p.discount_percent(), 0);
    }

    #[test]
    fn picks_largest_image() {
        let mut p = product("1");
        assert_eq!(p.main_image(), None);
        p.small_image = Some("s.jpg".to_string());
        assert_eq!(p.main_image(), Some("s.jpg"));
        p.big_image = Some("b.jpg".to_string());
        assert_eq!(p.main_image(), Some("b.jpg"));
        p.super_big_image = Some("sb.jpg".to_string());
        assert_eq!(p.main_image(), Some("sb.jpg"));
    }

    #[test]
    fn hides_category_filters() {
        let mut p = product("1");
        p.filters = vec![
            FilterValue {
                type_id: "8".to_string(),
                type_name: Some("Категория".to_string()),
                filter_id: "1".to_string(),
                filter_name: Some("Ручки".to_string()),
            },
            FilterValue {
                type_id: "21".to_string(),
                type_name: Some("Цвет".to_string()),
                filter_id: "5".to_string(),
                filter_name: Some("Синий".to_string()),
            },
        ];
        let visible: Vec<_> = p.readable_filters().map(|f| f.type_id.as_str()).collect();
        assert_eq!(visible, vec!["21"]);
    }

    #[test]
    fn counts_pages() {
        let page = Page::<()> {
            items: vec![],
            total: 25,
            page: 1,
            per_page: 12,
        };
        assert_eq!(page.pages(), 3);
    }
}
