use crate::classify::{parse_dimensions, Dimensions};
use crate::control::{flag, see_other, ControllerError, Response};
use crate::{comma_list, empty_string_as_none, empty_string_as_none_parse};
use actix_web::web::{Data, Path, Query};
use actix_web::{get, HttpResponse};
use gifts_types::category::{self, BySlug, Category, CategoryRepository, Featured};
use gifts_types::product::{
    Brand, BrandBySlug, BrandRepository, Facets, Page, Product, ProductQuery, ProductRepository,
    SortOrder,
};
use gifts_types::ProductStatus;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use typesafe_repository::async_ops::{Find, Get, List, Select};

pub const CATEGORY_PAGE_SIZE: usize = 12;
pub const PRODUCTS_PAGE_SIZE: usize = 24;
pub const SEARCH_PAGE_SIZE: usize = 12;
pub const SUGGESTIONS_LIMIT: usize = 5;
const HOME_LIMIT: usize = 8;
const MAX_PAGE_SIZE: usize = 100;

/// Product as shown in listings
#[derive(Serialize, Debug, Clone)]
pub struct ProductCard {
    pub product_id: String,
    pub code: String,
    pub name: String,
    pub brand: Option<String>,
    pub price: Decimal,
    pub old_price: Option<Decimal>,
    pub discount_percent: u32,
    pub image: Option<String>,
    pub status: ProductStatus,
    pub in_stock: bool,
    pub quantity: i64,
    pub url: String,
}

impl From<&Product> for ProductCard {
    fn from(p: &Product) -> Self {
        Self {
            product_id: p.product_id.clone(),
            code: p.code.clone(),
            name: p.name.clone(),
            brand: p.brand.clone(),
            price: p.price,
            old_price: p.old_price.filter(|_| p.has_discount()),
            discount_percent: p.discount_percent(),
            image: p.main_image().map(ToString::to_string),
            status: p.status,
            in_stock: p.in_stock,
            quantity: p.quantity,
            url: format!("/product/{}", p.product_id),
        }
    }
}

fn cards(products: &[Product]) -> Vec<ProductCard> {
    products.iter().map(ProductCard::from).collect()
}

#[derive(Deserialize, Debug, Default)]
pub struct Pagination {
    #[serde(default, deserialize_with = "empty_string_as_none_parse")]
    pub page: Option<usize>,
    #[serde(default, deserialize_with = "empty_string_as_none_parse")]
    pub per_page: Option<usize>,
}

impl Pagination {
    fn page(&self) -> usize {
        self.page.unwrap_or(1).max(1)
    }

    fn per_page(&self, default: usize) -> usize {
        self.per_page.unwrap_or(default).clamp(1, MAX_PAGE_SIZE)
    }

    /// Applies offset and limit to `query`
    fn apply(&self, query: ProductQuery, default: usize) -> ProductQuery {
        let per_page = self.per_page(default);
        ProductQuery {
            offset: (self.page() - 1) * per_page,
            limit: per_page,
            ..query
        }
    }
}

async fn paged_products(
    products: &dyn ProductRepository,
    pagination: &Pagination,
    query: ProductQuery,
    default: usize,
) -> Result<Page<ProductCard>, ControllerError> {
    let query = pagination.apply(query, default);
    let (items, total) = products.query(&query).await?;
    Ok(Page {
        items: cards(&items),
        total,
        page: pagination.page(),
        per_page: query.limit,
    })
}

#[derive(Serialize)]
struct Listing<'a> {
    #[serde(flatten)]
    page: &'a Page<ProductCard>,
    pages: usize,
}

fn listing(page: &Page<ProductCard>) -> Listing<'_> {
    Listing {
        page,
        pages: page.pages(),
    }
}

#[get("/")]
pub async fn home(
    categories: Data<Arc<dyn CategoryRepository>>,
    products: Data<Arc<dyn ProductRepository>>,
    brands: Data<Arc<dyn BrandRepository>>,
) -> Response {
    let mut featured = categories.select(&Featured).await?;
    if featured.is_empty() {
        featured = categories
            .list()
            .await?
            .into_iter()
            .filter(|c| c.parent_id.is_none())
            .collect();
    }
    featured.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
    let (new_products, _) = products
        .query(&ProductQuery {
            is_featured: Some(true),
            in_stock: true,
            sort: Some(SortOrder::Newest),
            limit: HOME_LIMIT,
            ..Default::default()
        })
        .await?;
    let (bestsellers, _) = products
        .query(&ProductQuery {
            is_bestseller: Some(true),
            in_stock: true,
            limit: HOME_LIMIT,
            ..Default::default()
        })
        .await?;
    let mut brands: Vec<Brand> = brands
        .list()
        .await?
        .into_iter()
        .filter(|b| b.is_active)
        .collect();
    brands.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "site_name": crate::SITE_NAME.as_str(),
        "categories": featured,
        "new_products": cards(&new_products),
        "bestsellers": cards(&bestsellers),
        "brands": brands,
    })))
}

#[get("/catalog")]
pub async fn catalog(categories: Data<Arc<dyn CategoryRepository>>) -> Response {
    let tree = category::build_tree(categories.list().await?);
    Ok(HttpResponse::Ok().json(tree))
}

#[derive(Deserialize, Debug, Default)]
pub struct CategoryFilters {
    #[serde(default, deserialize_with = "empty_string_as_none_parse")]
    pub min_price: Option<Decimal>,
    #[serde(default, deserialize_with = "empty_string_as_none_parse")]
    pub max_price: Option<Decimal>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub status: Option<ProductStatus>,
    #[serde(default, deserialize_with = "comma_list")]
    pub brands: Vec<String>,
    #[serde(default, deserialize_with = "comma_list")]
    pub materials: Vec<String>,
    #[serde(default, deserialize_with = "comma_list")]
    pub sizes: Vec<String>,
    #[serde(default, deserialize_with = "flag")]
    pub is_featured: bool,
    #[serde(default, deserialize_with = "flag")]
    pub is_bestseller: bool,
    #[serde(default, deserialize_with = "flag")]
    pub has_discount: bool,
    #[serde(default, deserialize_with = "flag")]
    pub in_stock: bool,
    #[serde(default, deserialize_with = "flag")]
    pub on_order: bool,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub sort: Option<SortOrder>,
    #[serde(flatten)]
    pub pagination: Pagination,
}

impl CategoryFilters {
    pub fn query(&self, categories: Vec<uuid::Uuid>) -> ProductQuery {
        ProductQuery {
            categories: Some(categories),
            min_price: self.min_price,
            max_price: self.max_price,
            status: self.status,
            brands: self.brands.clone(),
            materials: self.materials.clone(),
            sizes: self.sizes.clone(),
            is_featured: self.is_featured.then_some(true),
            is_bestseller: self.is_bestseller.then_some(true),
            has_discount: self.has_discount,
            in_stock: self.in_stock,
            on_order: self.on_order,
            sort: self.sort,
            ..Default::default()
        }
    }
}

#[derive(Serialize)]
struct CategoryPage<'a> {
    category: &'a Category,
    breadcrumbs: Vec<&'a Category>,
    subcategories: Vec<&'a Category>,
    products: Listing<'a>,
    facets: Facets,
    sort: Option<SortOrder>,
}

#[get("/category/{slug}")]
pub async fn category_page(
    slug: Path<String>,
    filters: Query<CategoryFilters>,
    categories: Data<Arc<dyn CategoryRepository>>,
    products: Data<Arc<dyn ProductRepository>>,
) -> Response {
    let current = categories
        .find(&BySlug(slug.into_inner()))
        .await?
        .ok_or(ControllerError::NotFound)?;
    let all = categories.list().await?;
    let query = filters.query(category::descendants(&all, &current.id));
    let facets = products.facets(&query).await?;
    let page = paged_products(
        products.get_ref().as_ref(),
        &filters.pagination,
        query,
        CATEGORY_PAGE_SIZE,
    )
    .await?;
    let mut subcategories: Vec<&Category> = all
        .iter()
        .filter(|c| c.parent_id == Some(current.id) && c.id != current.id)
        .collect();
    subcategories.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
    Ok(HttpResponse::Ok().json(CategoryPage {
        category: &current,
        breadcrumbs: category::breadcrumbs(&all, &current.id),
        subcategories,
        products: listing(&page),
        facets,
        sort: filters.sort,
    }))
}

#[derive(Deserialize, Debug, Default)]
pub struct ProductListParams {
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub brand: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub status: Option<ProductStatus>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub sort: Option<SortOrder>,
    #[serde(flatten)]
    pub pagination: Pagination,
}

#[get("/products")]
pub async fn product_list(
    params: Query<ProductListParams>,
    categories: Data<Arc<dyn CategoryRepository>>,
    brands: Data<Arc<dyn BrandRepository>>,
    products: Data<Arc<dyn ProductRepository>>,
) -> Response {
    let mut query = ProductQuery {
        in_stock: true,
        status: params.status,
        sort: params.sort,
        ..Default::default()
    };
    if let Some(slug) = &params.brand {
        let brand = brands
            .find(&BrandBySlug(slug.clone()))
            .await?
            .ok_or(ControllerError::NotFound)?;
        query.brands = vec![brand.name];
    }
    if let Some(slug) = &params.category {
        let category = categories
            .find(&BySlug(slug.clone()))
            .await?
            .ok_or(ControllerError::NotFound)?;
        query.categories = Some(vec![category.id]);
    }
    let page = paged_products(
        products.get_ref().as_ref(),
        &params.pagination,
        query,
        PRODUCTS_PAGE_SIZE,
    )
    .await?;
    Ok(HttpResponse::Ok().json(listing(&page)))
}

/// One orderable size of a product
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SizeInfo {
    pub size: String,
    pub quantity: i64,
    pub price: Decimal,
    pub old_price: Option<Decimal>,
    pub in_stock: bool,
    pub is_variant: bool,
}

/// Sizes from the variants, falling back to `sizes_available` with the product stock
pub fn size_info(p: &Product) -> Vec<SizeInfo> {
    if !p.variants.is_empty() {
        return p
            .variants
            .iter()
            .map(|v| SizeInfo {
                size: v.size.clone(),
                quantity: v.quantity,
                price: v.price,
                old_price: v.old_price.or(p.old_price),
                in_stock: v.quantity > 0,
                is_variant: true,
            })
            .collect();
    }
    p.sizes_available
        .iter()
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|size| SizeInfo {
            size: size.to_string(),
            quantity: p.quantity,
            price: p.price,
            old_price: p.old_price,
            in_stock: p.quantity > 0,
            is_variant: false,
        })
        .collect()
}

#[derive(Serialize)]
struct ReadableFilter<'a> {
    name: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct ProductDetails<'a> {
    #[serde(flatten)]
    product: &'a Product,
    discount_percent: u32,
    has_discount: bool,
    main_image: Option<&'a str>,
    images: Vec<String>,
    sizes: Vec<SizeInfo>,
    has_multiple_prices: bool,
    all_sizes_out_of_stock: bool,
    readable_filters: Vec<ReadableFilter<'a>>,
    breadcrumbs: Vec<&'a Category>,
    dimensions_mm: Option<Dimensions>,
}

#[get("/product/{product_id}")]
pub async fn product_page(
    product_id: Path<String>,
    products: Data<Arc<dyn ProductRepository>>,
    categories: Data<Arc<dyn CategoryRepository>>,
) -> Response {
    let product = products
        .get_one(&product_id.into_inner())
        .await?
        .ok_or(ControllerError::NotFound)?;
    let all = categories.list().await?;
    let breadcrumbs = product
        .categories
        .first()
        .map(|id| category::breadcrumbs(&all, id))
        .unwrap_or_default();
    let sizes = size_info(&product);
    let images = product
        .images()
        .map(|a| match &a.local_path {
            Some(path) => format!("/media/{path}"),
            None => a.url.clone(),
        })
        .collect();
    let readable_filters = product
        .readable_filters()
        .filter_map(|f| {
            Some(ReadableFilter {
                name: f.type_name.as_deref()?,
                value: f.filter_name.as_deref()?,
            })
        })
        .collect();
    Ok(HttpResponse::Ok().json(ProductDetails {
        discount_percent: product.discount_percent(),
        has_discount: product.has_discount(),
        main_image: product.main_image(),
        images,
        has_multiple_prices: sizes.iter().any(|s| s.price != product.price),
        all_sizes_out_of_stock: !sizes.is_empty() && sizes.iter().all(|s| s.quantity <= 0),
        sizes,
        readable_filters,
        breadcrumbs,
        dimensions_mm: product
            .dimensions
            .as_deref()
            .or(product.product_size.as_deref())
            .and_then(parse_dimensions),
        product: &product,
    }))
}

#[get("/brands")]
pub async fn brand_list(brands: Data<Arc<dyn BrandRepository>>) -> Response {
    let mut brands: Vec<Brand> = brands
        .list()
        .await?
        .into_iter()
        .filter(|b| b.is_active)
        .collect();
    brands.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(HttpResponse::Ok().json(brands))
}

#[derive(Deserialize, Debug, Default)]
pub struct BrandParams {
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub sort: Option<SortOrder>,
    #[serde(flatten)]
    pub pagination: Pagination,
}

#[get("/brand/{slug}")]
pub async fn brand_page(
    slug: Path<String>,
    params: Query<BrandParams>,
    brands: Data<Arc<dyn BrandRepository>>,
    products: Data<Arc<dyn ProductRepository>>,
) -> Response {
    let brand = brands
        .find(&BrandBySlug(slug.into_inner()))
        .await?
        .ok_or(ControllerError::NotFound)?;
    let query = ProductQuery {
        brands: vec![brand.name.clone()],
        in_stock: true,
        sort: params.sort,
        ..Default::default()
    };
    let page = paged_products(
        products.get_ref().as_ref(),
        &params.pagination,
        query,
        PRODUCTS_PAGE_SIZE,
    )
    .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "brand": brand,
        "products": listing(&page),
    })))
}

#[derive(Deserialize, Debug, Default)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    #[serde(flatten)]
    pub pagination: Pagination,
}

/// Category a search query names directly
pub fn matching_category<'a>(categories: &'a [Category], query: &str) -> Option<&'a Category> {
    let lower = query.to_lowercase();
    categories.iter().find(|c| {
        c.slug.eq_ignore_ascii_case(query)
            || c.name.to_lowercase() == lower
            || c.name.to_lowercase().contains(&lower)
    })
}

#[get("/search")]
pub async fn search(
    params: Query<SearchParams>,
    categories: Data<Arc<dyn CategoryRepository>>,
    products: Data<Arc<dyn ProductRepository>>,
) -> Response {
    let q = params.q.trim();
    if q.is_empty() {
        let page: Page<ProductCard> = Page {
            items: vec![],
            total: 0,
            page: 1,
            per_page: SEARCH_PAGE_SIZE,
        };
        return Ok(HttpResponse::Ok().json(serde_json::json!({
            "query": q,
            "products": listing(&page),
        })));
    }
    let all = categories.list().await?;
    if let Some(category) = matching_category(&all, q) {
        return Ok(see_other(&format!("/category/{}", category.slug)));
    }
    let query = ProductQuery {
        text: Some(q.to_string()),
        in_stock: true,
        ..Default::default()
    };
    let page = paged_products(
        products.get_ref().as_ref(),
        &params.pagination,
        query,
        SEARCH_PAGE_SIZE,
    )
    .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "query": q,
        "products": listing(&page),
    })))
}

#[derive(Serialize, Debug)]
struct Suggestion {
    name: String,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[get("/search/suggestions")]
pub async fn search_suggestions(
    params: Query<SearchParams>,
    categories: Data<Arc<dyn CategoryRepository>>,
    products: Data<Arc<dyn ProductRepository>>,
) -> Response {
    let q = params.q.trim().to_lowercase();
    let mut found_categories = vec![];
    let mut found_products = vec![];
    if q.chars().count() >= 2 {
        found_categories = categories
            .list()
            .await?
            .into_iter()
            .filter(|c| {
                c.name.to_lowercase().contains(&q)
                    || c.description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&q))
            })
            .take(SUGGESTIONS_LIMIT)
            .map(|c| Suggestion {
                url: format!("/category/{}", c.slug),
                name: c.name,
                price: None,
                image: None,
                kind: "category",
            })
            .collect();
        let (items, _) = products
            .query(&ProductQuery {
                text: Some(q.clone()),
                in_stock: true,
                limit: SUGGESTIONS_LIMIT,
                ..Default::default()
            })
            .await?;
        found_products = items
            .iter()
            .map(|p| Suggestion {
                name: p.name.clone(),
                url: format!("/product/{}", p.product_id),
                price: Some(p.price),
                image: p.main_image().map(ToString::to_string),
                kind: "product",
            })
            .collect();
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "categories": found_categories,
        "products": found_products,
    })))
}
