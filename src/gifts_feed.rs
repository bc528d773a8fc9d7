use crate::classify::{
    infer_gender, normalize_size, normalize_sizes, parse_size_chart, parse_size_table,
};
use gifts_types::product::{
    Attachment, AttachmentKind, FilterValue, PrintInfo, Product, ProductFlags, Variant,
};
use gifts_types::ProductStatus;
use quick_xml::DeError;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use time::OffsetDateTime;
use url::Url;

#[derive(Debug, Default, Deserialize)]
pub struct ProductFeed {
    #[serde(default, rename = "product")]
    pub products: Vec<ProductDto>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ImageRef {
    #[serde(default, rename = "@src")]
    pub src: Option<String>,
    #[serde(default, rename = "$text")]
    pub text: Option<String>,
}

impl ImageRef {
    pub fn path(&self) -> Option<&str> {
        self.src
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| self.text.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusDto {
    #[serde(default, rename = "@id")]
    pub id: Option<String>,
    #[serde(default, rename = "$text")]
    pub label: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PriceDto {
    pub price: Option<String>,
    pub oldprice: Option<String>,
    pub currency: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FilterRefs {
    #[serde(default, rename = "filter")]
    pub filters: Vec<FilterRef>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FilterRef {
    pub filtertypeid: Option<String>,
    pub filterid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PrintDto {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AttachmentDto {
    pub meaning: Option<String>,
    pub file: Option<ImageRef>,
    pub image: Option<ImageRef>,
    pub name: Option<String>,
}

impl AttachmentDto {
    pub fn is_image(&self) -> bool {
        self.meaning.as_deref().map(str::trim) == Some("1")
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Variants {
    #[serde(default, rename = "variant")]
    pub variants: Vec<VariantDto>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VariantDto {
    pub size: Option<String>,
    pub price: Option<String>,
    pub oldprice: Option<String>,
    pub code: Option<String>,
    pub barcode: Option<String>,
    pub quantity: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProductDto {
    pub product_id: Option<String>,
    pub group: Option<String>,
    pub code: Option<String>,
    pub name: Option<String>,
    pub content: Option<String>,
    pub brand: Option<String>,
    pub status: Option<StatusDto>,
    #[serde(default)]
    pub page: Vec<String>,
    pub price: Option<PriceDto>,
    #[serde(alias = "matherial")]
    pub material: Option<String>,
    pub weight: Option<String>,
    pub volume: Option<String>,
    pub barcode: Option<String>,
    pub product_size: Option<String>,
    pub small_image: Option<ImageRef>,
    pub big_image: Option<ImageRef>,
    pub super_big_image: Option<ImageRef>,

    pub made_in_russia: Option<String>,
    pub is_eco: Option<String>,
    pub for_kids: Option<String>,
    pub is_profitable: Option<String>,
    pub replaceable_refill: Option<String>,
    pub requires_marking: Option<String>,
    pub individual_packaging: Option<String>,
    pub has_lining: Option<String>,

    pub application_type: Option<String>,
    pub mechanism_type: Option<String>,
    pub ball_diameter: Option<String>,
    pub refill_type: Option<String>,
    pub format_size: Option<String>,
    pub cover_type: Option<String>,
    pub block_color: Option<String>,
    pub edge_type: Option<String>,
    pub page_count: Option<String>,
    pub calendar_grid: Option<String>,
    pub ribbon_color: Option<String>,
    pub box_size: Option<String>,
    pub density: Option<String>,
    pub expiration_date: Option<String>,
    pub pantone_color: Option<String>,
    pub gender: Option<String>,
    pub cover_material: Option<String>,
    pub block_number: Option<String>,
    pub collection: Option<String>,
    pub dating: Option<String>,
    pub sizes_available: Option<String>,
    pub dimensions: Option<String>,
    pub fit: Option<String>,
    pub cut: Option<String>,
    pub lining: Option<String>,
    pub video_link: Option<String>,
    pub stock_marking: Option<String>,
    pub umbrella_type: Option<String>,
    pub marking_type: Option<String>,
    pub packaging_type: Option<String>,

    pub filters: Option<FilterRefs>,
    #[serde(default, rename = "print")]
    pub prints: Vec<PrintDto>,
    #[serde(default, rename = "product_attachment")]
    pub attachments: Vec<AttachmentDto>,
    pub variants: Option<Variants>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StockFeed {
    #[serde(default, rename = "stock")]
    pub rows: Vec<StockDto>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StockDto {
    pub product_id: Option<String>,
    pub code: Option<String>,
    pub amount: Option<String>,
    pub free: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockRow {
    pub product_id: Option<String>,
    pub code: Option<String>,
    pub free: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct TreeFeed {
    #[serde(default, rename = "page")]
    pub pages: Vec<PageDto>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageDto {
    #[serde(default, rename = "@parent_page_id")]
    pub parent_page_id: Option<String>,
    pub page_id: Option<String>,
    pub name: Option<String>,
    pub uri: Option<String>,
    #[serde(default, rename = "page")]
    pub pages: Vec<PageDto>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CatalogueFeed {
    #[serde(default, rename = "category")]
    pub categories: Vec<CatalogueCategory>,
    #[serde(default, rename = "categories")]
    pub nested: Option<Box<CatalogueFeed>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CatalogueCategory {
    #[serde(default, rename = "@id")]
    pub id: Option<String>,
    #[serde(default, rename = "@parentId")]
    pub parent_id_attr: Option<String>,
    pub parent_id: Option<String>,
    pub name: Option<String>,
}

/// Category page flattened out of the feed tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryPage {
    pub page_id: String,
    pub name: String,
    pub uri: Option<String>,
    pub parent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FiltersFeed {
    #[serde(default, rename = "filtertype")]
    pub types: Vec<FilterTypeDto>,
    pub filtertypes: Option<Box<FiltersFeed>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FilterTypeDto {
    pub filtertypeid: Option<String>,
    pub filtertypename: Option<String>,
    #[serde(default, rename = "filter")]
    pub filter: Vec<FilterDto>,
    pub filters: Option<FilterList>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FilterList {
    #[serde(default, rename = "filter")]
    pub filter: Vec<FilterDto>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FilterDto {
    pub filterid: Option<String>,
    pub filtername: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterType {
    pub name: String,
    pub values: HashMap<String, String>,
}

/// Filter type id -> names of the type and its values
pub type FilterNames = HashMap<String, FilterType>;

/// Product read from the feed together with the category pages it belongs to
#[derive(Debug, Clone)]
pub struct FeedProduct {
    pub product: Product,
    pub pages: Vec<String>,
}

fn text(s: &Option<String>) -> Option<String> {
    s.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn flag(s: &Option<String>) -> bool {
    s.as_deref()
        .is_some_and(|s| s.trim().eq_ignore_ascii_case("true"))
}

pub fn parse_decimal(s: &str) -> Option<Decimal> {
    let s: String = s
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if s.is_empty() {
        return None;
    }
    Decimal::from_str(&s).ok()
}

fn decimal(s: &Option<String>) -> Option<Decimal> {
    s.as_deref().and_then(parse_decimal)
}

fn integer(s: &Option<String>) -> Option<i64> {
    s.as_deref().and_then(|s| s.trim().parse().ok())
}

/// Resolves a feed path against the feed base url; absolute urls pass through
pub fn resolve_url(base: &Url, path: &str) -> Option<String> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    base.join(path).ok().map(String::from)
}

pub fn alt_ids(product_id: &str, code: &str) -> Vec<String> {
    let mut res = vec![];
    if !code.is_empty() {
        res.push(code.to_string());
    }
    let stripped = product_id.trim_start_matches('0');
    if stripped != product_id && !stripped.is_empty() {
        res.push(stripped.to_string());
    }
    res
}

impl ProductDto {
    fn text_attributes(&self) -> BTreeMap<String, String> {
        [
            ("application_type", &self.application_type),
            ("mechanism_type", &self.mechanism_type),
            ("ball_diameter", &self.ball_diameter),
            ("refill_type", &self.refill_type),
            ("format_size", &self.format_size),
            ("cover_type", &self.cover_type),
            ("block_color", &self.block_color),
            ("edge_type", &self.edge_type),
            ("calendar_grid", &self.calendar_grid),
            ("ribbon_color", &self.ribbon_color),
            ("box_size", &self.box_size),
            ("density", &self.density),
            ("expiration_date", &self.expiration_date),
            ("pantone_color", &self.pantone_color),
            ("cover_material", &self.cover_material),
            ("block_number", &self.block_number),
            ("collection", &self.collection),
            ("dating", &self.dating),
            ("fit", &self.fit),
            ("cut", &self.cut),
            ("lining", &self.lining),
            ("video_link", &self.video_link),
            ("stock_marking", &self.stock_marking),
            ("umbrella_type", &self.umbrella_type),
            ("marking_type", &self.marking_type),
            ("packaging_type", &self.packaging_type),
        ]
        .into_iter()
        .filter_map(|(k, v)| text(v).map(|v| (k.to_string(), v)))
        .collect()
    }

    fn flags(&self) -> ProductFlags {
        ProductFlags {
            made_in_russia: flag(&self.made_in_russia),
            is_eco: flag(&self.is_eco),
            for_kids: flag(&self.for_kids),
            is_profitable: flag(&self.is_profitable),
            replaceable_refill: flag(&self.replaceable_refill),
            requires_marking: flag(&self.requires_marking),
            individual_packaging: flag(&self.individual_packaging),
            has_lining: flag(&self.has_lining),
        }
    }

    fn filter_values(&self, names: Option<&FilterNames>) -> Vec<FilterValue> {
        self.filters
            .iter()
            .flat_map(|f| f.filters.iter())
            .filter_map(|f| {
                let type_id = text(&f.filtertypeid)?;
                let filter_id = text(&f.filterid)?;
                let ty = names.and_then(|n| n.get(&type_id));
                Some(FilterValue {
                    type_name: ty.map(|t| t.name.clone()),
                    filter_name: ty.and_then(|t| t.values.get(&filter_id).cloned()),
                    type_id,
                    filter_id,
                })
            })
            .collect()
    }

    /// Builds the domain product; `None` when the record has no `product_id`
    pub fn into_feed_product(
        self,
        base: &Url,
        names: Option<&FilterNames>,
        now: OffsetDateTime,
    ) -> Option<FeedProduct> {
        let product_id = text(&self.product_id)?;
        let code = text(&self.code).unwrap_or_default();
        let name = text(&self.name).unwrap_or_default();
        let description = text(&self.content);
        let status = self
            .status
            .as_ref()
            .and_then(|s| text(&s.id))
            .map(|id| ProductStatus::from_feed_id(&id))
            .unwrap_or(ProductStatus::Regular);
        let price = self
            .price
            .as_ref()
            .and_then(|p| decimal(&p.price))
            .unwrap_or_default();
        let old_price = self.price.as_ref().and_then(|p| decimal(&p.oldprice));
        let image = |i: &Option<ImageRef>| {
            i.as_ref()
                .and_then(ImageRef::path)
                .and_then(|p| resolve_url(base, p))
        };

        let attachments: Vec<Attachment> = self
            .attachments
            .iter()
            .filter_map(|a| {
                let (kind, url) = if a.is_image() {
                    (AttachmentKind::Image, image(&a.image).or_else(|| image(&a.file)))
                } else {
                    (AttachmentKind::File, image(&a.file).or_else(|| image(&a.image)))
                };
                Some(Attachment {
                    kind,
                    url: url?,
                    name: text(&a.name),
                    local_path: None,
                })
            })
            .collect();

        let small_image = image(&self.small_image);
        let mut big_image = image(&self.big_image);
        let super_big_image = image(&self.super_big_image);
        if small_image.is_none() && big_image.is_none() && super_big_image.is_none() {
            big_image = attachments
                .iter()
                .find(|a| a.kind == AttachmentKind::Image)
                .map(|a| a.url.clone());
        }

        let filters = self.filter_values(names);
        let gender = infer_gender(
            text(&self.gender).as_deref(),
            &filters,
            &name,
            description.as_deref(),
        );
        let sizes_available = text(&self.sizes_available).map(|s| normalize_sizes(&s).unwrap_or(s));
        let size_table = description.as_deref().and_then(parse_size_table);
        let size_chart = description.as_deref().and_then(parse_size_chart);

        let variants = self
            .variants
            .iter()
            .flat_map(|v| v.variants.iter())
            .filter_map(|v| {
                Some(Variant {
                    size: normalize_size(&text(&v.size)?),
                    quantity: integer(&v.quantity).unwrap_or(0),
                    price: decimal(&v.price).unwrap_or(price),
                    old_price: decimal(&v.oldprice).or(old_price),
                    sku: text(&v.code),
                    barcode: text(&v.barcode),
                })
            })
            .collect();

        let prints = self
            .prints
            .iter()
            .filter_map(|p| {
                Some(PrintInfo {
                    name: text(&p.name)?,
                    description: text(&p.description),
                })
            })
            .collect();

        let pages = self
            .page
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(ToString::to_string)
            .collect();

        let product = Product {
            alt_ids: alt_ids(&product_id, &code),
            group_id: text(&self.group),
            attributes: self.text_attributes(),
            flags: self.flags(),
            page_count: integer(&self.page_count),
            material: text(&self.material),
            weight: decimal(&self.weight),
            volume: decimal(&self.volume),
            barcode: text(&self.barcode),
            product_size: text(&self.product_size),
            dimensions: text(&self.dimensions),
            brand: text(&self.brand),
            brand_id: None,
            is_featured: status == ProductStatus::New,
            is_bestseller: false,
            in_stock: true,
            quantity: 0,
            status,
            product_id,
            code,
            name,
            description,
            price,
            old_price,
            small_image,
            big_image,
            super_big_image,
            gender,
            sizes_available,
            filters,
            prints,
            attachments,
            variants,
            size_table,
            size_chart,
            categories: vec![],
            created_at: now,
            updated_at: now,
        };
        Some(FeedProduct { product, pages })
    }
}

impl ProductFeed {
    /// Refs of every product to its filters, used when names are loaded after the products
    pub fn filter_refs(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.products
            .iter()
            .filter_map(|p| {
                let id = text(&p.product_id)?;
                let refs: Vec<_> = p
                    .filters
                    .iter()
                    .flat_map(|f| f.filters.iter())
                    .filter_map(|f| Some((text(&f.filtertypeid)?, text(&f.filterid)?)))
                    .collect();
                (!refs.is_empty()).then_some((id, refs))
            })
            .collect()
    }
}

pub fn parse_products(xml: &str) -> Result<ProductFeed, DeError> {
    quick_xml::de::from_str(xml)
}

pub fn parse_stock(xml: &str) -> Result<Vec<StockRow>, DeError> {
    let feed: StockFeed = quick_xml::de::from_str(xml)?;
    Ok(feed
        .rows
        .into_iter()
        .map(|r| StockRow {
            product_id: text(&r.product_id),
            code: text(&r.code),
            free: integer(&r.free).unwrap_or(0),
        })
        .collect())
}

fn flatten_pages(pages: Vec<PageDto>, enclosing: Option<&str>, out: &mut Vec<CategoryPage>) {
    for page in pages {
        let page_id = text(&page.page_id);
        let name = text(&page.name);
        let current = match (page_id, name) {
            (Some(page_id), Some(name)) => {
                let parent = text(&page.parent_page_id).or(enclosing.map(ToString::to_string));
                out.push(CategoryPage {
                    page_id: page_id.clone(),
                    name,
                    uri: text(&page.uri),
                    parent,
                });
                Some(page_id)
            }
            (id, _) => {
                log::warn!("Skipping page without id or name: {id:?}");
                None
            }
        };
        flatten_pages(page.pages, current.as_deref().or(enclosing), out);
    }
}

/// Flattens tree.xml into pages in document order, parents before children
pub fn parse_tree(xml: &str) -> Result<Vec<CategoryPage>, DeError> {
    let feed: TreeFeed = quick_xml::de::from_str(xml)?;
    let mut res = vec![];
    flatten_pages(feed.pages, None, &mut res);
    Ok(res)
}

fn collect_catalogue(feed: CatalogueFeed, out: &mut Vec<CategoryPage>) {
    for c in feed.categories {
        let (Some(page_id), Some(name)) = (text(&c.id), text(&c.name)) else {
            log::warn!("Skipping catalogue category without id or name");
            continue;
        };
        out.push(CategoryPage {
            page_id,
            name,
            uri: None,
            parent: text(&c.parent_id_attr).or(text(&c.parent_id)),
        });
    }
    if let Some(nested) = feed.nested {
        collect_catalogue(*nested, out);
    }
}

/// Categories of the alternative catalogue.xml format
pub fn parse_catalogue(xml: &str) -> Result<Vec<CategoryPage>, DeError> {
    let feed: CatalogueFeed = quick_xml::de::from_str(xml)?;
    let mut res = vec![];
    collect_catalogue(feed, &mut res);
    Ok(res)
}

fn collect_filters(feed: FiltersFeed, out: &mut FilterNames) {
    for ty in feed.types {
        let (Some(id), Some(name)) = (text(&ty.filtertypeid), text(&ty.filtertypename)) else {
            continue;
        };
        let values = ty
            .filter
            .iter()
            .chain(ty.filters.iter().flat_map(|f| f.filter.iter()))
            .filter_map(|f| Some((text(&f.filterid)?, text(&f.filtername)?)))
            .collect();
        out.insert(id, FilterType { name, values });
    }
    if let Some(nested) = feed.filtertypes {
        collect_filters(*nested, out);
    }
}

pub fn parse_filters(xml: &str) -> Result<FilterNames, DeError> {
    let feed: FiltersFeed = quick_xml::de::from_str(xml)?;
    let mut res = HashMap::new();
    collect_filters(feed, &mut res);
    Ok(res)
}

/// Resolves `(type_id, filter_id)` refs against loaded names, dropping unknown ones
pub fn resolve_filters(names: &FilterNames, refs: &[(String, String)]) -> Vec<FilterValue> {
    refs.iter()
        .filter_map(|(type_id, filter_id)| {
            let ty = names.get(type_id)?;
            let value = ty.values.get(filter_id)?;
            Some(FilterValue {
                type_id: type_id.clone(),
                type_name: Some(ty.name.clone()),
                filter_id: filter_id.clone(),
                filter_name: Some(value.clone()),
            })
        })
        .collect()
}
