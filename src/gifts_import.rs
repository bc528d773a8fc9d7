use crate::category_rules::{self, CategoryRules};
use crate::classify::{extract_size_from_code, infer_gender, strip_size_suffix};
use crate::gifts::{FeedKind, GiftsClient};
use crate::gifts_feed::{self, CategoryPage, FeedProduct, FilterNames, StockRow};
use crate::import_throttle;
use crate::uploader::{self, local_attachment_path, DownloadSettings, ImageDir};
use crate::{slugify, unique_slug};
use anyhow::anyhow;
use derive_more::Display;
use gifts_types::category::{ByXmlId, Category, CategoryRepository};
use gifts_types::product::{
    AttachmentKind, Brand, BrandByName, BrandRepository, ProductQuery, ProductRepository,
    StockUpdate,
};
use indicatif::{ProgressBar, ProgressStyle};
use log_error::*;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use typesafe_repository::async_ops::{Find, Get, Save};
use typesafe_repository::IdentityOf;
use uuid::Uuid;

static SLUG_MAP: Lazy<HashMap<String, String>> = Lazy::new(|| {
    serde_yaml::from_str(include_str!("../data/category_slugs.yaml")).unwrap_or_else(|err| {
        log::error!("Unable to parse category slug map: {err}");
        HashMap::new()
    })
});

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum ImportKind {
    #[display("categories")]
    Categories,
    #[display("filters")]
    Filters,
    #[display("products")]
    Products,
    #[display("stock")]
    Stock,
    #[display("images")]
    Images,
    #[display("full")]
    Full,
}

impl std::str::FromStr for ImportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "categories" => Self::Categories,
            "filters" => Self::Filters,
            "products" => Self::Products,
            "stock" => Self::Stock,
            "images" => Self::Images,
            "full" => Self::Full,
            s => return Err(anyhow!("Unknown import kind: {s}")),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    pub force_update: bool,
    pub offset: usize,
    pub limit: Option<usize>,
    pub batch_size: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            force_update: false,
            offset: 0,
            limit: None,
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Display)]
#[display("создано {created}, обновлено {updated}, пропущено {skipped}, ошибок {errors}")]
pub struct ImportReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl AddAssign for ImportReport {
    fn add_assign(&mut self, rhs: Self) {
        self.created += rhs.created;
        self.updated += rhs.updated;
        self.skipped += rhs.skipped;
        self.errors += rhs.errors;
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ProgressInfo {
    pub stage: String,
    pub done: usize,
    pub total: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ImportStatus {
    Idle,
    InProgress,
    Success,
    Failure(String),
}

impl std::fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Ожидает"),
            Self::InProgress => write!(f, "Выполняется"),
            Self::Success => write!(f, "Успешно"),
            Self::Failure(_) => write!(f, "Ошибка"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ImportState {
    pub status: ImportStatus,
    pub progress: Option<ProgressInfo>,
    pub report: Option<ImportReport>,
    pub last_error: Option<String>,
    pub last_log: Option<String>,
    pub last_started: Option<OffsetDateTime>,
    pub last_finished: Option<OffsetDateTime>,
}

impl Default for ImportState {
    fn default() -> Self {
        Self {
            status: ImportStatus::Idle,
            progress: None,
            report: None,
            last_error: None,
            last_log: None,
            last_started: None,
            last_finished: None,
        }
    }
}

static IMPORT_STATE: Lazy<RwLock<HashMap<ImportKind, ImportState>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub async fn get_status(kind: ImportKind) -> ImportState {
    let map = IMPORT_STATE.read().await;
    map.get(&kind).cloned().unwrap_or_default()
}

pub async fn all_statuses() -> BTreeMap<ImportKind, ImportState> {
    let map = IMPORT_STATE.read().await;
    map.iter().map(|(k, v)| (*k, v.clone())).collect()
}

async fn set_state(kind: ImportKind, state: ImportState) {
    let mut map = IMPORT_STATE.write().await;
    map.insert(kind, state);
}

async fn update_progress(kind: ImportKind, stage: impl Into<String>, done: usize, total: usize) {
    let mut map = IMPORT_STATE.write().await;
    let entry = map.entry(kind).or_default();
    entry.progress = Some(ProgressInfo {
        stage: stage.into(),
        done,
        total,
    });
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    match ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos:>7}/{len:7} {msg}")
    {
        Ok(style) => pb.with_style(style.progress_chars("=-")),
        Err(err) => {
            log::warn!("Unable to initialize progress bar: {err}");
            pb
        }
    }
}

enum Saved {
    Created,
    Updated,
    Skipped,
}

/// Reconciles stock rows with imported products
pub struct StockMatcher {
    ids: HashSet<String>,
    by_code: HashMap<String, String>,
    codes: Vec<(String, String)>,
}

impl StockMatcher {
    /// `codes` are `(product_id, code)` pairs
    pub fn new(codes: Vec<(String, String)>) -> Self {
        let ids = codes.iter().map(|(id, _)| id.clone()).collect();
        let mut codes: Vec<(String, String)> = codes
            .into_iter()
            .filter(|(_, code)| !code.is_empty())
            .map(|(id, code)| (code, id))
            .collect();
        codes.sort();
        let mut by_code = HashMap::new();
        for (code, id) in &codes {
            by_code.entry(code.clone()).or_insert_with(|| id.clone());
        }
        Self {
            ids,
            by_code,
            codes,
        }
    }

    /// Product id by `product_id`, then code, then code without size, then a fuzzy code match
    pub fn resolve(&self, row: &StockRow) -> Option<String> {
        if let Some(id) = row.product_id.as_ref().filter(|id| self.ids.contains(*id)) {
            return Some(id.clone());
        }
        let code = row.code.as_deref()?;
        if let Some(id) = self.by_code.get(code) {
            return Some(id.clone());
        }
        if let Some(id) = strip_size_suffix(code).and_then(|base| self.by_code.get(base)) {
            return Some(id.clone());
        }
        self.fuzzy(code)
    }

    fn fuzzy(&self, code: &str) -> Option<String> {
        let chars: Vec<char> = code.chars().collect();
        let prefix: Option<String> = (chars.len() >= 6).then(|| chars[..6].iter().collect());
        let suffix: Option<String> =
            (chars.len() >= 4).then(|| chars[chars.len() - 4..].iter().collect());
        let by_prefix = prefix.and_then(|p| self.codes.iter().find(|(c, _)| c.starts_with(&p)));
        by_prefix
            .or_else(|| suffix.and_then(|s| self.codes.iter().find(|(c, _)| c.contains(&s))))
            .map(|(_, id)| id.clone())
    }
}

#[derive(Clone)]
pub struct Importer {
    client: Arc<GiftsClient>,
    products: Arc<dyn ProductRepository>,
    categories: Arc<dyn CategoryRepository>,
    brands: Arc<dyn BrandRepository>,
    rules: Arc<CategoryRules>,
    download: DownloadSettings,
}

impl Importer {
    pub fn new(
        client: Arc<GiftsClient>,
        products: Arc<dyn ProductRepository>,
        categories: Arc<dyn CategoryRepository>,
        brands: Arc<dyn BrandRepository>,
        rules: Arc<CategoryRules>,
        download: DownloadSettings,
    ) -> Self {
        Self {
            client,
            products,
            categories,
            brands,
            rules,
            download,
        }
    }

    pub fn client(&self) -> &GiftsClient {
        &self.client
    }

    pub async fn run(
        &self,
        kind: ImportKind,
        options: &ImportOptions,
    ) -> anyhow::Result<ImportReport> {
        if !self.client.has_credentials() {
            return Err(anyhow!("GIFTS_LOGIN and GIFTS_PASSWORD must be set to import"));
        }
        match kind {
            ImportKind::Categories => self.import_categories().await,
            ImportKind::Filters => self.import_filters().await,
            ImportKind::Products => self.import_products(options).await,
            ImportKind::Stock => self.import_stock().await,
            ImportKind::Images => self.import_images().await,
            ImportKind::Full => {
                let mut report = self.import_categories().await?;
                report += self.import_products(options).await?;
                report += self.import_stock().await?;
                report += self.import_images().await?;
                Ok(report)
            }
        }
    }

    pub async fn import_categories(&self) -> anyhow::Result<ImportReport> {
        update_progress(ImportKind::Categories, FeedKind::Tree.to_string(), 0, 0).await;
        let tree = match self.client.fetch(FeedKind::Tree).await {
            Ok(xml) => gifts_feed::parse_tree(&xml).map_err(anyhow::Error::from),
            Err(err) => Err(err.into()),
        };
        let pages = match tree {
            Ok(pages) if !pages.is_empty() => pages,
            res => {
                if let Err(err) = res {
                    log::warn!("Unable to load tree.xml, falling back to catalogue.xml: {err}");
                }
                let xml = self.client.fetch(FeedKind::Catalogue).await?;
                gifts_feed::parse_catalogue(&xml)?
            }
        };
        log::info!("{} category pages in feed", pages.len());
        self.save_categories(pages).await
    }

    /// Upserts pages keyed by their xml id, parents before children
    pub async fn save_categories(&self, pages: Vec<CategoryPage>) -> anyhow::Result<ImportReport> {
        let mut report = ImportReport::default();
        let mut order: Vec<String> = vec![];
        let mut by_id: HashMap<String, CategoryPage> = HashMap::new();
        for page in pages {
            if by_id.contains_key(&page.page_id) {
                report.skipped += 1;
                continue;
            }
            order.push(page.page_id.clone());
            by_id.insert(page.page_id.clone(), page);
        }

        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut queue: VecDeque<(&str, Option<IdentityOf<Category>>)> = VecDeque::new();
        for page in order.iter().filter_map(|id| by_id.get(id)) {
            match page.parent.as_deref() {
                Some(parent) if parent != page.page_id && by_id.contains_key(parent) => {
                    children.entry(parent).or_default().push(&page.page_id)
                }
                Some(parent) if parent != page.page_id => {
                    log::warn!(
                        "Category {} has unknown parent {parent}, saved as top level",
                        page.page_id
                    );
                    queue.push_back((page.page_id.as_str(), None));
                }
                _ => queue.push_back((page.page_id.as_str(), None)),
            }
        }

        let total = order.len();
        let mut visited: HashSet<&str> = HashSet::new();
        loop {
            while let Some((id, parent)) = queue.pop_front() {
                let Some(page) = by_id.get(id) else {
                    continue;
                };
                if !visited.insert(id) {
                    continue;
                }
                match self.save_category(page, parent).await {
                    Ok((uuid, created)) => {
                        match created {
                            true => report.created += 1,
                            false => report.updated += 1,
                        }
                        for child in children.get(id).into_iter().flatten() {
                            queue.push_back((*child, Some(uuid)));
                        }
                    }
                    Err(err) => {
                        log::error!("Unable to save category {id}: {err:?}");
                        report.errors += 1;
                    }
                }
                if visited.len() % 100 == 0 {
                    update_progress(ImportKind::Categories, "categories", visited.len(), total)
                        .await;
                }
            }
            match order.iter().find(|id| !visited.contains(id.as_str())) {
                Some(id) => {
                    log::warn!("Category {id} is not reachable from top level pages, saved as top level");
                    queue.push_back((id.as_str(), None));
                }
                None => break,
            }
        }
        log::info!("Categories: {report}");
        Ok(report)
    }

    async fn save_category(
        &self,
        page: &CategoryPage,
        parent: Option<IdentityOf<Category>>,
    ) -> anyhow::Result<(IdentityOf<Category>, bool)> {
        let existing = self
            .categories
            .find(&ByXmlId(page.page_id.clone()))
            .await?;
        let base = SLUG_MAP
            .get(page.name.trim())
            .cloned()
            .unwrap_or_else(|| slugify(&page.name));
        let base = match base.is_empty() {
            true => format!("category-{}", page.page_id),
            false => base,
        };
        let categories = self.categories.clone();
        let xml_id = page.page_id.clone();
        let slug = unique_slug(base, |slug| {
            let categories = categories.clone();
            let xml_id = xml_id.clone();
            async move { categories.slug_taken(&slug, Some(&xml_id)).await }
        })
        .await?;
        let created = existing.is_none();
        let category = match existing {
            Some(c) => Category {
                parent_id: parent,
                name: page.name.clone(),
                slug,
                ..c
            },
            None => Category {
                xml_id: Some(page.page_id.clone()),
                ..Category::new(page.name.clone(), slug, parent)
            },
        };
        let id = category.id;
        self.categories.save(category).await?;
        Ok((id, created))
    }

    async fn load_filter_names(&self) -> anyhow::Result<FilterNames> {
        let xml = self.client.fetch(FeedKind::Filters).await?;
        Ok(gifts_feed::parse_filters(&xml)?)
    }

    pub async fn import_filters(&self) -> anyhow::Result<ImportReport> {
        update_progress(ImportKind::Filters, FeedKind::Filters.to_string(), 0, 0).await;
        let names = self.load_filter_names().await?;
        let xml = self.client.fetch(FeedKind::Product).await?;
        let feed = gifts_feed::parse_products(&xml)?;
        self.apply_filters(&names, feed.filter_refs()).await
    }

    /// Replaces product filters with resolved names; gender is inferred again when missing
    pub async fn apply_filters(
        &self,
        names: &FilterNames,
        refs: Vec<(String, Vec<(String, String)>)>,
    ) -> anyhow::Result<ImportReport> {
        let mut report = ImportReport::default();
        let now = OffsetDateTime::now_utc();
        for (product_id, refs) in refs {
            let Some(mut product) = self.products.get_one(&product_id).await? else {
                report.skipped += 1;
                continue;
            };
            let filters = gifts_feed::resolve_filters(names, &refs);
            if product.filters == filters {
                report.skipped += 1;
                continue;
            }
            product.filters = filters;
            if product.gender.is_none() {
                product.gender = infer_gender(
                    None,
                    &product.filters,
                    &product.name,
                    product.description.as_deref(),
                );
            }
            product.updated_at = now;
            match self.products.save(product).await {
                Ok(()) => report.updated += 1,
                Err(err) => {
                    log::error!("Unable to update filters of {product_id}: {err:?}");
                    report.errors += 1;
                }
            }
        }
        log::info!("Filters: {report}");
        Ok(report)
    }

    pub async fn import_products(&self, options: &ImportOptions) -> anyhow::Result<ImportReport> {
        let names = self
            .load_filter_names()
            .await
            .map_err(|err| log::warn!("Filter names unavailable, keeping raw filter ids: {err}"))
            .ok();
        update_progress(ImportKind::Products, FeedKind::Product.to_string(), 0, 0).await;
        let xml = self.client.fetch(FeedKind::Product).await?;
        let feed = gifts_feed::parse_products(&xml)?;
        drop(xml);
        log::info!("{} products in feed", feed.products.len());

        let mut report = ImportReport::default();
        let base = self.client.base_url().clone();
        let now = OffsetDateTime::now_utc();
        let mut items = vec![];
        for dto in feed
            .products
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
        {
            match dto.into_feed_product(&base, names.as_ref(), now) {
                Some(item) => items.push(item),
                None => {
                    log::warn!("Skipping product without product_id");
                    report.skipped += 1;
                }
            }
        }
        report += self.save_products(items, options).await?;
        category_rules::link_products(&self.rules, self.products.clone(), self.categories.clone())
            .await
            .log_error("Smart category linking failed");
        Ok(report)
    }

    /// Upserts feed products keyed by `product_id`; a failing product does not stop the batch
    pub async fn save_products(
        &self,
        items: Vec<FeedProduct>,
        options: &ImportOptions,
    ) -> anyhow::Result<ImportReport> {
        let total = items.len();
        let pb = progress_bar(total);
        let mut report = ImportReport::default();
        let mut brands: HashMap<String, IdentityOf<Brand>> = HashMap::new();
        let mut pages: HashMap<String, Option<IdentityOf<Category>>> = HashMap::new();
        for (i, item) in items.into_iter().enumerate() {
            let product_id = item.product.product_id.clone();
            match self
                .save_product(item, options, &mut brands, &mut pages)
                .await
            {
                Ok(Saved::Created) => report.created += 1,
                Ok(Saved::Updated) => report.updated += 1,
                Ok(Saved::Skipped) => report.skipped += 1,
                Err(err) => {
                    log::error!("Unable to import product {product_id}: {err:?}");
                    report.errors += 1;
                }
            }
            pb.inc(1);
            if (i + 1) % options.batch_size.max(1) == 0 {
                log::info!("Products: {}/{total}", i + 1);
                update_progress(ImportKind::Products, "products", i + 1, total).await;
            }
        }
        pb.finish_and_clear();
        log::info!("Products: {report}");
        Ok(report)
    }

    async fn save_product(
        &self,
        item: FeedProduct,
        options: &ImportOptions,
        brands: &mut HashMap<String, IdentityOf<Brand>>,
        pages: &mut HashMap<String, Option<IdentityOf<Category>>>,
    ) -> anyhow::Result<Saved> {
        let FeedProduct {
            mut product,
            pages: product_pages,
        } = item;
        let existing = self.products.get_one(&product.product_id).await?;
        if existing.is_some() && !options.force_update {
            return Ok(Saved::Skipped);
        }
        if let Some(brand) = product.brand.clone() {
            product.brand_id = Some(self.brand_id(&brand, brands).await?);
        }
        for page in product_pages {
            let id = match pages.get(&page) {
                Some(id) => *id,
                None => {
                    let id = self
                        .categories
                        .find(&ByXmlId(page.clone()))
                        .await?
                        .map(|c| c.id);
                    if id.is_none() {
                        log::warn!("Category {page} of product {} not found", product.product_id);
                    }
                    pages.insert(page, id);
                    id
                }
            };
            if let Some(id) = id.filter(|id| !product.categories.contains(id)) {
                product.categories.push(id);
            }
        }
        for a in product
            .attachments
            .iter_mut()
            .filter(|a| a.kind == AttachmentKind::Image)
        {
            let path = local_attachment_path(&product.product_id, &a.url, ImageDir::Attachments);
            if self.download.root.join(&path).exists() {
                a.local_path = Some(path);
            }
        }
        match existing {
            Some(old) => {
                product.created_at = old.created_at;
                product.quantity = old.quantity;
                product.in_stock = old.in_stock;
                product.is_bestseller = old.is_bestseller;
                for c in old.categories {
                    if !product.categories.contains(&c) {
                        product.categories.push(c);
                    }
                }
                if product.variants.is_empty() {
                    product.variants = old.variants;
                }
                self.products.save(product).await?;
                Ok(Saved::Updated)
            }
            None => {
                self.products.save(product).await?;
                Ok(Saved::Created)
            }
        }
    }

    async fn brand_id(
        &self,
        name: &str,
        cache: &mut HashMap<String, IdentityOf<Brand>>,
    ) -> anyhow::Result<IdentityOf<Brand>> {
        if let Some(id) = cache.get(name) {
            return Ok(*id);
        }
        let id = match self.brands.find(&BrandByName(name.to_string())).await? {
            Some(brand) => brand.id,
            None => {
                let base = match slugify(name) {
                    s if s.is_empty() => "brand".to_string(),
                    s => s,
                };
                let brands = self.brands.clone();
                let slug = unique_slug(base, |slug| {
                    let brands = brands.clone();
                    async move { brands.slug_taken(&slug).await }
                })
                .await?;
                let brand = Brand {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                    slug,
                    is_active: true,
                };
                let id = brand.id;
                self.brands.save(brand).await?;
                log::info!("Created brand {name}");
                id
            }
        };
        cache.insert(name.to_string(), id);
        Ok(id)
    }

    pub async fn import_stock(&self) -> anyhow::Result<ImportReport> {
        update_progress(ImportKind::Stock, FeedKind::Stock.to_string(), 0, 0).await;
        let xml = self.client.fetch(FeedKind::Stock).await?;
        let rows = gifts_feed::parse_stock(&xml)?;
        log::info!("{} stock rows in feed", rows.len());
        self.apply_stock(rows).await
    }

    /// Sums free stock per product and size, then writes all quantities in one transaction
    pub async fn apply_stock(&self, rows: Vec<StockRow>) -> anyhow::Result<ImportReport> {
        let matcher = StockMatcher::new(self.products.codes().await?);
        let mut report = ImportReport::default();
        let mut totals: BTreeMap<String, StockUpdate> = BTreeMap::new();
        for row in rows {
            let Some(product_id) = matcher.resolve(&row) else {
                log::debug!("No product for stock row {:?} / {:?}", row.product_id, row.code);
                report.skipped += 1;
                continue;
            };
            let entry = totals
                .entry(product_id.clone())
                .or_insert_with(|| StockUpdate {
                    product_id,
                    quantity: 0,
                    sizes: BTreeMap::new(),
                });
            entry.quantity += row.free;
            if let Some(size) = row.code.as_deref().and_then(extract_size_from_code) {
                *entry.sizes.entry(size.to_string()).or_default() += row.free;
            }
        }
        report.updated = self
            .products
            .update_stock(totals.into_values().collect())
            .await?;
        log::info!("Stock: {report}");
        Ok(report)
    }

    pub async fn import_images(&self) -> anyhow::Result<ImportReport> {
        update_progress(ImportKind::Images, "images", 0, 0).await;
        let (products, _) = self.products.query(&ProductQuery::default()).await?;
        let tasks = uploader::collect_missing(&products, &self.download.root);
        drop(products);
        let (downloads, saved) =
            uploader::download_all(self.client.clone(), tasks, &self.download).await;
        for task in saved.iter().filter(|t| t.dir == ImageDir::Attachments) {
            self.products
                .set_attachment_path(&task.product_id, &task.url, &task.relative_path())
                .await
                .log_error("Unable to store attachment path");
        }
        Ok(ImportReport {
            created: downloads.downloaded,
            updated: 0,
            skipped: downloads.exists,
            errors: downloads.errors,
        })
    }
}

/// Starts a run of `kind` in the background; a run of the same kind already in progress is an error
pub async fn trigger_import(
    kind: ImportKind,
    options: ImportOptions,
    importer: Importer,
) -> anyhow::Result<()> {
    {
        let mut map = IMPORT_STATE.write().await;
        let state = map.entry(kind).or_default();
        if state.status == ImportStatus::InProgress {
            return Err(anyhow!("Import of {kind} already in progress"));
        }
        state.status = ImportStatus::InProgress;
        state.progress = None;
        state.last_error = None;
        state.last_log = None;
        state.last_started = Some(OffsetDateTime::now_utc());
    }

    tokio::spawn(async move {
        let res = match import_throttle::acquire_import_permit().await {
            Ok(_permit) => {
                log::info!("Import of {kind} started");
                importer.run(kind, &options).await
            }
            Err(err) => Err(anyhow!("Import queue closed: {err}")),
        };
        let mut state = get_status(kind).await;
        match res {
            Ok(report) => {
                log::info!("Import of {kind} finished: {report}");
                state.status = ImportStatus::Success;
                state.last_log = Some(report.to_string());
                state.report = Some(report);
            }
            Err(err) => {
                log::error!("Import of {kind} failed: {err:?}");
                state.status = ImportStatus::Failure(err.to_string());
                state.last_error = Some(err.to_string());
            }
        }
        state.progress = None;
        state.last_finished = Some(OffsetDateTime::now_utc());
        set_state(kind, state).await;
    });
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub products: Duration,
    pub stock: Duration,
    pub categories: Duration,
}

impl Schedule {
    pub fn from_env() -> anyhow::Result<Self> {
        let every = |var: &str, default: &str| gifts_types::parse_duration(&envmnt::get_or(var, default));
        Ok(Self {
            products: every("PRODUCTS_IMPORT_EVERY", "24h")?,
            stock: every("STOCK_IMPORT_EVERY", "1h")?,
            categories: every("CATEGORIES_IMPORT_EVERY", "24h")?,
        })
    }
}

pub async fn spawn_scheduler(importer: Importer, schedule: Schedule, token: CancellationToken) {
    let kinds = [
        (ImportKind::Categories, schedule.categories),
        (ImportKind::Products, schedule.products),
        (ImportKind::Stock, schedule.stock),
    ];
    for (kind, every) in kinds {
        let importer = importer.clone();
        let token = token.clone();
        log::info!("Scheduling {kind} import every {}", crate::format_duration(&every));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(every) => (),
                }
                if let Err(err) =
                    trigger_import(kind, ImportOptions::default(), importer.clone()).await
                {
                    log::warn!("Scheduled run skipped: {err}");
                }
            }
            log::info!("{kind} import scheduler stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::SqliteCategoryRepository;
    use crate::product::tests::product;
    use crate::product::{SqliteBrandRepository, SqliteProductRepository};
    use gifts_types::category::BySlug;
    use gifts_types::product::Product;
    use rust_decimal_macros::dec;
    use tokio_rusqlite::Connection;
    use typesafe_repository::async_ops::List;
    use url::Url;

    struct Fixture {
        importer: Importer,
        products: Arc<SqliteProductRepository>,
        categories: Arc<SqliteCategoryRepository>,
        brands: Arc<SqliteBrandRepository>,
    }

    async fn fixture() -> Fixture {
        let products = Arc::new(
            SqliteProductRepository::init(Connection::open_in_memory().await.unwrap())
                .await
                .unwrap(),
        );
        let categories = Arc::new(
            SqliteCategoryRepository::init(Connection::open_in_memory().await.unwrap())
                .await
                .unwrap(),
        );
        let brands = Arc::new(
            SqliteBrandRepository::init(Connection::open_in_memory().await.unwrap())
                .await
                .unwrap(),
        );
        let client = GiftsClient::new(
            reqwest::Client::new(),
            None,
            Url::parse("http://127.0.0.1:9/").unwrap(),
        )
        .unwrap();
        let rules = category_rules::parse_rules("{}").unwrap();
        let importer = Importer::new(
            Arc::new(client),
            products.clone(),
            categories.clone(),
            brands.clone(),
            Arc::new(rules),
            DownloadSettings {
                root: std::env::temp_dir().join(format!("import-{}", Uuid::new_v4())),
                threads: 1,
                limit: 10,
                delay: Duration::ZERO,
            },
        );
        Fixture {
            importer,
            products,
            categories,
            brands,
        }
    }

    fn page(id: &str, name: &str, parent: Option<&str>) -> CategoryPage {
        CategoryPage {
            page_id: id.to_string(),
            name: name.to_string(),
            uri: None,
            parent: parent.map(ToString::to_string),
        }
    }

    fn feed_product(p: Product, pages: &[&str]) -> FeedProduct {
        FeedProduct {
            product: p,
            pages: pages.iter().map(ToString::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn saves_category_tree() {
        let f = fixture().await;
        let pages = vec![
            page("2", "Кружки с логотипом", Some("1")),
            page("1", "Посуда", None),
            page("3", "Разное", Some("99")),
            page("4", "Разное", Some("1")),
            page("5", "Цикл А", Some("6")),
            page("6", "Цикл Б", Some("5")),
        ];
        let report = f.importer.save_categories(pages.clone()).await.unwrap();
        assert_eq!(report.created, 6);
        assert_eq!(report.errors, 0);

        let root = f.categories.find(&ByXmlId("1".to_string())).await.unwrap().unwrap();
        assert_eq!(root.slug, "posuda");
        assert_eq!(root.parent_id, None);
        let child = f.categories.find(&ByXmlId("2".to_string())).await.unwrap().unwrap();
        assert_eq!(child.parent_id, Some(root.id));
        let orphan = f.categories.find(&ByXmlId("3".to_string())).await.unwrap().unwrap();
        assert_eq!(orphan.parent_id, None);
        let twin = f.categories.find(&ByXmlId("4".to_string())).await.unwrap().unwrap();
        assert_ne!(orphan.slug, twin.slug);
        assert!(twin.slug.starts_with(&orphan.slug) || orphan.slug.starts_with(&twin.slug));

        let report = f.importer.save_categories(pages).await.unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.updated, 6);
        assert_eq!(f.categories.list().await.unwrap().len(), 6);
        let again = f.categories.find(&ByXmlId("4".to_string())).await.unwrap().unwrap();
        assert_eq!(again.slug, twin.slug);
        assert_eq!(again.id, twin.id);
    }

    #[tokio::test]
    async fn upserts_products() {
        let f = fixture().await;
        f.importer
            .save_categories(vec![page("10", "Посуда", None)])
            .await
            .unwrap();
        let mut p = product("1", "Кружка", dec!(100));
        p.brand = Some("Sol's".to_string());
        let report = f
            .importer
            .save_products(
                vec![
                    feed_product(p.clone(), &["10", "404"]),
                    feed_product(product("2", "Ручка", dec!(5)), &[]),
                ],
                &ImportOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(report.created, 2);

        let saved = f.products.get_one(&"1".to_string()).await.unwrap().unwrap();
        let category = f.categories.find(&BySlug("posuda".to_string())).await.unwrap().unwrap();
        assert_eq!(saved.categories, vec![category.id]);
        let brand = f.brands.find(&BrandByName("Sol's".to_string())).await.unwrap().unwrap();
        assert_eq!(saved.brand_id, Some(brand.id));
        assert_eq!(brand.slug, "sol-s");

        let report = f
            .importer
            .save_products(vec![feed_product(p.clone(), &[])], &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);

        f.products
            .update_stock(vec![StockUpdate {
                product_id: "1".to_string(),
                quantity: 7,
                sizes: BTreeMap::new(),
            }])
            .await
            .unwrap();
        p.name = "Кружка новая".to_string();
        let options = ImportOptions {
            force_update: true,
            ..Default::default()
        };
        let report = f
            .importer
            .save_products(vec![feed_product(p, &[])], &options)
            .await
            .unwrap();
        assert_eq!(report.updated, 1);
        let saved = f.products.get_one(&"1".to_string()).await.unwrap().unwrap();
        assert_eq!(saved.name, "Кружка новая");
        assert_eq!(saved.quantity, 7);
        assert_eq!(saved.categories, vec![category.id]);
        assert_eq!(f.brands.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reimport_keeps_sold_out_flag() {
        let f = fixture().await;
        let p = product("5", "Зонт", dec!(300));
        assert!(p.in_stock);
        f.products.save(p.clone()).await.unwrap();
        f.products
            .update_stock(vec![StockUpdate {
                product_id: "5".to_string(),
                quantity: 0,
                sizes: BTreeMap::new(),
            }])
            .await
            .unwrap();
        let sold_out = f.products.get_one(&"5".to_string()).await.unwrap().unwrap();
        assert!(!sold_out.in_stock);

        let options = ImportOptions {
            force_update: true,
            ..Default::default()
        };
        f.importer
            .save_products(vec![feed_product(p, &[])], &options)
            .await
            .unwrap();
        let saved = f.products.get_one(&"5".to_string()).await.unwrap().unwrap();
        assert_eq!(saved.quantity, 0);
        assert!(!saved.in_stock);
    }

    #[tokio::test]
    async fn applies_stock() {
        let f = fixture().await;
        for (id, code, name) in [
            ("1", "6580.70", "Футболка"),
            ("2", "1000.10", "Кружка"),
            ("3", "ABCDEF12", "Ручка"),
        ] {
            let mut p = product(id, name, dec!(10));
            p.code = code.to_string();
            f.products.save(p).await.unwrap();
        }
        let row = |id: Option<&str>, code: &str, free: i64| StockRow {
            product_id: id.map(ToString::to_string),
            code: Some(code.to_string()),
            free,
        };
        let report = f
            .importer
            .apply_stock(vec![
                row(Some("1"), "6580.70.S", 3),
                row(None, "6580.70.M", 2),
                row(Some("1"), "6580.70.S", 1),
                row(Some("777"), "1000.10", 0),
                row(None, "ABCDEF99", 4),
                row(None, "ZZZ", 1),
            ])
            .await
            .unwrap();
        assert_eq!(report.updated, 3);
        assert_eq!(report.skipped, 1);

        let p = f.products.get_one(&"1".to_string()).await.unwrap().unwrap();
        assert_eq!(p.quantity, 6);
        let sizes: Vec<_> = p.variants.iter().map(|v| (v.size.as_str(), v.quantity)).collect();
        assert_eq!(sizes, vec![("M", 2), ("S", 4)]);
        let p = f.products.get_one(&"2".to_string()).await.unwrap().unwrap();
        assert!(!p.in_stock);
        let p = f.products.get_one(&"3".to_string()).await.unwrap().unwrap();
        assert_eq!(p.quantity, 4);
        assert!(p.in_stock);
    }

    #[test]
    fn matches_stock_by_suffix() {
        let matcher = StockMatcher::new(vec![
            ("1".to_string(), "A-55123".to_string()),
            ("2".to_string(), String::new()),
        ]);
        let row = StockRow {
            product_id: None,
            code: Some("QQ5123".to_string()),
            free: 1,
        };
        assert_eq!(matcher.resolve(&row), Some("1".to_string()));
        let row = StockRow {
            product_id: Some("2".to_string()),
            code: None,
            free: 1,
        };
        assert_eq!(matcher.resolve(&row), Some("2".to_string()));
    }

    #[tokio::test]
    async fn applies_filter_names() {
        let f = fixture().await;
        f.products.save(product("1", "Футболка", dec!(10))).await.unwrap();
        let names: FilterNames = HashMap::from([(
            "23".to_string(),
            gifts_feed::FilterType {
                name: "Пол".to_string(),
                values: HashMap::from([("1".to_string(), "женские".to_string())]),
            },
        )]);
        let refs = vec![
            ("1".to_string(), vec![("23".to_string(), "1".to_string())]),
            ("missing".to_string(), vec![("23".to_string(), "1".to_string())]),
        ];
        let report = f.importer.apply_filters(&names, refs.clone()).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped, 1);
        let p = f.products.get_one(&"1".to_string()).await.unwrap().unwrap();
        assert_eq!(p.filters[0].filter_name.as_deref(), Some("женские"));
        assert_eq!(p.gender, Some(gifts_types::Gender::Female));
        let report = f.importer.apply_filters(&names, refs).await.unwrap();
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn refuses_parallel_runs_and_reports_failure() {
        let f = fixture().await;
        trigger_import(ImportKind::Images, ImportOptions::default(), f.importer.clone())
            .await
            .unwrap();
        let mut state = get_status(ImportKind::Images).await;
        for _ in 0..100 {
            if state.status != ImportStatus::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = get_status(ImportKind::Images).await;
        }
        assert!(matches!(state.status, ImportStatus::Failure(_)));
        assert_eq!(state.status.to_string(), "Ошибка");

        set_state(
            ImportKind::Images,
            ImportState {
                status: ImportStatus::InProgress,
                ..Default::default()
            },
        )
        .await;
        assert!(
            trigger_import(ImportKind::Images, ImportOptions::default(), f.importer)
                .await
                .is_err()
        );
        set_state(ImportKind::Images, ImportState::default()).await;
    }

    #[test]
    fn parses_kinds() {
        assert_eq!("stock".parse::<ImportKind>().unwrap(), ImportKind::Stock);
        assert_eq!(ImportKind::Full.to_string(), "full");
        assert!("everything".parse::<ImportKind>().is_err());
    }
}
