use crate::classify::{is_clothing, sort_sizes};
use crate::{decimal_from_sql, decimal_to_sql, json_from_sql, json_to_sql, parse_from_sql};
use async_trait::async_trait;
use gifts_types::category::Category;
use gifts_types::product::{
    Attachment, Brand, BrandByName, BrandBySlug, BrandRepository, ByCode, Facets, InCategory,
    Product, ProductQuery, ProductRepository, ProductText, SortOrder, StockUpdate, Variant,
};
use gifts_types::{Gender, ProductStatus};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Row};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use time::OffsetDateTime;
use tokio_rusqlite::Connection;
use typesafe_repository::async_ops::{Find, Get, List, Save, Select};
use typesafe_repository::prelude::*;

const COLUMNS: &str = "product_id, group_id, code, name, description, price, old_price,
    small_image, big_image, super_big_image, brand, brand_id, status, in_stock, quantity,
    material, weight, volume, barcode, product_size, is_featured, is_bestseller, gender,
    sizes_available, dimensions, alt_ids, flags, page_count, attributes, filters, prints,
    attachments, size_table, created_at, updated_at, size_chart";

pub struct SqliteProductRepository {
    conn: Connection,
}

fn optional_decimal(row: &Row, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| decimal_from_sql(idx, s))
        .transpose()
}

fn product_from_row(row: &Row) -> rusqlite::Result<Product> {
    Ok(Product {
        product_id: row.get(0)?,
        group_id: row.get(1)?,
        code: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        price: decimal_from_sql(5, row.get(5)?)?,
        old_price: optional_decimal(row, 6)?,
        small_image: row.get(7)?,
        big_image: row.get(8)?,
        super_big_image: row.get(9)?,
        brand: row.get(10)?,
        brand_id: row.get(11)?,
        status: parse_from_sql::<ProductStatus>(12, row.get(12)?)?,
        in_stock: row.get(13)?,
        quantity: row.get(14)?,
        material: row.get(15)?,
        weight: optional_decimal(row, 16)?,
        volume: optional_decimal(row, 17)?,
        barcode: row.get(18)?,
        product_size: row.get(19)?,
        is_featured: row.get(20)?,
        is_bestseller: row.get(21)?,
        gender: row
            .get::<_, Option<String>>(22)?
            .map(|g| parse_from_sql::<Gender>(22, g))
            .transpose()?,
        sizes_available: row.get(23)?,
        dimensions: row.get(24)?,
        alt_ids: json_from_sql(row.get(25)?),
        flags: json_from_sql(row.get(26)?),
        page_count: row.get(27)?,
        attributes: json_from_sql(row.get(28)?),
        filters: json_from_sql(row.get(29)?),
        prints: json_from_sql(row.get(30)?),
        attachments: json_from_sql(row.get(31)?),
        size_table: row
            .get::<_, Option<String>>(32)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        size_chart: row
            .get::<_, Option<String>>(35)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        categories: vec![],
        variants: vec![],
        created_at: row.get(33)?,
        updated_at: row.get(34)?,
    })
}

fn variant_from_row(row: &Row) -> rusqlite::Result<Variant> {
    Ok(Variant {
        size: row.get(0)?,
        quantity: row.get(1)?,
        price: decimal_from_sql(2, row.get(2)?)?,
        old_price: optional_decimal(row, 3)?,
        sku: row.get(4)?,
        barcode: row.get(5)?,
    })
}

fn load_relations(conn: &rusqlite::Connection, products: &mut [Product]) -> rusqlite::Result<()> {
    let mut categories =
        conn.prepare("SELECT category_id FROM product_category WHERE product_id = ?1")?;
    let mut variants = conn.prepare(
        "SELECT size, quantity, price, old_price, sku, barcode FROM variant WHERE product_id = ?1 ORDER BY id",
    )?;
    for p in products.iter_mut() {
        p.categories = categories
            .query_map([&p.product_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        p.variants = variants
            .query_map([&p.product_id], variant_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
    }
    Ok(())
}

fn search_text(p: &Product) -> String {
    format!(
        "{} {} {}",
        p.name,
        p.code,
        p.description.as_deref().unwrap_or_default()
    )
    .to_lowercase()
}

fn decimal_value(d: &Decimal) -> Value {
    Value::Real(d.to_f64().unwrap_or_default())
}

fn placeholders(n: usize) -> String {
    itertools::intersperse(std::iter::repeat("?").take(n), ", ").collect()
}

/// `WHERE` clause of a storefront query with its positional parameters
fn where_clause(q: &ProductQuery) -> (String, Vec<Value>) {
    let mut conditions: Vec<String> = vec![];
    let mut values: Vec<Value> = vec![];
    if let Some(categories) = &q.categories {
        conditions.push(format!(
            "product.product_id IN (SELECT product_id FROM product_category WHERE category_id IN ({}))",
            placeholders(categories.len().max(1))
        ));
        if categories.is_empty() {
            values.push(Value::Null);
        }
        values.extend(categories.iter().map(|c| Value::Blob(c.as_bytes().to_vec())));
    }
    if let Some(brand_id) = &q.brand_id {
        conditions.push("brand_id = ?".to_string());
        values.push(Value::Blob(brand_id.as_bytes().to_vec()));
    }
    if let Some(min) = &q.min_price {
        conditions.push("CAST(price AS REAL) >= ?".to_string());
        values.push(decimal_value(min));
    }
    if let Some(max) = &q.max_price {
        conditions.push("CAST(price AS REAL) <= ?".to_string());
        values.push(decimal_value(max));
    }
    if let Some(status) = &q.status {
        conditions.push("status = ?".to_string());
        values.push(status.as_str().to_string().into());
    }
    if !q.brands.is_empty() {
        conditions.push(format!("brand IN ({})", placeholders(q.brands.len())));
        values.extend(q.brands.iter().cloned().map(Value::from));
    }
    if !q.materials.is_empty() {
        conditions.push(format!("material IN ({})", placeholders(q.materials.len())));
        values.extend(q.materials.iter().cloned().map(Value::from));
    }
    if !q.sizes.is_empty() {
        let listed = std::iter::repeat("(', ' || sizes_available || ', ') LIKE ?")
            .take(q.sizes.len())
            .collect::<Vec<_>>()
            .join(" OR ");
        conditions.push(format!(
            "(EXISTS (SELECT 1 FROM variant v WHERE v.product_id = product.product_id AND v.size IN ({})) OR {listed})",
            placeholders(q.sizes.len())
        ));
        values.extend(q.sizes.iter().cloned().map(Value::from));
        values.extend(q.sizes.iter().map(|s| Value::from(format!("%, {s}, %"))));
    }
    if let Some(featured) = q.is_featured {
        conditions.push("is_featured = ?".to_string());
        values.push(Value::Integer(featured as i64));
    }
    if let Some(bestseller) = q.is_bestseller {
        conditions.push("is_bestseller = ?".to_string());
        values.push(Value::Integer(bestseller as i64));
    }
    if q.has_discount {
        conditions.push(
            "old_price IS NOT NULL AND CAST(old_price AS REAL) > CAST(price AS REAL)".to_string(),
        );
    }
    if q.in_stock {
        conditions.push("in_stock = 1 AND quantity > 0".to_string());
    }
    if q.on_order {
        conditions.push("in_stock = 0".to_string());
    }
    if let Some(text) = q.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        conditions.push("search_text LIKE ?".to_string());
        values.push(format!("%{}%", text.to_lowercase()).into());
    }
    let clause = match conditions.is_empty() {
        true => String::new(),
        false => format!("WHERE {}", conditions.join(" AND ")),
    };
    (clause, values)
}

fn order_clause(sort: Option<SortOrder>) -> &'static str {
    match sort {
        Some(SortOrder::PriceAsc) => "ORDER BY CAST(price AS REAL) ASC, name",
        Some(SortOrder::PriceDesc) => "ORDER BY CAST(price AS REAL) DESC, name",
        Some(SortOrder::NameAsc) | None => "ORDER BY name ASC",
        Some(SortOrder::NameDesc) => "ORDER BY name DESC",
        Some(SortOrder::Newest) => "ORDER BY created_at DESC, name",
    }
}

impl SqliteProductRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS product (
                    product_id TEXT PRIMARY KEY,
                    group_id TEXT,
                    code TEXT NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT,
                    price TEXT NOT NULL,
                    old_price TEXT,
                    small_image TEXT,
                    big_image TEXT,
                    super_big_image TEXT,
                    brand TEXT,
                    brand_id BLOB,
                    status TEXT NOT NULL,
                    in_stock INTEGER NOT NULL,
                    quantity INTEGER NOT NULL,
                    material TEXT,
                    weight TEXT,
                    volume TEXT,
                    barcode TEXT,
                    product_size TEXT,
                    is_featured INTEGER NOT NULL,
                    is_bestseller INTEGER NOT NULL,
                    gender TEXT,
                    sizes_available TEXT,
                    dimensions TEXT,
                    alt_ids TEXT,
                    flags TEXT,
                    page_count INTEGER,
                    attributes TEXT,
                    filters TEXT,
                    prints TEXT,
                    attachments TEXT,
                    size_table TEXT,
                    size_chart TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    search_text TEXT
                )",
                [],
            )?;
            conn.execute("CREATE INDEX IF NOT EXISTS product_code ON product (code)", [])?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS product_category (
                    product_id TEXT NOT NULL,
                    category_id BLOB NOT NULL,
                    PRIMARY KEY (product_id, category_id)
                )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS variant (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    product_id TEXT NOT NULL,
                    size TEXT NOT NULL,
                    quantity INTEGER NOT NULL,
                    price TEXT NOT NULL,
                    old_price TEXT,
                    sku TEXT,
                    barcode TEXT
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS variant_product ON variant (product_id)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    async fn select_where(&self, clause: String, values: Vec<Value>) -> anyhow::Result<Vec<Product>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM product {clause}"))?;
                let mut products = stmt
                    .query_map(params_from_iter(values), product_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                load_relations(conn, &mut products)?;
                Ok(products)
            })
            .await?)
    }
}

impl Repository<Product> for SqliteProductRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Get<Product> for SqliteProductRepository {
    async fn get_one(&self, id: &IdentityOf<Product>) -> Result<Option<Product>, Self::Error> {
        Ok(self
            .select_where("WHERE product_id = ?".to_string(), vec![id.clone().into()])
            .await?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl Find<Product, ByCode> for SqliteProductRepository {
    async fn find(&self, ByCode(code): &ByCode) -> Result<Option<Product>, Self::Error> {
        Ok(self
            .select_where(
                "WHERE code = ? ORDER BY product_id LIMIT 1".to_string(),
                vec![code.clone().into()],
            )
            .await?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl Select<Product, InCategory> for SqliteProductRepository {
    async fn select(&self, InCategory(id): &InCategory) -> Result<Vec<Product>, Self::Error> {
        self.select_where(
            "WHERE product_id IN (SELECT product_id FROM product_category WHERE category_id = ?) ORDER BY name"
                .to_string(),
            vec![Value::Blob(id.as_bytes().to_vec())],
        )
        .await
    }
}

#[async_trait]
impl Save<Product> for SqliteProductRepository {
    async fn save(&self, p: Product) -> Result<(), Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    &format!(
                        "INSERT INTO product ({COLUMNS}, search_text) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                            ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27,
                            ?28, ?29, ?30, ?31, ?32, ?33, ?34, ?35, ?37, ?36)
                         ON CONFLICT(product_id) DO UPDATE SET group_id=?2, code=?3, name=?4, description=?5,
                            price=?6, old_price=?7, small_image=?8, big_image=?9, super_big_image=?10, brand=?11,
                            brand_id=?12, status=?13, in_stock=?14, quantity=?15, material=?16, weight=?17,
                            volume=?18, barcode=?19, product_size=?20, is_featured=?21, is_bestseller=?22,
                            gender=?23, sizes_available=?24, dimensions=?25, alt_ids=?26, flags=?27,
                            page_count=?28, attributes=?29, filters=?30, prints=?31, attachments=?32,
                            size_table=?33, created_at=?34, updated_at=?35, size_chart=?37,
                            search_text=?36"
                    ),
                    params![
                        p.product_id,
                        p.group_id,
                        p.code,
                        p.name,
                        p.description,
                        decimal_to_sql(&p.price),
                        p.old_price.as_ref().map(decimal_to_sql),
                        p.small_image,
                        p.big_image,
                        p.super_big_image,
                        p.brand,
                        p.brand_id,
                        p.status.as_str(),
                        p.in_stock,
                        p.quantity,
                        p.material,
                        p.weight.as_ref().map(decimal_to_sql),
                        p.volume.as_ref().map(decimal_to_sql),
                        p.barcode,
                        p.product_size,
                        p.is_featured,
                        p.is_bestseller,
                        p.gender.map(|g| g.as_str()),
                        p.sizes_available,
                        p.dimensions,
                        json_to_sql(&p.alt_ids),
                        json_to_sql(&p.flags),
                        p.page_count,
                        json_to_sql(&p.attributes),
                        json_to_sql(&p.filters),
                        json_to_sql(&p.prints),
                        json_to_sql(&p.attachments),
                        p.size_table.as_ref().and_then(json_to_sql),
                        p.created_at,
                        p.updated_at,
                        search_text(&p),
                        p.size_chart.as_ref().and_then(json_to_sql),
                    ],
                )?;
                tx.execute(
                    "DELETE FROM product_category WHERE product_id = ?1",
                    [&p.product_id],
                )?;
                for c in &p.categories {
                    tx.execute(
                        "INSERT OR IGNORE INTO product_category (product_id, category_id) VALUES (?1, ?2)",
                        params![p.product_id, c],
                    )?;
                }
                tx.execute("DELETE FROM variant WHERE product_id = ?1", [&p.product_id])?;
                for v in &p.variants {
                    tx.execute(
                        "INSERT INTO variant (product_id, size, quantity, price, old_price, sku, barcode)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            p.product_id,
                            v.size,
                            v.quantity,
                            decimal_to_sql(&v.price),
                            v.old_price.as_ref().map(decimal_to_sql),
                            v.sku,
                            v.barcode,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?)
    }
}

#[async_trait]
impl ProductRepository for SqliteProductRepository {
    async fn exists(&self, product_id: &str) -> Result<bool, Self::Error> {
        let product_id = product_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM product WHERE product_id = ?1",
                    [product_id],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await?)
    }

    async fn query(&self, query: &ProductQuery) -> Result<(Vec<Product>, usize), Self::Error> {
        let (clause, values) = where_clause(query);
        let order = order_clause(query.sort);
        let limit = match query.limit {
            0 => -1,
            l => l as i64,
        };
        let offset = query.offset as i64;
        let count_values = values.clone();
        let count_clause = clause.clone();
        let total: i64 = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    &format!("SELECT COUNT(*) FROM product {count_clause}"),
                    params_from_iter(count_values),
                    |row| row.get(0),
                )?)
            })
            .await?;
        let products = self
            .select_where(format!("{clause} {order} LIMIT {limit} OFFSET {offset}"), values)
            .await?;
        Ok((products, total.max(0) as usize))
    }

    async fn facets(&self, query: &ProductQuery) -> Result<Facets, Self::Error> {
        let base = ProductQuery {
            brands: vec![],
            materials: vec![],
            sizes: vec![],
            sort: None,
            offset: 0,
            limit: 0,
            ..query.clone()
        };
        let (clause, values) = where_clause(&base);
        Ok(self
            .conn
            .call(move |conn| {
                let distinct = |column: &str| -> rusqlite::Result<Vec<String>> {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT DISTINCT {column} FROM product {clause} {} {column} IS NOT NULL AND {column} <> '' ORDER BY {column}",
                        if clause.is_empty() { "WHERE" } else { "AND" }
                    ))?;
                    let res = stmt
                        .query_map(params_from_iter(values.iter()), |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(res)
                };
                let brands = distinct("brand")?;
                let materials = distinct("material")?;
                let mut sizes: BTreeSet<String> = distinct("sizes_available")?
                    .iter()
                    .flat_map(|s| s.split(','))
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                let mut stmt = conn.prepare(&format!(
                    "SELECT DISTINCT size FROM variant WHERE product_id IN (SELECT product_id FROM product {clause})"
                ))?;
                sizes.extend(
                    stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?,
                );
                let mut sizes: Vec<String> = sizes.into_iter().collect();
                sort_sizes(&mut sizes);
                Ok(Facets {
                    brands,
                    materials,
                    sizes,
                })
            })
            .await?)
    }

    async fn codes(&self) -> Result<Vec<(String, String)>, Self::Error> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT product_id, code FROM product")?;
                let res = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(res)
            })
            .await?)
    }

    async fn update_stock(&self, updates: Vec<StockUpdate>) -> Result<usize, Self::Error> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut updated = 0;
                for u in updates {
                    let product: Option<(String, String, String, Option<String>)> = tx
                        .query_row(
                            "SELECT name, code, price, old_price FROM product WHERE product_id = ?1",
                            [&u.product_id],
                            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                        )
                        .map(Some)
                        .or_else(|err| match err {
                            rusqlite::Error::QueryReturnedNoRows => Ok(None),
                            err => Err(err),
                        })?;
                    let Some((name, code, price, old_price)) = product else {
                        log::warn!("Stock for unknown product {}", u.product_id);
                        continue;
                    };
                    tx.execute(
                        "UPDATE product SET quantity = ?1, in_stock = ?2, updated_at = ?3 WHERE product_id = ?4",
                        params![u.quantity, u.quantity > 0, now, u.product_id],
                    )?;
                    updated += 1;
                    // size suffixes only mean sizes for clothing or already sized products
                    let sized: i64 = tx.query_row(
                        "SELECT COUNT(*) FROM variant WHERE product_id = ?1",
                        [&u.product_id],
                        |row| row.get(0),
                    )?;
                    if sized == 0 && !is_clothing(&name) {
                        continue;
                    }
                    tx.execute("DELETE FROM variant WHERE product_id = ?1", [&u.product_id])?;
                    for (size, quantity) in &u.sizes {
                        tx.execute(
                            "INSERT INTO variant (product_id, size, quantity, price, old_price, sku, barcode)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
                            params![
                                u.product_id,
                                size,
                                quantity,
                                price,
                                old_price,
                                format!("{code}-{size}"),
                            ],
                        )?;
                    }
                }
                tx.commit()?;
                Ok(updated)
            })
            .await?)
    }

    async fn link_categories(
        &self,
        product_id: &str,
        categories: Vec<IdentityOf<Category>>,
    ) -> Result<(), Self::Error> {
        let product_id = product_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for c in categories {
                    tx.execute(
                        "INSERT OR IGNORE INTO product_category (product_id, category_id) VALUES (?1, ?2)",
                        params![product_id, c],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?)
    }

    async fn texts(&self) -> Result<Vec<ProductText>, Self::Error> {
        Ok(self
            .conn
            .call(|conn| {
                let mut links: HashMap<String, Vec<IdentityOf<Category>>> = HashMap::new();
                let mut stmt = conn.prepare("SELECT product_id, category_id FROM product_category")?;
                for row in stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))? {
                    let (product_id, category_id): (String, IdentityOf<Category>) = row?;
                    links.entry(product_id).or_default().push(category_id);
                }
                let mut stmt =
                    conn.prepare("SELECT product_id, name, description FROM product ORDER BY product_id")?;
                let res = stmt
                    .query_map([], |row| {
                        let product_id: String = row.get(0)?;
                        Ok(ProductText {
                            categories: links.remove(&product_id).unwrap_or_default(),
                            product_id,
                            name: row.get(1)?,
                            description: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(res)
            })
            .await?)
    }

    async fn uncategorized(&self) -> Result<Vec<String>, Self::Error> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT product_id FROM product
                     WHERE product_id NOT IN (SELECT product_id FROM product_category)
                     ORDER BY product_id",
                )?;
                let res = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(res)
            })
            .await?)
    }

    async fn set_attachment_path(
        &self,
        product_id: &str,
        url: &str,
        path: &str,
    ) -> Result<(), Self::Error> {
        let (product_id, url, path) = (product_id.to_string(), url.to_string(), path.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let raw: Option<String> = tx.query_row(
                    "SELECT attachments FROM product WHERE product_id = ?1",
                    [&product_id],
                    |row| row.get(0),
                )?;
                let mut attachments: Vec<Attachment> = json_from_sql(raw);
                attachments
                    .iter_mut()
                    .filter(|a| a.url == url)
                    .for_each(|a| a.local_path = Some(path.clone()));
                tx.execute(
                    "UPDATE product SET attachments = ?1 WHERE product_id = ?2",
                    params![json_to_sql(&attachments), product_id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?)
    }
}

pub struct SqliteBrandRepository {
    conn: Connection,
}

fn brand_from_row(row: &Row) -> rusqlite::Result<Brand> {
    Ok(Brand {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        is_active: row.get(3)?,
    })
}

impl SqliteBrandRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS brand (
                    id BLOB PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    slug TEXT NOT NULL UNIQUE,
                    is_active INTEGER NOT NULL DEFAULT 1
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    async fn find_by(&self, column: &'static str, value: Value) -> anyhow::Result<Option<Brand>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT id, name, slug, is_active FROM brand WHERE {column} = ?1"
                ))?;
                let b = stmt.query_map([value], brand_from_row)?.next().transpose()?;
                Ok(b)
            })
            .await?)
    }
}

impl Repository<Brand> for SqliteBrandRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Get<Brand> for SqliteBrandRepository {
    async fn get_one(&self, id: &IdentityOf<Brand>) -> Result<Option<Brand>, Self::Error> {
        self.find_by("id", Value::Blob(id.as_bytes().to_vec())).await
    }
}

#[async_trait]
impl Find<Brand, BrandByName> for SqliteBrandRepository {
    async fn find(&self, BrandByName(name): &BrandByName) -> Result<Option<Brand>, Self::Error> {
        self.find_by("name", name.clone().into()).await
    }
}

#[async_trait]
impl Find<Brand, BrandBySlug> for SqliteBrandRepository {
    async fn find(&self, BrandBySlug(slug): &BrandBySlug) -> Result<Option<Brand>, Self::Error> {
        self.find_by("slug", slug.clone().into()).await
    }
}

#[async_trait]
impl List<Brand> for SqliteBrandRepository {
    async fn list(&self) -> Result<Vec<Brand>, Self::Error> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, slug, is_active FROM brand WHERE is_active = 1 ORDER BY name",
                )?;
                let res = stmt
                    .query_map([], brand_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(res)
            })
            .await?)
    }
}

#[async_trait]
impl Save<Brand> for SqliteBrandRepository {
    async fn save(&self, b: Brand) -> Result<(), Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO brand (id, name, slug, is_active) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET name=?2, slug=?3, is_active=?4",
                    params![b.id, b.name, b.slug, b.is_active],
                )?;
                Ok(())
            })
            .await?)
    }
}

#[async_trait]
impl BrandRepository for SqliteBrandRepository {
    async fn slug_taken(&self, slug: &str) -> Result<bool, Self::Error> {
        Ok(self.find_by("slug", slug.to_string().into()).await?.is_some())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use gifts_types::product::{AttachmentKind, ProductFlags, SizeChart};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    pub fn product(product_id: &str, name: &str, price: Decimal) -> Product {
        Product {
            product_id: product_id.to_string(),
            group_id: None,
            code: format!("{product_id}.10"),
            name: name.to_string(),
            description: None,
            price,
            old_price: None,
            small_image: None,
            big_image: None,
            super_big_image: None,
            brand: None,
            brand_id: None,
            status: ProductStatus::Regular,
            in_stock: true,
            quantity: 5,
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

    pub async fn repo() -> SqliteProductRepository {
        let conn = Connection::open_in_memory().await.unwrap();
        SqliteProductRepository::init(conn).await.unwrap()
    }

    #[tokio::test]
    async fn round_trips_product() {
        let repo = repo().await;
        let category = Uuid::new_v4();
        let mut p = product("100", "Футболка", dec!(499.90));
        p.old_price = Some(dec!(599));
        p.gender = Some(Gender::Male);
        p.status = ProductStatus::New;
        p.categories = vec![category];
        p.attributes.insert("fit".to_string(), "прямой".to_string());
        p.variants = vec![Variant {
            size: "M".to_string(),
            quantity: 2,
            price: dec!(499.90),
            old_price: None,
            sku: Some("100.10-M".to_string()),
            barcode: None,
        }];
        p.size_chart = Some(SizeChart {
            image: Some("/img/chart.png".to_string()),
            table_html: "<table><tr><td>M</td></tr></table>".to_string(),
            note: None,
        });
        repo.save(p).await.unwrap();

        let p = repo.get_one(&"100".to_string()).await.unwrap().unwrap();
        assert_eq!(p.price, dec!(499.9));
        assert_eq!(p.old_price, Some(dec!(599)));
        assert_eq!(p.gender, Some(Gender::Male));
        assert_eq!(p.status, ProductStatus::New);
        assert_eq!(p.categories, vec![category]);
        assert_eq!(p.variants.len(), 1);
        assert_eq!(p.attributes["fit"], "прямой");
        let chart = p.size_chart.unwrap();
        assert_eq!(chart.image.as_deref(), Some("/img/chart.png"));
        assert_eq!(chart.table_html, "<table><tr><td>M</td></tr></table>");
        assert!(repo.exists("100").await.unwrap());
        assert!(!repo.exists("101").await.unwrap());
        assert_eq!(
            repo.find(&ByCode("100.10".to_string())).await.unwrap().map(|p| p.product_id),
            Some("100".to_string())
        );
        assert_eq!(repo.select(&InCategory(category)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn filters_and_sorts() {
        let repo = repo().await;
        let category = Uuid::new_v4();
        let mut a = product("1", "Ручка шариковая", dec!(50));
        a.brand = Some("Parker".to_string());
        a.material = Some("пластик".to_string());
        a.categories = vec![category];
        let mut b = product("2", "Кружка", dec!(300));
        b.old_price = Some(dec!(400));
        b.sizes_available = Some("XS, S, L".to_string());
        b.categories = vec![category];
        let mut c = product("3", "Зонт", dec!(1500));
        c.in_stock = false;
        c.brand = Some("Molti".to_string());
        for p in [a, b, c] {
            repo.save(p).await.unwrap();
        }

        let ids = |(products, _): (Vec<Product>, usize)| {
            products.into_iter().map(|p| p.product_id).collect::<Vec<_>>()
        };
        let q = ProductQuery {
            sort: Some(SortOrder::PriceDesc),
            ..Default::default()
        };
        assert_eq!(ids(repo.query(&q).await.unwrap()), vec!["3", "2", "1"]);
        let q = ProductQuery {
            categories: Some(vec![category]),
            ..Default::default()
        };
        assert_eq!(repo.query(&q).await.unwrap().1, 2);
        let q = ProductQuery {
            min_price: Some(dec!(100)),
            max_price: Some(dec!(1000)),
            ..Default::default()
        };
        assert_eq!(ids(repo.query(&q).await.unwrap()), vec!["2"]);
        let q = ProductQuery {
            has_discount: true,
            ..Default::default()
        };
        assert_eq!(ids(repo.query(&q).await.unwrap()), vec!["2"]);
        let q = ProductQuery {
            on_order: true,
            ..Default::default()
        };
        assert_eq!(ids(repo.query(&q).await.unwrap()), vec!["3"]);
        let q = ProductQuery {
            sizes: vec!["S".to_string()],
            ..Default::default()
        };
        assert_eq!(ids(repo.query(&q).await.unwrap()), vec!["2"]);
        let q = ProductQuery {
            brands: vec!["Parker".to_string(), "Molti".to_string()],
            sort: Some(SortOrder::NameAsc),
            ..Default::default()
        };
        assert_eq!(ids(repo.query(&q).await.unwrap()), vec!["3", "1"]);
        let q = ProductQuery {
            text: Some("РУЧКА".to_string()),
            ..Default::default()
        };
        assert_eq!(ids(repo.query(&q).await.unwrap()), vec!["1"]);
        let q = ProductQuery {
            categories: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(repo.query(&q).await.unwrap().1, 0);
        let q = ProductQuery {
            sort: Some(SortOrder::PriceAsc),
            offset: 1,
            limit: 1,
            ..Default::default()
        };
        let (page, total) = repo.query(&q).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page[0].product_id, "2");
    }

    #[tokio::test]
    async fn collects_facets() {
        let repo = repo().await;
        let mut a = product("1", "Футболка", dec!(50));
        a.brand = Some("Sol's".to_string());
        a.sizes_available = Some("XL, S".to_string());
        let mut b = product("2", "Поло", dec!(60));
        b.brand = Some("Nike".to_string());
        b.material = Some("хлопок".to_string());
        repo.save(a).await.unwrap();
        repo.save(b).await.unwrap();
        repo.update_stock(vec![StockUpdate {
            product_id: "2".to_string(),
            quantity: 4,
            sizes: BTreeMap::from([("M".to_string(), 4)]),
        }])
        .await
        .unwrap();
        let q = ProductQuery {
            brands: vec!["Nike".to_string()],
            ..Default::default()
        };
        let facets = repo.facets(&q).await.unwrap();
        assert_eq!(facets.brands, vec!["Nike", "Sol's"]);
        assert_eq!(facets.materials, vec!["хлопок"]);
        assert_eq!(facets.sizes, vec!["S", "M", "XL"]);
    }

    #[tokio::test]
    async fn updates_stock_and_variants() {
        let repo = repo().await;
        let mut p = product("7", "Толстовка", dec!(1200));
        p.old_price = Some(dec!(1500));
        repo.save(p).await.unwrap();
        let updated = repo
            .update_stock(vec![
                StockUpdate {
                    product_id: "7".to_string(),
                    quantity: 0,
                    sizes: BTreeMap::from([("S".to_string(), 0), ("L".to_string(), 0)]),
                },
                StockUpdate {
                    product_id: "missing".to_string(),
                    quantity: 3,
                    sizes: BTreeMap::new(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(updated, 1);
        let p = repo.get_one(&"7".to_string()).await.unwrap().unwrap();
        assert!(!p.in_stock);
        assert_eq!(p.quantity, 0);
        assert_eq!(p.variants.len(), 2);
        assert_eq!(p.variants[0].sku.as_deref(), Some("7.10-L"));
        assert_eq!(p.variants[0].price, dec!(1200));
        assert_eq!(p.variants[0].old_price, Some(dec!(1500)));
    }

    #[tokio::test]
    async fn size_codes_of_non_clothing_make_no_variants() {
        let repo = repo().await;
        repo.save(product("8", "Кружка", dec!(300))).await.unwrap();
        let mut bag = product("9", "Сумка", dec!(900));
        bag.variants = vec![Variant {
            size: "M".to_string(),
            quantity: 1,
            price: dec!(900),
            old_price: None,
            sku: None,
            barcode: None,
        }];
        repo.save(bag).await.unwrap();
        let sizes = BTreeMap::from([("S".to_string(), 2)]);
        let updated = repo
            .update_stock(vec![
                StockUpdate {
                    product_id: "8".to_string(),
                    quantity: 2,
                    sizes: sizes.clone(),
                },
                StockUpdate {
                    product_id: "9".to_string(),
                    quantity: 2,
                    sizes,
                },
            ])
            .await
            .unwrap();
        assert_eq!(updated, 2);
        let mug = repo.get_one(&"8".to_string()).await.unwrap().unwrap();
        assert_eq!(mug.quantity, 2);
        assert!(mug.variants.is_empty());
        let bag = repo.get_one(&"9".to_string()).await.unwrap().unwrap();
        assert_eq!(bag.variants.len(), 1);
        assert_eq!(bag.variants[0].size, "S");
        assert_eq!(bag.variants[0].sku.as_deref(), Some("9.10-S"));
    }

    #[tokio::test]
    async fn links_categories_and_attachments() {
        let repo = repo().await;
        let mut p = product("9", "Блокнот", dec!(100));
        p.attachments = vec![Attachment {
            kind: AttachmentKind::Image,
            url: "https://example.com/a.jpg".to_string(),
            name: None,
            local_path: None,
        }];
        repo.save(p).await.unwrap();
        repo.save(product("10", "Ручка", dec!(10))).await.unwrap();
        assert_eq!(repo.uncategorized().await.unwrap(), vec!["10", "9"]);
        let category = Uuid::new_v4();
        repo.link_categories("9", vec![category, category]).await.unwrap();
        assert_eq!(repo.uncategorized().await.unwrap(), vec!["10"]);
        repo.set_attachment_path("9", "https://example.com/a.jpg", "attachments/a.webp")
            .await
            .unwrap();
        let p = repo.get_one(&"9".to_string()).await.unwrap().unwrap();
        assert_eq!(
            p.attachments[0].local_path.as_deref(),
            Some("attachments/a.webp")
        );
        assert_eq!(repo.codes().await.unwrap().len(), 2);
        let texts = repo.texts().await.unwrap();
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[0].product_id, "10");
        assert!(texts[0].categories.is_empty());
        assert_eq!(texts[1].categories, vec![category]);
    }

    #[tokio::test]
    async fn stores_brands() {
        let conn = Connection::open_in_memory().await.unwrap();
        let repo = SqliteBrandRepository::init(conn).await.unwrap();
        let brand = Brand {
            id: Uuid::new_v4(),
            name: "Sol's".to_string(),
            slug: "sols".to_string(),
            is_active: true,
        };
        repo.save(brand.clone()).await.unwrap();
        assert!(repo.slug_taken("sols").await.unwrap());
        assert!(!repo.slug_taken("nike").await.unwrap());
        assert_eq!(
            repo.find(&BrandByName("Sol's".to_string())).await.unwrap(),
            Some(brand.clone())
        );
        assert_eq!(
            repo.find(&BrandBySlug("sols".to_string())).await.unwrap(),
            Some(brand.clone())
        );
        assert_eq!(repo.get_one(&brand.id).await.unwrap(), Some(brand.clone()));
        assert_eq!(repo.list().await.unwrap(), vec![brand]);
    }
}
