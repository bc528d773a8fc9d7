use crate::{decimal_from_sql, decimal_to_sql, json_from_sql, json_to_sql, parse_from_sql};
use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use derive_more::{Display, Error};
use lazy_regex::regex_is_match;
use photon_rs::PhotonImage;
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio_rusqlite::Connection;
use uuid::Uuid;

pub const DEFAULT_COLOR: &str = "#000000";
pub const DEFAULT_FONT_SIZE: u32 = 14;
pub const DEFAULT_MAX_TEXT_LENGTH: u32 = 50;
/// Pixels brighter than this are background
pub const MASK_THRESHOLD: u8 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
pub enum GarmentSize {
    #[serde(rename = "XXS")]
    #[display("XXS")]
    Xxs,
    #[serde(rename = "XS")]
    #[display("XS")]
    Xs,
    #[serde(rename = "S")]
    #[display("S")]
    S,
    #[serde(rename = "M")]
    #[display("M")]
    M,
    #[serde(rename = "L")]
    #[display("L")]
    L,
    #[serde(rename = "XL")]
    #[display("XL")]
    Xl,
    #[serde(rename = "XXL")]
    #[display("XXL")]
    Xxl,
    #[serde(rename = "3XL")]
    #[display("3XL")]
    X3l,
    #[serde(rename = "4XL")]
    #[display("4XL")]
    X4l,
    #[serde(rename = "5XL")]
    #[display("5XL")]
    X5l,
    #[serde(rename = "6XL")]
    #[display("6XL")]
    X6l,
    #[serde(rename = "7XL")]
    #[display("7XL")]
    X7l,
}

impl GarmentSize {
    pub const ALL: [GarmentSize; 12] = [
        Self::Xxs,
        Self::Xs,
        Self::S,
        Self::M,
        Self::L,
        Self::Xl,
        Self::Xxl,
        Self::X3l,
        Self::X4l,
        Self::X5l,
        Self::X6l,
        Self::X7l,
    ];

    /// Russian size range
    pub fn range(&self) -> &'static str {
        match self {
            Self::Xxs => "40-42",
            Self::Xs => "44-46",
            Self::S => "48",
            Self::M => "50",
            Self::L => "52",
            Self::Xl => "54",
            Self::Xxl => "56-58",
            Self::X3l => "60-62",
            Self::X4l => "64-66",
            Self::X5l => "68-70",
            Self::X6l => "72-74",
            Self::X7l => "76-78",
        }
    }

    pub fn label(&self) -> String {
        format!("{self} ({})", self.range())
    }
}

impl std::str::FromStr for GarmentSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|size| size.to_string() == s)
            .ok_or_else(|| anyhow!("Unknown size: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[default]
    #[display("Лицевая сторона")]
    Front,
    #[display("Тыльная сторона")]
    Back,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::Back => "back",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "front" => Ok(Self::Front),
            "back" => Ok(Self::Back),
            s => Err(anyhow!("Unknown side: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub base_price: Decimal,
    pub active: bool,
    pub sizes: Vec<GarmentSize>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub base_price: Decimal,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub sizes: Vec<GarmentSize>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateImage {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub template_id: i64,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub is_front: bool,
    #[serde(default)]
    pub is_back: bool,
    #[serde(default)]
    pub is_silhouette: bool,
    #[serde(default)]
    pub order: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesignArea {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub template_id: i64,
    pub name: String,
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
    #[serde(default = "default_max_text_length")]
    pub max_text_length: u32,
    #[serde(default = "default_true")]
    pub allow_images: bool,
    #[serde(default = "default_true")]
    pub allow_text: bool,
    /// Set for areas created by free placement; they go away with their element
    #[serde(default)]
    pub design_id: Option<i64>,
}

fn default_max_text_length() -> u32 {
    DEFAULT_MAX_TEXT_LENGTH
}

/// Template with everything the editor needs to draw it
#[derive(Debug, Clone, Serialize)]
pub struct TemplateDetails {
    pub template: Template,
    pub images: Vec<TemplateImage>,
    pub areas: Vec<DesignArea>,
}

impl TemplateDetails {
    pub fn front_image(&self) -> Option<&TemplateImage> {
        self.images.iter().find(|i| i.is_front)
    }

    pub fn back_image(&self) -> Option<&TemplateImage> {
        self.images.iter().find(|i| i.is_back)
    }

    /// Mask source for a side: the image marked as silhouette wins over the plain front image
    pub fn silhouette_source(&self, side: Side) -> Option<&TemplateImage> {
        match side {
            Side::Front => self
                .images
                .iter()
                .find(|i| i.is_silhouette && !i.is_back)
                .or_else(|| self.front_image()),
            Side::Back => self
                .images
                .iter()
                .find(|i| i.is_silhouette && i.is_back)
                .or_else(|| self.back_image()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserDesign {
    pub id: i64,
    pub session_key: String,
    pub user_id: Option<Uuid>,
    pub template_id: i64,
    pub product_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UserDesign {
    pub fn belongs_to(&self, session_key: &str, user_id: Option<Uuid>) -> bool {
        self.session_key == session_key || (user_id.is_some() && self.user_id == user_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DesignElement {
    pub id: i64,
    pub design_id: i64,
    pub area_id: i64,
    pub text: Option<String>,
    pub image_path: Option<String>,
    pub color: String,
    pub font_size: u32,
    pub rotation: i32,
    pub side: Side,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ElementInput {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub font_size: Option<u32>,
    #[serde(default)]
    pub rotation: Option<i32>,
    #[serde(default)]
    pub side: Side,
}

impl ElementInput {
    fn text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    fn color(&self) -> Result<String, DesignerError> {
        match self.color.as_deref().map(str::trim) {
            None | Some("") => Ok(DEFAULT_COLOR.to_string()),
            Some(c) if regex_is_match!(r"^#[0-9a-fA-F]{6}$", c) => Ok(c.to_uppercase()),
            Some(_) => Err(DesignerError::InvalidColor),
        }
    }

    /// Checks the element against what the area accepts
    pub fn validate(&self, area: &DesignArea) -> Result<(), DesignerError> {
        if self.text().is_none() && self.image_path.is_none() {
            return Err(DesignerError::NoContent);
        }
        if let Some(text) = self.text() {
            if !area.allow_text {
                return Err(DesignerError::TextNotAllowed);
            }
            if text.chars().count() > area.max_text_length as usize {
                return Err(DesignerError::TextTooLong {
                    max: area.max_text_length,
                });
            }
        }
        if self.image_path.is_some() && !area.allow_images {
            return Err(DesignerError::ImagesNotAllowed);
        }
        self.color()?;
        Ok(())
    }
}

/// Element dropped anywhere on the garment
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FreePlacement {
    #[serde(default)]
    pub x: Option<i64>,
    #[serde(default)]
    pub y: Option<i64>,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(flatten)]
    pub element: ElementInput,
}

impl FreePlacement {
    pub fn area(&self, template_id: i64, design_id: i64) -> DesignArea {
        DesignArea {
            id: 0,
            template_id,
            name: format!("User Area {}", &Uuid::new_v4().simple().to_string()[..6]),
            x: self.x.unwrap_or(0),
            y: self.y.unwrap_or(0),
            width: self.width.unwrap_or(200),
            height: self.height.unwrap_or(50),
            max_text_length: DEFAULT_MAX_TEXT_LENGTH,
            allow_images: true,
            allow_text: true,
            design_id: Some(design_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductColor {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub hex_code: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub is_pattern: bool,
    #[serde(default)]
    pub pattern_path: Option<String>,
    #[serde(default)]
    pub gradient_css: Option<String>,
}

impl ProductColor {
    /// CSS background for the swatch
    pub fn display_value(&self) -> String {
        if let Some(gradient) = self.gradient_css.as_deref().filter(|g| !g.is_empty()) {
            return gradient.to_string();
        }
        if let Some(pattern) = self.pattern_path.as_deref().filter(|p| !p.is_empty()) {
            return format!("url('/media/{}')", pattern.trim_start_matches('/'));
        }
        self.hex_code.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Silhouette {
    pub template_id: i64,
    pub front_mask: String,
    pub back_mask: Option<String>,
    #[serde(default)]
    pub colored_areas: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomOrder {
    pub id: i64,
    pub design_id: i64,
    pub color_id: Option<i64>,
    pub size: Option<GarmentSize>,
    pub quantity: u32,
    pub price: Decimal,
    pub in_cart: bool,
    pub product_id: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCustomOrder {
    pub design_id: i64,
    #[serde(default)]
    pub color_id: Option<i64>,
    #[serde(default)]
    pub size: Option<GarmentSize>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Display, Error)]
pub enum DesignerError {
    #[display("Не найдено")]
    NotFound,
    #[display("Текст длиннее {max} символов")]
    TextTooLong { max: u32 },
    #[display("В этой области нельзя размещать текст")]
    TextNotAllowed,
    #[display("В этой области нельзя размещать изображения")]
    ImagesNotAllowed,
    #[display("Нужно указать текст или изображение")]
    NoContent,
    #[display("Цвет должен быть в формате #RRGGBB")]
    InvalidColor,
    #[display("Количество должно быть не меньше 1")]
    InvalidQuantity,
    #[error(ignore)]
    #[display("Размер {_0} недоступен для этого изделия")]
    SizeUnavailable(GarmentSize),
    #[error(ignore)]
    #[display("{_0}")]
    Other(anyhow::Error),
}

impl From<tokio_rusqlite::Error> for DesignerError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        Self::Other(err.into())
    }
}

impl From<anyhow::Error> for DesignerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err)
    }
}

#[async_trait]
pub trait DesignerRepository: Send + Sync {
    async fn add_template(&self, template: NewTemplate) -> anyhow::Result<Template>;
    async fn templates(&self, only_active: bool) -> anyhow::Result<Vec<Template>>;
    async fn template(&self, id: i64) -> anyhow::Result<Option<TemplateDetails>>;
    async fn add_image(&self, image: TemplateImage) -> anyhow::Result<TemplateImage>;
    async fn add_area(&self, area: DesignArea) -> anyhow::Result<DesignArea>;
    async fn get_or_create_design(
        &self,
        session_key: &str,
        user_id: Option<Uuid>,
        template_id: i64,
        product_id: Option<String>,
    ) -> Result<UserDesign, DesignerError>;
    async fn design(&self, id: i64) -> anyhow::Result<Option<UserDesign>>;
    /// Designs started in the session or by the user
    async fn designs(&self, session_key: &str, user_id: Option<Uuid>)
        -> anyhow::Result<Vec<UserDesign>>;
    async fn elements(&self, design_id: i64) -> anyhow::Result<Vec<DesignElement>>;
    /// Areas created by free placement inside the design
    async fn placed_areas(&self, design_id: i64) -> anyhow::Result<Vec<DesignArea>>;
    /// Writes the element of `area_id`, replacing the previous content of that area
    async fn save_element(
        &self,
        design_id: i64,
        area_id: i64,
        input: ElementInput,
    ) -> Result<DesignElement, DesignerError>;
    async fn place_element(
        &self,
        design_id: i64,
        placement: FreePlacement,
    ) -> Result<(DesignElement, DesignArea), DesignerError>;
    async fn delete_element(&self, design_id: i64, element_id: i64) -> Result<(), DesignerError>;
    async fn save_color(&self, color: ProductColor) -> anyhow::Result<ProductColor>;
    async fn colors(&self, only_active: bool) -> anyhow::Result<Vec<ProductColor>>;
    async fn save_silhouette(&self, silhouette: Silhouette) -> anyhow::Result<()>;
    async fn silhouette(&self, template_id: i64) -> anyhow::Result<Option<Silhouette>>;
    async fn create_custom_order(&self, order: NewCustomOrder)
        -> Result<CustomOrder, DesignerError>;
    async fn custom_orders(&self, design_ids: Vec<i64>) -> anyhow::Result<Vec<CustomOrder>>;
    async fn update_custom_order(
        &self,
        id: i64,
        quantity: u32,
    ) -> Result<CustomOrder, DesignerError>;
    async fn remove_custom_order(&self, id: i64) -> Result<(), DesignerError>;
    async fn custom_order(&self, id: i64) -> anyhow::Result<Option<CustomOrder>>;
}

const TEMPLATE_SELECT: &str =
    "SELECT id, name, description, base_price, active, created_at FROM design_template";
const AREA_SELECT: &str = "SELECT id, template_id, name, x, y, width, height, max_text_length,
    allow_images, allow_text, design_id FROM design_area";
const ELEMENT_SELECT: &str = "SELECT id, design_id, area_id, text, image_path, color, font_size,
    rotation, side, created_at FROM design_element";
const DESIGN_SELECT: &str = "SELECT id, session_key, user_id, template_id, product_id, created_at,
    updated_at FROM user_design";
const COLOR_SELECT: &str = "SELECT id, name, hex_code, active, is_pattern, pattern_path, gradient_css
    FROM product_color";
const CUSTOM_ORDER_SELECT: &str = "SELECT id, design_id, color_id, size, quantity, price, in_cart,
    product_id, created_at FROM custom_order";

fn template_from_row(row: &Row) -> rusqlite::Result<Template> {
    Ok(Template {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        base_price: decimal_from_sql(3, row.get(3)?)?,
        active: row.get(4)?,
        sizes: vec![],
        created_at: row.get(5)?,
    })
}

fn image_from_row(row: &Row) -> rusqlite::Result<TemplateImage> {
    Ok(TemplateImage {
        id: row.get(0)?,
        template_id: row.get(1)?,
        name: row.get(2)?,
        path: row.get(3)?,
        is_front: row.get(4)?,
        is_back: row.get(5)?,
        is_silhouette: row.get(6)?,
        order: row.get(7)?,
    })
}

fn area_from_row(row: &Row) -> rusqlite::Result<DesignArea> {
    Ok(DesignArea {
        id: row.get(0)?,
        template_id: row.get(1)?,
        name: row.get(2)?,
        x: row.get(3)?,
        y: row.get(4)?,
        width: row.get(5)?,
        height: row.get(6)?,
        max_text_length: row.get(7)?,
        allow_images: row.get(8)?,
        allow_text: row.get(9)?,
        design_id: row.get(10)?,
    })
}

fn element_from_row(row: &Row) -> rusqlite::Result<DesignElement> {
    Ok(DesignElement {
        id: row.get(0)?,
        design_id: row.get(1)?,
        area_id: row.get(2)?,
        text: row.get(3)?,
        image_path: row.get(4)?,
        color: row.get(5)?,
        font_size: row.get(6)?,
        rotation: row.get(7)?,
        side: parse_from_sql(8, row.get(8)?)?,
        created_at: row.get(9)?,
    })
}

fn design_from_row(row: &Row) -> rusqlite::Result<UserDesign> {
    Ok(UserDesign {
        id: row.get(0)?,
        session_key: row.get(1)?,
        user_id: row.get(2)?,
        template_id: row.get(3)?,
        product_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn color_from_row(row: &Row) -> rusqlite::Result<ProductColor> {
    Ok(ProductColor {
        id: row.get(0)?,
        name: row.get(1)?,
        hex_code: row.get(2)?,
        active: row.get(3)?,
        is_pattern: row.get(4)?,
        pattern_path: row.get(5)?,
        gradient_css: row.get(6)?,
    })
}

fn custom_order_from_row(row: &Row) -> rusqlite::Result<CustomOrder> {
    Ok(CustomOrder {
        id: row.get(0)?,
        design_id: row.get(1)?,
        color_id: row.get(2)?,
        size: row
            .get::<_, Option<String>>(3)?
            .map(|s| parse_from_sql(3, s))
            .transpose()?,
        quantity: row.get(4)?,
        price: decimal_from_sql(5, row.get(5)?)?,
        in_cart: row.get(6)?,
        product_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn template_sizes(conn: &rusqlite::Connection, template_id: i64) -> rusqlite::Result<Vec<GarmentSize>> {
    let mut stmt = conn.prepare("SELECT size FROM design_template_size WHERE template_id = ?1")?;
    let mut sizes = stmt
        .query_map([template_id], |row| parse_from_sql(0, row.get(0)?))?
        .collect::<Result<Vec<GarmentSize>, _>>()?;
    sizes.sort();
    Ok(sizes)
}

fn load_template(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<Template>> {
    let template = conn
        .query_row(&format!("{TEMPLATE_SELECT} WHERE id = ?1"), [id], template_from_row)
        .optional()?;
    template
        .map(|mut t| {
            t.sizes = template_sizes(conn, t.id)?;
            Ok(t)
        })
        .transpose()
}

fn load_area(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<DesignArea>> {
    conn.query_row(&format!("{AREA_SELECT} WHERE id = ?1"), [id], area_from_row)
        .optional()
}

fn load_element(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<DesignElement>> {
    conn.query_row(&format!("{ELEMENT_SELECT} WHERE id = ?1"), [id], element_from_row)
        .optional()
}

fn load_design(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<UserDesign>> {
    conn.query_row(&format!("{DESIGN_SELECT} WHERE id = ?1"), [id], design_from_row)
        .optional()
}

fn load_custom_order(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<CustomOrder>> {
    conn.query_row(
        &format!("{CUSTOM_ORDER_SELECT} WHERE id = ?1"),
        [id],
        custom_order_from_row,
    )
    .optional()
}

fn insert_area(conn: &rusqlite::Connection, area: &DesignArea) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO design_area (template_id, name, x, y, width, height, max_text_length,
            allow_images, allow_text, design_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            area.template_id,
            area.name,
            area.x,
            area.y,
            area.width,
            area.height,
            area.max_text_length,
            area.allow_images,
            area.allow_text,
            area.design_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_element(
    conn: &rusqlite::Connection,
    design_id: i64,
    area_id: i64,
    input: &ElementInput,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO design_element (design_id, area_id, text, image_path, color, font_size,
            rotation, side, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            design_id,
            area_id,
            input.text().map(str::to_string),
            input.image_path,
            input.color().unwrap_or_else(|_| DEFAULT_COLOR.to_string()),
            input.font_size.unwrap_or(DEFAULT_FONT_SIZE),
            input.rotation.unwrap_or(0),
            input.side.as_str(),
            OffsetDateTime::now_utc(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn touch_design(conn: &rusqlite::Connection, design_id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE user_design SET updated_at = ?2 WHERE id = ?1",
        params![design_id, OffsetDateTime::now_utc()],
    )?;
    Ok(())
}

pub struct SqliteDesignerRepository {
    conn: Connection,
}

impl SqliteDesignerRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS design_template (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    base_price TEXT NOT NULL,
                    active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS design_template_size (
                    template_id INTEGER NOT NULL REFERENCES design_template(id) ON DELETE CASCADE,
                    size TEXT NOT NULL,
                    PRIMARY KEY(template_id, size)
                );
                CREATE TABLE IF NOT EXISTS design_template_image (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    template_id INTEGER NOT NULL REFERENCES design_template(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    path TEXT NOT NULL,
                    is_front INTEGER NOT NULL DEFAULT 0,
                    is_back INTEGER NOT NULL DEFAULT 0,
                    is_silhouette INTEGER NOT NULL DEFAULT 0,
                    position INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE IF NOT EXISTS design_area (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    template_id INTEGER NOT NULL REFERENCES design_template(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    x INTEGER NOT NULL,
                    y INTEGER NOT NULL,
                    width INTEGER NOT NULL,
                    height INTEGER NOT NULL,
                    max_text_length INTEGER NOT NULL DEFAULT 50,
                    allow_images INTEGER NOT NULL DEFAULT 1,
                    allow_text INTEGER NOT NULL DEFAULT 1,
                    design_id INTEGER
                );
                CREATE TABLE IF NOT EXISTS user_design (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_key TEXT NOT NULL,
                    user_id BLOB,
                    template_id INTEGER NOT NULL REFERENCES design_template(id) ON DELETE CASCADE,
                    product_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(session_key, template_id)
                );
                CREATE TABLE IF NOT EXISTS design_element (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    design_id INTEGER NOT NULL REFERENCES user_design(id) ON DELETE CASCADE,
                    area_id INTEGER NOT NULL REFERENCES design_area(id) ON DELETE CASCADE,
                    text TEXT,
                    image_path TEXT,
                    color TEXT NOT NULL DEFAULT '#000000',
                    font_size INTEGER NOT NULL DEFAULT 14,
                    rotation INTEGER NOT NULL DEFAULT 0,
                    side TEXT NOT NULL DEFAULT 'front',
                    created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS product_color (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    hex_code TEXT NOT NULL,
                    active INTEGER NOT NULL DEFAULT 1,
                    is_pattern INTEGER NOT NULL DEFAULT 0,
                    pattern_path TEXT,
                    gradient_css TEXT
                );
                CREATE TABLE IF NOT EXISTS silhouette (
                    template_id INTEGER PRIMARY KEY REFERENCES design_template(id) ON DELETE CASCADE,
                    front_mask TEXT NOT NULL,
                    back_mask TEXT,
                    colored_areas TEXT
                );
                CREATE TABLE IF NOT EXISTS custom_order (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    design_id INTEGER NOT NULL REFERENCES user_design(id) ON DELETE CASCADE,
                    color_id INTEGER REFERENCES product_color(id) ON DELETE SET NULL,
                    size TEXT,
                    quantity INTEGER NOT NULL,
                    price TEXT NOT NULL,
                    in_cart INTEGER NOT NULL DEFAULT 1,
                    product_id TEXT,
                    created_at TEXT NOT NULL
                );",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl DesignerRepository for SqliteDesignerRepository {
    async fn add_template(&self, template: NewTemplate) -> anyhow::Result<Template> {
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO design_template (name, description, base_price, active, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        template.name,
                        template.description,
                        decimal_to_sql(&template.base_price),
                        template.active,
                        OffsetDateTime::now_utc(),
                    ],
                )?;
                let id = tx.last_insert_rowid();
                for size in &template.sizes {
                    tx.execute(
                        "INSERT OR IGNORE INTO design_template_size (template_id, size) VALUES (?1, ?2)",
                        params![id, size.to_string()],
                    )?;
                }
                let res = load_template(&tx, id)?;
                tx.commit()?;
                Ok(res)
            })
            .await?
            .ok_or_else(|| anyhow!("Template disappeared after insert"))?)
    }

    async fn templates(&self, only_active: bool) -> anyhow::Result<Vec<Template>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{TEMPLATE_SELECT} WHERE active = 1 OR ?1 = 0 ORDER BY id"
                ))?;
                let mut res = stmt
                    .query_map([only_active], template_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                for t in &mut res {
                    t.sizes = template_sizes(conn, t.id)?;
                }
                Ok(res)
            })
            .await?)
    }

    async fn template(&self, id: i64) -> anyhow::Result<Option<TemplateDetails>> {
        Ok(self
            .conn
            .call(move |conn| {
                let Some(template) = load_template(conn, id)? else {
                    return Ok(None);
                };
                let mut stmt = conn.prepare(
                    "SELECT id, template_id, name, path, is_front, is_back, is_silhouette, position
                     FROM design_template_image WHERE template_id = ?1 ORDER BY position, id",
                )?;
                let images = stmt
                    .query_map([id], image_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                let mut stmt = conn.prepare(&format!(
                    "{AREA_SELECT} WHERE template_id = ?1 AND design_id IS NULL ORDER BY id"
                ))?;
                let areas = stmt
                    .query_map([id], area_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(TemplateDetails {
                    template,
                    images,
                    areas,
                }))
            })
            .await?)
    }

    async fn add_image(&self, image: TemplateImage) -> anyhow::Result<TemplateImage> {
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO design_template_image (template_id, name, path, is_front, is_back,
                        is_silhouette, position)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        image.template_id,
                        image.name,
                        image.path,
                        image.is_front,
                        image.is_back,
                        image.is_silhouette,
                        image.order,
                    ],
                )?;
                Ok(TemplateImage {
                    id: conn.last_insert_rowid(),
                    ..image
                })
            })
            .await?)
    }

    async fn add_area(&self, area: DesignArea) -> anyhow::Result<DesignArea> {
        Ok(self
            .conn
            .call(move |conn| {
                let id = insert_area(conn, &area)?;
                Ok(DesignArea { id, ..area })
            })
            .await?)
    }

    async fn get_or_create_design(
        &self,
        session_key: &str,
        user_id: Option<Uuid>,
        template_id: i64,
        product_id: Option<String>,
    ) -> Result<UserDesign, DesignerError> {
        let session_key = session_key.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if load_template(&tx, template_id)?.is_none() {
                    return Ok(Err(DesignerError::NotFound));
                }
                let now = OffsetDateTime::now_utc();
                tx.execute(
                    "INSERT INTO user_design (session_key, user_id, template_id, product_id,
                        created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     ON CONFLICT(session_key, template_id) DO UPDATE SET
                        user_id = COALESCE(excluded.user_id, user_id),
                        product_id = COALESCE(excluded.product_id, product_id)",
                    params![session_key, user_id, template_id, product_id, now],
                )?;
                let design = tx.query_row(
                    &format!("{DESIGN_SELECT} WHERE session_key = ?1 AND template_id = ?2"),
                    params![session_key, template_id],
                    design_from_row,
                )?;
                tx.commit()?;
                Ok(Ok(design))
            })
            .await?
    }

    async fn design(&self, id: i64) -> anyhow::Result<Option<UserDesign>> {
        Ok(self.conn.call(move |conn| Ok(load_design(conn, id)?)).await?)
    }

    async fn designs(
        &self,
        session_key: &str,
        user_id: Option<Uuid>,
    ) -> anyhow::Result<Vec<UserDesign>> {
        let session_key = session_key.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{DESIGN_SELECT} WHERE session_key = ?1 OR (?2 IS NOT NULL AND user_id = ?2)
                     ORDER BY id"
                ))?;
                let res = stmt
                    .query_map(params![session_key, user_id], design_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(res)
            })
            .await?)
    }

    async fn elements(&self, design_id: i64) -> anyhow::Result<Vec<DesignElement>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("{ELEMENT_SELECT} WHERE design_id = ?1 ORDER BY id"))?;
                let res = stmt
                    .query_map([design_id], element_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(res)
            })
            .await?)
    }

    async fn placed_areas(&self, design_id: i64) -> anyhow::Result<Vec<DesignArea>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("{AREA_SELECT} WHERE design_id = ?1 ORDER BY id"))?;
                let res = stmt
                    .query_map([design_id], area_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(res)
            })
            .await?)
    }

    async fn save_element(
        &self,
        design_id: i64,
        area_id: i64,
        input: ElementInput,
    ) -> Result<DesignElement, DesignerError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let (Some(design), Some(area)) = (load_design(&tx, design_id)?, load_area(&tx, area_id)?)
                else {
                    return Ok(Err(DesignerError::NotFound));
                };
                if area.template_id != design.template_id {
                    return Ok(Err(DesignerError::NotFound));
                }
                if let Err(err) = input.validate(&area) {
                    return Ok(Err(err));
                }
                tx.execute(
                    "DELETE FROM design_element WHERE design_id = ?1 AND area_id = ?2",
                    params![design_id, area_id],
                )?;
                let id = insert_element(&tx, design_id, area_id, &input)?;
                touch_design(&tx, design_id)?;
                let element = load_element(&tx, id)?;
                tx.commit()?;
                Ok(element.ok_or(DesignerError::NotFound))
            })
            .await?
    }

    async fn place_element(
        &self,
        design_id: i64,
        placement: FreePlacement,
    ) -> Result<(DesignElement, DesignArea), DesignerError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(design) = load_design(&tx, design_id)? else {
                    return Ok(Err(DesignerError::NotFound));
                };
                let mut area = placement.area(design.template_id, design_id);
                if let Err(err) = placement.element.validate(&area) {
                    return Ok(Err(err));
                }
                area.id = insert_area(&tx, &area)?;
                let id = insert_element(&tx, design_id, area.id, &placement.element)?;
                touch_design(&tx, design_id)?;
                let element = load_element(&tx, id)?;
                tx.commit()?;
                Ok(element.map(|e| (e, area)).ok_or(DesignerError::NotFound))
            })
            .await?
    }

    async fn delete_element(&self, design_id: i64, element_id: i64) -> Result<(), DesignerError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(element) = load_element(&tx, element_id)? else {
                    return Ok(Err(DesignerError::NotFound));
                };
                if element.design_id != design_id {
                    return Ok(Err(DesignerError::NotFound));
                }
                tx.execute("DELETE FROM design_element WHERE id = ?1", [element_id])?;
                tx.execute(
                    "DELETE FROM design_area WHERE id = ?1 AND design_id = ?2",
                    params![element.area_id, design_id],
                )?;
                touch_design(&tx, design_id)?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await?
    }

    async fn save_color(&self, color: ProductColor) -> anyhow::Result<ProductColor> {
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO product_color (id, name, hex_code, active, is_pattern, pattern_path,
                        gradient_css)
                     VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        hex_code = excluded.hex_code,
                        active = excluded.active,
                        is_pattern = excluded.is_pattern,
                        pattern_path = excluded.pattern_path,
                        gradient_css = excluded.gradient_css",
                    params![
                        color.id,
                        color.name,
                        color.hex_code,
                        color.active,
                        color.is_pattern,
                        color.pattern_path,
                        color.gradient_css,
                    ],
                )?;
                let id = match color.id {
                    0 => conn.last_insert_rowid(),
                    id => id,
                };
                Ok(ProductColor { id, ..color })
            })
            .await?)
    }

    async fn colors(&self, only_active: bool) -> anyhow::Result<Vec<ProductColor>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{COLOR_SELECT} WHERE active = 1 OR ?1 = 0 ORDER BY id"
                ))?;
                let res = stmt
                    .query_map([only_active], color_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(res)
            })
            .await?)
    }

    async fn save_silhouette(&self, silhouette: Silhouette) -> anyhow::Result<()> {
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO silhouette (template_id, front_mask, back_mask, colored_areas)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(template_id) DO UPDATE SET
                        front_mask = excluded.front_mask,
                        back_mask = excluded.back_mask,
                        colored_areas = excluded.colored_areas",
                    params![
                        silhouette.template_id,
                        silhouette.front_mask,
                        silhouette.back_mask,
                        json_to_sql(&silhouette.colored_areas),
                    ],
                )?;
                Ok(())
            })
            .await?)
    }

    async fn silhouette(&self, template_id: i64) -> anyhow::Result<Option<Silhouette>> {
        Ok(self
            .conn
            .call(move |conn| {
                let res = conn
                    .query_row(
                        "SELECT template_id, front_mask, back_mask, colored_areas FROM silhouette
                         WHERE template_id = ?1",
                        [template_id],
                        |row| {
                            Ok(Silhouette {
                                template_id: row.get(0)?,
                                front_mask: row.get(1)?,
                                back_mask: row.get(2)?,
                                colored_areas: json_from_sql(row.get(3)?),
                            })
                        },
                    )
                    .optional()?;
                Ok(res)
            })
            .await?)
    }

    async fn create_custom_order(
        &self,
        order: NewCustomOrder,
    ) -> Result<CustomOrder, DesignerError> {
        if order.quantity < 1 {
            return Err(DesignerError::InvalidQuantity);
        }
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(design) = load_design(&tx, order.design_id)? else {
                    return Ok(Err(DesignerError::NotFound));
                };
                let Some(template) = load_template(&tx, design.template_id)? else {
                    return Ok(Err(DesignerError::NotFound));
                };
                if let Some(size) = order.size {
                    if !template.sizes.is_empty() && !template.sizes.contains(&size) {
                        return Ok(Err(DesignerError::SizeUnavailable(size)));
                    }
                }
                if let Some(color_id) = order.color_id {
                    let exists = tx
                        .query_row(
                            "SELECT 1 FROM product_color WHERE id = ?1 AND active = 1",
                            [color_id],
                            |_| Ok(()),
                        )
                        .optional()?;
                    if exists.is_none() {
                        return Ok(Err(DesignerError::NotFound));
                    }
                }
                let price = template.base_price * Decimal::from(order.quantity);
                tx.execute(
                    "INSERT INTO custom_order (design_id, color_id, size, quantity, price, in_cart,
                        product_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
                    params![
                        order.design_id,
                        order.color_id,
                        order.size.map(|s| s.to_string()),
                        order.quantity,
                        decimal_to_sql(&price),
                        design.product_id,
                        OffsetDateTime::now_utc(),
                    ],
                )?;
                let res = load_custom_order(&tx, tx.last_insert_rowid())?;
                tx.commit()?;
                Ok(res.ok_or(DesignerError::NotFound))
            })
            .await?
    }

    async fn custom_orders(&self, design_ids: Vec<i64>) -> anyhow::Result<Vec<CustomOrder>> {
        if design_ids.is_empty() {
            return Ok(vec![]);
        }
        Ok(self
            .conn
            .call(move |conn| {
                let placeholders = vec!["?"; design_ids.len()].join(", ");
                let mut stmt = conn.prepare(&format!(
                    "{CUSTOM_ORDER_SELECT} WHERE in_cart = 1 AND design_id IN ({placeholders}) ORDER BY id"
                ))?;
                let res = stmt
                    .query_map(rusqlite::params_from_iter(design_ids), custom_order_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(res)
            })
            .await?)
    }

    async fn update_custom_order(
        &self,
        id: i64,
        quantity: u32,
    ) -> Result<CustomOrder, DesignerError> {
        if quantity < 1 {
            return Err(DesignerError::InvalidQuantity);
        }
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let base_price = tx
                    .query_row(
                        "SELECT t.base_price FROM custom_order o
                         JOIN user_design d ON d.id = o.design_id
                         JOIN design_template t ON t.id = d.template_id
                         WHERE o.id = ?1",
                        [id],
                        |row| decimal_from_sql(0, row.get(0)?),
                    )
                    .optional()?;
                let Some(base_price) = base_price else {
                    return Ok(Err(DesignerError::NotFound));
                };
                tx.execute(
                    "UPDATE custom_order SET quantity = ?2, price = ?3 WHERE id = ?1",
                    params![id, quantity, decimal_to_sql(&(base_price * Decimal::from(quantity)))],
                )?;
                let res = load_custom_order(&tx, id)?;
                tx.commit()?;
                Ok(res.ok_or(DesignerError::NotFound))
            })
            .await?
    }

    async fn remove_custom_order(&self, id: i64) -> Result<(), DesignerError> {
        self.conn
            .call(move |conn| {
                match conn.execute("DELETE FROM custom_order WHERE id = ?1", [id])? {
                    0 => Ok(Err(DesignerError::NotFound)),
                    _ => Ok(Ok(())),
                }
            })
            .await?
    }

    async fn custom_order(&self, id: i64) -> anyhow::Result<Option<CustomOrder>> {
        Ok(self
            .conn
            .call(move |conn| Ok(load_custom_order(conn, id)?))
            .await?)
    }
}

/// Builds a CSS `mask-image` from a garment photo: the garment turns black, the light background white
pub fn silhouette_mask(image: &PhotonImage) -> PhotonImage {
    let mut pixels = image.get_raw_pixels();
    for px in pixels.chunks_exact_mut(4) {
        let luma = (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32).round() as u8;
        let garment = luma <= MASK_THRESHOLD && px[3] > 0;
        let value = match garment {
            true => 0,
            false => 255,
        };
        px[0] = value;
        px[1] = value;
        px[2] = value;
        px[3] = 255;
    }
    PhotonImage::new(pixels, image.get_width(), image.get_height())
}

pub async fn generate_mask(source: &Path, target: &Path) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(source)
        .await
        .with_context(|| format!("Unable to read {}", source.display()))?;
    let png = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
        let image = photon_rs::native::open_image_from_bytes(&bytes)
            .context("Unable to open garment image")?;
        Ok(silhouette_mask(&image).get_bytes())
    })
    .await??;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, png)
        .await
        .with_context(|| format!("Unable to write {}", target.display()))?;
    Ok(())
}

/// Generates masks for both sides of a template under `{media_root}/product_silhouettes/`
pub async fn generate_silhouette(
    repo: &dyn DesignerRepository,
    template_id: i64,
    media_root: &Path,
) -> Result<Silhouette, DesignerError> {
    let details = repo
        .template(template_id)
        .await?
        .ok_or(DesignerError::NotFound)?;
    let Some(front) = details.silhouette_source(Side::Front) else {
        return Err(anyhow!("Template {template_id} has no front image").into());
    };
    let front_mask = format!("product_silhouettes/mask_{template_id}.png");
    generate_mask(&media_root.join(&front.path), &media_root.join(&front_mask)).await?;
    let back_mask = match details.silhouette_source(Side::Back) {
        Some(back) => {
            let path = format!("product_silhouettes/mask_{template_id}_back.png");
            generate_mask(&media_root.join(&back.path), &media_root.join(&path)).await?;
            Some(path)
        }
        None => None,
    };
    let colored_areas = repo
        .silhouette(template_id)
        .await?
        .map(|s| s.colored_areas)
        .unwrap_or_default();
    let silhouette = Silhouette {
        template_id,
        front_mask,
        back_mask,
        colored_areas,
    };
    repo.save_silhouette(silhouette.clone()).await?;
    log::info!("Generated silhouette for template {}", details.template.name);
    Ok(silhouette)
}

/// Stores an uploaded design picture under `{media_root}/design_elements/`
pub async fn store_element_image(
    media_root: &Path,
    file_name: Option<&str>,
    data: &[u8],
) -> anyhow::Result<String> {
    let ext = file_name
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .filter(|e| matches!(e.as_str(), "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg"))
        .ok_or_else(|| anyhow!("Unsupported image type"))?;
    let relative = format!("design_elements/{}.{ext}", Uuid::new_v4().simple());
    let path: PathBuf = media_root.join(&relative);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, data)
        .await
        .with_context(|| format!("Unable to write {}", path.display()))?;
    Ok(relative)
}
