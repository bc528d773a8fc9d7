use crate::decimal_from_sql;
use async_trait::async_trait;
use derive_more::{Display, Error};
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_rusqlite::Connection;
use uuid::Uuid;

/// Who a cart or an order belongs to: a signed in user or an anonymous session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartOwner {
    User(Uuid),
    Session(String),
}

impl CartOwner {
    pub(crate) fn columns(&self) -> (Option<Uuid>, Option<String>) {
        match self {
            Self::User(id) => (Some(*id), None),
            Self::Session(key) => (None, Some(key.clone())),
        }
    }

    pub(crate) fn from_columns(user_id: Option<Uuid>, session_key: Option<String>) -> Option<Self> {
        user_id
            .map(Self::User)
            .or_else(|| session_key.map(Self::Session))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Cart {
    pub id: i64,
    pub owner: CartOwner,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CartItem {
    pub id: i64,
    pub cart_id: i64,
    pub product_id: String,
    pub name: String,
    pub code: String,
    pub size: Option<String>,
    pub quantity: u32,
    pub price: Decimal,
}

impl CartItem {
    pub fn total(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CartView {
    pub cart_id: i64,
    pub items: Vec<CartItem>,
    pub total_quantity: u64,
    pub total_price: Decimal,
}

impl CartView {
    pub fn new(cart_id: i64, items: Vec<CartItem>) -> Self {
        Self {
            cart_id,
            total_quantity: items.iter().map(|i| i.quantity as u64).sum(),
            total_price: items.iter().map(CartItem::total).sum(),
            items,
        }
    }
}

#[derive(Debug, Display, Error)]
pub enum CartError {
    #[display("Количество должно быть не меньше 1")]
    InvalidQuantity,
    #[error(ignore)]
    #[display("Товар {_0} не найден")]
    ProductNotFound(String),
    #[display("Позиция корзины не найдена")]
    ItemNotFound,
    #[display("Нет доступа к позиции корзины")]
    Forbidden,
    #[error(ignore)]
    #[display("{_0}")]
    Other(anyhow::Error),
}

impl From<tokio_rusqlite::Error> for CartError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        Self::Other(err.into())
    }
}

impl From<anyhow::Error> for CartError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err)
    }
}

#[async_trait]
pub trait CartRepository: Send + Sync {
    async fn get_or_create(&self, owner: &CartOwner) -> anyhow::Result<Cart>;
    async fn items(&self, cart_id: i64) -> anyhow::Result<Vec<CartItem>>;
    /// Adds `quantity` of the product; an existing line with the same product and size is incremented
    async fn add(
        &self,
        cart_id: i64,
        product_id: String,
        quantity: u32,
        size: Option<String>,
    ) -> Result<CartItem, CartError>;
    async fn update(&self, cart_id: i64, item_id: i64, quantity: u32) -> Result<CartItem, CartError>;
    async fn remove(&self, cart_id: i64, item_id: i64) -> Result<(), CartError>;
    async fn clear(&self, cart_id: i64) -> anyhow::Result<()>;
}

const ITEM_SELECT: &str = "SELECT ci.id, ci.cart_id, ci.product_id, p.name, p.code, ci.size, ci.quantity, p.price
    FROM cart_item ci JOIN product p ON p.product_id = ci.product_id";

pub(crate) fn cart_item_from_row(row: &Row) -> rusqlite::Result<CartItem> {
    Ok(CartItem {
        id: row.get(0)?,
        cart_id: row.get(1)?,
        product_id: row.get(2)?,
        name: row.get(3)?,
        code: row.get(4)?,
        size: row
            .get::<_, String>(5)
            .map(|s| Some(s).filter(|s| !s.is_empty()))?,
        quantity: row.get(6)?,
        price: decimal_from_sql(7, row.get(7)?)?,
    })
}

pub(crate) fn load_items(conn: &rusqlite::Connection, cart_id: i64) -> rusqlite::Result<Vec<CartItem>> {
    let mut stmt = conn.prepare(&format!("{ITEM_SELECT} WHERE ci.cart_id = ?1 ORDER BY ci.id"))?;
    let res = stmt
        .query_map([cart_id], cart_item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(res)
}

fn load_item(conn: &rusqlite::Connection, item_id: i64) -> rusqlite::Result<Option<CartItem>> {
    conn.query_row(
        &format!("{ITEM_SELECT} WHERE ci.id = ?1"),
        [item_id],
        cart_item_from_row,
    )
    .optional()
}

/// Cart owning `item_id`, `None` when the item does not exist
fn item_cart(conn: &rusqlite::Connection, item_id: i64) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT cart_id FROM cart_item WHERE id = ?1",
        [item_id],
        |row| row.get(0),
    )
    .optional()
}

fn check_access(
    conn: &rusqlite::Connection,
    cart_id: i64,
    item_id: i64,
) -> rusqlite::Result<Result<(), CartError>> {
    Ok(match item_cart(conn, item_id)? {
        None => Err(CartError::ItemNotFound),
        Some(owner) if owner != cart_id => Err(CartError::Forbidden),
        Some(_) => Ok(()),
    })
}

/// Cart tables live in the same database as `product`
pub struct SqliteCartRepository {
    conn: Connection,
}

impl SqliteCartRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS cart (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id BLOB UNIQUE,
                    session_key TEXT UNIQUE,
                    created_at TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS cart_item (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    cart_id INTEGER NOT NULL REFERENCES cart(id) ON DELETE CASCADE,
                    product_id TEXT NOT NULL,
                    size TEXT NOT NULL DEFAULT '',
                    quantity INTEGER NOT NULL,
                    UNIQUE(cart_id, product_id, size)
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CartRepository for SqliteCartRepository {
    async fn get_or_create(&self, owner: &CartOwner) -> anyhow::Result<Cart> {
        let owner = owner.clone();
        Ok(self
            .conn
            .call(move |conn| {
                let (user_id, session_key) = owner.columns();
                let tx = conn.transaction()?;
                let existing = tx
                    .query_row(
                        "SELECT id, created_at FROM cart WHERE user_id = ?1 OR session_key = ?2",
                        params![user_id, session_key],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let (id, created_at) = match existing {
                    Some(c) => c,
                    None => {
                        let now = OffsetDateTime::now_utc();
                        tx.execute(
                            "INSERT INTO cart (user_id, session_key, created_at) VALUES (?1, ?2, ?3)",
                            params![user_id, session_key, now],
                        )?;
                        (tx.last_insert_rowid(), now)
                    }
                };
                tx.commit()?;
                Ok(Cart {
                    id,
                    owner,
                    created_at,
                })
            })
            .await?)
    }

    async fn items(&self, cart_id: i64) -> anyhow::Result<Vec<CartItem>> {
        Ok(self
            .conn
            .call(move |conn| Ok(load_items(conn, cart_id)?))
            .await?)
    }

    async fn add(
        &self,
        cart_id: i64,
        product_id: String,
        quantity: u32,
        size: Option<String>,
    ) -> Result<CartItem, CartError> {
        if quantity < 1 {
            return Err(CartError::InvalidQuantity);
        }
        let size = size.map(|s| s.trim().to_string()).unwrap_or_default();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists = tx
                    .query_row(
                        "SELECT 1 FROM product WHERE product_id = ?1",
                        [&product_id],
                        |_| Ok(()),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Ok(Err(CartError::ProductNotFound(product_id)));
                }
                tx.execute(
                    "INSERT INTO cart_item (cart_id, product_id, size, quantity) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(cart_id, product_id, size) DO UPDATE SET quantity = quantity + excluded.quantity",
                    params![cart_id, product_id, size, quantity],
                )?;
                let id: i64 = tx.query_row(
                    "SELECT id FROM cart_item WHERE cart_id = ?1 AND product_id = ?2 AND size = ?3",
                    params![cart_id, product_id, size],
                    |row| row.get(0),
                )?;
                let item = load_item(&tx, id)?;
                tx.commit()?;
                Ok(item.ok_or(CartError::ItemNotFound))
            })
            .await?
    }

    async fn update(&self, cart_id: i64, item_id: i64, quantity: u32) -> Result<CartItem, CartError> {
        if quantity < 1 {
            return Err(CartError::InvalidQuantity);
        }
        self.conn
            .call(move |conn| {
                if let Err(err) = check_access(conn, cart_id, item_id)? {
                    return Ok(Err(err));
                }
                conn.execute(
                    "UPDATE cart_item SET quantity = ?2 WHERE id = ?1",
                    params![item_id, quantity],
                )?;
                Ok(load_item(conn, item_id)?.ok_or(CartError::ItemNotFound))
            })
            .await?
    }

    async fn remove(&self, cart_id: i64, item_id: i64) -> Result<(), CartError> {
        self.conn
            .call(move |conn| {
                if let Err(err) = check_access(conn, cart_id, item_id)? {
                    return Ok(Err(err));
                }
                conn.execute("DELETE FROM cart_item WHERE id = ?1", [item_id])?;
                Ok(Ok(()))
            })
            .await?
    }

    async fn clear(&self, cart_id: i64) -> anyhow::Result<()> {
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute("DELETE FROM cart_item WHERE cart_id = ?1", [cart_id])?;
                Ok(())
            })
            .await?)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::product::tests::product;
    use crate::product::SqliteProductRepository;
    use rust_decimal_macros::dec;
    use typesafe_repository::async_ops::Save;

    /// Product, cart and order tables over one in-memory database
    pub async fn conn_with_products() -> Connection {
        let conn = Connection::open_in_memory().await.unwrap();
        let products = SqliteProductRepository::init(conn.clone()).await.unwrap();
        products.save(product("1", "Кружка", dec!(150.50))).await.unwrap();
        products.save(product("2", "Футболка", dec!(500))).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn creates_cart_once_per_owner() {
        let repo = SqliteCartRepository::init(conn_with_products().await).await.unwrap();
        let user = CartOwner::User(Uuid::new_v4());
        let a = repo.get_or_create(&user).await.unwrap();
        let b = repo.get_or_create(&user).await.unwrap();
        assert_eq!(a.id, b.id);
        let session = repo
            .get_or_create(&CartOwner::Session("abc".to_string()))
            .await
            .unwrap();
        assert_ne!(a.id, session.id);
    }

    #[tokio::test]
    async fn adds_updates_and_totals_items() {
        let repo = SqliteCartRepository::init(conn_with_products().await).await.unwrap();
        let cart = repo
            .get_or_create(&CartOwner::Session("s".to_string()))
            .await
            .unwrap();
        repo.add(cart.id, "1".to_string(), 2, None).await.unwrap();
        let merged = repo.add(cart.id, "1".to_string(), 1, None).await.unwrap();
        assert_eq!(merged.quantity, 3);
        let shirt = repo
            .add(cart.id, "2".to_string(), 1, Some("XL".to_string()))
            .await
            .unwrap();
        repo.add(cart.id, "2".to_string(), 1, Some("M".to_string()))
            .await
            .unwrap();
        assert!(matches!(
            repo.add(cart.id, "404".to_string(), 1, None).await,
            Err(CartError::ProductNotFound(_))
        ));
        assert!(matches!(
            repo.add(cart.id, "1".to_string(), 0, None).await,
            Err(CartError::InvalidQuantity)
        ));

        let updated = repo.update(cart.id, shirt.id, 4).await.unwrap();
        assert_eq!(updated.size.as_deref(), Some("XL"));
        let view = CartView::new(cart.id, repo.items(cart.id).await.unwrap());
        assert_eq!(view.items.len(), 3);
        assert_eq!(view.total_quantity, 8);
        assert_eq!(view.total_price, dec!(451.50) + dec!(2000) + dec!(500));
    }

    #[tokio::test]
    async fn refuses_foreign_items() {
        let repo = SqliteCartRepository::init(conn_with_products().await).await.unwrap();
        let mine = repo
            .get_or_create(&CartOwner::Session("mine".to_string()))
            .await
            .unwrap();
        let theirs = repo
            .get_or_create(&CartOwner::Session("theirs".to_string()))
            .await
            .unwrap();
        let item = repo.add(theirs.id, "1".to_string(), 1, None).await.unwrap();
        assert!(matches!(
            repo.update(mine.id, item.id, 5).await,
            Err(CartError::Forbidden)
        ));
        assert!(matches!(
            repo.remove(mine.id, item.id).await,
            Err(CartError::Forbidden)
        ));
        assert!(matches!(
            repo.remove(mine.id, 999).await,
            Err(CartError::ItemNotFound)
        ));
        repo.remove(theirs.id, item.id).await.unwrap();
        assert!(repo.items(theirs.id).await.unwrap().is_empty());
    }
}
