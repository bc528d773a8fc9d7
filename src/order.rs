use crate::cart::{load_items, CartOwner};
use crate::{decimal_from_sql, decimal_to_sql, parse_from_sql};
use actix::Message;
use actix_broker::{Broker, SystemBroker};
use async_trait::async_trait;
use derive_more::{Display, Error};
use gifts_types::access::is_valid_email;
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_rusqlite::Connection;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[display("Новый")]
    New,
    #[display("В обработке")]
    InProgress,
    #[display("Завершен")]
    Completed,
    #[display("Отменен")]
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "new" => Self::New,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            s => return Err(anyhow::anyhow!("Unknown order status: {s}")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: Option<String>,
    pub product_name: String,
    pub size: Option<String>,
    pub quantity: u32,
    pub price: Decimal,
}

impl OrderItem {
    pub fn total(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: i64,
    pub owner: Option<CartOwner>,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub comment: Option<String>,
    pub status: OrderStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub items: Vec<OrderItem>,
}

impl Order {
    pub fn total(&self) -> Decimal {
        self.items.iter().map(OrderItem::total).sum()
    }

    pub fn total_quantity(&self) -> u64 {
        self.items.iter().map(|i| i.quantity as u64).sum()
    }

    pub fn belongs_to(&self, owner: &CartOwner) -> bool {
        self.owner.as_ref() == Some(owner)
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match &self.owner {
            Some(CartOwner::User(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn customer_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Checkout {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Checkout {
    fn validate(mut self) -> Result<Self, CheckoutError> {
        for (field, value) in [
            ("first_name", &mut self.first_name),
            ("last_name", &mut self.last_name),
            ("email", &mut self.email),
            ("phone", &mut self.phone),
            ("address", &mut self.address),
        ] {
            *value = value.trim().to_string();
            if value.is_empty() {
                return Err(CheckoutError::MissingField(field));
            }
        }
        if !is_valid_email(&self.email) {
            return Err(CheckoutError::InvalidEmail);
        }
        self.comment = self
            .comment
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        Ok(self)
    }
}

#[derive(Debug, Display, Error)]
pub enum CheckoutError {
    #[display("Корзина пуста")]
    EmptyCart,
    #[error(ignore)]
    #[display("Поле {_0} обязательно")]
    MissingField(&'static str),
    #[display("Некорректный email")]
    InvalidEmail,
    #[error(ignore)]
    #[display("{_0}")]
    Other(anyhow::Error),
}

impl From<tokio_rusqlite::Error> for CheckoutError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        Self::Other(err.into())
    }
}

/// Issued after an order moved to another status
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct OrderStatusChanged {
    pub order: Order,
    pub previous: OrderStatus,
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Turns the owner's cart into a new order and empties the cart
    async fn checkout(&self, owner: &CartOwner, form: Checkout) -> Result<Order, CheckoutError>;
    async fn get(&self, id: i64) -> anyhow::Result<Option<Order>>;
    async fn list_by_user(&self, user_id: Uuid) -> anyhow::Result<Vec<Order>>;
    async fn list(&self, limit: usize) -> anyhow::Result<Vec<Order>>;
    /// Returns the previous status together with the updated order
    async fn set_status(
        &self,
        id: i64,
        status: OrderStatus,
    ) -> anyhow::Result<Option<(OrderStatus, Order)>>;
}

/// Updates the status and announces the change; unchanged statuses are not announced
pub async fn change_status(
    orders: &dyn OrderRepository,
    id: i64,
    status: OrderStatus,
) -> anyhow::Result<Option<Order>> {
    let Some((previous, order)) = orders.set_status(id, status).await? else {
        return Ok(None);
    };
    if previous != status {
        log::info!("Order #{id}: {previous} -> {status}");
        Broker::<SystemBroker>::issue_async(OrderStatusChanged {
            order: order.clone(),
            previous,
        });
    }
    Ok(Some(order))
}

const ORDER_COLUMNS: &str = "id, user_id, session_key, first_name, last_name, email, phone, address,
    comment, status, created_at, updated_at";

fn order_from_row(row: &Row) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(0)?,
        owner: CartOwner::from_columns(row.get(1)?, row.get(2)?),
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        email: row.get(5)?,
        phone: row.get(6)?,
        address: row.get(7)?,
        comment: row.get(8)?,
        status: parse_from_sql(9, row.get(9)?)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        items: vec![],
    })
}

fn item_from_row(row: &Row) -> rusqlite::Result<OrderItem> {
    Ok(OrderItem {
        id: row.get(0)?,
        order_id: row.get(1)?,
        product_id: row.get(2)?,
        product_name: row.get(3)?,
        size: row.get(4)?,
        quantity: row.get(5)?,
        price: decimal_from_sql(6, row.get(6)?)?,
    })
}

fn load_order_items(conn: &rusqlite::Connection, orders: &mut [Order]) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "SELECT id, order_id, product_id, product_name, size, quantity, price
         FROM order_item WHERE order_id = ?1 ORDER BY id",
    )?;
    for order in orders {
        order.items = stmt
            .query_map([order.id], item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
    }
    Ok(())
}

fn select_orders(
    conn: &rusqlite::Connection,
    condition: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<Order>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE {condition} ORDER BY created_at DESC, id DESC"
    ))?;
    let mut orders = stmt
        .query_map(params, order_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    load_order_items(conn, &mut orders)?;
    Ok(orders)
}

/// Order tables live in the same database as `cart` and `product`
pub struct SqliteOrderRepository {
    conn: Connection,
}

impl SqliteOrderRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS orders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id BLOB,
                    session_key TEXT,
                    first_name TEXT NOT NULL,
                    last_name TEXT NOT NULL,
                    email TEXT NOT NULL,
                    phone TEXT NOT NULL,
                    address TEXT NOT NULL,
                    comment TEXT,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS order_item (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    order_id INTEGER NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                    product_id TEXT,
                    product_name TEXT NOT NULL,
                    size TEXT,
                    quantity INTEGER NOT NULL,
                    price TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS orders_user ON orders (user_id)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl OrderRepository for SqliteOrderRepository {
    async fn checkout(&self, owner: &CartOwner, form: Checkout) -> Result<Order, CheckoutError> {
        let form = form.validate()?;
        let owner = owner.clone();
        self.conn
            .call(move |conn| {
                let (user_id, session_key) = owner.columns();
                let tx = conn.transaction()?;
                let cart_id: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM cart WHERE user_id = ?1 OR session_key = ?2",
                        params![user_id, session_key],
                        |row| row.get(0),
                    )
                    .optional()?;
                let items = match cart_id {
                    Some(id) => load_items(&tx, id)?,
                    None => vec![],
                };
                let Some(cart_id) = cart_id.filter(|_| !items.is_empty()) else {
                    return Ok(Err(CheckoutError::EmptyCart));
                };
                let now = OffsetDateTime::now_utc();
                tx.execute(
                    &format!(
                        "INSERT INTO orders ({ORDER_COLUMNS}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)"
                    ),
                    params![
                        user_id,
                        session_key,
                        form.first_name,
                        form.last_name,
                        form.email,
                        form.phone,
                        form.address,
                        form.comment,
                        OrderStatus::New.as_str(),
                        now,
                    ],
                )?;
                let order_id = tx.last_insert_rowid();
                let mut order_items = Vec::with_capacity(items.len());
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO order_item (order_id, product_id, product_name, size, quantity, price)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?;
                    for item in items {
                        stmt.execute(params![
                            order_id,
                            item.product_id,
                            item.name,
                            item.size,
                            item.quantity,
                            decimal_to_sql(&item.price),
                        ])?;
                        order_items.push(OrderItem {
                            id: tx.last_insert_rowid(),
                            order_id,
                            product_id: Some(item.product_id),
                            product_name: item.name,
                            size: item.size,
                            quantity: item.quantity,
                            price: item.price,
                        });
                    }
                }
                tx.execute("DELETE FROM cart_item WHERE cart_id = ?1", [cart_id])?;
                tx.commit()?;
                Ok(Ok(Order {
                    id: order_id,
                    owner: Some(owner),
                    first_name: form.first_name,
                    last_name: form.last_name,
                    email: form.email,
                    phone: form.phone,
                    address: form.address,
                    comment: form.comment,
                    status: OrderStatus::New,
                    created_at: now,
                    updated_at: now,
                    items: order_items,
                }))
            })
            .await?
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<Order>> {
        Ok(self
            .conn
            .call(move |conn| Ok(select_orders(conn, "id = ?1", [id])?.into_iter().next()))
            .await?)
    }

    async fn list_by_user(&self, user_id: Uuid) -> anyhow::Result<Vec<Order>> {
        Ok(self
            .conn
            .call(move |conn| Ok(select_orders(conn, "user_id = ?1", [user_id])?))
            .await?)
    }

    async fn list(&self, limit: usize) -> anyhow::Result<Vec<Order>> {
        Ok(self
            .conn
            .call(move |conn| {
                Ok(select_orders(
                    conn,
                    "id IN (SELECT id FROM orders ORDER BY created_at DESC, id DESC LIMIT ?1)",
                    [limit as i64],
                )?)
            })
            .await?)
    }

    async fn set_status(
        &self,
        id: i64,
        status: OrderStatus,
    ) -> anyhow::Result<Option<(OrderStatus, Order)>> {
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let previous: Option<String> = tx
                    .query_row("SELECT status FROM orders WHERE id = ?1", [id], |row| {
                        row.get(0)
                    })
                    .optional()?;
                let Some(previous) = previous else {
                    return Ok(None);
                };
                let previous: OrderStatus = parse_from_sql(0, previous)?;
                tx.execute(
                    "UPDATE orders SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, status.as_str(), OffsetDateTime::now_utc()],
                )?;
                let order = select_orders(&tx, "id = ?1", [id])?.into_iter().next();
                tx.commit()?;
                Ok(order.map(|o| (previous, o)))
            })
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::tests::conn_with_products;
    use crate::cart::{CartRepository, SqliteCartRepository};
    use rust_decimal_macros::dec;

    fn form() -> Checkout {
        Checkout {
            first_name: " Иван ".to_string(),
            last_name: "Петров".to_string(),
            email: "ivan@example.com".to_string(),
            phone: "+7 900 000-00-00".to_string(),
            address: "Москва".to_string(),
            comment: None,
        }
    }

    #[tokio::test]
    async fn checks_out_cart_in_one_go() {
        let conn = conn_with_products().await;
        let carts = SqliteCartRepository::init(conn.clone()).await.unwrap();
        let orders = SqliteOrderRepository::init(conn).await.unwrap();
        let owner = CartOwner::Session("key".to_string());

        assert!(matches!(
            orders.checkout(&owner, form()).await,
            Err(CheckoutError::EmptyCart)
        ));
        let cart = carts.get_or_create(&owner).await.unwrap();
        assert!(matches!(
            orders.checkout(&owner, form()).await,
            Err(CheckoutError::EmptyCart)
        ));
        carts.add(cart.id, "1".to_string(), 2, None).await.unwrap();
        carts
            .add(cart.id, "2".to_string(), 1, Some("L".to_string()))
            .await
            .unwrap();
        assert!(matches!(
            orders
                .checkout(&owner, Checkout {
                    email: "nope".to_string(),
                    ..form()
                })
                .await,
            Err(CheckoutError::InvalidEmail)
        ));

        let order = orders.checkout(&owner, form()).await.unwrap();
        assert_eq!(order.first_name, "Иван");
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.total(), dec!(801));
        assert!(order.belongs_to(&owner));
        assert!(!order.belongs_to(&CartOwner::Session("other".to_string())));
        assert!(carts.items(cart.id).await.unwrap().is_empty());

        let stored = orders.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.items.len(), 2);
        assert_eq!(stored.items[1].size.as_deref(), Some("L"));
        assert_eq!(stored.items[0].price, dec!(150.50));
        assert_eq!(stored.owner, Some(owner));
    }

    #[tokio::test]
    async fn changes_status() {
        let conn = conn_with_products().await;
        let carts = SqliteCartRepository::init(conn.clone()).await.unwrap();
        let orders = SqliteOrderRepository::init(conn).await.unwrap();
        let user = Uuid::new_v4();
        let owner = CartOwner::User(user);
        let cart = carts.get_or_create(&owner).await.unwrap();
        carts.add(cart.id, "1".to_string(), 1, None).await.unwrap();
        let order = orders.checkout(&owner, form()).await.unwrap();

        let (previous, updated) = orders
            .set_status(order.id, OrderStatus::InProgress)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(previous, OrderStatus::New);
        assert_eq!(updated.status, OrderStatus::InProgress);
        assert_eq!(updated.status.to_string(), "В обработке");
        assert!(orders.set_status(999, OrderStatus::Completed).await.unwrap().is_none());
        assert_eq!(orders.list_by_user(user).await.unwrap().len(), 1);
        assert_eq!(orders.list(10).await.unwrap().len(), 1);
        assert_eq!(updated.user_id(), Some(user));
    }

    #[test]
    fn parses_status() {
        assert_eq!("in_progress".parse::<OrderStatus>().unwrap(), OrderStatus::InProgress);
        assert_eq!(OrderStatus::Cancelled.to_string(), "Отменен");
        assert!("lost".parse::<OrderStatus>().is_err());
    }
}
