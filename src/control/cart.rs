use crate::cart::{CartItem, CartRepository, CartView};
use crate::control::{AdminAccess, ControllerError, InputData, Response, Visitor};
use crate::designer::{CustomOrder, DesignerRepository};
use crate::invoice::Invoices;
use crate::order::{self, Checkout, Order, OrderRepository, OrderStatus};
use actix_web::http::header::CONTENT_DISPOSITION;
use actix_web::web::{Data, Path};
use actix_web::{get, post, HttpResponse};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const ADMIN_ORDERS_LIMIT: usize = 100;
const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Serialize, Debug)]
pub struct CartPage {
    #[serde(flatten)]
    pub cart: CartView,
    pub custom_orders: Vec<CustomOrder>,
    pub grand_total: Decimal,
}

/// Custom garments the visitor put into the cart from the designer
async fn visitor_custom_orders(
    designer: &dyn DesignerRepository,
    visitor: &Visitor,
) -> anyhow::Result<Vec<CustomOrder>> {
    let designs = designer
        .designs(&visitor.session_key, visitor.user_id)
        .await?;
    designer
        .custom_orders(designs.into_iter().map(|d| d.id).collect())
        .await
}

#[get("/cart")]
pub async fn show_cart(
    carts: Data<Arc<dyn CartRepository>>,
    designer: Data<Arc<dyn DesignerRepository>>,
    visitor: Visitor,
) -> Response {
    let cart = carts.get_or_create(&visitor.owner()).await?;
    let items = carts.items(cart.id).await?;
    let cart = CartView::new(cart.id, items);
    let custom_orders = visitor_custom_orders(designer.as_ref().as_ref(), &visitor).await?;
    let grand_total = cart.total_price + custom_orders.iter().map(|o| o.price).sum::<Decimal>();
    Ok(HttpResponse::Ok().json(CartPage {
        cart,
        custom_orders,
        grand_total,
    }))
}

fn one() -> u32 {
    1
}

#[derive(Deserialize, Debug)]
pub struct AddItem {
    #[serde(default = "one")]
    pub quantity: u32,
    #[serde(default)]
    pub size: Option<String>,
}

#[derive(Serialize, Debug)]
struct ItemChanged {
    status: &'static str,
    item: Option<CartItem>,
    total_quantity: u64,
    total_price: Decimal,
}

async fn item_changed(
    carts: &dyn CartRepository,
    cart_id: i64,
    item: Option<CartItem>,
) -> Response {
    let view = CartView::new(cart_id, carts.items(cart_id).await?);
    Ok(HttpResponse::Ok().json(ItemChanged {
        status: "success",
        item,
        total_quantity: view.total_quantity,
        total_price: view.total_price,
    }))
}

#[post("/cart/add/{product_id}")]
pub async fn add(
    carts: Data<Arc<dyn CartRepository>>,
    visitor: Visitor,
    product_id: Path<String>,
    input: InputData<AddItem>,
) -> Response {
    let input = input.into_inner();
    let cart = carts.get_or_create(&visitor.owner()).await?;
    let item = carts
        .add(cart.id, product_id.into_inner(), input.quantity, input.size)
        .await?;
    log::debug!("Added {} x{} to cart {}", item.product_id, input.quantity, cart.id);
    item_changed(carts.as_ref().as_ref(), cart.id, Some(item)).await
}

#[derive(Deserialize, Debug)]
pub struct UpdateItem {
    pub quantity: u32,
}

#[post("/cart/update/{item_id}")]
pub async fn update(
    carts: Data<Arc<dyn CartRepository>>,
    visitor: Visitor,
    item_id: Path<i64>,
    input: InputData<UpdateItem>,
) -> Response {
    let cart = carts.get_or_create(&visitor.owner()).await?;
    let item = carts
        .update(cart.id, item_id.into_inner(), input.into_inner().quantity)
        .await?;
    item_changed(carts.as_ref().as_ref(), cart.id, Some(item)).await
}

#[post("/cart/remove/{item_id}")]
pub async fn remove(
    carts: Data<Arc<dyn CartRepository>>,
    visitor: Visitor,
    item_id: Path<i64>,
) -> Response {
    let cart = carts.get_or_create(&visitor.owner()).await?;
    carts.remove(cart.id, item_id.into_inner()).await?;
    item_changed(carts.as_ref().as_ref(), cart.id, None).await
}

#[post("/checkout")]
pub async fn checkout(
    orders: Data<Arc<dyn OrderRepository>>,
    visitor: Visitor,
    input: InputData<Checkout>,
) -> Response {
    let order = orders.checkout(&visitor.owner(), input.into_inner()).await?;
    log::info!(
        "Order #{} placed by {}: {} items, {}",
        order.id,
        order.email,
        order.total_quantity(),
        order.total()
    );
    Ok(HttpResponse::Created().json(serde_json::json!({
        "status": "success",
        "redirect_url": format!("/order/{}/success", order.id),
        "order": order,
    })))
}

#[derive(Serialize, Debug)]
struct OrderSummary {
    #[serde(flatten)]
    order: Order,
    status_label: String,
    total: Decimal,
    total_quantity: u64,
}

impl From<Order> for OrderSummary {
    fn from(order: Order) -> Self {
        Self {
            status_label: order.status.to_string(),
            total: order.total(),
            total_quantity: order.total_quantity(),
            order,
        }
    }
}

#[get("/order/{id}/success")]
pub async fn order_success(
    orders: Data<Arc<dyn OrderRepository>>,
    visitor: Visitor,
    id: Path<i64>,
) -> Response {
    let order = orders
        .get(id.into_inner())
        .await?
        .filter(|o| o.belongs_to(&visitor.owner()))
        .ok_or(ControllerError::NotFound)?;
    Ok(HttpResponse::Ok().json(OrderSummary::from(order)))
}

#[get("/order/{id}/invoice.xlsx")]
pub async fn order_invoice(
    orders: Data<Arc<dyn OrderRepository>>,
    invoices: Data<Invoices>,
    visitor: Visitor,
    admin: Option<AdminAccess>,
    id: Path<i64>,
) -> Response {
    let order = orders
        .get(id.into_inner())
        .await?
        .filter(|o| admin.is_some() || o.belongs_to(&visitor.owner()))
        .ok_or(ControllerError::NotFound)?;
    let invoice = invoices.build(order).await?;
    let bytes = invoice.render_xlsx()?;
    let filename: String =
        url::form_urlencoded::byte_serialize(invoice.xlsx_filename().as_bytes()).collect();
    Ok(HttpResponse::Ok()
        .content_type(XLSX_MIME)
        .insert_header((
            CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"invoice_{}.xlsx\"; filename*=UTF-8''{filename}",
                invoice.order.id
            ),
        ))
        .body(bytes))
}

#[get("/admin/orders")]
pub async fn admin_orders(orders: Data<Arc<dyn OrderRepository>>, _admin: AdminAccess) -> Response {
    let orders = orders.list(ADMIN_ORDERS_LIMIT).await?;
    Ok(HttpResponse::Ok().json(
        orders
            .into_iter()
            .map(OrderSummary::from)
            .collect::<Vec<_>>(),
    ))
}

#[derive(Deserialize, Debug)]
pub struct StatusInput {
    pub status: OrderStatus,
}

#[post("/admin/orders/{id}/status")]
pub async fn set_status(
    orders: Data<Arc<dyn OrderRepository>>,
    admin: AdminAccess,
    id: Path<i64>,
    input: InputData<StatusInput>,
) -> Response {
    let id = id.into_inner();
    let status = input.into_inner().status;
    let order = order::change_status(orders.as_ref().as_ref(), id, status)
        .await?
        .ok_or(ControllerError::NotFound)?;
    log::info!("{} set order #{id} to {}", admin.user.email, order.status);
    Ok(HttpResponse::Ok().json(OrderSummary::from(order)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::tests::{fixture, log_in, session_cookie, test_app, user};
    use crate::product::tests::product;
    use actix_web::http::StatusCode;
    use actix_web::test;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use typesafe_repository::async_ops::Save;

    fn checkout_form() -> Value {
        json!({
            "first_name": "Анна",
            "last_name": "Смирнова",
            "email": "anna@example.com",
            "phone": "+7 900 000-00-00",
            "address": "Москва, ул. Ленина, 1",
        })
    }

    #[actix_web::test]
    async fn fills_cart_and_checks_out() {
        let f = fixture().await;
        f.products.save(product("1", "Кружка", dec!(250))).await.unwrap();
        f.products.save(product("2", "Ручка", dec!(40))).await.unwrap();
        let app = test_app!(f.data);

        let res = test::call_service(&app, test::TestRequest::get().uri("/cart").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
        let cookie = session_cookie(&res);

        for (uri, body) in [
            ("/cart/add/1", json!({ "quantity": 2 })),
            ("/cart/add/1", json!({ "quantity": 1 })),
            ("/cart/add/2", json!({ "size": "M" })),
        ] {
            let res = test::call_service(
                &app,
                test::TestRequest::post()
                    .uri(uri)
                    .cookie(cookie.clone())
                    .set_json(body)
                    .to_request(),
            )
            .await;
            assert_eq!(res.status(), StatusCode::OK);
        }

        let res: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/cart").cookie(cookie.clone()).to_request(),
        )
        .await;
        assert_eq!(res["items"].as_array().unwrap().len(), 2);
        assert_eq!(res["items"][0]["quantity"], 3);
        assert_eq!(res["total_quantity"], 4);
        assert_eq!(res["total_price"].as_f64(), Some(790.0));

        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/cart/add/1")
                .cookie(cookie.clone())
                .set_json(json!({ "quantity": 0 }))
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/checkout")
                .cookie(cookie.clone())
                .set_json(checkout_form())
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(res).await;
        let id = body["order"]["id"].as_i64().unwrap();
        assert_eq!(body["redirect_url"], format!("/order/{id}/success"));

        let res: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/cart").cookie(cookie.clone()).to_request(),
        )
        .await;
        assert_eq!(res["total_quantity"], 0);

        let res: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get()
                .uri(&format!("/order/{id}/success"))
                .cookie(cookie.clone())
                .to_request(),
        )
        .await;
        assert_eq!(res["status_label"], "Новый");
        assert_eq!(res["items"][1]["size"], "M");

        let res = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/order/{id}/success"))
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/checkout")
                .cookie(cookie)
                .set_json(checkout_form())
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn refuses_items_of_other_carts() {
        let f = fixture().await;
        f.products.save(product("1", "Кружка", dec!(250))).await.unwrap();
        let app = test_app!(f.data);

        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/cart/add/1")
                .set_json(json!({}))
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = test::read_body_json(res).await;
        let item_id = body["item"]["id"].as_i64().unwrap();

        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri(&format!("/cart/update/{item_id}"))
                .set_json(json!({ "quantity": 5 }))
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/cart/add/missing")
                .set_json(json!({}))
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn admin_changes_status_and_downloads_invoice() {
        let f = fixture().await;
        f.products.save(product("1", "Кружка", dec!(250))).await.unwrap();
        user(&f.users, "buyer@example.com", false).await;
        user(&f.users, "admin@example.com", true).await;
        let app = test_app!(f.data);

        let buyer = log_in!(app, "buyer@example.com");
        test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/cart/add/1")
                .cookie(buyer.clone())
                .set_json(json!({ "quantity": 2 }))
                .to_request(),
        )
        .await;
        let res: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri("/checkout")
                .cookie(buyer.clone())
                .set_json(checkout_form())
                .to_request(),
        )
        .await;
        let id = res["order"]["id"].as_i64().unwrap();

        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri(&format!("/admin/orders/{id}/status"))
                .cookie(buyer.clone())
                .set_json(json!({ "status": "in_progress" }))
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let admin = log_in!(app, "admin@example.com");
        let res: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri(&format!("/admin/orders/{id}/status"))
                .cookie(admin.clone())
                .set_json(json!({ "status": "in_progress" }))
                .to_request(),
        )
        .await;
        assert_eq!(res["status"], "in_progress");
        assert_eq!(res["status_label"], "В обработке");

        let res: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/admin/orders").cookie(admin.clone()).to_request(),
        )
        .await;
        assert_eq!(res[0]["id"], id);

        for cookie in [buyer, admin] {
            let res = test::call_service(
                &app,
                test::TestRequest::get()
                    .uri(&format!("/order/{id}/invoice.xlsx"))
                    .cookie(cookie)
                    .to_request(),
            )
            .await;
            assert_eq!(res.status(), StatusCode::OK);
            assert_eq!(res.headers().get("content-type").unwrap(), XLSX_MIME);
            let body = test::read_body(res).await;
            assert_eq!(&body[..2], b"PK");
        }

        let res = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/order/{id}/invoice.xlsx"))
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
