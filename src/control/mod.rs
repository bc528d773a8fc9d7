use crate::cart::{CartError, CartOwner, CartRepository};
use crate::designer::{DesignerError, DesignerRepository};
use crate::gifts::FeedError;
use crate::gifts_import::Importer;
use crate::invoice::Invoices;
use crate::order::{CheckoutError, OrderRepository};
use actix::fut::{ready, Ready};
use actix::prelude::*;
use actix_files::Files;
use actix_session::Session;
use actix_web::{
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    http::StatusCode,
    web::{Data, Form, Json, ServiceConfig},
    Either, FromRequest, HttpMessage, HttpRequest, HttpResponse,
};
use anyhow::anyhow;
use derive_more::{Display, Error};
use futures::future::LocalBoxFuture;
use gifts_types::access::repository::{AuditLogRepository, DocumentRepository, UserRepository};
use gifts_types::access::service::{
    CompanyService, GetUser, RegistrationError, VerificationError,
};
use gifts_types::access::User;
use gifts_types::category::CategoryRepository;
use gifts_types::product::{BrandRepository, ProductRepository};
use log_error::LogError;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub mod account;
pub mod cart;
pub mod catalog;
pub mod designer;
pub mod import;

pub type Response = Result<HttpResponse, ControllerError>;
pub type InputData<T> = Either<Form<T>, Json<T>>;

pub const USER_SESSION_KEY: &str = "user_id";
pub const VISITOR_SESSION_KEY: &str = "visitor";

#[derive(Debug, Display, Error)]
pub enum ControllerError {
    NotFound,
    Unauthorized,
    Forbidden,
    #[error(ignore)]
    InternalServerError(anyhow::Error),
    #[error(ignore)]
    #[display("Invalid field {field}: {msg}")]
    InvalidInput { field: String, msg: String },
}

impl ControllerError {
    pub fn invalid(field: impl Into<String>, msg: impl ToString) -> Self {
        Self::InvalidInput {
            field: field.into(),
            msg: msg.to_string(),
        }
    }
}

impl From<anyhow::Error> for ControllerError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalServerError(err)
    }
}

impl From<actix::MailboxError> for ControllerError {
    fn from(err: actix::MailboxError) -> Self {
        Self::InternalServerError(err.into())
    }
}

impl From<FeedError> for ControllerError {
    fn from(err: FeedError) -> Self {
        Self::InternalServerError(err.into())
    }
}

impl From<CartError> for ControllerError {
    fn from(err: CartError) -> Self {
        match err {
            CartError::InvalidQuantity => Self::invalid("quantity", err),
            CartError::ProductNotFound(_) | CartError::ItemNotFound => Self::NotFound,
            CartError::Forbidden => Self::Forbidden,
            CartError::Other(err) => Self::InternalServerError(err),
        }
    }
}

impl From<CheckoutError> for ControllerError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::EmptyCart => Self::invalid("cart", err),
            CheckoutError::MissingField(field) => Self::invalid(field, err),
            CheckoutError::InvalidEmail => Self::invalid("email", err),
            CheckoutError::Other(err) => Self::InternalServerError(err),
        }
    }
}

impl From<DesignerError> for ControllerError {
    fn from(err: DesignerError) -> Self {
        use DesignerError::*;
        match err {
            NotFound => Self::NotFound,
            TextTooLong { .. } | TextNotAllowed | NoContent => Self::invalid("text", err),
            ImagesNotAllowed => Self::invalid("image", err),
            InvalidColor => Self::invalid("color", err),
            InvalidQuantity => Self::invalid("quantity", err),
            SizeUnavailable(_) => Self::invalid("size", err),
            Other(err) => Self::InternalServerError(err),
        }
    }
}

impl From<RegistrationError> for ControllerError {
    fn from(err: RegistrationError) -> Self {
        match err {
            RegistrationError::InvalidInn => Self::invalid("inn", err),
            RegistrationError::InvalidEmail | RegistrationError::EmailTaken => {
                Self::invalid("email", err)
            }
            RegistrationError::InvalidPassword(_) => Self::invalid("password", err),
            RegistrationError::Other(msg) => Self::InternalServerError(anyhow!(msg)),
        }
    }
}

impl From<VerificationError> for ControllerError {
    fn from(err: VerificationError) -> Self {
        match err {
            VerificationError::Invalid | VerificationError::Expired => Self::invalid("token", err),
            VerificationError::Other(msg) => Self::InternalServerError(anyhow!(msg)),
        }
    }
}

impl actix_web::error::ResponseError for ControllerError {
    fn status_code(&self) -> StatusCode {
        use ControllerError::*;
        match self {
            NotFound => StatusCode::NOT_FOUND,
            Unauthorized => StatusCode::UNAUTHORIZED,
            Forbidden => StatusCode::FORBIDDEN,
            InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            InvalidInput { .. } => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        log::warn!("{self:?}");
        use ControllerError::*;
        let body = match self {
            NotFound => serde_json::json!({ "status": "error", "message": "Не найдено" }),
            Unauthorized => {
                serde_json::json!({ "status": "error", "message": "Требуется авторизация" })
            }
            Forbidden => serde_json::json!({ "status": "error", "message": "Доступ запрещен" }),
            InternalServerError(_) => {
                serde_json::json!({ "status": "error", "message": "Внутренняя ошибка сервера" })
            }
            InvalidInput { field, msg } => {
                serde_json::json!({ "status": "error", "field": field, "message": msg })
            }
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

pub fn see_other(location: &str) -> HttpResponse {
    HttpResponse::SeeOther()
        .insert_header(("Location", location))
        .json(())
}

/// Query flag given as `1`, `true`, `on` or `yes`
pub fn flag<'de, D>(de: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(de)?;
    Ok(matches!(
        opt.as_deref().map(str::to_lowercase).as_deref(),
        Some("1" | "true" | "on" | "yes")
    ))
}

/// Signed in user id stored in the session
#[derive(Clone, Debug)]
pub struct Identity {
    pub user_id: Uuid,
}

impl FromRequest for Identity {
    type Error = ControllerError;
    type Future = Ready<Result<Self, Self::Error>>;

    #[inline]
    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Identity>()
                .cloned()
                .ok_or(ControllerError::Unauthorized),
        )
    }
}

/// Anyone browsing the store, signed in or not
#[derive(Clone, Debug)]
pub struct Visitor {
    pub session_key: String,
    pub user_id: Option<Uuid>,
}

impl Visitor {
    pub fn owner(&self) -> CartOwner {
        match self.user_id {
            Some(id) => CartOwner::User(id),
            None => CartOwner::Session(self.session_key.clone()),
        }
    }
}

impl FromRequest for Visitor {
    type Error = ControllerError;
    type Future = Ready<Result<Self, Self::Error>>;

    #[inline]
    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Visitor>()
                .cloned()
                .ok_or_else(|| anyhow!("Visitor session is not initialized").into()),
        )
    }
}

pub struct CurrentUser {
    pub user: User,
}

impl FromRequest for CurrentUser {
    type Error = ControllerError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    #[inline]
    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let req = req.clone();
        Box::pin(async move {
            let Identity { user_id } = Identity::extract(&req).await?;
            let service = Data::<Addr<CompanyService>>::extract(&req)
                .await
                .map_err(|_err| anyhow!("Unable to extract CompanyService from request"))?;
            let user = service
                .send(GetUser(user_id))
                .await??
                .filter(|u| u.is_active)
                .ok_or(ControllerError::Unauthorized)?;
            Ok(Self { user })
        })
    }
}

/// Staff member allowed to manage orders, imports and designer templates
pub struct AdminAccess {
    pub user: User,
}

impl FromRequest for AdminAccess {
    type Error = ControllerError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    #[inline]
    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let req = req.clone();
        Box::pin(async move {
            let CurrentUser { user } = CurrentUser::extract(&req).await?;
            if user.is_staff {
                Ok(Self { user })
            } else {
                Err(ControllerError::Forbidden)
            }
        })
    }
}

pub struct SessionMiddlewareFactory {}

impl<S, B: 'static> Transform<S, ServiceRequest> for SessionMiddlewareFactory
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type Transform = SessionMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(SessionMiddleware {
            service: Arc::new(service),
        }))
    }
}

/// Puts [`Identity`] and [`Visitor`] into request extensions, issuing a visitor key on first visit
pub struct SessionMiddleware<S> {
    service: Arc<S>,
}

impl<S, B> Service<ServiceRequest> for SessionMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        Box::pin(async move {
            let session = req.extract::<Session>().await?;
            let user_id = match session.get::<Uuid>(USER_SESSION_KEY) {
                Ok(id) => id,
                Err(err) => {
                    log::error!("Unable to extract user from session:\n{err:?}");
                    None
                }
            };
            let session_key = match session.get::<String>(VISITOR_SESSION_KEY) {
                Ok(Some(key)) => key,
                res => {
                    if let Err(err) = res {
                        log::error!("Unable to extract visitor from session:\n{err:?}");
                    }
                    let key = Uuid::new_v4().simple().to_string();
                    session
                        .insert(VISITOR_SESSION_KEY, &key)
                        .log_error("Unable to store visitor key");
                    key
                }
            };
            if let Some(user_id) = user_id {
                req.extensions_mut().insert(Identity { user_id });
            }
            req.extensions_mut().insert(Visitor {
                session_key,
                user_id,
            });
            service.call(req).await
        })
    }
}

/// Directory uploaded and downloaded files live in, served under `/media`
#[derive(Clone, Debug)]
pub struct MediaRoot(pub PathBuf);

/// Everything the handlers take from application data
#[derive(Clone)]
pub struct AppData {
    pub categories: Arc<dyn CategoryRepository>,
    pub products: Arc<dyn ProductRepository>,
    pub brands: Arc<dyn BrandRepository>,
    pub carts: Arc<dyn CartRepository>,
    pub orders: Arc<dyn OrderRepository>,
    pub designer: Arc<dyn DesignerRepository>,
    pub users: Arc<dyn UserRepository>,
    pub documents: Arc<dyn DocumentRepository>,
    pub audit: Arc<dyn AuditLogRepository>,
    pub invoices: Invoices,
    pub company_service: Addr<CompanyService>,
    pub importer: Importer,
    pub media_root: PathBuf,
}

impl AppData {
    pub fn configure(&self, cfg: &mut ServiceConfig) {
        cfg.app_data(Data::new(self.categories.clone()))
            .app_data(Data::new(self.products.clone()))
            .app_data(Data::new(self.brands.clone()))
            .app_data(Data::new(self.carts.clone()))
            .app_data(Data::new(self.orders.clone()))
            .app_data(Data::new(self.designer.clone()))
            .app_data(Data::new(self.users.clone()))
            .app_data(Data::new(self.documents.clone()))
            .app_data(Data::new(self.audit.clone()))
            .app_data(Data::new(self.invoices.clone()))
            .app_data(Data::new(self.company_service.clone()))
            .app_data(Data::new(self.importer.clone()))
            .app_data(Data::new(MediaRoot(self.media_root.clone())))
            .service(Files::new("/media", self.media_root.clone()));
    }
}

pub fn routes(cfg: &mut ServiceConfig) {
    cfg.service(catalog::home)
        .service(catalog::catalog)
        .service(catalog::category_page)
        .service(catalog::product_list)
        .service(catalog::product_page)
        .service(catalog::brand_list)
        .service(catalog::brand_page)
        .service(catalog::search_suggestions)
        .service(catalog::search)
        .service(cart::show_cart)
        .service(cart::add)
        .service(cart::update)
        .service(cart::remove)
        .service(cart::checkout)
        .service(cart::order_success)
        .service(cart::order_invoice)
        .service(cart::admin_orders)
        .service(cart::set_status)
        .service(account::register)
        .service(account::verify)
        .service(account::resend)
        .service(account::company_status)
        .service(account::log_in)
        .service(account::log_out)
        .service(account::dashboard)
        .service(account::profile)
        .service(account::upload_document)
        .service(designer::start)
        .service(designer::edit)
        .service(designer::save_element)
        .service(designer::place_element)
        .service(designer::delete_element)
        .service(designer::upload_image)
        .service(designer::color_list)
        .service(designer::save_order)
        .service(designer::update_item)
        .service(designer::remove_item)
        .service(designer::add_template)
        .service(designer::add_template_image)
        .service(designer::add_area)
        .service(designer::add_color)
        .service(designer::generate_silhouette)
        .service(import::start)
        .service(import::import_status)
        .service(import::register_ip);
}
