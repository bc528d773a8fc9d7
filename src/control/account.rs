use crate::control::{
    see_other, ControllerError, CurrentUser, InputData, MediaRoot, Response, USER_SESSION_KEY,
};
use crate::order::{Order, OrderRepository};
use actix::Addr;
use actix_multipart::form::{tempfile::TempFile, text::Text, MultipartForm};
use actix_session::Session;
use actix_web::web::{Data, Path};
use actix_web::{get, post, HttpResponse};
use anyhow::Context as AnyhowContext;
use gifts_types::access::repository::{AuditLogRepository, DocumentRepository, UserRepository};
use gifts_types::access::service::{
    CompanyService, GetCompany, Login, ProfileUpdate, Register, Registration, Resend, Status,
    UpdateProfile, Verify,
};
use gifts_types::access::{
    AuditLog, ByCompany, Company, Document, DocumentKind, User, VerificationToken,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use typesafe_repository::async_ops::Select;
use uuid::Uuid;

const AUDIT_LIMIT: usize = 50;
const DOCUMENT_EXTENSIONS: [&str; 7] = ["pdf", "doc", "docx", "xls", "xlsx", "jpg", "png"];

fn log_in_session(session: &Session, user: &User) -> Result<(), ControllerError> {
    session.renew();
    session
        .insert(USER_SESSION_KEY, user.id)
        .context("Unable to insert user into session")?;
    Ok(())
}

#[post("/accounts/register")]
pub async fn register(
    service: Data<Addr<CompanyService>>,
    input: InputData<Registration>,
) -> Response {
    let (company, user) = service
        .send(Register(input.into_inner()))
        .await
        .context("Unable to send message to CompanyService")??;
    Ok(HttpResponse::Created().json(serde_json::json!({
        "status": "success",
        "company_id": company.id,
        "email": user.email,
        "message": "Проверьте почту: мы отправили ссылку для подтверждения регистрации",
    })))
}

#[get("/accounts/verify/{token}")]
pub async fn verify(
    service: Data<Addr<CompanyService>>,
    session: Session,
    token: Path<String>,
) -> Response {
    let user = service
        .send(Verify(VerificationToken(token.into_inner())))
        .await
        .context("Unable to send message to CompanyService")??;
    log_in_session(&session, &user)?;
    log::info!("{} verified and signed in", user.email);
    Ok(see_other("/accounts/dashboard"))
}

#[post("/accounts/resend/{company_id}")]
pub async fn resend(service: Data<Addr<CompanyService>>, company_id: Path<Uuid>) -> Response {
    service
        .send(Resend(company_id.into_inner()))
        .await
        .context("Unable to send message to CompanyService")?
        .map_err(|err| ControllerError::invalid("company_id", err))?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "message": "Письмо с подтверждением отправлено повторно",
    })))
}

#[get("/accounts/status/{company_id}")]
pub async fn company_status(service: Data<Addr<CompanyService>>, company_id: Path<Uuid>) -> Response {
    let status = service
        .send(Status(company_id.into_inner()))
        .await
        .context("Unable to send message to CompanyService")??
        .ok_or(ControllerError::NotFound)?;
    Ok(HttpResponse::Ok().json(status))
}

#[derive(Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[post("/accounts/login")]
pub async fn log_in(
    service: Data<Addr<CompanyService>>,
    session: Session,
    input: InputData<Credentials>,
) -> Response {
    let Credentials { email, password } = input.into_inner();
    let user = service
        .send(Login { email, password })
        .await
        .context("Unable to send message to CompanyService")??;
    let Some(user) = user else {
        return Err(ControllerError::invalid(
            "password",
            "Неверный email или пароль",
        ));
    };
    log_in_session(&session, &user)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "success", "user": user })))
}

#[post("/accounts/logout")]
pub async fn log_out(session: Session) -> Response {
    session.clear();
    Ok(see_other("/"))
}

#[derive(Serialize)]
struct Dashboard {
    user: User,
    company: Company,
    users: Vec<User>,
    orders: Vec<Order>,
    documents: Vec<Document>,
    audit: Vec<AuditLog>,
}

async fn user_company(
    service: &Addr<CompanyService>,
    user: &User,
) -> Result<Company, ControllerError> {
    let company_id = user.company_id.ok_or(ControllerError::Forbidden)?;
    service
        .send(GetCompany(company_id))
        .await
        .context("Unable to send message to CompanyService")??
        .ok_or(ControllerError::Forbidden)
}

#[get("/accounts/dashboard")]
pub async fn dashboard(
    service: Data<Addr<CompanyService>>,
    users: Data<Arc<dyn UserRepository>>,
    orders: Data<Arc<dyn OrderRepository>>,
    documents: Data<Arc<dyn DocumentRepository>>,
    audit: Data<Arc<dyn AuditLogRepository>>,
    CurrentUser { user }: CurrentUser,
) -> Response {
    let company = user_company(&service, &user).await?;
    let users = users.select(&ByCompany(company.id)).await?;
    let mut company_orders = Vec::new();
    for u in &users {
        company_orders.extend(orders.list_by_user(u.id).await?);
    }
    company_orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    let documents = documents.list_by_company(company.id).await?;
    let audit = audit.list_by_company(company.id, AUDIT_LIMIT).await?;
    Ok(HttpResponse::Ok().json(Dashboard {
        user,
        company,
        users,
        orders: company_orders,
        documents,
        audit,
    }))
}

#[post("/accounts/profile")]
pub async fn profile(
    service: Data<Addr<CompanyService>>,
    CurrentUser { user }: CurrentUser,
    input: InputData<ProfileUpdate>,
) -> Response {
    let company = user_company(&service, &user).await?;
    let company = service
        .send(UpdateProfile {
            company_id: company.id,
            user_id: user.id,
            update: input.into_inner(),
        })
        .await
        .context("Unable to send message to CompanyService")??;
    Ok(HttpResponse::Ok().json(company))
}

#[derive(MultipartForm, Debug)]
pub struct DocumentUpload {
    file: TempFile,
    kind: Text<String>,
}

#[post("/accounts/documents")]
pub async fn upload_document(
    service: Data<Addr<CompanyService>>,
    documents: Data<Arc<dyn DocumentRepository>>,
    audit: Data<Arc<dyn AuditLogRepository>>,
    media_root: Data<MediaRoot>,
    CurrentUser { user }: CurrentUser,
    form: MultipartForm<DocumentUpload>,
) -> Response {
    let company = user_company(&service, &user).await?;
    let form = form.into_inner();
    let kind: DocumentKind = form
        .kind
        .parse()
        .map_err(|err| ControllerError::invalid("kind", err))?;
    let ext = form
        .file
        .file_name
        .as_deref()
        .and_then(|name| std::path::Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|ext| DOCUMENT_EXTENSIONS.contains(&ext.as_str()))
        .ok_or_else(|| ControllerError::invalid("file", "Неподдерживаемый тип файла"))?;
    let relative = format!(
        "company_documents/{}/{}.{ext}",
        company.id,
        Uuid::new_v4().simple()
    );
    let dest = media_root.0.join(&relative);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Unable to create documents dir")?;
    }
    tokio::fs::copy(form.file.file.path(), &dest)
        .await
        .with_context(|| format!("Unable to store {}", dest.display()))?;
    let document = documents.add(company.id, kind, relative).await?;
    audit
        .add(
            company.id,
            Some(user.id),
            format!("Загружен документ: {kind}"),
        )
        .await?;
    Ok(HttpResponse::Created().json(document))
}
