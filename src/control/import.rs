use crate::control::{AdminAccess, ControllerError, InputData, Response};
use crate::gifts_import::{self, ImportKind, ImportOptions, Importer};
use crate::SITE_URL;
use actix_web::web::{Data, Path, Query};
use actix_web::{get, post, HttpResponse};
use serde::Deserialize;
use std::net::IpAddr;

#[post("/admin/import/{kind}")]
pub async fn start(
    importer: Data<Importer>,
    AdminAccess { user }: AdminAccess,
    kind: Path<String>,
    options: Query<ImportOptions>,
) -> Response {
    let kind: ImportKind = kind
        .parse()
        .map_err(|err| ControllerError::invalid("kind", err))?;
    gifts_import::trigger_import(kind, options.into_inner(), importer.as_ref().clone())
        .await
        .map_err(|err| ControllerError::invalid("kind", err))?;
    log::info!("{} started {kind} import", user.email);
    Ok(HttpResponse::Accepted().json(gifts_import::get_status(kind).await))
}

#[get("/admin/import")]
pub async fn import_status(_admin: AdminAccess) -> Response {
    Ok(HttpResponse::Ok().json(gifts_import::all_statuses().await))
}

#[derive(Deserialize)]
pub struct RegisterIp {
    pub ip: String,
    #[serde(default)]
    pub site: Option<String>,
}

/// Host of the storefront as the feed provider knows it
fn default_site() -> String {
    url::Url::parse(SITE_URL.as_str())
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .unwrap_or_else(|| SITE_URL.to_string())
}

#[post("/admin/register-ip")]
pub async fn register_ip(
    importer: Data<Importer>,
    _admin: AdminAccess,
    input: InputData<RegisterIp>,
) -> Response {
    let RegisterIp { ip, site } = input.into_inner();
    let ip: IpAddr = ip
        .trim()
        .parse()
        .map_err(|err| ControllerError::invalid("ip", err))?;
    let site = site
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(default_site);
    let registered = importer.client().register_ip(&ip.to_string(), &site).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": if registered { "success" } else { "error" },
        "ip": ip,
        "site": site,
    })))
}

#[cfg(test)]
mod tests {
    use crate::control::tests::{fixture, log_in, test_app, user};
    use actix_web::http::StatusCode;
    use actix_web::test;
    use serde_json::{json, Value};

    #[actix_web::test]
    async fn starts_imports_for_staff_only() {
        let f = fixture().await;
        user(&f.users, "buyer@example.com", false).await;
        user(&f.users, "admin@example.com", true).await;
        let app = test_app!(f.data);

        let buyer = log_in!(app, "buyer@example.com");
        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/admin/import/filters")
                .cookie(buyer)
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let admin = log_in!(app, "admin@example.com");
        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/admin/import/everything")
                .cookie(admin.clone())
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/admin/import/filters?force_update=true&limit=10")
                .cookie(admin.clone())
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let res: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get()
                .uri("/admin/import")
                .cookie(admin.clone())
                .to_request(),
        )
        .await;
        assert!(res.get("filters").is_some());

        let res = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/admin/register-ip")
                .cookie(admin)
                .set_json(json!({ "ip": "not an ip" }))
                .to_request(),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
