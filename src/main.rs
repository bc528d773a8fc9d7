use actix::prelude::*;
use actix_multipart::form::MultipartFormConfig;
use actix_session::storage::CookieSessionStore;
use actix_session::SessionMiddleware;
use actix_web::cookie::Key;
use actix_web::middleware::{NormalizePath, TrailingSlash};
use actix_web::{web::FormConfig, web::JsonConfig, App, HttpServer};
use anyhow::Context as AnyhowContext;
use gifts_store::{
    access::{
        repository::{
            SqliteAuditLogRepository, SqliteCompanyRepository, SqliteDocumentRepository,
            SqliteUserRepository,
        },
        AccountMailer,
    },
    cart::SqliteCartRepository,
    category::SqliteCategoryRepository,
    category_rules,
    control::{self, AppData},
    designer::SqliteDesignerRepository,
    gifts::GiftsClient,
    gifts_import::{self, Importer, Schedule},
    invoice::{self, InvoiceMailer, Invoices},
    mail::OutboxMailer,
    order::SqliteOrderRepository,
    product::{SqliteBrandRepository, SqliteProductRepository},
    uploader::DownloadSettings,
    MEDIA_ROOT, SELF_ADDR,
};
use gifts_types::access::service::CompanyService;
use rand::{distributions, Rng};
use reqwest::header::{HeaderMap, HeaderValue};
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;

static DEFAULT_ACCEPT_ENCODING: &str = "br;q=1.0, gzip;q=0.6, deflate;q=0.4, *;q=0.2";

async fn open_database(path: &str) -> anyhow::Result<Connection> {
    if let Some(dir) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("Unable to create {}", dir.display()))?;
    }
    let conn = Connection::open(path).await?;
    conn.call(|conn| {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    })
    .await?;
    Ok(conn)
}

#[actix_web::main]
async fn main() -> Result<(), anyhow::Error> {
    if let Err(env::VarError::NotPresent) = env::var("RUST_LOG") {
        env::set_var("RUST_LOG", "INFO,html5ever=error");
    }
    pretty_env_logger::formatted_timed_builder()
        .parse_default_env()
        .init();

    match std::fs::File::open(".env") {
        Ok(_) => envmnt::load_file(".env")?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::File::create(".env")?;
            envmnt::load_file(".env")?;
        }
        Err(err) => {
            return Err(anyhow::anyhow!("Unable to open .env file: {err}"));
        }
    }

    let conn = open_database(&envmnt::get_or("DATABASE_PATH", "storage/gifts.db")).await?;
    let categories = Arc::new(SqliteCategoryRepository::init(conn.clone()).await?);
    let products = Arc::new(SqliteProductRepository::init(conn.clone()).await?);
    let brands = Arc::new(SqliteBrandRepository::init(conn.clone()).await?);
    let carts = Arc::new(SqliteCartRepository::init(conn.clone()).await?);
    let orders = Arc::new(SqliteOrderRepository::init(conn.clone()).await?);
    let designer = Arc::new(SqliteDesignerRepository::init(conn.clone()).await?);
    let companies = Arc::new(SqliteCompanyRepository::init(conn.clone()).await?);
    let users = Arc::new(SqliteUserRepository::init(conn.clone()).await?);
    let audit = Arc::new(SqliteAuditLogRepository::init(conn.clone()).await?);
    let documents = Arc::new(SqliteDocumentRepository::init(conn).await?);

    let media_root = PathBuf::from(MEDIA_ROOT.as_str());
    std::fs::create_dir_all(&media_root).context("Unable to create media root")?;

    let token = CancellationToken::new();

    let company_service =
        CompanyService::new(companies.clone(), users.clone(), audit.clone()).start();
    let mailer = Arc::new(OutboxMailer::from_env());
    AccountMailer::new(mailer.clone()).start();
    let invoices = Invoices::new(users.clone(), companies.clone());
    InvoiceMailer::new(invoices.clone(), invoice::pdf_renderer_from_env(), mailer).start();

    let mut map = HeaderMap::new();
    map.append(
        reqwest::header::ACCEPT_ENCODING,
        HeaderValue::from_str(DEFAULT_ACCEPT_ENCODING)?,
    );
    let client = reqwest::ClientBuilder::new()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(300))
        .use_rustls_tls()
        .default_headers(map)
        .build()?;
    let gifts_client = GiftsClient::from_env(client)?;
    if !gifts_client.has_credentials() {
        log::warn!("GIFTS_LOGIN / GIFTS_PASSWORD are not set, feed imports will fail");
    }
    let importer = Importer::new(
        Arc::new(gifts_client),
        products.clone(),
        categories.clone(),
        brands.clone(),
        Arc::new(category_rules::load_rules()?),
        DownloadSettings::from_env(media_root.clone()),
    );
    if envmnt::is_or("AUTO_IMPORT", false) {
        gifts_import::spawn_scheduler(importer.clone(), Schedule::from_env()?, token.clone())
            .await;
    }

    let t = token.clone();
    tokio::spawn(async {
        let token = t;
        match signal::ctrl_c().await {
            Ok(_) => token.cancel(),
            Err(err) => log::error!("Unable to listen to shutdown: {err}"),
        }
    });
    let secret_key: String = match envmnt::get_parse("SESSION_KEY") {
        Ok(v) => v,
        Err(envmnt::errors::EnvmntError::Missing(_)) => {
            let key = rand::thread_rng()
                .sample_iter(distributions::Alphanumeric)
                .take(64)
                .map(char::from)
                .collect::<String>();
            let mut f = std::fs::File::options().append(true).open(".env")?;
            f.write_all(format!("\nSESSION_KEY={key}\n").as_bytes())?;
            key
        }
        Err(err) => {
            return Err(anyhow::anyhow!("Unable to read secret key: {err}"));
        }
    };
    let secret_key = Key::from(secret_key.as_bytes());
    let secure_cookies = envmnt::is_or("SECURE_COOKIES", false);

    let data = AppData {
        categories,
        products,
        brands,
        carts,
        orders,
        designer,
        users,
        documents,
        audit,
        invoices,
        company_service,
        importer,
        media_root,
    };
    let port: u16 = envmnt::get_parse("PORT").unwrap_or(8080);
    let addr = (SELF_ADDR.as_str(), port);
    log::info!("Listening on {}:{port}", addr.0);
    HttpServer::new(move || {
        let data = data.clone();
        App::new()
            .app_data(FormConfig::default().limit(256 * 1024))
            .app_data(JsonConfig::default().limit(1024 * 1024))
            .app_data(MultipartFormConfig::default().total_limit(20 * 1024 * 1024))
            .wrap(actix_web::middleware::Compress::default())
            .wrap(control::SessionMiddlewareFactory {})
            .wrap(
                SessionMiddleware::builder(CookieSessionStore::default(), secret_key.clone())
                    .cookie_secure(secure_cookies)
                    .build(),
            )
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .configure(move |cfg| data.configure(cfg))
            .configure(control::routes)
    })
    .bind(addr)
    .with_context(|| format!("Failed to bind server to {}:{port}", addr.0))?
    .run()
    .await?;
    Ok(())
}
