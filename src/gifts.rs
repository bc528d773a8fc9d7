use crate::gifts_feed::resolve_url;
use crate::RateLimiter;
use async_zip::base::read::mem::ZipFileReader;
use bytes::Bytes;
use derive_more::{Display, Error};
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api2.gifts.ru/export/v2/catalogue/";
pub const DEFAULT_REGISTER_URL: &str = "https://api2.gifts.ru/export/v2/registerip/";
const ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum FeedKind {
    #[display("product.xml")]
    Product,
    #[display("stock.xml")]
    Stock,
    #[display("tree.xml")]
    Tree,
    #[display("filters.xml")]
    Filters,
    #[display("catalogue.xml")]
    Catalogue,
}

#[derive(Debug, Display, Error)]
pub enum FeedError {
    #[display("Feed credentials are not configured")]
    NoCredentials,
    #[display("Invalid url: {_0}")]
    Url(url::ParseError),
    #[display("Request failed: {_0}")]
    Request(reqwest_middleware::Error),
    #[display("HTTP {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error(ignore)]
    #[display("Empty response for {_0}")]
    Empty(String),
    #[display("Unable to unpack archive: {_0}")]
    Archive(async_zip::error::ZipError),
    #[display("Archive has no files")]
    EmptyArchive,
    #[display("Unable to parse feed: {_0}")]
    Parse(quick_xml::DeError),
}

impl FeedError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest_middleware::Error> for FeedError {
    fn from(err: reqwest_middleware::Error) -> Self {
        Self::Request(err)
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.into())
    }
}

impl From<url::ParseError> for FeedError {
    fn from(err: url::ParseError) -> Self {
        Self::Url(err)
    }
}

impl From<async_zip::error::ZipError> for FeedError {
    fn from(err: async_zip::error::ZipError) -> Self {
        Self::Archive(err)
    }
}

impl From<quick_xml::DeError> for FeedError {
    fn from(err: quick_xml::DeError) -> Self {
        Self::Parse(err)
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// `GIFTS_LOGIN` / `GIFTS_PASSWORD`, both required
    pub fn from_env() -> Option<Self> {
        let login = envmnt::get_or("GIFTS_LOGIN", "");
        let password = envmnt::get_or("GIFTS_PASSWORD", "");
        if login.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self { login, password })
    }
}

#[derive(Clone)]
pub struct GiftsClient {
    client: ClientWithMiddleware,
    stock_client: ClientWithMiddleware,
    credentials: Option<Credentials>,
    base_url: Url,
    register_url: Url,
    retry_delay: Duration,
}

impl GiftsClient {
    pub fn new(
        client: reqwest::Client,
        credentials: Option<Credentials>,
        base_url: Url,
    ) -> Result<Self, FeedError> {
        let retry_policy = || ExponentialBackoff::builder().build_with_max_retries(3);
        let stock_client = ClientBuilder::new(client.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy()))
            .with(reqwest_ratelimit::all(RateLimiter::per_second(5)))
            .build();
        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy()))
            .build();
        Ok(Self {
            client,
            stock_client,
            credentials,
            base_url,
            register_url: Url::parse(DEFAULT_REGISTER_URL)?,
            retry_delay: Duration::from_secs(5),
        })
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self, FeedError> {
        let base = Url::parse(&with_slash(envmnt::get_or("GIFTS_BASE_URL", DEFAULT_BASE_URL)))?;
        let register = Url::parse(&with_slash(envmnt::get_or(
            "GIFTS_REGISTER_URL",
            DEFAULT_REGISTER_URL,
        )))?;
        Ok(Self::new(client, Credentials::from_env(), base)?.with_register_url(register))
    }

    pub fn with_register_url(mut self, url: Url) -> Self {
        self.register_url = url;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn image_url(&self, src: &str) -> Option<String> {
        resolve_url(&self.base_url, src)
    }

    fn credentials(&self) -> Result<&Credentials, FeedError> {
        self.credentials.as_ref().ok_or(FeedError::NoCredentials)
    }

    async fn get(&self, client: &ClientWithMiddleware, url: &str) -> Result<Bytes, FeedError> {
        let Credentials { login, password } = self.credentials()?;
        let response = client
            .get(url)
            .basic_auth(login, Some(password))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status {
                status,
                url: url.to_string(),
            });
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(FeedError::Empty(url.to_string()));
        }
        Ok(bytes)
    }

    /// Downloads a feed document, retrying failed attempts with a growing delay
    pub async fn fetch(&self, kind: FeedKind) -> Result<String, FeedError> {
        let url = self.base_url.join(&kind.to_string())?;
        let client = match kind {
            FeedKind::Stock => &self.stock_client,
            _ => &self.client,
        };
        let mut attempt = 0;
        let bytes = loop {
            match self.get(client, url.as_str()).await {
                Ok(bytes) => break bytes,
                Err(err @ FeedError::NoCredentials) => return Err(err),
                Err(err) if attempt + 1 >= ATTEMPTS => return Err(err),
                Err(err) => {
                    attempt += 1;
                    log::warn!("Attempt {attempt} to fetch {kind} failed: {err}");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
            }
        };
        log::info!("Fetched {kind}: {} bytes", bytes.len());
        if looks_like_zip(&bytes) {
            unzip_first_text(bytes.to_vec()).await
        } else {
            Ok(String::from_utf8_lossy(&bytes).to_string())
        }
    }

    /// Raw download of an attachment or image with feed credentials
    pub async fn fetch_url(&self, url: &str) -> Result<Bytes, FeedError> {
        self.get(&self.client, url).await
    }

    /// Registers the server address with the feed provider; `true` on HTTP 200
    pub async fn register_ip(&self, ip: &str, site: &str) -> Result<bool, FeedError> {
        let Credentials { login, password } = self.credentials()?;
        let url = self.register_url.join(&format!("{ip}/{site}"))?;
        let response = self
            .client
            .post(url.as_str())
            .basic_auth(login, Some(password))
            .send()
            .await?;
        log::info!("Register ip {ip} for {site}: {}", response.status());
        Ok(response.status() == StatusCode::OK)
    }
}

fn with_slash(mut s: String) -> String {
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

pub fn looks_like_zip(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04")
}

async fn unzip_first_text(bytes: Vec<u8>) -> Result<String, FeedError> {
    let zip = ZipFileReader::new(bytes).await?;
    let entry_index = zip
        .file()
        .entries()
        .iter()
        .position(|entry| entry.dir().is_ok_and(|is_dir| !is_dir))
        .ok_or(FeedError::EmptyArchive)?;
    let mut reader = zip.reader_with_entry(entry_index).await?;
    let mut output = String::new();
    reader.read_to_string_checked(&mut output).await?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
    use async_zip::base::write::ZipFileWriter;
    use async_zip::{Compression, ZipEntryBuilder};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn authorized(req: &HttpRequest) -> bool {
        req.headers()
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .is_some_and(|h| h.starts_with("Basic "))
    }

    const STOCK_XML: &str =
        "<doct><stock><product_id>7</product_id><code>A.1</code><free>3</free></stock></doct>";

    async fn zipped(files: &[(&str, &str)]) -> Bytes {
        let mut writer = ZipFileWriter::new(Vec::<u8>::new());
        for (name, content) in files {
            let entry = ZipEntryBuilder::new(name.to_string().into(), Compression::Deflate);
            writer
                .write_entry_whole(entry, content.as_bytes())
                .await
                .unwrap();
        }
        Bytes::from(writer.close().await.unwrap())
    }

    async fn serve(failures: usize) -> (Url, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let stock = zipped(&[("export/", ""), ("stock.xml", STOCK_XML)]).await;
        let filters = zipped(&[("export/", "")]).await;
        let server = HttpServer::new(move || {
            let calls = c.clone();
            let stock = stock.clone();
            let filters = filters.clone();
            App::new()
                .route(
                    "/catalogue/stock.xml",
                    web::get().to(move || {
                        let stock = stock.clone();
                        async move { HttpResponse::Ok().body(stock) }
                    }),
                )
                .route(
                    "/catalogue/filters.xml",
                    web::get().to(move || {
                        let filters = filters.clone();
                        async move { HttpResponse::Ok().body(filters) }
                    }),
                )
                .route(
                    "/catalogue/tree.xml",
                    web::get().to(move |req: HttpRequest| {
                        let calls = calls.clone();
                        async move {
                            let n = calls.fetch_add(1, Ordering::SeqCst);
                            if !authorized(&req) {
                                HttpResponse::Unauthorized().finish()
                            } else if n < failures {
                                HttpResponse::NotFound().finish()
                            } else {
                                HttpResponse::Ok().body("<doct><page><page_id>1</page_id><name>A</name></page></doct>")
                            }
                        }
                    }),
                )
                .route(
                    "/registerip/{ip}/{site}",
                    web::post().to(|req: HttpRequest| async move {
                        match authorized(&req) {
                            true => HttpResponse::Ok().finish(),
                            false => HttpResponse::Forbidden().finish(),
                        }
                    }),
                )
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        (
            Url::parse(&format!("http://{addr}/catalogue/")).unwrap(),
            calls,
        )
    }

    fn client(base: Url, credentials: Option<Credentials>) -> GiftsClient {
        let register = base.join("../registerip/").unwrap();
        GiftsClient::new(reqwest::Client::new(), credentials, base)
            .unwrap()
            .with_register_url(register)
            .with_retry_delay(Duration::from_millis(1))
    }

    fn credentials() -> Option<Credentials> {
        Some(Credentials {
            login: "login".to_string(),
            password: "secret".to_string(),
        })
    }

    #[actix_web::test]
    async fn retries_failed_fetch() {
        let (base, calls) = serve(2).await;
        let xml = client(base, credentials())
            .fetch(FeedKind::Tree)
            .await
            .unwrap();
        assert!(xml.contains("<page_id>1</page_id>"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[actix_web::test]
    async fn gives_up_after_three_attempts() {
        let (base, calls) = serve(5).await;
        let err = client(base, credentials())
            .fetch(FeedKind::Tree)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[actix_web::test]
    async fn unpacks_zipped_feed() {
        let (base, _) = serve(0).await;
        let gifts = client(base, credentials());
        let xml = gifts.fetch(FeedKind::Stock).await.unwrap();
        assert_eq!(xml, STOCK_XML);
        let rows = crate::gifts_feed::parse_stock(&xml).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].free, 3);

        let err = gifts.fetch(FeedKind::Filters).await.unwrap_err();
        assert!(matches!(err, FeedError::EmptyArchive));
    }

    #[actix_web::test]
    async fn requires_credentials() {
        let (base, calls) = serve(0).await;
        let err = client(base, None).fetch(FeedKind::Tree).await.unwrap_err();
        assert!(matches!(err, FeedError::NoCredentials));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn registers_ip() {
        let (base, _) = serve(0).await;
        let registered = client(base, credentials())
            .register_ip("10.0.0.1", "example.com")
            .await
            .unwrap();
        assert!(registered);
    }

    #[actix_web::test]
    async fn resolves_image_urls() {
        let gifts = client(Url::parse(DEFAULT_BASE_URL).unwrap(), None);
        assert_eq!(
            gifts.image_url("thumbnails/1.jpg").as_deref(),
            Some("https://api2.gifts.ru/export/v2/catalogue/thumbnails/1.jpg")
        );
        assert_eq!(
            gifts.image_url("/img/2.jpg").as_deref(),
            Some("https://api2.gifts.ru/img/2.jpg")
        );
        assert_eq!(gifts.image_url("  "), None);
    }

    #[test]
    fn detects_zip_archives() {
        assert!(looks_like_zip(b"PK\x03\x04rest"));
        assert!(!looks_like_zip(b"<?xml"));
        assert_eq!(FeedKind::Stock.to_string(), "stock.xml");
    }
}
