use crate::gifts::{FeedError, GiftsClient};
use derive_more::{Display, Error, From};
use futures::StreamExt;
use gifts_types::product::{AttachmentKind, Product};
use rand::Rng;
use reqwest::StatusCode;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const MAX_FILE_NAME: usize = 100;
const RETRY_WORKERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ImageDir {
    Attachments,
    Main,
}

impl ImageDir {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attachments => "attachments",
            Self::Main => "products/main",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageTask {
    pub product_id: String,
    pub url: String,
    pub dir: ImageDir,
}

impl ImageTask {
    /// Path relative to the media root
    pub fn relative_path(&self) -> String {
        local_attachment_path(&self.product_id, &self.url, self.dir)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub root: PathBuf,
    pub threads: usize,
    pub limit: usize,
    pub delay: Duration,
}

impl DownloadSettings {
    pub fn from_env(root: PathBuf) -> Self {
        let threads: usize = envmnt::get_parse("IMAGE_THREADS").unwrap_or(5);
        Self {
            root,
            threads: threads.max(1),
            limit: envmnt::get_parse("IMAGE_LIMIT").unwrap_or(2000),
            delay: Duration::from_millis(envmnt::get_parse("IMAGE_DELAY_MS").unwrap_or(500)),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    pub exists: usize,
    pub downloaded: usize,
    pub errors: usize,
    pub retried: usize,
}

#[derive(Debug, Display, Error, From)]
pub enum DownloadError {
    #[display("{_0}")]
    Feed(FeedError),
    #[display("Unable to write image: {_0}")]
    Io(std::io::Error),
}

impl DownloadError {
    fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Feed(err) if err.status() == Some(StatusCode::TOO_MANY_REQUESTS))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Exists,
    Downloaded,
}

fn clean_basename(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let name = path.rsplit('/').next().unwrap_or_default();
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    let cleaned: String = stem
        .chars()
        .map(|c| match c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            true => c,
            false => '_',
        })
        .collect();
    match cleaned.trim_matches('_') {
        "" => "image".to_string(),
        s => s.to_string(),
    }
}

/// Storage path of a downloaded image: `{dir}/{product_id}_{basename}.webp`,
/// the file name cut to 100 characters
pub fn local_attachment_path(product_id: &str, url: &str, dir: ImageDir) -> String {
    const EXT: &str = ".webp";
    let name: String = format!("{product_id}_{}", clean_basename(url))
        .chars()
        .take(MAX_FILE_NAME - EXT.len())
        .collect();
    format!("{}/{name}{EXT}", dir.as_str())
}

/// Tasks for every image of `products` that is not on disk yet
pub fn collect_missing(products: &[Product], root: &Path) -> Vec<ImageTask> {
    let mut seen = HashSet::new();
    let main = products.iter().filter_map(|p| {
        Some(ImageTask {
            product_id: p.product_id.clone(),
            url: p.main_image()?.to_string(),
            dir: ImageDir::Main,
        })
    });
    let attachments = products.iter().flat_map(|p| {
        p.attachments
            .iter()
            .filter(|a| a.kind == AttachmentKind::Image)
            .map(|a| ImageTask {
                product_id: p.product_id.clone(),
                url: a.url.clone(),
                dir: ImageDir::Attachments,
            })
    });
    main.chain(attachments)
        .filter(|t| !root.join(t.relative_path()).exists())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

async fn download_one(
    client: &GiftsClient,
    task: &ImageTask,
    settings: &DownloadSettings,
) -> Result<Outcome, DownloadError> {
    let path = settings.root.join(task.relative_path());
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(Outcome::Exists);
    }
    if !settings.delay.is_zero() {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        tokio::time::sleep(settings.delay.mul_f64(jitter)).await;
    }
    let bytes = client.fetch_url(&task.url).await?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(Outcome::Downloaded)
}

async fn run_pass(
    client: &GiftsClient,
    tasks: Vec<ImageTask>,
    settings: &DownloadSettings,
    workers: usize,
    report: &mut DownloadReport,
    saved: &mut Vec<ImageTask>,
) -> Vec<ImageTask> {
    let results: Vec<_> = futures::stream::iter(tasks)
        .map(|task| async move {
            let res = download_one(client, &task, settings).await;
            (task, res)
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await;
    let mut rate_limited = vec![];
    for (task, res) in results {
        match res {
            Ok(Outcome::Exists) => {
                report.exists += 1;
                saved.push(task);
            }
            Ok(Outcome::Downloaded) => {
                report.downloaded += 1;
                saved.push(task);
            }
            Err(err) if err.is_rate_limited() => rate_limited.push(task),
            Err(err) => {
                log::warn!("Unable to download {}: {err}", task.url);
                report.errors += 1;
            }
        }
    }
    rate_limited
}

/// Downloads up to `settings.limit` images; tasks refused with HTTP 429 get a
/// second, slower pass. Returns the report and the tasks whose file is on disk.
pub async fn download_all(
    client: Arc<GiftsClient>,
    mut tasks: Vec<ImageTask>,
    settings: &DownloadSettings,
) -> (DownloadReport, Vec<ImageTask>) {
    tasks.truncate(settings.limit);
    let mut report = DownloadReport::default();
    let mut saved = vec![];
    log::info!("Downloading {} images", tasks.len());
    let rate_limited = run_pass(
        &client,
        tasks,
        settings,
        settings.threads,
        &mut report,
        &mut saved,
    )
    .await;
    if !rate_limited.is_empty() {
        log::info!("Retrying {} rate limited images", rate_limited.len());
        report.retried = rate_limited.len();
        let failed = run_pass(
            &client,
            rate_limited,
            settings,
            RETRY_WORKERS,
            &mut report,
            &mut saved,
        )
        .await;
        report.errors += failed.len();
    }
    log::info!("Images: {report:?}");
    (report, saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gifts::Credentials;
    use crate::product::tests::product;
    use actix_web::{web, App, HttpResponse, HttpServer};
    use gifts_types::product::Attachment;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    #[test]
    fn builds_local_paths() {
        assert_eq!(
            local_attachment_path("123", "https://x.ru/img/a b.JPG?v=2", ImageDir::Attachments),
            "attachments/123_a_b.webp"
        );
        assert_eq!(
            local_attachment_path("7", "https://x.ru/", ImageDir::Main),
            "products/main/7_image.webp"
        );
        let long = format!("https://x.ru/{}.png", "a".repeat(300));
        let path = local_attachment_path("1", &long, ImageDir::Main);
        assert_eq!(path.rsplit('/').next().unwrap().len(), 100);
    }

    #[test]
    fn collects_unique_missing_images() {
        let root = std::env::temp_dir().join(format!("collect-{}", uuid::Uuid::new_v4()));
        let mut p = product("1", "Кружка", dec!(1));
        p.big_image = Some("https://x.ru/1.jpg".to_string());
        p.attachments = vec![
            Attachment {
                kind: AttachmentKind::Image,
                url: "https://x.ru/2.jpg".to_string(),
                name: None,
                local_path: None,
            },
            Attachment {
                kind: AttachmentKind::Image,
                url: "https://x.ru/2.jpg".to_string(),
                name: None,
                local_path: None,
            },
            Attachment {
                kind: AttachmentKind::File,
                url: "https://x.ru/manual.pdf".to_string(),
                name: None,
                local_path: None,
            },
        ];
        let tasks = collect_missing(&[p], &root);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].dir, ImageDir::Main);
        assert_eq!(tasks[1].relative_path(), "attachments/1_2.webp");
    }

    #[actix_web::test]
    async fn downloads_and_retries_rate_limited() {
        let hits = web::Data::new(AtomicUsize::new(0));
        let server = HttpServer::new({
            let hits = hits.clone();
            move || {
                App::new()
                    .app_data(hits.clone())
                    .route(
                        "/ok/{name}",
                        web::get().to(|| async { HttpResponse::Ok().body("image") }),
                    )
                    .route(
                        "/busy/{name}",
                        web::get().to(|hits: web::Data<AtomicUsize>| async move {
                            match hits.fetch_add(1, Ordering::SeqCst) {
                                // retry middleware makes 4 attempts per request
                                0..=3 => HttpResponse::TooManyRequests().finish(),
                                _ => HttpResponse::Ok().body("image"),
                            }
                        }),
                    )
                    .route(
                        "/missing/{name}",
                        web::get().to(|| async { HttpResponse::NotFound().finish() }),
                    )
            }
        })
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());

        let base = Url::parse(&format!("http://{addr}/")).unwrap();
        let credentials = Credentials {
            login: "login".to_string(),
            password: "password".to_string(),
        };
        let client = GiftsClient::new(reqwest::Client::new(), Some(credentials), base).unwrap();
        let root = std::env::temp_dir().join(format!("images-{}", uuid::Uuid::new_v4()));
        let settings = DownloadSettings {
            root: root.clone(),
            threads: 2,
            limit: 10,
            delay: Duration::ZERO,
        };
        let task = |name: &str| ImageTask {
            product_id: "1".to_string(),
            url: format!("http://{addr}/{name}"),
            dir: ImageDir::Attachments,
        };
        let tasks = vec![task("ok/a.jpg"), task("busy/b.jpg"), task("missing/c.jpg")];
        let (report, saved) = download_all(Arc::new(client.clone()), tasks.clone(), &settings).await;
        assert_eq!(report.downloaded, 2);
        assert_eq!(report.retried, 1);
        assert_eq!(report.errors, 1);
        assert_eq!(saved.len(), 2);
        assert!(root.join("attachments/1_a.webp").exists());

        let (report, _) = download_all(Arc::new(client), tasks, &settings).await;
        assert_eq!(report.exists, 2);
        tokio::fs::remove_dir_all(root).await.ok();
    }
}
