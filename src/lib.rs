#![deny(clippy::unwrap_used)]
#![allow(clippy::from_over_into)]

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use serde::de::{DeserializeOwned, IntoDeserializer};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use time_tz::OffsetDateTimeExt;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration};

pub mod access;
pub mod cart;
pub mod category;
pub mod category_rules;
pub mod classify;
pub mod control;
pub mod designer;
pub mod gifts;
pub mod gifts_feed;
pub mod gifts_import;
pub mod import_throttle;
pub mod invoice;
pub mod mail;
pub mod order;
pub mod product;
pub mod uploader;

pub static SELF_ADDR: Lazy<String> = Lazy::new(|| envmnt::get_or("SELF_ADDR", "0.0.0.0"));

pub static SITE_NAME: Lazy<String> =
    Lazy::new(|| envmnt::get_or("SITE_NAME", "Корпоративные подарки"));

pub static SITE_URL: Lazy<String> = Lazy::new(|| {
    envmnt::get_or("SITE_URL", "http://localhost:8080")
        .trim_end_matches('/')
        .to_string()
});

pub static MEDIA_ROOT: Lazy<String> = Lazy::new(|| envmnt::get_or("MEDIA_ROOT", "media"));

pub struct RateLimiter(Arc<Notify>);

impl RateLimiter {
    pub fn per_second(rps: u64) -> Self {
        Self::with_interval(Duration::from_millis(1_000 / rps.max(1)))
    }
    fn with_interval(duration: Duration) -> Self {
        let notify = Arc::new(Notify::new());
        let n = notify.clone();
        tokio::spawn(async move {
            let notify = n;
            loop {
                sleep(duration).await;
                notify.notify_one();
            }
        });
        Self(notify)
    }
}

#[async_trait]
impl reqwest_ratelimit::RateLimiter for RateLimiter {
    async fn acquire_permit(&self) {
        self.0.notified().await;
    }
}

pub fn decimal_to_sql(d: &Decimal) -> String {
    d.normalize().to_string()
}

pub fn decimal_from_sql(idx: usize, s: String) -> rusqlite::Result<Decimal> {
    Decimal::from_str(&s).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
    })
}

/// Text column holding a value with a `FromStr` representation
pub fn parse_from_sql<T: FromStr<Err = anyhow::Error>>(idx: usize, s: String) -> rusqlite::Result<T> {
    s.parse().map_err(|err: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
    })
}

pub fn json_to_sql<T: Serialize>(v: &T) -> Option<String> {
    serde_json::to_string(v).ok()
}

pub fn json_from_sql<T: DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

pub fn moscow_now() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_timezone(time_tz::timezones::db::europe::MOSCOW)
}

fn transliterate(c: char) -> Option<&'static str> {
    Some(match c {
        'а' => "a",
        'б' => "b",
        'в' => "v",
        'г' => "g",
        'д' => "d",
        'е' | 'э' => "e",
        'ё' => "yo",
        'ж' => "zh",
        'з' => "z",
        'и' => "i",
        'й' => "y",
        'к' => "k",
        'л' => "l",
        'м' => "m",
        'н' => "n",
        'о' => "o",
        'п' => "p",
        'р' => "r",
        'с' => "s",
        'т' => "t",
        'у' => "u",
        'ф' => "f",
        'х' => "h",
        'ц' => "ts",
        'ч' => "ch",
        'ш' => "sh",
        'щ' => "shch",
        'ъ' | 'ь' => "",
        'ы' => "y",
        'ю' => "yu",
        'я' => "ya",
        _ => return None,
    })
}

/// Lowercase ASCII slug with Cyrillic transliterated, words joined by `-`
pub fn slugify(s: &str) -> String {
    let mut res = String::with_capacity(s.len());
    for c in s.to_lowercase().chars() {
        if let Some(t) = transliterate(c) {
            res.push_str(t);
        } else if c.is_ascii_alphanumeric() {
            res.push(c);
        } else if c == '_' {
            res.push('_');
        } else if !res.ends_with('-') {
            res.push('-');
        }
    }
    res.trim_matches('-').to_string()
}

/// Appends `-1`, `-2`, ... to `base` until `taken` reports the slug as free
pub async fn unique_slug<F, Fut>(base: String, taken: F) -> anyhow::Result<String>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let mut slug = base.clone();
    let mut counter = 1;
    while taken(slug.clone()).await? {
        slug = format!("{base}-{counter}");
        counter += 1;
    }
    Ok(slug)
}

pub fn format_duration(duration: &std::time::Duration) -> String {
    let mut res = vec![];
    let days = duration.as_millis() / 1000 / 60 / 60 / 24;
    let hours = duration.as_millis() / 1000 / 60 / 60 % 24;
    let minutes = duration.as_millis() / 1000 / 60 % 60;
    let seconds = duration.as_millis() / 1000 % 60;
    let whole_millis = duration.as_millis();
    if days > 0 {
        res.push(format!("{days}д."));
    }
    if hours > 0 {
        res.push(format!("{hours}ч."));
    }
    if minutes > 0 {
        res.push(format!("{minutes}мин."));
    }
    if seconds > 0 {
        res.push(format!("{seconds}с."));
    }
    if whole_millis < 1000 {
        res.push(format!("{whole_millis}мс."));
    }
    itertools::intersperse(res, " ".to_string()).collect()
}

pub fn empty_string_as_none<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::Deserialize<'de>,
{
    let opt = Option::<String>::deserialize(de)?;
    let opt = opt.as_deref();
    match opt {
        None | Some("") | Some("all") | Some("any") => Ok(None),
        Some(s) => T::deserialize(s.into_deserializer()).map(Some),
    }
}

pub fn empty_string_as_none_parse<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let opt = Option::<String>::deserialize(de)?;
    match opt.as_deref().map(str::trim) {
        None | Some("") | Some("all") | Some("any") => Ok(None),
        Some(s) => s.parse().map_err(serde::de::Error::custom).map(Some),
    }
}

/// Comma separated query parameter, empty items dropped
pub fn comma_list<'de, D>(de: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(de)?;
    Ok(opt
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect())
}

#[cfg(test)]
pub mod test {
    use super::*;

    #[test]
    fn slugifies_cyrillic() {
        assert_eq!(slugify("Ручки с логотипом"), "ruchki-s-logotipom");
        assert_eq!(slugify("Power Bank  & Co"), "power-bank-co");
        assert_eq!(slugify("Щётка"), "shchyotka");
        assert_eq!(slugify("--Эко--"), "eko");
    }

    #[tokio::test]
    async fn makes_slug_unique() {
        let taken = ["sumki".to_string(), "sumki-1".to_string()];
        let slug = unique_slug("sumki".to_string(), |s| {
            let res = taken.contains(&s);
            async move { Ok(res) }
        })
        .await
        .unwrap();
        assert_eq!(slug, "sumki-2");
    }

    #[test]
    fn formats_duration() {
        assert_eq!(
            format_duration(&std::time::Duration::from_secs(3_661)),
            "1ч. 1мин. 1с."
        );
        assert_eq!(
            format_duration(&std::time::Duration::from_millis(250)),
            "250мс."
        );
    }

    #[test]
    fn round_trips_decimal_column() {
        let d = Decimal::new(12350, 2);
        assert_eq!(decimal_to_sql(&d), "123.5");
        assert_eq!(decimal_from_sql(0, "123.5".to_string()).unwrap(), d);
        assert!(decimal_from_sql(0, "abc".to_string()).is_err());
    }
}
