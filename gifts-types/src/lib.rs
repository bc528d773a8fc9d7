use derive_more::Display;
use serde::{Deserialize, Serialize};

pub mod access;
pub mod category;
pub mod product;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    #[display("Новинка")]
    New,
    #[display("Обычный")]
    Regular,
    #[display("До исчерпания")]
    Limited,
}

impl ProductStatus {
    /// Maps `status@id` of the supplier feed
    pub fn from_feed_id(id: &str) -> Self {
        match id.trim() {
            "0" => Self::New,
            "2" => Self::Limited,
            _ => Self::Regular,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Regular => "regular",
            Self::Limited => "limited",
        }
    }
}

impl std::str::FromStr for ProductStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "regular" => Ok(Self::Regular),
            "limited" => Ok(Self::Limited),
            s => Err(anyhow::anyhow!("Unknown product status: {s}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    #[display("Мужской")]
    Male,
    #[display("Женский")]
    Female,
    #[display("Унисекс")]
    Unisex,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Unisex => "unisex",
        }
    }
}

impl std::str::FromStr for Gender {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "male" => Ok(Self::Male),
            "female" => Ok(Self::Female),
            "unisex" => Ok(Self::Unisex),
            s => Err(anyhow::anyhow!("Unknown gender: {s}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[repr(u8)]
pub enum Availability {
    #[display("Нет в наличии")]
    NotAvailable = 0,
    #[display("В наличии")]
    Available = 1,
    #[display("Под заказ")]
    OnOrder = 2,
}

impl Availability {
    pub fn new(in_stock: bool, quantity: i64) -> Self {
        match (in_stock, quantity) {
            (true, q) if q > 0 => Self::Available,
            (true, _) => Self::NotAvailable,
            (false, _) => Self::OnOrder,
        }
    }
}

pub fn parse_duration(duration: &str) -> Result<std::time::Duration, anyhow::Error> {
    let duration = duration
        .to_lowercase()
        .replace('.', "")
        .replace("сек", "s")
        .replace("с", "s")
        .replace("мин", "m")
        .replace("м", "m")
        .replace("час", "h")
        .replace("ч", "h")
        .replace("д", "d");
    duration_str::parse(duration).map_err(|dur| anyhow::anyhow!("Unable to parse duration {dur}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_feed_status() {
        assert_eq!(ProductStatus::from_feed_id("0"), ProductStatus::New);
        assert_eq!(ProductStatus::from_feed_id("1"), ProductStatus::Regular);
        assert_eq!(ProductStatus::from_feed_id(" 2 "), ProductStatus::Limited);
        assert_eq!(ProductStatus::from_feed_id("9"), ProductStatus::Regular);
    }

    #[test]
    fn availability_from_stock() {
        assert_eq!(Availability::new(true, 3), Availability::Available);
        assert_eq!(Availability::new(true, 0), Availability::NotAvailable);
        assert_eq!(Availability::new(false, 10), Availability::OnOrder);
    }

    #[test]
    fn parses_russian_durations() {
        assert_eq!(
            parse_duration("1ч").unwrap(),
            std::time::Duration::from_secs(3600)
        );
        assert_eq!(
            parse_duration("24h").unwrap(),
            std::time::Duration::from_secs(86400)
        );
    }
}
