use argon2::{Variant, Version};
use derive_more::{Deref, Display};
use lazy_regex::regex_is_match;
use rand::rngs::StdRng;
use rand::{distributions, Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use typesafe_repository::macros::Id;
use typesafe_repository::prelude::*;
use typesafe_repository::{SelectBy, Selector};
use uuid::Uuid;

pub mod repository;
pub mod service;

pub const PASSWORD_LENGTH: u32 = 64;
pub const MIN_PASSWORD_LENGTH: u32 = 8;
pub const DEFAULT_ARGON_CONFIG: argon2::Config = argon2::Config {
    variant: Variant::Argon2id,
    version: Version::Version13,
    mem_cost: 19456,
    time_cost: 2,
    lanes: 1,
    secret: &[],
    ad: &[],
    hash_length: PASSWORD_LENGTH,
};
pub const VERIFICATION_TOKEN_LENGTH: usize = 50;
pub const VERIFICATION_TTL: Duration = Duration::minutes(5);

pub fn generate_salt() -> Salt {
    let mut salt = [0; 512];
    StdRng::from_entropy().fill_bytes(&mut salt);
    salt
}

pub type Salt = [u8; 512];

#[derive(Clone, Debug, Deref, Serialize, Deserialize, PartialEq)]
pub struct Password {
    #[deref]
    password: String,
    #[serde(with = "serde_arrays")]
    salt: Salt,
}

impl Password {
    pub fn check(&self, input: &str) -> Result<bool, anyhow::Error> {
        Ok(argon2::verify_encoded(&self.password, input.as_bytes())?)
    }
    pub fn generate(input: String, salt: Salt) -> Result<Password, anyhow::Error> {
        if input.chars().count() < MIN_PASSWORD_LENGTH as usize {
            return Err(anyhow::anyhow!(
                "Password cannot be shorter than {MIN_PASSWORD_LENGTH}"
            ));
        }
        let password = argon2::hash_encoded(input.as_bytes(), &salt, &DEFAULT_ARGON_CONFIG)?;
        Ok(Self { password, salt })
    }
    /// Restores a password from its stored hash
    pub fn from_hash(password: String, salt: Salt) -> Self {
        Self { password, salt }
    }
    pub fn salt(&self) -> &Salt {
        &self.salt
    }
    pub fn password(&self) -> &String {
        &self.password
    }
}

#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct VerificationToken(pub String);

impl VerificationToken {
    pub fn generate() -> Self {
        Self(
            StdRng::from_entropy()
                .sample_iter(distributions::Alphanumeric)
                .take(VERIFICATION_TOKEN_LENGTH)
                .map(char::from)
                .collect(),
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Default)]
pub enum OrganizationType {
    #[default]
    #[serde(rename = "ООО")]
    #[display("ООО")]
    Ooo,
    #[serde(rename = "АО")]
    #[display("АО")]
    Ao,
    #[serde(rename = "ИП")]
    #[display("ИП")]
    Ip,
}

impl OrganizationType {
    pub fn full_name(&self) -> &'static str {
        match self {
            Self::Ooo => "Общество с ограниченной ответственностью",
            Self::Ao => "Акционерное общество",
            Self::Ip => "Индивидуальный предприниматель",
        }
    }
}

impl std::str::FromStr for OrganizationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ООО" => Ok(Self::Ooo),
            "АО" => Ok(Self::Ao),
            "ИП" => Ok(Self::Ip),
            s => Err(anyhow::anyhow!("Unknown organization type: {s}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Default)]
pub enum CompanyStatus {
    #[default]
    #[serde(rename = "Действующее")]
    #[display("Действующее")]
    Active,
    #[serde(rename = "Ликвидировано")]
    #[display("Ликвидировано")]
    Liquidated,
}

impl std::str::FromStr for CompanyStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Действующее" => Ok(Self::Active),
            "Ликвидировано" => Ok(Self::Liquidated),
            s => Err(anyhow::anyhow!("Unknown company status: {s}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    #[display("Администратор")]
    Admin,
    #[display("Бухгалтер")]
    Accountant,
    #[display("Менеджер закупок")]
    Manager,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Accountant => "accountant",
            Self::Manager => "manager",
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "accountant" => Ok(Self::Accountant),
            "manager" => Ok(Self::Manager),
            s => Err(anyhow::anyhow!("Unknown role: {s}")),
        }
    }
}

#[derive(Id, Serialize, Deserialize, Debug, Clone)]
pub struct Company {
    #[id]
    pub id: Uuid,
    pub inn: String,
    pub legal_name: String,
    pub email: String,
    pub kpp: Option<String>,
    pub legal_address: Option<String>,
    pub bank_account: Option<String>,
    pub bank_bik: Option<String>,
    pub organization_type: OrganizationType,
    pub status: CompanyStatus,
    #[serde(skip_serializing)]
    pub verification_token: Option<VerificationToken>,
    #[serde(skip_serializing)]
    pub token_created_at: Option<OffsetDateTime>,
    pub is_verified: bool,
}

impl Company {
    pub fn token_expired(&self, now: OffsetDateTime) -> bool {
        self.token_created_at
            .map_or(true, |created| now - created > VERIFICATION_TTL)
    }
    pub fn issue_token(&mut self, now: OffsetDateTime) -> VerificationToken {
        let token = VerificationToken::generate();
        self.verification_token = Some(token.clone());
        self.token_created_at = Some(now);
        token
    }
}

#[derive(Id, Serialize, Deserialize, Debug, Clone)]
pub struct User {
    #[id]
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: Password,
    pub company_id: Option<IdentityOf<Company>>,
    pub role: UserRole,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub phone: Option<String>,
    pub is_active: bool,
    pub is_staff: bool,
}

impl User {
    pub fn full_name(&self) -> String {
        let mut name = format!("{} {}", self.last_name, self.first_name);
        if let Some(middle) = &self.middle_name {
            name.push(' ');
            name.push_str(middle);
        }
        name.trim().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: i64,
    pub company_id: IdentityOf<Company>,
    pub user_id: Option<IdentityOf<User>>,
    pub action: String,
    pub timestamp: OffsetDateTime,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    #[display("Счет-фактура")]
    Invoice,
    #[display("Акт")]
    Act,
    #[display("Договор")]
    Contract,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Act => "act",
            Self::Contract => "contract",
        }
    }
}

impl std::str::FromStr for DocumentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoice" => Ok(Self::Invoice),
            "act" => Ok(Self::Act),
            "contract" => Ok(Self::Contract),
            s => Err(anyhow::anyhow!("Unknown document type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub company_id: IdentityOf<Company>,
    pub kind: DocumentKind,
    pub file: String,
    pub created_at: OffsetDateTime,
    pub signed: bool,
}

pub struct ByEmail(pub String);
pub struct ByCompany(pub IdentityOf<Company>);

impl Selector for VerificationToken {}
impl SelectBy<VerificationToken> for Company {}

impl Selector for ByEmail {}
impl SelectBy<ByEmail> for Company {}
impl SelectBy<ByEmail> for User {}

impl Selector for ByCompany {}
impl SelectBy<ByCompany> for User {}

pub fn is_valid_inn(inn: &str) -> bool {
    regex_is_match!(r"^(\d{10}|\d{12})$", inn)
}

pub fn is_valid_email(email: &str) -> bool {
    regex_is_match!(r"^[^@\s]+@[^@\s]+\.[^@\s]+$", email)
}
