use crate::access::repository::{AuditLogRepository, CompanyRepository, UserRepository};
use crate::access::{
    generate_salt, is_valid_email, is_valid_inn, ByEmail, Company, CompanyStatus,
    OrganizationType, Password, User, UserRole, VerificationToken,
};
use actix::prelude::*;
use actix::ResponseActFuture;
use actix_broker::BrokerIssue;
use derive_more::{Display, Error};
use log_error::*;
use rand::{distributions, Rng};
use serde::Deserialize;
use std::sync::Arc;
use time::OffsetDateTime;
use typesafe_repository::IdentityOf;
use uuid::Uuid;

pub struct CompanyService {
    companies: Arc<dyn CompanyRepository>,
    users: Arc<dyn UserRepository>,
    audit: Arc<dyn AuditLogRepository>,
}

impl CompanyService {
    pub fn new(
        companies: Arc<dyn CompanyRepository>,
        users: Arc<dyn UserRepository>,
        audit: Arc<dyn AuditLogRepository>,
    ) -> Self {
        Self {
            companies,
            users,
            audit,
        }
    }
}

impl Actor for CompanyService {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let admin_email =
            std::env::var("ADMIN_EMAIL").unwrap_or_else(|_| "admin@localhost".to_string());
        let admin_pwd = std::env::var("ADMIN_PASSWORD").unwrap_or_else(|err| {
            log::error!("Unable to get admin password from env: {err}");
            let pwd = rand::thread_rng()
                .sample_iter(distributions::Alphanumeric)
                .take(20)
                .map(char::from)
                .collect::<String>();
            log::info!("Admin password is {pwd}");
            pwd
        });
        let users = self.users.clone();
        ctx.spawn(
            async move {
                let existing = users
                    .find(&ByEmail(admin_email.clone()))
                    .await
                    .log_error("Unable to get admin")
                    .flatten();
                let password = match Password::generate(admin_pwd, generate_salt()) {
                    Ok(p) => p,
                    Err(err) => {
                        log::error!("Unable to set admin password: {err}");
                        return;
                    }
                };
                let admin = User {
                    id: existing.as_ref().map(|u| u.id).unwrap_or_else(Uuid::new_v4),
                    email: admin_email,
                    password,
                    company_id: None,
                    role: UserRole::Admin,
                    first_name: "Администратор".to_string(),
                    last_name: String::new(),
                    middle_name: None,
                    phone: None,
                    is_active: true,
                    is_staff: true,
                };
                if users.save(admin).await.log_error("Unable to add admin").is_some() {
                    log::info!("Admin updated successfully");
                }
            }
            .into_actor(self),
        );
    }
}

/// Issued after a verification token has been created or renewed
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct VerificationRequested {
    pub company: Company,
    pub user: User,
    pub token: VerificationToken,
    pub resend: bool,
}

#[derive(Debug, Display, Error)]
pub enum RegistrationError {
    #[display("Некорректный ИНН")]
    InvalidInn,
    #[display("Некорректный email")]
    InvalidEmail,
    #[display("Компания с таким email уже зарегистрирована")]
    EmailTaken,
    #[error(ignore)]
    #[display("{_0}")]
    InvalidPassword(String),
    #[error(ignore)]
    #[display("{_0}")]
    Other(String),
}

impl From<anyhow::Error> for RegistrationError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[derive(Debug, Display, Error)]
pub enum VerificationError {
    #[display("Недействительная ссылка подтверждения")]
    Invalid,
    #[display("Срок действия ссылки истёк. Пожалуйста, запросите новую.")]
    Expired,
    #[error(ignore)]
    #[display("{_0}")]
    Other(String),
}

impl From<anyhow::Error> for VerificationError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Registration {
    pub email: String,
    pub inn: String,
    pub legal_name: String,
    pub password: String,
    pub role: UserRole,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    #[serde(default)]
    pub organization_type: OrganizationType,
    #[serde(default)]
    pub company_status: CompanyStatus,
    pub kpp: Option<String>,
    pub legal_address: Option<String>,
    pub bank_account: Option<String>,
    pub bank_bik: Option<String>,
}

#[derive(Message)]
#[rtype(result = "Result<(Company, User), RegistrationError>")]
pub struct Register(pub Registration);

#[derive(Message)]
#[rtype(result = "Result<User, VerificationError>")]
pub struct Verify(pub VerificationToken);

#[derive(Message)]
#[rtype(result = "Result<(), anyhow::Error>")]
pub struct Resend(pub IdentityOf<Company>);

#[derive(Debug, Clone, serde::Serialize, PartialEq, Eq)]
pub struct VerificationStatus {
    pub is_verified: bool,
    pub company_name: String,
}

#[derive(Message)]
#[rtype(result = "Result<Option<VerificationStatus>, anyhow::Error>")]
pub struct Status(pub IdentityOf<Company>);

#[derive(Message)]
#[rtype(result = "Result<Option<User>, anyhow::Error>")]
pub struct Login {
    pub email: String,
    pub password: String,
}

#[derive(Message)]
#[rtype(result = "Result<Option<User>, anyhow::Error>")]
pub struct GetUser(pub IdentityOf<User>);

#[derive(Message)]
#[rtype(result = "Result<Option<Company>, anyhow::Error>")]
pub struct GetCompany(pub IdentityOf<Company>);

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub legal_address: Option<String>,
    pub bank_account: Option<String>,
    pub bank_bik: Option<String>,
}

#[derive(Message)]
#[rtype(result = "Result<Company, anyhow::Error>")]
pub struct UpdateProfile {
    pub company_id: IdentityOf<Company>,
    pub user_id: IdentityOf<User>,
    pub update: ProfileUpdate,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Handler<Register> for CompanyService {
    type Result = ResponseActFuture<Self, Result<(Company, User), RegistrationError>>;

    fn handle(&mut self, Register(form): Register, _: &mut Self::Context) -> Self::Result {
        let companies = self.companies.clone();
        let users = self.users.clone();
        Box::pin(
            async move {
                let email = form.email.trim().to_lowercase();
                let inn = form.inn.trim().to_string();
                if !is_valid_inn(&inn) {
                    return Err(RegistrationError::InvalidInn);
                }
                if !is_valid_email(&email) {
                    return Err(RegistrationError::InvalidEmail);
                }
                if companies.find(&ByEmail(email.clone())).await?.is_some()
                    || users.find(&ByEmail(email.clone())).await?.is_some()
                {
                    return Err(RegistrationError::EmailTaken);
                }
                let password = Password::generate(form.password, generate_salt())
                    .map_err(|err| RegistrationError::InvalidPassword(err.to_string()))?;
                let mut company = Company {
                    id: Uuid::new_v4(),
                    inn,
                    legal_name: form.legal_name.trim().to_string(),
                    email: email.clone(),
                    kpp: non_empty(form.kpp),
                    legal_address: non_empty(form.legal_address),
                    bank_account: non_empty(form.bank_account),
                    bank_bik: non_empty(form.bank_bik),
                    organization_type: form.organization_type,
                    status: form.company_status,
                    verification_token: None,
                    token_created_at: None,
                    is_verified: false,
                };
                let token = company.issue_token(OffsetDateTime::now_utc());
                let user = User {
                    id: Uuid::new_v4(),
                    email,
                    password,
                    company_id: Some(company.id),
                    role: form.role,
                    first_name: form.first_name.trim().to_string(),
                    last_name: form.last_name.trim().to_string(),
                    middle_name: non_empty(form.middle_name),
                    phone: None,
                    is_active: false,
                    is_staff: false,
                };
                companies.save(company.clone()).await?;
                users.save(user.clone()).await?;
                log::info!("Registered company {} ({})", company.legal_name, company.id);
                Ok((company, user, token))
            }
            .into_actor(self)
            .map(|res, act, _| {
                res.map(|(company, user, token)| {
                    act.issue_system_async(VerificationRequested {
                        company: company.clone(),
                        user: user.clone(),
                        token,
                        resend: false,
                    });
                    (company, user)
                })
            }),
        )
    }
}

impl Handler<Verify> for CompanyService {
    type Result = ResponseActFuture<Self, Result<User, VerificationError>>;

    fn handle(&mut self, Verify(token): Verify, _: &mut Self::Context) -> Self::Result {
        let companies = self.companies.clone();
        let users = self.users.clone();
        let audit = self.audit.clone();
        Box::pin(
            async move {
                let mut company = companies
                    .find(&token)
                    .await?
                    .ok_or(VerificationError::Invalid)?;
                if company.token_expired(OffsetDateTime::now_utc()) {
                    return Err(VerificationError::Expired);
                }
                let mut user = users
                    .find(&ByEmail(company.email.clone()))
                    .await?
                    .ok_or(VerificationError::Invalid)?;
                company.is_verified = true;
                company.verification_token = None;
                company.token_created_at = None;
                user.is_active = true;
                companies.save(company.clone()).await?;
                users.save(user.clone()).await?;
                audit
                    .add(company.id, Some(user.id), "Компания подтверждена".to_string())
                    .await
                    .log_error("Unable to write audit log");
                Ok(user)
            }
            .into_actor(self),
        )
    }
}

impl Handler<Resend> for CompanyService {
    type Result = ResponseActFuture<Self, Result<(), anyhow::Error>>;

    fn handle(&mut self, Resend(id): Resend, _: &mut Self::Context) -> Self::Result {
        let companies = self.companies.clone();
        let users = self.users.clone();
        Box::pin(
            async move {
                let mut company = companies
                    .get_one(&id)
                    .await?
                    .ok_or(anyhow::anyhow!("Company {id} not found"))?;
                if company.is_verified {
                    return Err(anyhow::anyhow!("Company {id} is already verified"));
                }
                let user = users
                    .find(&ByEmail(company.email.clone()))
                    .await?
                    .ok_or(anyhow::anyhow!("Company {id} has no administrator"))?;
                let token = company.issue_token(OffsetDateTime::now_utc());
                companies.save(company.clone()).await?;
                Ok((company, user, token))
            }
            .into_actor(self)
            .map(|res, act, _| {
                res.map(|(company, user, token)| {
                    act.issue_system_async(VerificationRequested {
                        company,
                        user,
                        token,
                        resend: true,
                    });
                })
            }),
        )
    }
}

impl Handler<Status> for CompanyService {
    type Result = ResponseActFuture<Self, Result<Option<VerificationStatus>, anyhow::Error>>;

    fn handle(&mut self, Status(id): Status, _: &mut Self::Context) -> Self::Result {
        let companies = self.companies.clone();
        Box::pin(
            async move {
                Ok(companies
                    .get_one(&id)
                    .await?
                    .map(|c| VerificationStatus {
                        is_verified: c.is_verified,
                        company_name: c.legal_name,
                    }))
            }
            .into_actor(self),
        )
    }
}

impl Handler<Login> for CompanyService {
    type Result = ResponseActFuture<Self, Result<Option<User>, anyhow::Error>>;

    fn handle(&mut self, Login { email, password }: Login, _: &mut Self::Context) -> Self::Result {
        let users = self.users.clone();
        Box::pin(
            async move {
                let user = users.find(&ByEmail(email.trim().to_lowercase())).await?;
                match user {
                    Some(user) if user.password.check(&password)? => match user.is_active {
                        true => Ok(Some(user)),
                        false => {
                            log::info!("Login refused for inactive user {}", user.email);
                            Ok(None)
                        }
                    },
                    _ => Ok(None),
                }
            }
            .into_actor(self),
        )
    }
}

impl Handler<GetUser> for CompanyService {
    type Result = ResponseActFuture<Self, Result<Option<User>, anyhow::Error>>;

    fn handle(&mut self, GetUser(id): GetUser, _: &mut Self::Context) -> Self::Result {
        let users = self.users.clone();
        Box::pin(async move { users.get_one(&id).await }.into_actor(self))
    }
}

impl Handler<GetCompany> for CompanyService {
    type Result = ResponseActFuture<Self, Result<Option<Company>, anyhow::Error>>;

    fn handle(&mut self, GetCompany(id): GetCompany, _: &mut Self::Context) -> Self::Result {
        let companies = self.companies.clone();
        Box::pin(async move { companies.get_one(&id).await }.into_actor(self))
    }
}

impl Handler<UpdateProfile> for CompanyService {
    type Result = ResponseActFuture<Self, Result<Company, anyhow::Error>>;

    fn handle(
        &mut self,
        UpdateProfile {
            company_id,
            user_id,
            update,
        }: UpdateProfile,
        _: &mut Self::Context,
    ) -> Self::Result {
        let companies = self.companies.clone();
        let audit = self.audit.clone();
        Box::pin(
            async move {
                let mut company = companies
                    .get_one(&company_id)
                    .await?
                    .ok_or(anyhow::anyhow!("Company {company_id} not found"))?;
                company.legal_address = non_empty(update.legal_address);
                company.bank_account = non_empty(update.bank_account);
                company.bank_bik = non_empty(update.bank_bik);
                companies.save(company.clone()).await?;
                audit
                    .add(company_id, Some(user_id), "Обновлены реквизиты компании".to_string())
                    .await
                    .log_error("Unable to write audit log");
                Ok(company)
            }
            .into_actor(self),
        )
    }
}
