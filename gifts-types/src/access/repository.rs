use crate::access::{
    AuditLog, ByCompany, ByEmail, Company, Document, DocumentKind, User, VerificationToken,
};
use async_trait::async_trait;
use typesafe_repository::async_ops::{Find, Get, Save, Select};
use typesafe_repository::{IdentityOf, Repository};

pub trait CompanyRepository:
    Repository<Company, Error = anyhow::Error>
    + Get<Company>
    + Save<Company>
    + Find<Company, VerificationToken>
    + Find<Company, ByEmail>
    + Send
    + Sync
{
}

pub trait UserRepository:
    Repository<User, Error = anyhow::Error>
    + Get<User>
    + Save<User>
    + Find<User, ByEmail>
    + Select<User, ByCompany>
    + Send
    + Sync
{
}

#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    async fn add(
        &self,
        company_id: IdentityOf<Company>,
        user_id: Option<IdentityOf<User>>,
        action: String,
    ) -> anyhow::Result<()>;
    async fn list_by_company(
        &self,
        company_id: IdentityOf<Company>,
        limit: usize,
    ) -> anyhow::Result<Vec<AuditLog>>;
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn add(
        &self,
        company_id: IdentityOf<Company>,
        kind: DocumentKind,
        file: String,
    ) -> anyhow::Result<Document>;
    async fn list_by_company(&self, company_id: IdentityOf<Company>)
        -> anyhow::Result<Vec<Document>>;
}
