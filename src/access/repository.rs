use crate::parse_from_sql;
use async_trait::async_trait;
use gifts_types::access::repository::{
    AuditLogRepository, CompanyRepository, DocumentRepository, UserRepository,
};
use gifts_types::access::{
    AuditLog, ByCompany, ByEmail, Company, Document, DocumentKind, Password, Salt, User,
    VerificationToken,
};
use rusqlite::types::{Type, Value};
use rusqlite::{params, Row};
use time::OffsetDateTime;
use tokio_rusqlite::Connection;
use typesafe_repository::async_ops::{Find, Get, Save, Select};
use typesafe_repository::{IdentityOf, Repository};

const COMPANY_COLUMNS: &str = "id, inn, legal_name, email, kpp, legal_address, bank_account,
    bank_bik, organization_type, status, verification_token, token_created_at, is_verified";

const USER_COLUMNS: &str = "id, email, password, salt, company_id, role, first_name, last_name,
    middle_name, phone, is_active, is_staff";

fn company_from_row(row: &Row) -> rusqlite::Result<Company> {
    Ok(Company {
        id: row.get(0)?,
        inn: row.get(1)?,
        legal_name: row.get(2)?,
        email: row.get(3)?,
        kpp: row.get(4)?,
        legal_address: row.get(5)?,
        bank_account: row.get(6)?,
        bank_bik: row.get(7)?,
        organization_type: parse_from_sql(8, row.get(8)?)?,
        status: parse_from_sql(9, row.get(9)?)?,
        verification_token: row.get::<_, Option<String>>(10)?.map(VerificationToken),
        token_created_at: row.get(11)?,
        is_verified: row.get(12)?,
    })
}

fn salt_from_sql(idx: usize, raw: Vec<u8>) -> rusqlite::Result<Salt> {
    raw.try_into().map_err(|raw: Vec<u8>| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Blob,
            anyhow::anyhow!("Invalid salt length {}", raw.len()).into(),
        )
    })
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password: Password::from_hash(row.get(2)?, salt_from_sql(3, row.get(3)?)?),
        company_id: row.get(4)?,
        role: parse_from_sql(5, row.get(5)?)?,
        first_name: row.get(6)?,
        last_name: row.get(7)?,
        middle_name: row.get(8)?,
        phone: row.get(9)?,
        is_active: row.get(10)?,
        is_staff: row.get(11)?,
    })
}

pub struct SqliteCompanyRepository {
    conn: Connection,
}

impl SqliteCompanyRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS company (
                    id BLOB PRIMARY KEY,
                    inn TEXT NOT NULL,
                    legal_name TEXT NOT NULL,
                    email TEXT NOT NULL UNIQUE,
                    kpp TEXT,
                    legal_address TEXT,
                    bank_account TEXT,
                    bank_bik TEXT,
                    organization_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    verification_token TEXT,
                    token_created_at TEXT,
                    is_verified INTEGER NOT NULL DEFAULT 0
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    async fn find_by(&self, column: &'static str, value: Value) -> anyhow::Result<Option<Company>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COMPANY_COLUMNS} FROM company WHERE {column} = ?1"
                ))?;
                let c = stmt.query_map([value], company_from_row)?.next().transpose()?;
                Ok(c)
            })
            .await?)
    }
}

impl Repository<Company> for SqliteCompanyRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Get<Company> for SqliteCompanyRepository {
    async fn get_one(&self, id: &IdentityOf<Company>) -> Result<Option<Company>, Self::Error> {
        self.find_by("id", Value::Blob(id.as_bytes().to_vec())).await
    }
}

#[async_trait]
impl Find<Company, VerificationToken> for SqliteCompanyRepository {
    async fn find(&self, token: &VerificationToken) -> Result<Option<Company>, Self::Error> {
        self.find_by("verification_token", token.0.clone().into()).await
    }
}

#[async_trait]
impl Find<Company, ByEmail> for SqliteCompanyRepository {
    async fn find(&self, ByEmail(email): &ByEmail) -> Result<Option<Company>, Self::Error> {
        self.find_by("email", email.clone().into()).await
    }
}

#[async_trait]
impl Save<Company> for SqliteCompanyRepository {
    async fn save(&self, c: Company) -> Result<(), Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO company (id, inn, legal_name, email, kpp, legal_address, bank_account,
                        bank_bik, organization_type, status, verification_token, token_created_at, is_verified)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(id) DO UPDATE SET inn=?2, legal_name=?3, email=?4, kpp=?5,
                        legal_address=?6, bank_account=?7, bank_bik=?8, organization_type=?9,
                        status=?10, verification_token=?11, token_created_at=?12, is_verified=?13",
                    params![
                        c.id,
                        c.inn,
                        c.legal_name,
                        c.email,
                        c.kpp,
                        c.legal_address,
                        c.bank_account,
                        c.bank_bik,
                        c.organization_type.to_string(),
                        c.status.to_string(),
                        c.verification_token.map(|t| t.0),
                        c.token_created_at,
                        c.is_verified,
                    ],
                )?;
                Ok(())
            })
            .await?)
    }
}

impl CompanyRepository for SqliteCompanyRepository {}

pub struct SqliteUserRepository {
    conn: Connection,
}

impl SqliteUserRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS users (
                    id BLOB PRIMARY KEY,
                    email TEXT NOT NULL UNIQUE,
                    password TEXT NOT NULL,
                    salt BLOB NOT NULL,
                    company_id BLOB,
                    role TEXT NOT NULL,
                    first_name TEXT NOT NULL,
                    last_name TEXT NOT NULL,
                    middle_name TEXT,
                    phone TEXT,
                    is_active INTEGER NOT NULL DEFAULT 0,
                    is_staff INTEGER NOT NULL DEFAULT 0
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS user_company ON users (company_id)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    async fn select_by(&self, column: &'static str, value: Value) -> anyhow::Result<Vec<User>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE {column} = ?1 ORDER BY last_name, first_name"
                ))?;
                let res = stmt
                    .query_map([value], user_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(res)
            })
            .await?)
    }
}

impl Repository<User> for SqliteUserRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Get<User> for SqliteUserRepository {
    async fn get_one(&self, id: &IdentityOf<User>) -> Result<Option<User>, Self::Error> {
        Ok(self
            .select_by("id", Value::Blob(id.as_bytes().to_vec()))
            .await?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl Find<User, ByEmail> for SqliteUserRepository {
    async fn find(&self, ByEmail(email): &ByEmail) -> Result<Option<User>, Self::Error> {
        Ok(self
            .select_by("email", email.clone().into())
            .await?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl Select<User, ByCompany> for SqliteUserRepository {
    async fn select(&self, ByCompany(id): &ByCompany) -> Result<Vec<User>, Self::Error> {
        self.select_by("company_id", Value::Blob(id.as_bytes().to_vec()))
            .await
    }
}

#[async_trait]
impl Save<User> for SqliteUserRepository {
    async fn save(&self, u: User) -> Result<(), Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users (id, email, password, salt, company_id, role, first_name,
                        last_name, middle_name, phone, is_active, is_staff)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(id) DO UPDATE SET email=?2, password=?3, salt=?4, company_id=?5,
                        role=?6, first_name=?7, last_name=?8, middle_name=?9, phone=?10,
                        is_active=?11, is_staff=?12",
                    params![
                        u.id,
                        u.email,
                        u.password.password(),
                        &u.password.salt()[..],
                        u.company_id,
                        u.role.as_str(),
                        u.first_name,
                        u.last_name,
                        u.middle_name,
                        u.phone,
                        u.is_active,
                        u.is_staff,
                    ],
                )?;
                Ok(())
            })
            .await?)
    }
}

impl UserRepository for SqliteUserRepository {}

pub struct SqliteAuditLogRepository {
    conn: Connection,
}

impl SqliteAuditLogRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS audit_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    company_id BLOB NOT NULL,
                    user_id BLOB,
                    action TEXT NOT NULL,
                    timestamp TEXT NOT NULL
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl AuditLogRepository for SqliteAuditLogRepository {
    async fn add(
        &self,
        company_id: IdentityOf<Company>,
        user_id: Option<IdentityOf<User>>,
        action: String,
    ) -> anyhow::Result<()> {
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO audit_log (company_id, user_id, action, timestamp) VALUES (?1, ?2, ?3, ?4)",
                    params![company_id, user_id, action, OffsetDateTime::now_utc()],
                )?;
                Ok(())
            })
            .await?)
    }

    async fn list_by_company(
        &self,
        company_id: IdentityOf<Company>,
        limit: usize,
    ) -> anyhow::Result<Vec<AuditLog>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, company_id, user_id, action, timestamp FROM audit_log
                     WHERE company_id = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let res = stmt
                    .query_map(params![company_id, limit as i64], |row| {
                        Ok(AuditLog {
                            id: row.get(0)?,
                            company_id: row.get(1)?,
                            user_id: row.get(2)?,
                            action: row.get(3)?,
                            timestamp: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(res)
            })
            .await?)
    }
}

pub struct SqliteDocumentRepository {
    conn: Connection,
}

impl SqliteDocumentRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS document (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    company_id BLOB NOT NULL,
                    kind TEXT NOT NULL,
                    file TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    signed INTEGER NOT NULL DEFAULT 0
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl DocumentRepository for SqliteDocumentRepository {
    async fn add(
        &self,
        company_id: IdentityOf<Company>,
        kind: DocumentKind,
        file: String,
    ) -> anyhow::Result<Document> {
        let created_at = OffsetDateTime::now_utc();
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO document (company_id, kind, file, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![company_id, kind.as_str(), file, created_at],
                )?;
                Ok(Document {
                    id: conn.last_insert_rowid(),
                    company_id,
                    kind,
                    file,
                    created_at,
                    signed: false,
                })
            })
            .await?)
    }

    async fn list_by_company(
        &self,
        company_id: IdentityOf<Company>,
    ) -> anyhow::Result<Vec<Document>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, company_id, kind, file, created_at, signed FROM document
                     WHERE company_id = ?1 ORDER BY created_at DESC, id DESC",
                )?;
                let res = stmt
                    .query_map([company_id], |row| {
                        Ok(Document {
                            id: row.get(0)?,
                            company_id: row.get(1)?,
                            kind: parse_from_sql(2, row.get(2)?)?,
                            file: row.get(3)?,
                            created_at: row.get(4)?,
                            signed: row.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(res)
            })
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gifts_types::access::{generate_salt, CompanyStatus, OrganizationType, UserRole};
    use uuid::Uuid;

    pub fn company(email: &str) -> Company {
        Company {
            id: Uuid::new_v4(),
            inn: "7707083893".to_string(),
            legal_name: "ООО Ромашка".to_string(),
            email: email.to_string(),
            kpp: Some("770701001".to_string()),
            legal_address: None,
            bank_account: None,
            bank_bik: None,
            organization_type: OrganizationType::Ao,
            status: CompanyStatus::Active,
            verification_token: None,
            token_created_at: None,
            is_verified: false,
        }
    }

    #[tokio::test]
    async fn stores_companies_and_users() {
        let conn = Connection::open_in_memory().await.unwrap();
        let companies = SqliteCompanyRepository::init(conn.clone()).await.unwrap();
        let users = SqliteUserRepository::init(conn).await.unwrap();

        let mut c = company("info@romashka.ru");
        let token = c.issue_token(OffsetDateTime::now_utc());
        companies.save(c.clone()).await.unwrap();
        let found = companies.find(&token).await.unwrap().unwrap();
        assert_eq!(found.id, c.id);
        assert_eq!(found.organization_type, OrganizationType::Ao);
        assert!(!found.token_expired(OffsetDateTime::now_utc()));
        assert!(companies
            .find(&ByEmail("info@romashka.ru".to_string()))
            .await
            .unwrap()
            .is_some());

        let user = User {
            id: Uuid::new_v4(),
            email: c.email.clone(),
            password: Password::generate("secret password".to_string(), generate_salt()).unwrap(),
            company_id: Some(c.id),
            role: UserRole::Accountant,
            first_name: "Анна".to_string(),
            last_name: "Иванова".to_string(),
            middle_name: None,
            phone: None,
            is_active: false,
            is_staff: false,
        };
        users.save(user.clone()).await.unwrap();
        let stored = users.get_one(&user.id).await.unwrap().unwrap();
        assert!(stored.password.check("secret password").unwrap());
        assert_eq!(stored.role, UserRole::Accountant);
        assert_eq!(users.select(&ByCompany(c.id)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn appends_audit_log_and_documents() {
        let conn = Connection::open_in_memory().await.unwrap();
        let audit = SqliteAuditLogRepository::init(conn.clone()).await.unwrap();
        let documents = SqliteDocumentRepository::init(conn).await.unwrap();
        let company_id = Uuid::new_v4();
        audit.add(company_id, None, "first".to_string()).await.unwrap();
        audit.add(company_id, None, "second".to_string()).await.unwrap();
        audit.add(Uuid::new_v4(), None, "other".to_string()).await.unwrap();
        let log = audit.list_by_company(company_id, 10).await.unwrap();
        assert_eq!(
            log.iter().map(|l| l.action.as_str()).collect::<Vec<_>>(),
            vec!["second", "first"]
        );
        assert_eq!(audit.list_by_company(company_id, 1).await.unwrap().len(), 1);

        let doc = documents
            .add(company_id, DocumentKind::Act, "documents/act.pdf".to_string())
            .await
            .unwrap();
        let listed = documents.list_by_company(company_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, doc.id);
        assert_eq!(listed[0].kind, DocumentKind::Act);
    }
}
