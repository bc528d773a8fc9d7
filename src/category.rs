use async_trait::async_trait;
use gifts_types::category::{
    ByParentId, ByXmlId, BySlug, Category, CategoryRepository, Featured, TopLevel,
};
use rusqlite::{params, Row};
use tokio_rusqlite::Connection;
use typesafe_repository::async_ops::{Find, Get, List, Save, Select};
use typesafe_repository::prelude::*;

const COLUMNS: &str =
    "id, parent_id, name, slug, xml_id, description, sort_order, is_featured, icon";

pub struct SqliteCategoryRepository {
    conn: Connection,
}

fn category_from_row(row: &Row) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        parent_id: row.get::<_, Option<IdentityOf<Category>>>(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        xml_id: row.get(4)?,
        description: row.get(5)?,
        order: row.get(6)?,
        is_featured: row.get(7)?,
        icon: row.get(8)?,
    })
}

impl SqliteCategoryRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS category (
                    id BLOB PRIMARY KEY,
                    parent_id BLOB,
                    name TEXT NOT NULL,
                    slug TEXT NOT NULL UNIQUE,
                    xml_id TEXT UNIQUE,
                    description TEXT,
                    sort_order INTEGER NOT NULL DEFAULT 0,
                    is_featured INTEGER NOT NULL DEFAULT 0,
                    icon TEXT
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS category_parent ON category (parent_id)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    async fn select_where(
        &self,
        condition: &'static str,
        param: Option<rusqlite::types::Value>,
    ) -> Result<Vec<Category>, anyhow::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM category WHERE {condition} ORDER BY sort_order, name"
                ))?;
                let res = match param {
                    Some(p) => stmt.query_map([p], category_from_row)?,
                    None => stmt.query_map([], category_from_row)?,
                }
                .collect::<Result<Vec<_>, _>>()?;
                Ok(res)
            })
            .await?)
    }
}

impl Repository<Category> for SqliteCategoryRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Get<Category> for SqliteCategoryRepository {
    async fn get_one(&self, id: &IdentityOf<Category>) -> Result<Option<Category>, Self::Error> {
        let id = *id;
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {COLUMNS} FROM category WHERE id = ?1"))?;
                let c = stmt
                    .query_map([id], category_from_row)?
                    .next()
                    .transpose()?;
                Ok(c)
            })
            .await?)
    }
}

#[async_trait]
impl List<Category> for SqliteCategoryRepository {
    async fn list(&self) -> Result<Vec<Category>, Self::Error> {
        self.select_where("1 = 1", None).await
    }
}

#[async_trait]
impl Select<Category, ByParentId> for SqliteCategoryRepository {
    async fn select(&self, ByParentId(id): &ByParentId) -> Result<Vec<Category>, Self::Error> {
        self.select_where("parent_id = ?1", Some(rusqlite::types::Value::Blob(id.as_bytes().to_vec())))
            .await
    }
}

#[async_trait]
impl Select<Category, TopLevel> for SqliteCategoryRepository {
    async fn select(&self, _: &TopLevel) -> Result<Vec<Category>, Self::Error> {
        self.select_where("parent_id IS NULL", None).await
    }
}

#[async_trait]
impl Select<Category, Featured> for SqliteCategoryRepository {
    async fn select(&self, _: &Featured) -> Result<Vec<Category>, Self::Error> {
        self.select_where("is_featured = 1", None).await
    }
}

#[async_trait]
impl Find<Category, BySlug> for SqliteCategoryRepository {
    async fn find(&self, BySlug(slug): &BySlug) -> Result<Option<Category>, Self::Error> {
        Ok(self
            .select_where("slug = ?1", Some(slug.clone().into()))
            .await?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl Find<Category, ByXmlId> for SqliteCategoryRepository {
    async fn find(&self, ByXmlId(xml_id): &ByXmlId) -> Result<Option<Category>, Self::Error> {
        Ok(self
            .select_where("xml_id = ?1", Some(xml_id.clone().into()))
            .await?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl Save<Category> for SqliteCategoryRepository {
    async fn save(&self, c: Category) -> Result<(), Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO category (id, parent_id, name, slug, xml_id, description, sort_order, is_featured, icon)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO UPDATE SET parent_id=?2, name=?3, slug=?4, xml_id=?5,
                        description=?6, sort_order=?7, is_featured=?8, icon=?9",
                    params![
                        c.id,
                        c.parent_id,
                        c.name,
                        c.slug,
                        c.xml_id,
                        c.description,
                        c.order,
                        c.is_featured,
                        c.icon,
                    ],
                )?;
                Ok(())
            })
            .await?)
    }
}

#[async_trait]
impl CategoryRepository for SqliteCategoryRepository {
    async fn slug_taken(
        &self,
        slug: &str,
        except_xml_id: Option<&str>,
    ) -> Result<bool, Self::Error> {
        let slug = slug.to_string();
        let except = except_xml_id.map(ToString::to_string);
        Ok(self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM category WHERE slug = ?1 AND (?2 IS NULL OR xml_id IS NULL OR xml_id <> ?2)",
                    params![slug, except],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await?)
    }
}
