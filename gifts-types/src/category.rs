use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use typesafe_repository::async_ops::{Find, Get, List, Save, Select};
use typesafe_repository::macros::Id;
use typesafe_repository::prelude::*;
use typesafe_repository::{SelectBy, Selector};
use uuid::Uuid;

#[derive(Id, Clone, Debug, Serialize, Deserialize)]
pub struct Category {
    #[id]
    pub id: Uuid,
    pub parent_id: Option<IdentityOf<Category>>,
    pub name: String,
    pub slug: String,
    /// `page_id` of the supplier category tree
    pub xml_id: Option<String>,
    pub description: Option<String>,
    pub order: i64,
    pub is_featured: bool,
    pub icon: Option<String>,
}

impl Category {
    pub fn new(name: String, slug: String, parent_id: Option<IdentityOf<Category>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id,
            name,
            slug,
            xml_id: None,
            description: None,
            order: 0,
            is_featured: false,
            icon: None,
        }
    }
}

impl PartialEq for Category {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Category {}

impl std::hash::Hash for Category {
    fn hash<H>(&self, state: &mut H)
    where
        H: std::hash::Hasher,
    {
        self.id.hash(state)
    }
}

pub struct ByParentId(pub IdentityOf<Category>);
pub struct TopLevel;
pub struct Featured;
pub struct BySlug(pub String);
pub struct ByXmlId(pub String);

impl Selector for ByParentId {}
impl SelectBy<ByParentId> for Category {}

impl Selector for TopLevel {}
impl SelectBy<TopLevel> for Category {}

impl Selector for Featured {}
impl SelectBy<Featured> for Category {}

impl Selector for BySlug {}
impl SelectBy<BySlug> for Category {}

impl Selector for ByXmlId {}
impl SelectBy<ByXmlId> for Category {}

#[async_trait]
pub trait CategoryRepository:
    Repository<Category, Error = anyhow::Error>
    + Save<Category>
    + Get<Category>
    + List<Category>
    + Select<Category, ByParentId>
    + Select<Category, TopLevel>
    + Select<Category, Featured>
    + Find<Category, BySlug>
    + Find<Category, ByXmlId>
    + Send
    + Sync
{
    /// Whether `slug` is used by any category other than the one imported from `except_xml_id`
    async fn slug_taken(
        &self,
        slug: &str,
        except_xml_id: Option<&str>,
    ) -> Result<bool, Self::Error>;
}

pub fn count_parents<'a, T>(categories: &'a T, category: &Category) -> usize
where
    &'a T: IntoIterator<Item = &'a Category> + 'a,
{
    count_parents_internal(categories, category, vec![])
}

fn count_parents_internal<'a, T>(
    categories: &'a T,
    category: &Category,
    mut backtrace: Vec<&'a Category>,
) -> usize
where
    &'a T: IntoIterator<Item = &'a Category> + 'a,
{
    match &category.parent_id {
        Some(id) => {
            let parent = categories.into_iter().find(|c| &c.id == id);
            if let Some(parent) = parent {
                if backtrace.iter().any(|c| &c.id == id) {
                    return 0;
                }
                backtrace.push(parent);
                1 + count_parents_internal(categories, parent, backtrace)
            } else {
                0
            }
        }
        None => 0,
    }
}

/// Ids of `root` and every category below it
pub fn descendants(categories: &[Category], root: &IdentityOf<Category>) -> Vec<IdentityOf<Category>> {
    let mut children: HashMap<IdentityOf<Category>, Vec<IdentityOf<Category>>> = HashMap::new();
    for c in categories {
        if let Some(parent) = c.parent_id {
            children.entry(parent).or_default().push(c.id);
        }
    }
    let mut visited = HashSet::new();
    let mut queue = vec![*root];
    let mut res = vec![];
    while let Some(id) = queue.pop() {
        if !visited.insert(id) {
            continue;
        }
        res.push(id);
        if let Some(c) = children.get(&id) {
            queue.extend(c.iter().copied());
        }
    }
    res
}

/// Path from the root category down to `id`
pub fn breadcrumbs<'a>(categories: &'a [Category], id: &IdentityOf<Category>) -> Vec<&'a Category> {
    let mut res = vec![];
    let mut current = categories.iter().find(|c| &c.id == id);
    while let Some(c) = current {
        if res.iter().any(|r: &&Category| r.id == c.id) {
            break;
        }
        res.push(c);
        current = c
            .parent_id
            .and_then(|p| categories.iter().find(|c| c.id == p));
    }
    res.reverse();
    res
}

#[derive(Serialize, Debug, Clone)]
pub struct CategoryNode {
    #[serde(flatten)]
    pub category: Category,
    pub children: Vec<CategoryNode>,
}

pub fn build_tree(categories: Vec<Category>) -> Vec<CategoryNode> {
    let ids: HashSet<_> = categories.iter().map(|c| c.id).collect();
    let mut by_parent: HashMap<Option<IdentityOf<Category>>, Vec<Category>> = HashMap::new();
    for c in categories {
        let parent = c.parent_id.filter(|p| ids.contains(p) && *p != c.id);
        by_parent.entry(parent).or_default().push(c);
    }
    build_level(&mut by_parent, None, &mut HashSet::new())
}

fn build_level(
    by_parent: &mut HashMap<Option<IdentityOf<Category>>, Vec<Category>>,
    parent: Option<IdentityOf<Category>>,
    visited: &mut HashSet<IdentityOf<Category>>,
) -> Vec<CategoryNode> {
    let mut level = by_parent.remove(&parent).unwrap_or_default();
    level.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
    let mut nodes = Vec::with_capacity(level.len());
    for category in level {
        if !visited.insert(category.id) {
            continue;
        }
        let children = build_level(by_parent, Some(category.id), visited);
        nodes.push(CategoryNode { category, children });
    }
    nodes
}
