use anyhow::Context;
use gifts_types::category::{Category, CategoryRepository};
use gifts_types::product::{ProductRepository, ProductText};
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use typesafe_repository::async_ops::List;
use typesafe_repository::IdentityOf;

const DEFAULT_RULES: &str = include_str!("../data/category_rules.yaml");

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CategoryRule {
    #[serde(default)]
    pub priority: bool,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub subcategories: BTreeMap<String, Vec<String>>,
}

impl CategoryRule {
    fn excludes(&self, text: &str) -> bool {
        contains_any(text, &self.exclude)
    }

    fn matches(&self, text: &str) -> bool {
        contains_any(text, &self.keywords)
    }
}

/// Keyword rules keyed by category slug
pub type CategoryRules = BTreeMap<String, CategoryRule>;

fn contains_any(text: &str, keywords: &[String]) -> bool {
    keywords
        .iter()
        .any(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
}

pub fn parse_rules(yaml: &str) -> anyhow::Result<CategoryRules> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Embedded rules, replaced by the file at `CATEGORY_RULES_PATH` when it is set
pub fn load_rules() -> anyhow::Result<CategoryRules> {
    match std::env::var("CATEGORY_RULES_PATH") {
        Ok(path) if !path.trim().is_empty() => {
            let yaml = std::fs::read_to_string(&path)
                .with_context(|| format!("Unable to read category rules from {path}"))?;
            parse_rules(&yaml).with_context(|| format!("Invalid category rules in {path}"))
        }
        _ => parse_rules(DEFAULT_RULES),
    }
}

/// Rule for a category nobody wrote one for: the first word of its name
fn fallback_rule(category: &Category) -> Option<CategoryRule> {
    let word = category.name.split_whitespace().next()?.to_lowercase();
    Some(CategoryRule {
        priority: false,
        keywords: vec![word],
        exclude: vec![],
        subcategories: BTreeMap::new(),
    })
}

/// Category slugs every product should be linked to.
///
/// Priority rules run first. A product that is in a priority category, either
/// already or through this run, is not offered to the remaining rules.
/// Categories without a rule of their own match on the first word of their name.
pub fn plan_links(
    rules: &CategoryRules,
    categories: &[Category],
    texts: &[ProductText],
) -> BTreeMap<String, Vec<String>> {
    let mut effective: Vec<(&str, Cow<CategoryRule>)> = rules
        .iter()
        .map(|(slug, rule)| (slug.as_str(), Cow::Borrowed(rule)))
        .collect();
    effective.extend(
        categories
            .iter()
            .filter(|c| !rules.contains_key(&c.slug))
            .filter_map(|c| Some((c.slug.as_str(), Cow::Owned(fallback_rule(c)?)))),
    );
    effective.sort_by_key(|(_, rule)| !rule.priority);

    let priority_ids: HashSet<IdentityOf<Category>> = categories
        .iter()
        .filter(|c| rules.get(&c.slug).is_some_and(|r| r.priority))
        .map(|c| c.id)
        .collect();
    let mut claimed: HashSet<&str> = texts
        .iter()
        .filter(|t| t.categories.iter().any(|c| priority_ids.contains(c)))
        .map(|t| t.product_id.as_str())
        .collect();
    let texts: Vec<(&str, String)> = texts
        .iter()
        .map(|t| {
            let text = format!("{} {}", t.name, t.description.as_deref().unwrap_or_default());
            (t.product_id.as_str(), text.to_lowercase())
        })
        .collect();

    let mut links: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (slug, rule) in effective {
        for (id, text) in &texts {
            if !rule.priority && claimed.contains(id) {
                continue;
            }
            if rule.excludes(text) || !rule.matches(text) {
                continue;
            }
            let entry = links.entry(id.to_string()).or_default();
            entry.push(slug.to_string());
            entry.extend(
                rule.subcategories
                    .iter()
                    .filter(|(_, keywords)| contains_any(text, keywords))
                    .map(|(sub, _)| sub.clone()),
            );
            if rule.priority {
                claimed.insert(*id);
            }
        }
    }
    for slugs in links.values_mut() {
        let mut seen = HashSet::new();
        slugs.retain(|s| seen.insert(s.clone()));
    }
    links
}

/// Links products to categories by keywords found in their name or description.
/// Returns the number of products that received at least one link.
pub async fn link_products(
    rules: &CategoryRules,
    products: Arc<dyn ProductRepository>,
    categories: Arc<dyn CategoryRepository>,
) -> anyhow::Result<usize> {
    let texts = products.texts().await?;
    let all = categories.list().await?;
    let plan = plan_links(rules, &all, &texts);
    let by_slug: HashMap<&str, IdentityOf<Category>> =
        all.iter().map(|c| (c.slug.as_str(), c.id)).collect();
    let mut missing: HashSet<String> = HashSet::new();
    let mut linked = 0;
    for (product_id, slugs) in plan {
        let mut ids = vec![];
        for slug in slugs {
            match by_slug.get(slug.as_str()) {
                Some(id) => ids.push(*id),
                None => {
                    if missing.insert(slug.clone()) {
                        log::warn!("Category {slug} from linking rules does not exist");
                    }
                }
            }
        }
        if ids.is_empty() {
            continue;
        }
        products.link_categories(&product_id, ids).await?;
        linked += 1;
    }
    log::info!("Smart linking: {linked} products linked");
    Ok(linked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(id: &str, name: &str, description: Option<&str>) -> ProductText {
        ProductText {
            product_id: id.to_string(),
            name: name.to_string(),
            description: description.map(ToString::to_string),
            categories: vec![],
        }
    }

    fn category(name: &str, slug: &str) -> Category {
        Category::new(name.to_string(), slug.to_string(), None)
    }

    #[test]
    fn embedded_rules_parse() {
        let rules = parse_rules(DEFAULT_RULES).unwrap();
        assert!(rules["elektronika"].priority);
        assert!(!rules["odezhda"].priority);
        assert!(rules["odezhda"].subcategories.contains_key("futbolki"));
    }

    #[test]
    fn links_with_subcategories() {
        let rules = parse_rules(DEFAULT_RULES).unwrap();
        let plan = plan_links(
            &rules,
            &[],
            &[
                text("1", "Футболка хлопковая", None),
                text("2", "Кружка керамическая", Some("Подарочная MUG")),
                text("3", "Мяч", None),
            ],
        );
        assert_eq!(plan["1"], vec!["odezhda", "futbolki"]);
        assert_eq!(plan["2"], vec!["posuda", "kruzhki"]);
        assert!(!plan.contains_key("3"));
    }

    #[test]
    fn exclude_keywords_block_rule() {
        let rules = parse_rules(DEFAULT_RULES).unwrap();
        let plan = plan_links(&rules, &[], &[text("1", "Дверная ручка", None)]);
        assert!(!plan
            .get("1")
            .is_some_and(|slugs| slugs.contains(&"ruchki".to_string())));
    }

    #[test]
    fn priority_rules_claim_products() {
        let rules = parse_rules(
            r#"
a:
  keywords: [кабель]
b:
  priority: true
  keywords: [usb]
"#,
        )
        .unwrap();
        let plan = plan_links(
            &rules,
            &[],
            &[text("1", "USB кабель", None), text("2", "Кабель", None)],
        );
        assert_eq!(plan["1"], vec!["b"]);
        assert_eq!(plan["2"], vec!["a"]);
    }

    #[test]
    fn products_already_in_priority_category_are_skipped() {
        let rules = parse_rules(DEFAULT_RULES).unwrap();
        let electronics = category("Электроника", "elektronika");
        let mut heated = text("1", "Футболка с подогревом", None);
        heated.categories = vec![electronics.id];
        let plain = text("2", "Футболка", None);
        let plan = plan_links(&rules, &[electronics], &[heated, plain]);
        assert!(!plan.contains_key("1"));
        assert_eq!(plan["2"], vec!["odezhda", "futbolki"]);
    }

    #[test]
    fn categories_without_rules_match_first_word() {
        let rules = parse_rules("{}").unwrap();
        let categories = vec![
            category("Зонты и дождевики", "zonty"),
            category("Пледы", "pledy"),
            category("", "empty"),
        ];
        let plan = plan_links(
            &rules,
            &categories,
            &[
                text("1", "Складной зонт", Some("Зонты с логотипом")),
                text("2", "Плед флисовый", None),
            ],
        );
        assert_eq!(plan["1"], vec!["zonty"]);
        assert!(!plan.contains_key("2"));
    }

    #[tokio::test]
    async fn links_through_repositories() {
        use crate::category::SqliteCategoryRepository;
        use crate::product::tests::product;
        use crate::product::SqliteProductRepository;
        use rust_decimal_macros::dec;
        use tokio_rusqlite::Connection;
        use typesafe_repository::async_ops::{Get, Save};

        let conn = Connection::open_in_memory().await.unwrap();
        let products = Arc::new(SqliteProductRepository::init(conn.clone()).await.unwrap());
        let categories = Arc::new(SqliteCategoryRepository::init(conn).await.unwrap());
        let electronics = category("Электроника", "elektronika");
        let clothes = category("Одежда", "odezhda");
        let umbrellas = category("Зонты", "zonty");
        for c in [&electronics, &clothes, &umbrellas] {
            categories.save(c.clone()).await.unwrap();
        }
        let mut heated = product("1", "Футболка с подогревом", dec!(900));
        heated.categories = vec![electronics.id];
        products.save(heated).await.unwrap();
        products.save(product("2", "Зонты-трости", dec!(700))).await.unwrap();

        let rules = parse_rules(DEFAULT_RULES).unwrap();
        let linked = link_products(&rules, products.clone(), categories.clone())
            .await
            .unwrap();
        assert_eq!(linked, 1);
        let heated = products.get_one(&"1".to_string()).await.unwrap().unwrap();
        assert_eq!(heated.categories, vec![electronics.id]);
        let umbrella = products.get_one(&"2".to_string()).await.unwrap().unwrap();
        assert_eq!(umbrella.categories, vec![umbrellas.id]);
    }
}
