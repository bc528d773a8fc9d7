use gifts_types::product::{FilterValue, SizeChart, SizeTable};
use gifts_types::Gender;
use lazy_regex::{regex, regex_captures};
use rust_decimal::Decimal;
use scraper::{Html, Selector};
use serde::Serialize;
use std::str::FromStr;

/// Size tokens of stock codes, longest first
const CODE_SIZES: [(&str, &str); 10] = [
    ("XXXL", "XXXL"),
    ("3XL", "XXXL"),
    ("4XL", "4XL"),
    ("5XL", "5XL"),
    ("XXL", "XXL"),
    ("XL", "XL"),
    ("XS", "XS"),
    ("S", "S"),
    ("M", "M"),
    ("L", "L"),
];

pub const STANDARD_SIZE_ORDER: [&str; 9] = ["XS", "S", "M", "L", "XL", "XXL", "XXXL", "4XL", "5XL"];

const CLOTHING_KEYWORDS: [&str; 20] = [
    "футболк", "толстовк", "рубашк", "брюк", "шорт", "куртк", "ветровк", "свитшот", "худи",
    "жилет", "джемпер", "кофт", "лонгслив", "бейсболк", "панам", "кепк", "поло", "фартук",
    "платье", "дождевик",
];

/// Clothing size encoded in a supplier SKU such as `6580.70.XL`
pub fn extract_size_from_code(code: &str) -> Option<&'static str> {
    let parts: Vec<&str> = code.split('.').collect();
    if parts
        .last()
        .is_some_and(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }
    let lower = code.to_lowercase();
    if lower.contains("cm") || lower.contains("см") {
        return None;
    }
    parts.iter().rev().take(2).find_map(|part| {
        let part = part.trim().to_uppercase();
        CODE_SIZES
            .iter()
            .find(|(pattern, _)| part == *pattern)
            .map(|(_, size)| *size)
    })
}

/// Code without its trailing size token, used to find the base product of a size SKU
pub fn strip_size_suffix(code: &str) -> Option<&str> {
    CODE_SIZES
        .iter()
        .find(|(pattern, _)| code.ends_with(pattern))
        .map(|(pattern, _)| {
            code[..code.len() - pattern.len()]
                .trim_end_matches(|c: char| c.is_whitespace() || matches!(c, '.' | '-' | '_'))
        })
        .filter(|base| !base.is_empty())
}

const GENDER_MAPPING: [(&str, Gender); 18] = [
    ("женские", Gender::Female),
    ("female", Gender::Female),
    ("для женщин", Gender::Female),
    ("women", Gender::Female),
    ("woman", Gender::Female),
    ("жен", Gender::Female),
    ("ж", Gender::Female),
    ("мужские", Gender::Male),
    ("male", Gender::Male),
    ("для мужчин", Gender::Male),
    ("men", Gender::Male),
    ("man", Gender::Male),
    ("муж", Gender::Male),
    ("м", Gender::Male),
    ("унисекс", Gender::Unisex),
    ("unisex", Gender::Unisex),
    ("для всех", Gender::Unisex),
    ("уни", Gender::Unisex),
];

pub fn normalize_gender(raw: &str) -> Option<Gender> {
    let value = raw.trim().to_lowercase();
    if value.is_empty() {
        return None;
    }
    if let Some((_, g)) = GENDER_MAPPING.iter().find(|(k, _)| *k == value) {
        return Some(*g);
    }
    GENDER_MAPPING
        .iter()
        .filter(|(k, _)| k.chars().count() > 1)
        .find(|(k, _)| value.contains(k))
        .map(|(_, g)| *g)
}

/// Gender from the `gender` element, then the gender filter (type `23`), then product texts
pub fn infer_gender(
    attr: Option<&str>,
    filters: &[FilterValue],
    name: &str,
    description: Option<&str>,
) -> Option<Gender> {
    if let Some(g) = attr.and_then(normalize_gender) {
        return Some(g);
    }
    let from_filter = filters
        .iter()
        .filter(|f| f.type_id == "23")
        .filter_map(|f| f.filter_name.as_deref())
        .find_map(normalize_gender);
    if from_filter.is_some() {
        return from_filter;
    }
    let text = format!("{} {}", name, description.unwrap_or_default()).to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| text.contains(w));
    if has(&["женск", "female", "woman", "для жен"]) {
        Some(Gender::Female)
    } else if has(&["мужск", "male", "man", "для муж"]) {
        Some(Gender::Male)
    } else if has(&["унисекс", "unisex", "для всех"]) {
        Some(Gender::Unisex)
    } else {
        None
    }
}

fn canonical_size(token: &str) -> String {
    match token {
        "2XL" => "XXL".to_string(),
        "3XL" => "XXXL".to_string(),
        t => t.to_string(),
    }
}

/// Size letters from free text: `"женские XS, S, мужские L"` becomes `"XS, S, L"`
pub fn normalize_sizes(raw: &str) -> Option<String> {
    let upper = raw.to_uppercase();
    let mut sizes: Vec<String> = vec![];
    for m in regex!(r"\b(XXXL|XXL|XL|XXS|XS|S|M|L|[2-7]XL)\b").find_iter(&upper) {
        let size = canonical_size(m.as_str());
        if !sizes.contains(&size) {
            sizes.push(size);
        }
    }
    if sizes.is_empty() {
        return None;
    }
    Some(itertools::intersperse(sizes, ", ".to_string()).collect())
}

pub fn normalize_size(raw: &str) -> String {
    canonical_size(raw.trim().to_uppercase().as_str())
}

fn size_rank(size: &str) -> usize {
    STANDARD_SIZE_ORDER
        .iter()
        .position(|s| *s == size)
        .unwrap_or(STANDARD_SIZE_ORDER.len())
}

pub fn sort_sizes(sizes: &mut [String]) {
    sizes.sort_by(|a, b| size_rank(a).cmp(&size_rank(b)).then_with(|| a.cmp(b)));
}

pub fn is_clothing(name: &str) -> bool {
    let name = name.to_lowercase();
    CLOTHING_KEYWORDS.iter().any(|k| name.contains(k))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dimensions {
    pub length_mm: Decimal,
    pub width_mm: Option<Decimal>,
    pub height_mm: Option<Decimal>,
    pub diameter: bool,
}

fn parse_number(s: &str) -> Option<Decimal> {
    Decimal::from_str(&s.replace(',', ".")).ok()
}

fn unit_factor(unit: &str) -> Decimal {
    match unit {
        "см" | "cm" => Decimal::TEN,
        "м" | "m" => Decimal::ONE_THOUSAND,
        _ => Decimal::ONE,
    }
}

/// Dimensions like `20 x 15,5 x 3 см` or `d 7 см`, converted to millimetres
pub fn parse_dimensions(text: &str) -> Option<Dimensions> {
    let text = text.to_lowercase();
    if let Some((_, a, b, c, unit)) = regex_captures!(
        r"(\d+(?:[.,]\d+)?)\s*[xх×*]\s*(\d+(?:[.,]\d+)?)(?:\s*[xх×*]\s*(\d+(?:[.,]\d+)?))?\s*(мм|см|mm|cm|м|m)?",
        &text
    ) {
        let factor = unit_factor(unit);
        return Some(Dimensions {
            length_mm: parse_number(a)? * factor,
            width_mm: Some(parse_number(b)? * factor),
            height_mm: parse_number(c).map(|c| c * factor),
            diameter: false,
        });
    }
    if let Some((_, d, unit)) = regex_captures!(
        r"(?:\bd|ø|диаметр)\s*[:=]?\s*(\d+(?:[.,]\d+)?)\s*(мм|см|mm|cm|м|m)?",
        &text
    ) {
        return Some(Dimensions {
            length_mm: parse_number(d)? * unit_factor(unit),
            width_mm: None,
            height_mm: None,
            diameter: true,
        });
    }
    None
}

fn cell_text(el: scraper::ElementRef) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// First `<table>` of the product description: first row is the header
pub fn parse_size_table(content: &str) -> Option<SizeTable> {
    let html = Html::parse_fragment(content);
    let table_sel = Selector::parse("table").ok()?;
    let row_sel = Selector::parse("tr").ok()?;
    let cell_sel = Selector::parse("td").ok()?;
    let table = html.select(&table_sel).next()?;
    let mut rows = table.select(&row_sel);
    let headers = rows
        .next()
        .map(|r| r.select(&cell_sel).map(cell_text).collect())
        .unwrap_or_default();
    let rows = rows
        .map(|r| r.select(&cell_sel).map(cell_text).collect::<Vec<_>>())
        .filter(|r| !r.is_empty())
        .collect();
    Some(SizeTable { headers, rows })
}

/// Size chart block `div#tablemer` embedded in descriptions of clothing; blocks without a table are ignored
pub fn parse_size_chart(content: &str) -> Option<SizeChart> {
    let html = Html::parse_fragment(content);
    let table_sel = Selector::parse("table").ok()?;
    let block = html
        .select(&Selector::parse("div#tablemer").ok()?)
        .find(|b| b.select(&table_sel).next().is_some())?;
    let image = block
        .select(&Selector::parse("img").ok()?)
        .next()
        .and_then(|i| i.value().attr("src"))
        .map(ToString::to_string);
    let table_html = block.select(&table_sel).next()?.html();
    let note = block
        .select(&Selector::parse("p").ok()?)
        .next()
        .map(cell_text)
        .filter(|n| !n.is_empty());
    Some(SizeChart {
        image,
        table_html,
        note,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn extracts_size_from_code() {
        assert_eq!(extract_size_from_code("6580.70.XL"), Some("XL"));
        assert_eq!(extract_size_from_code("6580.70.L"), Some("L"));
        assert_eq!(extract_size_from_code("6580.AB.3XL"), Some("XXXL"));
        assert_eq!(extract_size_from_code("ABC.XS.Q"), Some("XS"));
        assert_eq!(extract_size_from_code("6580.70"), None);
        assert_eq!(extract_size_from_code("6580.56"), None);
        assert_eq!(extract_size_from_code("HAT.56CM"), None);
        assert_eq!(extract_size_from_code("КЕПКА.56см"), None);
    }

    #[test]
    fn strips_size_suffix() {
        assert_eq!(strip_size_suffix("11223XXL"), Some("11223"));
        assert_eq!(strip_size_suffix("11223 M"), Some("11223"));
        assert_eq!(strip_size_suffix("6580.70.M"), Some("6580.70"));
        assert_eq!(strip_size_suffix("112233"), None);
        assert_eq!(strip_size_suffix("XL"), None);
    }

    #[test]
    fn normalizes_gender() {
        assert_eq!(normalize_gender("Мужские"), Some(Gender::Male));
        assert_eq!(normalize_gender("ж"), Some(Gender::Female));
        assert_eq!(normalize_gender("female"), Some(Gender::Female));
        assert_eq!(normalize_gender("модель для женщин"), Some(Gender::Female));
        assert_eq!(normalize_gender("Унисекс модель"), Some(Gender::Unisex));
        assert_eq!(normalize_gender("детские"), None);
        assert_eq!(normalize_gender(""), None);
    }

    #[test]
    fn infers_gender_by_priority() {
        let filters = vec![FilterValue {
            type_id: "23".to_string(),
            type_name: Some("Пол".to_string()),
            filter_id: "1".to_string(),
            filter_name: Some("женские".to_string()),
        }];
        assert_eq!(
            infer_gender(Some("мужские"), &filters, "Футболка", None),
            Some(Gender::Male)
        );
        assert_eq!(
            infer_gender(None, &filters, "Футболка мужская", None),
            Some(Gender::Female)
        );
        assert_eq!(
            infer_gender(None, &[], "Футболка мужская", None),
            Some(Gender::Male)
        );
        assert_eq!(
            infer_gender(None, &[], "Футболка", Some("Модель унисекс")),
            Some(Gender::Unisex)
        );
        assert_eq!(infer_gender(None, &[], "Кружка", None), None);
    }

    #[test]
    fn normalizes_sizes() {
        assert_eq!(
            normalize_sizes("женские XS, S, мужские L").as_deref(),
            Some("XS, S, L")
        );
        assert_eq!(normalize_sizes("S-3XL, M").as_deref(), Some("S, XXXL, M"));
        assert_eq!(normalize_sizes("один размер"), None);
        assert_eq!(normalize_size("3xl"), "XXXL");
    }

    #[test]
    fn sorts_sizes_in_standard_order() {
        let mut sizes = vec![
            "XL".to_string(),
            "S".to_string(),
            "ONE".to_string(),
            "XS".to_string(),
            "XXXL".to_string(),
        ];
        sort_sizes(&mut sizes);
        assert_eq!(sizes, vec!["XS", "S", "XL", "XXXL", "ONE"]);
    }

    #[test]
    fn parses_dimensions() {
        let d = parse_dimensions("Размер: 20 x 15,5 x 3 см").unwrap();
        assert_eq!(d.length_mm, dec!(200));
        assert_eq!(d.width_mm, Some(dec!(155)));
        assert_eq!(d.height_mm, Some(dec!(30)));
        let d = parse_dimensions("100х50 мм").unwrap();
        assert_eq!(d.length_mm, dec!(100));
        assert_eq!(d.height_mm, None);
        let d = parse_dimensions("d 7 см").unwrap();
        assert!(d.diameter);
        assert_eq!(d.length_mm, dec!(70));
        assert_eq!(parse_dimensions("без размера"), None);
    }

    #[test]
    fn detects_clothing() {
        assert!(is_clothing("Футболка мужская Regent"));
        assert!(is_clothing("Толстовка с капюшоном"));
        assert!(!is_clothing("Кружка Promo"));
    }

    #[test]
    fn parses_first_table() {
        let content = r#"<p>Описание</p>
            <table><tr><td>Размер</td><td>Обхват груди</td></tr>
            <tr><td>S</td><td>88-92</td></tr>
            <tr></tr>
            <tr><td>M</td><td>96-100</td></tr></table>
            <table><tr><td>other</td></tr></table>"#;
        let table = parse_size_table(content).unwrap();
        assert_eq!(table.headers, vec!["Размер", "Обхват груди"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1], vec!["M", "96-100"]);
        assert_eq!(parse_size_table("<p>нет таблицы</p>"), None);
    }

    #[test]
    fn parses_size_chart_block() {
        let content = r#"<div id="tablemer"><img src="/img/chart.png"><table><tr><td>S</td></tr></table><p>Замеры указаны в см</p></div>"#;
        let chart = parse_size_chart(content).unwrap();
        assert_eq!(chart.image.as_deref(), Some("/img/chart.png"));
        assert!(chart.table_html.starts_with("<table>"));
        assert_eq!(chart.note.as_deref(), Some("Замеры указаны в см"));
        assert!(parse_size_chart("<div>no chart</div>").is_none());
        assert!(parse_size_chart(r#"<div id="tablemer"><p>скоро</p></div>"#).is_none());
    }
}
