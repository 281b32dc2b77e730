// src/store_profiles.rs
//
// Lookup tables for store attributes that the source does not carry:
// store type, floor area range and amenities. Every table is an ordered
// rule list with an explicit default, first match wins.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_STORE_TYPE: &str = "магазин у дома";
pub const DEFAULT_AREA_RANGE: AreaRange = AreaRange::new(100.0, 500.0);

/// Floor area bounds in m².
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaRange {
    pub min: f64,
    pub max: f64,
}

impl AreaRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

struct ChainRule {
    chain: &'static str,
    /// Matched against "chain format" when present; sub-format rules precede the plain chain rule.
    sub_format: Option<&'static str>,
    store_type: &'static str,
    area: Option<AreaRange>,
    has_alcohol: bool,
    has_snacks: bool,
}

const fn chain(
    chain: &'static str,
    sub_format: Option<&'static str>,
    store_type: &'static str,
    area: Option<AreaRange>,
    has_alcohol: bool,
) -> ChainRule {
    ChainRule {
        chain,
        sub_format,
        store_type,
        area,
        has_alcohol,
        has_snacks: true,
    }
}

static CHAIN_RULES: &[ChainRule] = &[
    chain("ашан", Some("ашан сити"), "супермаркет", Some(AreaRange::new(600.0, 1000.0)), true),
    chain("ашан", Some("ашан экспресс"), "магазин у дома", Some(AreaRange::new(200.0, 400.0)), true),
    chain("ашан", None, "гипермаркет", Some(AreaRange::new(3000.0, 5000.0)), true),
    chain("пятерочка", None, "магазин у дома", Some(AreaRange::new(200.0, 400.0)), true),
    chain("перекресток", None, "супермаркет", Some(AreaRange::new(600.0, 1000.0)), true),
    chain("магнит", None, "магазин у дома", Some(AreaRange::new(180.0, 320.0)), false),
    chain("лента", None, "гипермаркет", Some(AreaRange::new(2000.0, 3000.0)), true),
    chain("дикси", None, "магазин у дома", Some(AreaRange::new(200.0, 360.0)), true),
    chain("метро", None, "cash&carry", None, true),
    chain("окей", None, "гипермаркет", None, true),
    chain("виктория", None, "супермаркет", None, true),
];

struct KeywordRule {
    keywords: &'static [&'static str],
    store_type: &'static str,
    area: AreaRange,
}

static FORMAT_RULES: &[KeywordRule] = &[
    KeywordRule {
        keywords: &["торговый центр", "тц", "молл", "mall"],
        store_type: "торговый центр",
        area: AreaRange::new(300.0, 1200.0),
    },
    KeywordRule {
        keywords: &["гипермаркет", "hypermarket"],
        store_type: "гипермаркет",
        area: AreaRange::new(2000.0, 5000.0),
    },
    KeywordRule {
        keywords: &["супермаркет", "supermarket"],
        store_type: "супермаркет",
        area: AreaRange::new(500.0, 1500.0),
    },
    KeywordRule {
        keywords: &["у дома", "продукты"],
        store_type: "магазин у дома",
        area: AreaRange::new(100.0, 400.0),
    },
    KeywordRule {
        keywords: &["дискаунтер", "discount"],
        store_type: "дискаунтер",
        area: AreaRange::new(300.0, 800.0),
    },
];

/// Resolved attributes for one store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreProfile {
    pub store_type: String,
    pub area_range: AreaRange,
    pub has_alcohol_department: bool,
    pub has_snacks: bool,
}

fn fold(text: &str) -> String {
    text.trim().to_lowercase().replace('ё', "е")
}

/// Short keywords ("тц") only match whole words.
fn has_keyword(text: &str, keyword: &str) -> bool {
    if keyword.chars().count() > 3 {
        return text.contains(keyword);
    }
    text.split(|c: char| !c.is_alphanumeric())
        .any(|word| word == keyword)
}

fn match_chain(chain: &str, store_format: &str) -> Option<&'static ChainRule> {
    let chain = fold(chain);
    let combined = format!("{} {}", chain, fold(store_format));
    CHAIN_RULES.iter().find(|rule| {
        chain.contains(rule.chain)
            && rule
                .sub_format
                .map_or(true, |sub| combined.contains(sub))
    })
}

fn match_keywords(text: &str) -> Option<&'static KeywordRule> {
    FORMAT_RULES
        .iter()
        .find(|rule| rule.keywords.iter().any(|k| has_keyword(text, k)))
}

/// Store type label. A non-empty source format wins, then the chain table,
/// then format/address keywords, then the default.
pub fn store_type(chain: &str, store_format: &str, address: &str) -> String {
    let explicit = store_format.trim();
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    if let Some(rule) = match_chain(chain, store_format) {
        return rule.store_type.to_string();
    }
    match_keywords(&fold(address))
        .map(|rule| rule.store_type)
        .unwrap_or(DEFAULT_STORE_TYPE)
        .to_string()
}

/// Area range by chain (and sub-format), then by format keyword, then the global default.
pub fn area_range(chain: &str, store_format: &str) -> AreaRange {
    if let Some(area) = match_chain(chain, store_format).and_then(|rule| rule.area) {
        return area;
    }
    match_keywords(&fold(store_format))
        .map(|rule| rule.area)
        .unwrap_or(DEFAULT_AREA_RANGE)
}

/// (alcohol department, snacks) by chain; unknown chains get both.
pub fn amenities(chain: &str) -> (bool, bool) {
    match match_chain(chain, "") {
        Some(rule) => (rule.has_alcohol, rule.has_snacks),
        None => (true, true),
    }
}

pub fn resolve_profile(chain: &str, store_format: &str, address: &str) -> StoreProfile {
    let (has_alcohol_department, has_snacks) = amenities(chain);
    StoreProfile {
        store_type: store_type(chain, store_format, address),
        area_range: area_range(chain, store_format),
        has_alcohol_department,
        has_snacks,
    }
}

/// Uniform draws inside an area range. Seeded runs are reproducible.
pub struct AreaEstimator {
    rng: StdRng,
}

impl AreaEstimator {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Rounded to 0.1 m².
    pub fn estimate(&mut self, range: AreaRange) -> f64 {
        if range.max <= range.min {
            return range.min;
        }
        let value = self.rng.gen_range(range.min..=range.max);
        ((value * 10.0).round() / 10.0).clamp(range.min, range.max)
    }
}
