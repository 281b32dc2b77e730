// src/address_parser.rs
//
// Offline fallback for geography: an ordered rule engine over free-text
// Russian addresses. First matching rule wins; nothing here touches the network.

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

/// Value stored for any part the rules cannot recover.
pub const UNKNOWN: &str = "Неизвестно";

const CENTRAL: &str = "Центральный федеральный округ";
const NORTH_WEST: &str = "Северо-Западный федеральный округ";
const SOUTH: &str = "Южный федеральный округ";
const NORTH_CAUCASUS: &str = "Северо-Кавказский федеральный округ";
const VOLGA: &str = "Приволжский федеральный округ";
const URALS: &str = "Уральский федеральный округ";
const SIBERIA: &str = "Сибирский федеральный округ";
const FAR_EAST: &str = "Дальневосточный федеральный округ";

/// Cities of federal significance: subject and city at once.
const FEDERAL_CITIES: &[&str] = &["Москва", "Санкт-Петербург", "Севастополь"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub city: String,
    pub federal_subject: String,
    pub federal_district: String,
}

impl ParsedAddress {
    fn unknown() -> Self {
        Self {
            city: UNKNOWN.to_string(),
            federal_subject: UNKNOWN.to_string(),
            federal_district: UNKNOWN.to_string(),
        }
    }
}

struct SubjectRule {
    needle: &'static str,
    subject: &'static str,
    district: &'static str,
}

const fn subject(needle: &'static str, subject: &'static str, district: &'static str) -> SubjectRule {
    SubjectRule {
        needle,
        subject,
        district,
    }
}

// Regions come before their capitals so "московская область, ... москва ..."
// resolves to the region. "томская" must precede "омская".
static SUBJECT_RULES: &[SubjectRule] = &[
    subject("московская область", "Московская область", CENTRAL),
    subject("подмосковье", "Московская область", CENTRAL),
    subject("ленинградская область", "Ленинградская область", NORTH_WEST),
    subject("москва", "Москва", CENTRAL),
    subject("санкт-петербург", "Санкт-Петербург", NORTH_WEST),
    subject("спб", "Санкт-Петербург", NORTH_WEST),
    subject("севастополь", "Севастополь", SOUTH),
    subject("крым", "Республика Крым", SOUTH),
    subject("краснодар", "Краснодарский край", SOUTH),
    subject("ростов", "Ростовская область", SOUTH),
    subject("волгоград", "Волгоградская область", SOUTH),
    subject("воронеж", "Воронежская область", CENTRAL),
    subject("тульская", "Тульская область", CENTRAL),
    subject("ярослав", "Ярославская область", CENTRAL),
    subject("калужская", "Калужская область", CENTRAL),
    subject("свердловская", "Свердловская область", URALS),
    subject("екатеринбург", "Свердловская область", URALS),
    subject("челябинск", "Челябинская область", URALS),
    subject("тюмен", "Тюменская область", URALS),
    subject("новосибирск", "Новосибирская область", SIBERIA),
    subject("томская", "Томская область", SIBERIA),
    subject("омская", "Омская область", SIBERIA),
    subject("красноярск", "Красноярский край", SIBERIA),
    subject("нижегородская", "Нижегородская область", VOLGA),
    subject("нижний новгород", "Нижегородская область", VOLGA),
    subject("татарстан", "Республика Татарстан", VOLGA),
    subject("казань", "Республика Татарстан", VOLGA),
    subject("самар", "Самарская область", VOLGA),
    subject("башкортостан", "Республика Башкортостан", VOLGA),
    subject("пермск", "Пермский край", VOLGA),
    subject("ставрополь", "Ставропольский край", NORTH_CAUCASUS),
    subject("дагестан", "Республика Дагестан", NORTH_CAUCASUS),
    subject("приморский", "Приморский край", FAR_EAST),
    subject("владивосток", "Приморский край", FAR_EAST),
    subject("хабаровск", "Хабаровский край", FAR_EAST),
];

/// Abbreviation expansions applied before matching, in order.
static ABBREVIATIONS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\bг\.\s*", "город "),
        (r"\bул\.\s*", "улица "),
        (r"\bпр-т\.?\s*", "проспект "),
        (r"\bпер\.\s*", "переулок "),
        (r"\bобл\b\.?", "область"),
        (r"\bресп\.\s*", "республика "),
        (r"\bпгт\.?\s*", "поселок "),
        (r"\bпос\.\s*", "поселок "),
        (r"\bп\.\s*", "поселок "),
        (r"\bс\.\s*", "село "),
        (r"\bдом\s*№\s*", "дом "),
        (r"\bд\.\s*", "дом "),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

static WHITESPACE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\s+").ok());
static REPEATED_COMMAS: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\s*,[\s,]*").ok());

/// How a city rule turns a match into a name.
enum Extract {
    /// Capture group 1.
    Capture,
    /// The second comma-separated segment when the address has at least three.
    SecondSegment,
}

struct CityRule {
    name: &'static str,
    pattern: Option<Regex>,
    extract: Extract,
}

static CITY_RULES: Lazy<Vec<CityRule>> = Lazy::new(|| {
    vec![
        CityRule {
            name: "город-prefix",
            pattern: Regex::new(r"(?:^|,\s*)город\s+([а-яa-z][а-яa-z\- ]*?)\s*(?:,|$)").ok(),
            extract: Extract::Capture,
        },
        CityRule {
            name: "город-suffix",
            pattern: Regex::new(r"(?:^|,\s*)([а-яa-z][а-яa-z\-]*)\s+город\s*(?:,|$)").ok(),
            extract: Extract::Capture,
        },
        CityRule {
            name: "settlement",
            pattern: Regex::new(r"(?:^|,\s*)(?:поселок|село|деревня)\s+([а-яa-z][а-яa-z\- ]*?)\s*(?:,|$)").ok(),
            extract: Extract::Capture,
        },
        CityRule {
            name: "second-segment",
            pattern: None,
            extract: Extract::SecondSegment,
        },
    ]
});

/// Words that mark a segment as a street, building or administrative unit.
const NON_CITY_KEYWORDS: &[&str] = &[
    "улица", "проспект", "переулок", "шоссе", "бульвар", "площадь", "набережная", "проезд", "дом",
    "область", "край", "республика", "район", "округ", "россия", "микрорайон", "тц", "корпус",
];

/// Lower-cases, expands abbreviations and tidies whitespace and commas.
pub fn normalize_address(address: &str) -> String {
    let mut text = address.to_lowercase().replace('ё', "е");
    for (re, replacement) in ABBREVIATIONS.iter() {
        text = re.replace_all(&text, *replacement).into_owned();
    }
    if let Some(re) = WHITESPACE.as_ref() {
        text = re.replace_all(&text, " ").into_owned();
    }
    if let Some(re) = REPEATED_COMMAS.as_ref() {
        text = re.replace_all(&text, ", ").into_owned();
    }
    text.trim().trim_matches(',').trim().to_string()
}

fn match_subject(normalized: &str) -> Option<&'static SubjectRule> {
    SUBJECT_RULES.iter().find(|rule| normalized.contains(rule.needle))
}

/// Federal district for a subject name as returned by a geocoder.
pub fn district_for_subject(subject: &str) -> Option<&'static str> {
    match_subject(&normalize_address(subject)).map(|rule| rule.district)
}

fn is_city_candidate(candidate: &str) -> bool {
    let candidate = candidate.trim();
    if candidate.chars().count() < 2 || candidate.chars().any(|c| c.is_ascii_digit()) {
        return false;
    }
    !candidate
        .split(|c: char| c.is_whitespace() || c == '-')
        .any(|word| NON_CITY_KEYWORDS.contains(&word))
}

fn match_city(normalized: &str) -> Option<String> {
    for rule in CITY_RULES.iter() {
        let candidate = match (&rule.extract, &rule.pattern) {
            (Extract::Capture, Some(re)) => re
                .captures(normalized)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string()),
            (Extract::SecondSegment, _) => {
                let parts: Vec<&str> = normalized.split(',').map(str::trim).collect();
                if parts.len() >= 3 {
                    Some(parts[1].to_string())
                } else {
                    None
                }
            }
            (Extract::Capture, None) => None,
        };
        if let Some(city) = candidate.filter(|c| is_city_candidate(c)) {
            debug!("City rule '{}' matched '{}'", rule.name, city);
            return Some(title_case(&city));
        }
    }
    None
}

/// "ростов-на-дону" -> "Ростов-на-Дону".
fn title_case(text: &str) -> String {
    text.split(' ')
        .filter(|w| !w.is_empty())
        .map(|word| {
            word.split('-')
                .map(|part| {
                    if part.chars().count() <= 2 {
                        return part.to_string();
                    }
                    let mut chars = part.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().chain(chars).collect(),
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join("-")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Recovers city, federal subject and federal district from a raw address.
pub fn parse_address(address: &str) -> ParsedAddress {
    let normalized = normalize_address(address);
    let mut parsed = ParsedAddress::unknown();
    if normalized.is_empty() {
        return parsed;
    }

    let subject = match_subject(&normalized);
    if let Some(rule) = subject {
        parsed.federal_subject = rule.subject.to_string();
        parsed.federal_district = rule.district.to_string();
    }

    parsed.city = match match_city(&normalized) {
        Some(city) => city,
        None => match subject {
            Some(rule) if FEDERAL_CITIES.contains(&rule.subject) => rule.subject.to_string(),
            _ => UNKNOWN.to_string(),
        },
    };
    parsed
}
