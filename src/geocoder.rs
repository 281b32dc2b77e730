// src/geocoder.rs
//
// HTTP geocoding client (Yandex Geocoder JSON API). One request per address,
// rate limited client-side; the caller supplies the credential.

use crate::credential_pool::Credential;
use crate::settings::Geocoder as GeocoderSettings;
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;
use reqwest::StatusCode;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;

type DefaultDirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Marker of a federal district among province components.
const FEDERAL_DISTRICT_MARKER: &str = "федеральный округ";

/// A resolved address.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
    pub city: Option<String>,
    pub federal_subject: Option<String>,
    pub federal_district: Option<String>,
    pub country_code: Option<String>,
    pub formatted: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    /// The credential hit its quota or rate limit. Rotate and retry.
    #[error("Quota exhausted (status {status:?}): {detail}")]
    QuotaExceeded { status: Option<u16>, detail: String },
    #[error("Address not found")]
    NotFound,
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Cannot decode geocoder response: {0}")]
    Decode(String),
}

impl GeocodeError {
    pub fn is_quota(&self) -> bool {
        matches!(self, GeocodeError::QuotaExceeded { .. })
    }
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str, credential: &Credential) -> Result<GeoLocation, GeocodeError>;
}

pub struct HttpGeocoder {
    client: reqwest::Client,
    base_url: String,
    country_suffix: String,
    lang: String,
    results: u32,
    limiter: DefaultDirectRateLimiter,
}

impl HttpGeocoder {
    pub fn new(settings: &GeocoderSettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        let per_second = NonZeroU32::new(settings.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            country_suffix: settings.country_suffix.clone(),
            lang: settings.lang.clone(),
            results: settings.results.max(1),
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
        })
    }

    fn query_text(&self, address: &str) -> String {
        if self.country_suffix.is_empty() {
            address.to_string()
        } else {
            format!("{}, {}", address, self.country_suffix)
        }
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, address: &str, credential: &Credential) -> Result<GeoLocation, GeocodeError> {
        self.limiter.until_ready().await;

        let query = self.query_text(address);
        let results = self.results.to_string();
        debug!("Geocoding '{}' with {}", query, credential.label);

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("apikey", credential.secret()),
                ("geocode", query.as_str()),
                ("format", "json"),
                ("results", results.as_str()),
                ("lang", self.lang.as_str()),
            ])
            .send()
            .await
            // Drop the URL from the error, it carries the api key
            .map_err(|e| GeocodeError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GeocodeError::Transport(e.without_url().to_string()))?;

        if status == StatusCode::FORBIDDEN
            || status == StatusCode::TOO_MANY_REQUESTS
            || (!status.is_success() && mentions_limit(&body))
        {
            return Err(GeocodeError::QuotaExceeded {
                status: Some(status.as_u16()),
                detail: truncate(&body, 200),
            });
        }
        if !status.is_success() {
            return Err(GeocodeError::Http {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        parse_response(&body)
    }
}

fn mentions_limit(body: &str) -> bool {
    body.to_lowercase().contains("limit")
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[derive(Debug, Deserialize)]
struct Envelope {
    response: Option<ResponseBody>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    #[serde(rename = "GeoObjectCollection")]
    collection: GeoObjectCollection,
}

#[derive(Debug, Deserialize)]
struct GeoObjectCollection {
    #[serde(rename = "metaDataProperty", default)]
    meta: Option<CollectionMeta>,
    #[serde(rename = "featureMember", default)]
    members: Vec<FeatureMember>,
}

#[derive(Debug, Deserialize)]
struct CollectionMeta {
    #[serde(rename = "GeocoderResponseMetaData")]
    response_meta: ResponseMeta,
}

#[derive(Debug, Deserialize)]
struct ResponseMeta {
    #[serde(default)]
    found: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FeatureMember {
    #[serde(rename = "GeoObject")]
    geo_object: GeoObject,
}

#[derive(Debug, Deserialize)]
struct GeoObject {
    #[serde(rename = "metaDataProperty")]
    meta: GeoObjectMeta,
    #[serde(rename = "Point")]
    point: Point,
}

#[derive(Debug, Deserialize)]
struct GeoObjectMeta {
    #[serde(rename = "GeocoderMetaData")]
    geocoder: GeocoderMetaData,
}

#[derive(Debug, Deserialize)]
struct GeocoderMetaData {
    #[serde(rename = "Address", default)]
    address: Option<AddressData>,
}

#[derive(Debug, Deserialize)]
struct AddressData {
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    formatted: Option<String>,
    #[serde(rename = "Components", default)]
    components: Vec<Component>,
}

#[derive(Debug, Deserialize)]
struct Component {
    kind: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Point {
    pos: String,
}

fn found_count(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parses a 2xx geocoder body into the first matched location.
pub(crate) fn parse_response(body: &str) -> Result<GeoLocation, GeocodeError> {
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| GeocodeError::Decode(e.to_string()))?;

    let Some(response) = envelope.response else {
        // Some quota errors arrive with a 200 and an error object
        let detail = envelope
            .message
            .or_else(|| envelope.error.map(|e| e.to_string()))
            .unwrap_or_default();
        if mentions_limit(&detail) {
            return Err(GeocodeError::QuotaExceeded { status: None, detail });
        }
        return Err(GeocodeError::Decode(format!("missing 'response': {}", detail)));
    };

    let collection = response.collection;
    let found = collection
        .meta
        .as_ref()
        .and_then(|m| m.response_meta.found.as_ref())
        .and_then(found_count);
    if found == Some(0) {
        return Err(GeocodeError::NotFound);
    }
    let Some(member) = collection.members.into_iter().next() else {
        return Err(GeocodeError::NotFound);
    };

    let geo = member.geo_object;
    let (lon, lat) = parse_pos(&geo.point.pos)?;

    let mut location = GeoLocation {
        lat,
        lon,
        city: None,
        federal_subject: None,
        federal_district: None,
        country_code: None,
        formatted: None,
    };

    if let Some(address) = geo.meta.geocoder.address {
        location.country_code = address.country_code;
        location.formatted = address.formatted;
        for component in address.components {
            match component.kind.as_str() {
                "province" if component.name.to_lowercase().contains(FEDERAL_DISTRICT_MARKER) => {
                    location.federal_district.get_or_insert(component.name);
                }
                // The most specific province wins (district first, then subject)
                "province" => location.federal_subject = Some(component.name),
                "locality" => {
                    location.city.get_or_insert(component.name);
                }
                _ => {}
            }
        }
    }

    Ok(location)
}

/// `"lon lat"` as sent in `Point.pos`.
fn parse_pos(pos: &str) -> Result<(f64, f64), GeocodeError> {
    let mut parts = pos.split_whitespace().map(str::parse::<f64>);
    match (parts.next(), parts.next()) {
        (Some(Ok(lon)), Some(Ok(lat))) => Ok((lon, lat)),
        _ => Err(GeocodeError::Decode(format!("bad Point.pos '{}'", pos))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOSCOW: &str = r#"{
      "response": {
        "GeoObjectCollection": {
          "metaDataProperty": {"GeocoderResponseMetaData": {"request": "Тверская 1", "found": "2", "results": "1"}},
          "featureMember": [{
            "GeoObject": {
              "metaDataProperty": {"GeocoderMetaData": {
                "kind": "house",
                "text": "Россия, Москва, Тверская улица, 1",
                "Address": {
                  "country_code": "RU",
                  "formatted": "Россия, Москва, Тверская улица, 1",
                  "Components": [
                    {"kind": "country", "name": "Россия"},
                    {"kind": "province", "name": "Центральный федеральный округ"},
                    {"kind": "province", "name": "Москва"},
                    {"kind": "locality", "name": "Москва"},
                    {"kind": "street", "name": "Тверская улица"},
                    {"kind": "house", "name": "1"}
                  ]
                }
              }},
              "Point": {"pos": "37.611347 55.757017"}
            }
          }]
        }
      }
    }"#;

    #[test]
    fn test_parse_full_match() {
        let loc = parse_response(MOSCOW).unwrap();
        assert_eq!(loc.lon, 37.611347);
        assert_eq!(loc.lat, 55.757017);
        assert_eq!(loc.city.as_deref(), Some("Москва"));
        assert_eq!(loc.federal_subject.as_deref(), Some("Москва"));
        assert_eq!(loc.federal_district.as_deref(), Some("Центральный федеральный округ"));
        assert_eq!(loc.country_code.as_deref(), Some("RU"));
    }

    #[test]
    fn test_found_zero_is_not_found() {
        let body = r#"{"response":{"GeoObjectCollection":{
            "metaDataProperty":{"GeocoderResponseMetaData":{"found":"0"}},
            "featureMember":[]}}}"#;
        assert!(matches!(parse_response(body), Err(GeocodeError::NotFound)));

        let numeric = r#"{"response":{"GeoObjectCollection":{
            "metaDataProperty":{"GeocoderResponseMetaData":{"found":0}}}}}"#;
        assert!(matches!(parse_response(numeric), Err(GeocodeError::NotFound)));
    }

    #[test]
    fn test_empty_feature_list_is_not_found() {
        let body = r#"{"response":{"GeoObjectCollection":{"featureMember":[]}}}"#;
        assert!(matches!(parse_response(body), Err(GeocodeError::NotFound)));
    }

    #[test]
    fn test_limit_in_payload_is_quota() {
        let body = r#"{"statusCode":200,"error":"Forbidden","message":"Limit is exceeded"}"#;
        assert!(parse_response(body).unwrap_err().is_quota());
    }

    #[test]
    fn test_garbage_is_decode_error() {
        assert!(matches!(parse_response("<html>"), Err(GeocodeError::Decode(_))));
        assert!(matches!(parse_pos("37.6"), Err(GeocodeError::Decode(_))));
    }
}
