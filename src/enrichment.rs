// src/enrichment.rs
//
// Geo enrichment of (chain, address, date) tuples:
//   select pending (anti-join) -> re-check -> geocode with credential rotation
//   -> heuristic fallback -> sales aggregate + store profile -> insert if absent
// Addresses are processed strictly one after another.

use crate::address_parser::{self, UNKNOWN};
use crate::credential_pool::{CredentialPool, CredentialUsage};
use crate::error::{StoreError, SyncError};
use crate::geocoder::{GeoLocation, Geocoder};
use crate::metrics;
use crate::progress;
use crate::settings::Settings;
use crate::store::{EnrichmentStore, GeoSource, PendingStore, StoreCharacteristic};
use crate::store_profiles::{self, AreaEstimator};
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    pub selection_limit: usize,
    /// Geocoding request budget for one run
    pub max_requests: Option<u64>,
    pub pause: Duration,
    /// Geocoder results outside this country fall back to the heuristic parser
    pub country_code: String,
    pub random_seed: Option<u64>,
    pub show_progress: bool,
    pub create_table: bool,
}

impl EnrichmentConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            selection_limit: settings.enrichment.selection_limit,
            max_requests: settings.enrichment.max_requests,
            pause: Duration::from_millis(settings.enrichment.pause_ms),
            country_code: settings.enrichment.country_code.clone(),
            random_seed: settings.enrichment.random_seed,
            show_progress: settings.enrichment.show_progress,
            create_table: settings.sink.create_table,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnrichmentStats {
    pub fetched: u64,
    pub processed: u64,
    pub saved: u64,
    pub skipped_existing: u64,
    pub errors: u64,
    pub api_requests: u64,
    pub geocoded: u64,
    pub heuristic: u64,
    /// Every credential reported quota exhaustion
    pub limit_hit: bool,
    /// `max_requests` was reached
    pub budget_reached: bool,
    pub credentials: Vec<CredentialUsage>,
    pub elapsed: Duration,
}

/// Outcome of geocoding one address.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Geocoded {
        location: GeoLocation,
        /// Label of the credential that answered
        credential: String,
    },
    /// Not geocodable right now (no credentials, not found, transport error...)
    Fallback { reason: String },
    PoolExhausted,
    BudgetReached,
}

#[derive(Debug, Clone, PartialEq)]
struct Geography {
    city: String,
    federal_subject: String,
    federal_district: String,
    lat: f64,
    lon: f64,
    source: GeoSource,
}

impl Geography {
    fn heuristic(address: &str) -> Self {
        let parsed = address_parser::parse_address(address);
        Self {
            city: parsed.city,
            federal_subject: parsed.federal_subject,
            federal_district: parsed.federal_district,
            lat: 0.0,
            lon: 0.0,
            source: GeoSource::Heuristic,
        }
    }

    /// Geocoder answer, with gaps filled from the subject table and the parser.
    fn from_location(location: GeoLocation, address: &str) -> Self {
        let mut parsed = None;
        let mut parse = || {
            parsed
                .get_or_insert_with(|| address_parser::parse_address(address))
                .clone()
        };

        let federal_subject = match location.federal_subject {
            Some(subject) => subject,
            None => parse().federal_subject,
        };
        let federal_district = match location.federal_district {
            Some(district) => district,
            None => match address_parser::district_for_subject(&federal_subject) {
                Some(district) => district.to_string(),
                None => parse().federal_district,
            },
        };
        let city = match location.city {
            Some(city) => city,
            None => parse().city,
        };

        Self {
            city,
            federal_subject,
            federal_district,
            lat: location.lat,
            lon: location.lon,
            source: GeoSource::Geocoder,
        }
    }
}

enum Step {
    Continue,
    Stop,
}

pub struct GeoEnrichmentEngine<E: EnrichmentStore + ?Sized, G: Geocoder + ?Sized> {
    store: Arc<E>,
    geocoder: Arc<G>,
    pool: CredentialPool,
    config: EnrichmentConfig,
    requests: u64,
}

impl<E: EnrichmentStore + ?Sized, G: Geocoder + ?Sized> GeoEnrichmentEngine<E, G> {
    pub fn new(store: Arc<E>, geocoder: Arc<G>, pool: CredentialPool, config: EnrichmentConfig) -> Self {
        Self {
            store,
            geocoder,
            pool,
            config,
            requests: 0,
        }
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    /// Geocoding requests sent so far by this engine.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Enriches up to `selection_limit` pending tuples.
    ///
    /// Quota exhaustion and the request budget end the run early without an
    /// error. Per-address store failures are counted; an unreachable store
    /// aborts the run.
    pub async fn enrich(&mut self) -> Result<EnrichmentStats, SyncError> {
        let started = Instant::now();
        let mut stats = EnrichmentStats::default();

        if self.config.create_table {
            self.store.ensure_table().await?;
        }

        let pending = self.store.select_pending(self.config.selection_limit).await?;
        stats.fetched = pending.len() as u64;
        if pending.is_empty() {
            info!("✅ No stores pending enrichment");
            stats.credentials = self.pool.usage();
            stats.elapsed = started.elapsed();
            return Ok(stats);
        }
        info!(
            "🌍 Enriching {} stores with {} geocoder credentials",
            pending.len(),
            self.pool.len()
        );
        if self.pool.is_empty() {
            warn!("⚠️ No geocoder credentials configured, using address heuristics only");
        }

        let mut estimator = AreaEstimator::new(self.config.random_seed);
        let pb = progress::create_progress_bar(
            pending.len() as u64,
            "Enriching stores",
            self.config.show_progress,
        );

        for item in &pending {
            let requests_before = self.requests;
            match self.process(item, &mut estimator, &mut stats).await {
                Ok(Step::Continue) => stats.processed += 1,
                Ok(Step::Stop) => break,
                Err(e) if e.is_unavailable() => {
                    pb.finish_and_clear();
                    return Err(e.into());
                }
                Err(e) => {
                    stats.processed += 1;
                    stats.errors += 1;
                    warn!("⚠️ Failed to enrich {}: {}", item.key, e);
                }
            }

            stats.api_requests = self.requests;
            pb.inc(1);
            pb.set_message(progress::enrichment_message(stats.saved, stats.errors, stats.api_requests));

            if self.requests > requests_before && !self.config.pause.is_zero() {
                tokio::time::sleep(self.config.pause).await;
            }
        }
        pb.finish_and_clear();

        stats.api_requests = self.requests;
        stats.credentials = self.pool.usage();
        stats.elapsed = started.elapsed();

        if stats.limit_hit {
            warn!("🔑 Geocoder quota exhausted on every credential, stopping early");
        }
        if stats.budget_reached {
            info!("Request budget of {:?} reached, stopping early", self.config.max_requests);
        }
        info!(
            "✅ Enrichment done: saved {} ({} geocoded, {} heuristic), skipped {}, errors {}, requests {}",
            stats.saved, stats.geocoded, stats.heuristic, stats.skipped_existing, stats.errors, stats.api_requests
        );
        for usage in &stats.credentials {
            debug!(
                "🔑 {}: {} requests, {} successes, {} quota hits{}",
                usage.label,
                usage.requests,
                usage.successes,
                usage.quota_hits,
                if usage.exhausted { ", exhausted" } else { "" }
            );
        }
        Ok(stats)
    }

    async fn process(
        &mut self,
        item: &PendingStore,
        estimator: &mut AreaEstimator,
        stats: &mut EnrichmentStats,
    ) -> Result<Step, StoreError> {
        let key = &item.key;
        if self.store.exists(key).await? {
            debug!("{} already enriched", key);
            stats.skipped_existing += 1;
            return Ok(Step::Continue);
        }

        let geography = match self.resolve(&key.address).await {
            Resolution::Geocoded { location, credential } => {
                if self.in_scope(&location) {
                    debug!("Geocoded '{}' with {}", key.address, credential);
                    Geography::from_location(location, &key.address)
                } else {
                    debug!(
                        "'{}' resolved outside {} ({:?}), using heuristics",
                        key.address, self.config.country_code, location.country_code
                    );
                    Geography::heuristic(&key.address)
                }
            }
            Resolution::Fallback { reason } => {
                debug!("Heuristic geography for '{}': {}", key.address, reason);
                Geography::heuristic(&key.address)
            }
            Resolution::PoolExhausted => {
                // Left unsaved so a later run geocodes it properly
                stats.limit_hit = true;
                return Ok(Step::Stop);
            }
            Resolution::BudgetReached => {
                stats.budget_reached = true;
                return Ok(Step::Stop);
            }
        };

        let sales = self.store.sales_aggregate(key).await?.unwrap_or_default();

        let profile = store_profiles::resolve_profile(&key.retail_chain, &item.store_format, &key.address);
        let area_m2 = match self.store.source_area(key).await {
            Ok(Some(area)) => area,
            Ok(None) => estimator.estimate(profile.area_range),
            Err(e) if e.is_unavailable() => return Err(e),
            Err(e) => {
                warn!("Cannot read source area for {}: {}, estimating", key, e);
                estimator.estimate(profile.area_range)
            }
        };

        let record = StoreCharacteristic {
            key: key.clone(),
            store_format: item.store_format.clone(),
            store_type: profile.store_type,
            area_m2,
            has_alcohol_department: profile.has_alcohol_department,
            has_snacks: profile.has_snacks,
            sales,
            city: non_empty(geography.city),
            federal_subject: non_empty(geography.federal_subject),
            federal_district: non_empty(geography.federal_district),
            lat: geography.lat,
            lon: geography.lon,
            geo_source: geography.source,
            created_at: Utc::now().naive_utc(),
        };

        if self.store.insert_if_absent(&record).await? {
            stats.saved += 1;
            match record.geo_source {
                GeoSource::Geocoder => stats.geocoded += 1,
                GeoSource::Heuristic => stats.heuristic += 1,
            }
            metrics::increment_records_saved(record.geo_source.as_str());
            debug!("Saved {} ({}, {})", key, record.city, record.geo_source.as_str());
        } else {
            debug!("{} was inserted concurrently", key);
            stats.skipped_existing += 1;
        }
        Ok(Step::Continue)
    }

    /// Geocodes one address, rotating credentials on quota responses.
    ///
    /// At most `2 × pool size` attempts; any non-quota failure falls back
    /// immediately without rotating.
    pub async fn resolve(&mut self, address: &str) -> Resolution {
        if self.pool.is_empty() {
            return Resolution::Fallback {
                reason: "no credentials configured".to_string(),
            };
        }

        let max_attempts = 2 * self.pool.len();
        for attempt in 1..=max_attempts {
            if let Some(max) = self.config.max_requests {
                if self.requests >= max {
                    return Resolution::BudgetReached;
                }
            }
            let Some(credential) = self.pool.current().cloned() else {
                return Resolution::PoolExhausted;
            };

            self.requests += 1;
            self.pool.record_request(&credential);
            metrics::increment_geocoder_request();

            match self.geocoder.geocode(address, &credential).await {
                Ok(location) => {
                    self.pool.record_success(&credential);
                    return Resolution::Geocoded {
                        location,
                        credential: credential.label,
                    };
                }
                Err(e) if e.is_quota() => {
                    debug!("Attempt {}/{} with {}: {}", attempt, max_attempts, credential.label, e);
                    metrics::increment_quota_exhausted(&credential.label);
                    self.pool.mark_exhausted(&credential);
                    if !self.pool.rotate() {
                        return Resolution::PoolExhausted;
                    }
                }
                Err(e) => {
                    return Resolution::Fallback { reason: e.to_string() };
                }
            }
        }

        Resolution::Fallback {
            reason: format!("no answer after {} attempts", max_attempts),
        }
    }

    fn in_scope(&self, location: &GeoLocation) -> bool {
        if self.config.country_code.is_empty() {
            return true;
        }
        location
            .country_code
            .as_deref()
            .map_or(true, |cc| cc.eq_ignore_ascii_case(&self.config.country_code))
    }

    /// Recomputes sales of records still at zero.
    pub async fn refresh_sales(&self) -> Result<u64, SyncError> {
        let updated = self.store.refresh_sales().await?;
        info!("✅ Refreshed sales for {} store records", updated);
        Ok(updated)
    }
}

fn non_empty(value: String) -> String {
    if value.trim().is_empty() {
        UNKNOWN.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> GeoLocation {
        GeoLocation {
            lat: 55.75,
            lon: 37.61,
            city: None,
            federal_subject: Some("Москва".to_string()),
            federal_district: None,
            country_code: Some("RU".to_string()),
            formatted: None,
        }
    }

    #[test]
    fn test_geography_fills_district_from_subject() {
        let geo = Geography::from_location(location(), "г. Москва, ул. Тверская, 1");
        assert_eq!(geo.federal_district, "Центральный федеральный округ");
        assert_eq!(geo.city, "Москва");
        assert_eq!(geo.source, GeoSource::Geocoder);
        assert_eq!(geo.lat, 55.75);
    }

    #[test]
    fn test_heuristic_geography_has_zero_coordinates() {
        let geo = Geography::heuristic("Свердловская область, Екатеринбург, улица Малышева, 5");
        assert_eq!(geo.city, "Екатеринбург");
        assert_eq!(geo.lat, 0.0);
        assert_eq!(geo.lon, 0.0);
        assert_eq!(geo.source, GeoSource::Heuristic);
    }

    #[test]
    fn test_non_empty_uses_sentinel() {
        assert_eq!(non_empty("  ".to_string()), UNKNOWN);
        assert_eq!(non_empty("Казань".to_string()), "Казань");
    }
}
