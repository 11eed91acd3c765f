//! Address-to-coordinates resolution over the geocoder port.
//!
//! The cascade narrows step by step: full address, city centre, country
//! capital, country search, configured last-resort coordinates. The first
//! step that yields a point wins and is cached.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use super::cache::{GeocodeCache, ResolvedPoint, normalize_query};
use crate::config::GeoConfig;
use crate::domain::{Address, GeoPoint};
use crate::error::StageError;
use crate::ports::GeocoderPort;

/// How precisely an address was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressStatus {
    Exact,
    CityCentre,
    Capital,
    CountryMatch,
    LastResort,
    Unknown,
}

impl AddressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::CityCentre => "city_centre",
            Self::Capital => "capital",
            Self::CountryMatch => "country_match",
            Self::LastResort => "last_resort",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeoResolution {
    pub point: Option<GeoPoint>,
    pub provider: String,
    pub status: AddressStatus,
    pub explanation: String,
}

impl GeoResolution {
    fn unknown(explanation: impl Into<String>) -> Self {
        Self {
            point: None,
            provider: "none".to_string(),
            status: AddressStatus::Unknown,
            explanation: explanation.into(),
        }
    }
}

// Country capitals for the capital-fallback step.
const CAPITALS: &[(&str, f64, f64)] = &[
    ("kazakhstan", 51.1694, 71.4491),
    ("казахстан", 51.1694, 71.4491),
    ("russia", 55.7558, 37.6173),
    ("россия", 55.7558, 37.6173),
    ("uzbekistan", 41.2995, 69.2401),
    ("узбекистан", 41.2995, 69.2401),
    ("kyrgyzstan", 42.8746, 74.5698),
    ("кыргызстан", 42.8746, 74.5698),
    ("azerbaijan", 40.4093, 49.8671),
    ("азербайджан", 40.4093, 49.8671),
    ("georgia", 41.7151, 44.8271),
    ("грузия", 41.7151, 44.8271),
    ("armenia", 40.1872, 44.5152),
    ("армения", 40.1872, 44.5152),
    ("belarus", 53.9006, 27.5590),
    ("беларусь", 53.9006, 27.5590),
    ("moldova", 47.0105, 28.8638),
    ("молдова", 47.0105, 28.8638),
    ("tajikistan", 38.5598, 68.7738),
    ("таджикистан", 38.5598, 68.7738),
    ("turkmenistan", 37.9601, 58.3261),
    ("туркменистан", 37.9601, 58.3261),
    ("ukraine", 50.4501, 30.5234),
    ("украина", 50.4501, 30.5234),
];

fn capital_of(country: &str) -> Option<GeoPoint> {
    let key = country.trim().to_lowercase();
    CAPITALS
        .iter()
        .find(|(name, _, _)| *name == key)
        .map(|(_, lat, lon)| GeoPoint::new(*lat, *lon))
}

fn clean_city(city: &str) -> &str {
    let c = city.trim();
    let c = c.split('/').next().unwrap_or(c);
    c.split('(').next().unwrap_or(c).trim()
}

fn build_query(parts: &[Option<&str>]) -> Option<String> {
    let joined: Vec<&str> = parts
        .iter()
        .filter_map(|p| p.map(str::trim).filter(|s| !s.is_empty()))
        .collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join(", "))
    }
}

pub struct AddressResolver {
    geocoder: Arc<dyn GeocoderPort>,
    cache: GeocodeCache,
    config: GeoConfig,
    last_resort_cursor: AtomicUsize,
}

impl AddressResolver {
    pub fn new(geocoder: Arc<dyn GeocoderPort>, config: GeoConfig) -> Self {
        Self {
            geocoder,
            cache: GeocodeCache::new(),
            config,
            last_resort_cursor: AtomicUsize::new(0),
        }
    }

    pub fn cache(&self) -> &GeocodeCache {
        &self.cache
    }

    /// Forget cached misses; called once per batch.
    pub fn start_batch(&self) {
        self.cache.clear_negatives();
    }

    pub async fn resolve(&self, address: &Address) -> Result<GeoResolution, StageError> {
        if address.is_empty() {
            return Ok(self.exhausted("address is empty"));
        }

        let country = address.country.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let region = address.region.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let city = address
            .city
            .as_deref()
            .map(clean_city)
            .filter(|s| !s.is_empty());
        let street = address.street.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let house = address.house.as_deref().map(str::trim).filter(|s| !s.is_empty());

        // Foreign addresses bypass the cascade and land on the fallback
        // offices when any are configured, however complete the address.
        if let Some(country) = country {
            if !self.config.is_home_country(country) && !self.config.last_resort.is_empty() {
                return Ok(self.exhausted(&format!("foreign address ({country})")));
            }
        }

        // Step 1: full address.
        if street.is_some() {
            if let Some(query) = build_query(&[country, region, city, street, house]) {
                if let Some(hit) = self.lookup(&query).await? {
                    return Ok(GeoResolution {
                        point: Some(hit.point),
                        provider: hit.provider,
                        status: AddressStatus::Exact,
                        explanation: format!("full address resolved: {query}"),
                    });
                }
            }
        }

        // Step 2: city centre, with and without the region.
        if let Some(city) = city {
            for parts in [[country, region, Some(city)], [country, None, Some(city)]] {
                if let Some(query) = build_query(&parts) {
                    if let Some(hit) = self.lookup(&query).await? {
                        return Ok(GeoResolution {
                            point: Some(hit.point),
                            provider: hit.provider,
                            status: AddressStatus::CityCentre,
                            explanation: format!("city centre used: {city}"),
                        });
                    }
                }
            }
        }

        // Step 3: country capital, no vendor call needed.
        if let Some(country) = country {
            if let Some(point) = capital_of(country) {
                return Ok(GeoResolution {
                    point: Some(point),
                    provider: "capital_table".to_string(),
                    status: AddressStatus::Capital,
                    explanation: format!("capital of {country} used"),
                });
            }
        }

        // Step 4: country search for a bare city.
        if country.is_none() {
            if let Some(city) = city {
                for search_country in &self.config.search_countries {
                    let query = format!("{city}, {search_country}");
                    if let Some(hit) = self.lookup(&query).await? {
                        return Ok(GeoResolution {
                            point: Some(hit.point),
                            provider: hit.provider,
                            status: AddressStatus::CountryMatch,
                            explanation: format!(
                                "no country given; {city} found in {search_country}"
                            ),
                        });
                    }
                }
            }
        }

        Ok(self.exhausted("all cascade steps exhausted"))
    }

    /// Cache-through lookup against the geocoder port.
    async fn lookup(&self, query: &str) -> Result<Option<ResolvedPoint>, StageError> {
        let key = normalize_query(query);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }
        debug!(query = %key, "geocode lookup");
        match self.geocoder.geocode(&key).await? {
            Some(hit) => {
                let resolved = ResolvedPoint {
                    point: hit.point,
                    provider: hit.provider,
                };
                self.cache.insert(key, resolved.clone());
                Ok(Some(resolved))
            }
            None => {
                self.cache.insert_negative(key);
                Ok(None)
            }
        }
    }

    fn exhausted(&self, reason: &str) -> GeoResolution {
        if self.config.last_resort.is_empty() {
            return GeoResolution::unknown(reason);
        }
        let idx =
            self.last_resort_cursor.fetch_add(1, Ordering::Relaxed) % self.config.last_resort.len();
        let office = &self.config.last_resort[idx];
        GeoResolution {
            point: Some(GeoPoint::new(office.lat, office.lon)),
            provider: "last_resort".to_string(),
            status: AddressStatus::LastResort,
            explanation: format!("{reason}; routed to {}", office.name),
        }
    }
}
