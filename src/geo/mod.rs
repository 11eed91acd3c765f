//! Geocoding: query cache, provider cascade and great-circle distance.

mod cache;
mod cascade;
mod distance;

pub use cache::{GeocodeCache, ResolvedPoint, normalize_query};
pub use cascade::{AddressResolver, AddressStatus, GeoResolution};
pub use distance::{EARTH_RADIUS_KM, haversine_km};
