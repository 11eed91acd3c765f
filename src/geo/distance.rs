use crate::domain::GeoPoint;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two WGS84 points, km (Haversine).
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_KM * 2.0 * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASTANA: GeoPoint = GeoPoint {
        lat: 51.1694,
        lon: 71.4491,
    };
    const ALMATY: GeoPoint = GeoPoint {
        lat: 43.2220,
        lon: 76.8512,
    };

    #[test]
    fn test_zero_distance() {
        assert!(haversine_km(ASTANA, ASTANA) < 1e-9);
    }

    #[test]
    fn test_known_distance() {
        let d = haversine_km(ASTANA, ALMATY);
        assert!((940.0..990.0).contains(&d), "got {d}");
    }

    #[test]
    fn test_symmetry() {
        let ab = haversine_km(ASTANA, ALMATY);
        let ba = haversine_km(ALMATY, ASTANA);
        assert!((ab - ba).abs() < 1e-9);
    }
}
