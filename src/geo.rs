//! Great-circle helpers used by the eligibility filter and ranking.

use crate::entities::Coordinates;

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two points, in kilometres.
pub fn distance_km(from: Coordinates, to: Coordinates) -> f64 {
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lng = (to.lng - from.lng).to_radians();

    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Rough driving time in whole minutes at a constant average speed.
pub fn estimate_travel_minutes(distance_km: f64, average_speed_kmh: f64) -> u32 {
    debug_assert!(average_speed_kmh > 0.0);

    ((distance_km / average_speed_kmh) * 60.0).round().max(0.0) as u32
}

/// Rounds a distance to two decimals for notification payloads.
pub fn round_km(distance_km: f64) -> f64 {
    (distance_km * 100.0).round() / 100.0
}

/// Point `distance_km` due north of `origin`. Handy for placing drivers at a
/// known distance in tests and the load simulation.
pub fn offset_north(origin: Coordinates, distance_km: f64) -> Coordinates {
    let d_lat = (distance_km / EARTH_RADIUS_KM).to_degrees();

    Coordinates::new(origin.lat + d_lat, origin.lng)
}

#[test]
fn distance_paris_lyon() {
    let paris = Coordinates::new(48.8566, 2.3522);
    let lyon = Coordinates::new(45.7640, 4.8357);

    let d = distance_km(paris, lyon);
    assert!(d > 385.0 && d < 400.0, "got {}", d);
}

#[test]
fn distance_is_symmetric_and_zero_on_self() {
    let a = Coordinates::new(43.2965, 5.3698);
    let b = Coordinates::new(43.3, 5.4);

    assert_eq!(distance_km(a, a), 0.0);
    assert!((distance_km(a, b) - distance_km(b, a)).abs() < 1e-9);
}

#[test]
fn offset_north_round_trips_through_haversine() {
    let origin = Coordinates::new(48.8566, 2.3522);

    for km in [1.0, 4.0, 9.0] {
        let point = offset_north(origin, km);
        assert!((distance_km(origin, point) - km).abs() < 1e-6);
    }
}

#[test]
fn travel_estimate_uses_average_speed() {
    assert_eq!(estimate_travel_minutes(15.0, 30.0), 30);
    assert_eq!(estimate_travel_minutes(0.0, 30.0), 0);
    assert_eq!(round_km(1.23456), 1.23);
}
