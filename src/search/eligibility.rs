use uuid::Uuid;

use crate::entities::{Coordinates, DriverCandidate};
use crate::geo;

/// Keeps the candidates that may be offered a trip from `pickup`.
///
/// A candidate survives when it is available, drives the requested vehicle
/// type (any type when `vehicle_type` is `None`), is not in `exclude_ids`, and
/// has a known position within `max_radius_km` (inclusive) of the pickup.
/// Candidates without a position are dropped since they cannot be ranked by
/// distance. Pool order is preserved.
pub fn filter(
    pickup: Coordinates,
    vehicle_type: Option<&str>,
    max_radius_km: f64,
    exclude_ids: &[Uuid],
    pool: &[DriverCandidate],
) -> Vec<DriverCandidate> {
    debug_assert!(max_radius_km > 0.0, "radius must be positive");

    pool.iter()
        .filter(|driver| driver.available)
        .filter(|driver| match vehicle_type {
            Some(vehicle_type) => driver.vehicle_type == vehicle_type,
            None => true,
        })
        .filter(|driver| !exclude_ids.contains(&driver.id))
        .filter(|driver| match driver.position {
            Some(position) => geo::distance_km(pickup, position) <= max_radius_km,
            None => false,
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::offset_north;

    fn pickup() -> Coordinates {
        Coordinates::new(48.8566, 2.3522)
    }

    fn driver_at(km: f64, vehicle_type: &str) -> DriverCandidate {
        DriverCandidate::new(Uuid::nil(), vehicle_type, Some(offset_north(pickup(), km)))
    }

    #[test]
    fn keeps_drivers_inside_radius() {
        let pool = vec![
            driver_at(1.0, "standard"),
            driver_at(4.0, "standard"),
            driver_at(9.0, "standard"),
        ];

        let eligible = filter(pickup(), Some("standard"), 5.0, &[], &pool);

        assert_eq!(eligible.len(), 2);
        assert_eq!(eligible[0].id, pool[0].id);
        assert_eq!(eligible[1].id, pool[1].id);
    }

    #[test]
    fn drops_unavailable_wrong_type_excluded_and_unlocated() {
        let mut busy = driver_at(1.0, "standard");
        busy.available = false;

        let van = driver_at(1.0, "van");
        let excluded = driver_at(1.0, "standard");
        let unlocated = DriverCandidate::new(Uuid::nil(), "standard", None);
        let keeper = driver_at(2.0, "standard");

        let pool = vec![busy, van, excluded.clone(), unlocated, keeper.clone()];
        let eligible = filter(pickup(), Some("standard"), 5.0, &[excluded.id], &pool);

        assert_eq!(eligible, vec![keeper]);
    }

    #[test]
    fn no_vehicle_type_means_any_type() {
        let pool = vec![driver_at(1.0, "standard"), driver_at(1.5, "van")];

        assert_eq!(filter(pickup(), None, 5.0, &[], &pool).len(), 2);
    }

    #[test]
    fn empty_pool_gives_empty_result() {
        assert!(filter(pickup(), Some("standard"), 5.0, &[], &[]).is_empty());
    }
}
