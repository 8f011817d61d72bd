use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::Coordinates;

/// Snapshot of a driver taken when a dispatch starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverCandidate {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub position: Option<Coordinates>,
    pub vehicle_type: String,
    pub rating: f64,
    pub available: bool,
}

impl DriverCandidate {
    pub fn new(tenant_id: Uuid, vehicle_type: &str, position: Option<Coordinates>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            position,
            vehicle_type: vehicle_type.into(),
            rating: 5.0,
            available: true,
        }
    }

    pub fn with_rating(mut self, rating: f64) -> Self {
        debug_assert!((0.0..=5.0).contains(&rating));
        self.rating = rating;
        self
    }
}
