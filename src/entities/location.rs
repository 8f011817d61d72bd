use serde::{Deserialize, Serialize};

use crate::error::{invalid_input_error, Error};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Rejects NaN and out-of-range values before any dispatch state is touched.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(invalid_input_error("latitude must be within [-90, 90]"));
        }

        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(invalid_input_error("longitude must be within [-180, 180]"));
        }

        Ok(())
    }
}

#[test]
fn validate_rejects_out_of_range() {
    assert!(Coordinates::new(48.85, 2.35).validate().is_ok());
    assert!(Coordinates::new(91.0, 2.35).validate().is_err());
    assert!(Coordinates::new(48.85, -180.5).validate().is_err());
    assert!(Coordinates::new(f64::NAN, 0.0).validate().is_err());
}
