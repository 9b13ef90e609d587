use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn compare_to(&self, other: &Self) -> Ordering {
        self.latitude
            .partial_cmp(&other.latitude)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                self.longitude
                    .partial_cmp(&other.longitude)
                    .unwrap_or(Ordering::Equal)
            })
    }
}
