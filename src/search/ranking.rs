use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Coordinates, DriverCandidate};
use crate::error::{invalid_input_error, Error};
use crate::geo;

const BALANCED_PROXIMITY_WEIGHT: f64 = 0.7;
const BALANCED_RATING_WEIGHT: f64 = 0.3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Nearest,
    Rating,
    Balanced,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Rating => "rating",
            Self::Balanced => "balanced",
        }
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "rating" => Ok(Self::Rating),
            "balanced" => Ok(Self::Balanced),
            _ => Err(invalid_input_error(
                "assignment strategy must be one of nearest, rating, balanced",
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RankedDriver {
    pub candidate: DriverCandidate,
    pub distance_km: f64,
}

impl RankedDriver {
    pub fn id(&self) -> Uuid {
        self.candidate.id
    }

    pub fn balanced_score(&self) -> f64 {
        BALANCED_PROXIMITY_WEIGHT * (1.0 / (self.distance_km + 1.0))
            + BALANCED_RATING_WEIGHT * (self.candidate.rating / 5.0)
    }
}

/// Orders candidates by `strategy`. Ties are always broken by ascending
/// driver id so identical inputs give identical output.
///
/// Candidates without a position rank as infinitely far away.
pub fn rank(
    strategy: Strategy,
    pickup: Coordinates,
    candidates: &[DriverCandidate],
) -> Vec<RankedDriver> {
    let mut ranked: Vec<RankedDriver> = candidates
        .iter()
        .map(|candidate| RankedDriver {
            distance_km: candidate
                .position
                .map(|position| geo::distance_km(pickup, position))
                .unwrap_or(f64::INFINITY),
            candidate: candidate.clone(),
        })
        .collect();

    ranked.sort_by(|a, b| compare(strategy, a, b).then_with(|| a.id().cmp(&b.id())));

    ranked
}

fn compare(strategy: Strategy, a: &RankedDriver, b: &RankedDriver) -> Ordering {
    match strategy {
        Strategy::Nearest => a.distance_km.total_cmp(&b.distance_km),
        Strategy::Rating => b.candidate.rating.total_cmp(&a.candidate.rating),
        Strategy::Balanced => b.balanced_score().total_cmp(&a.balanced_score()),
    }
}

/// Moves preferred drivers ahead of the rest, keeping the ranking order
/// within each group.
pub fn prioritize(preferred_ids: &[Uuid], ranked: Vec<RankedDriver>) -> Vec<RankedDriver> {
    if preferred_ids.is_empty() {
        return ranked;
    }

    let (mut preferred, others): (Vec<_>, Vec<_>) = ranked
        .into_iter()
        .partition(|driver| preferred_ids.contains(&driver.id()));

    preferred.extend(others);
    preferred
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::offset_north;

    fn pickup() -> Coordinates {
        Coordinates::new(48.8566, 2.3522)
    }

    fn driver(id: u128, km: f64, rating: f64) -> DriverCandidate {
        let mut driver = DriverCandidate::new(Uuid::nil(), "standard", Some(offset_north(pickup(), km)))
            .with_rating(rating);
        driver.id = Uuid::from_u128(id);
        driver
    }

    fn ids(ranked: &[RankedDriver]) -> Vec<u128> {
        ranked.iter().map(|driver| driver.id().as_u128()).collect()
    }

    #[test]
    fn nearest_orders_by_distance() {
        let candidates = vec![driver(1, 4.0, 5.0), driver(2, 1.0, 3.0), driver(3, 2.5, 4.0)];

        assert_eq!(ids(&rank(Strategy::Nearest, pickup(), &candidates)), vec![2, 3, 1]);
    }

    #[test]
    fn rating_orders_by_rating_descending() {
        let candidates = vec![driver(1, 4.0, 4.2), driver(2, 1.0, 3.0), driver(3, 2.5, 4.9)];

        assert_eq!(ids(&rank(Strategy::Rating, pickup(), &candidates)), vec![3, 1, 2]);
    }

    #[test]
    fn balanced_mixes_distance_and_rating() {
        // 0.7/(1+1) + 0.3*3/5 = 0.53 vs 0.7/(0.5+1) + 0.3*1/5 = 0.5267
        let candidates = vec![driver(1, 0.5, 1.0), driver(2, 1.0, 3.0)];

        assert_eq!(ids(&rank(Strategy::Balanced, pickup(), &candidates)), vec![2, 1]);
    }

    #[test]
    fn ties_break_on_id() {
        let candidates = vec![driver(9, 2.0, 4.0), driver(3, 2.0, 4.0), driver(5, 2.0, 4.0)];

        for strategy in [Strategy::Nearest, Strategy::Rating, Strategy::Balanced] {
            assert_eq!(ids(&rank(strategy, pickup(), &candidates)), vec![3, 5, 9]);
        }
    }

    #[test]
    fn ranking_is_deterministic() {
        let candidates: Vec<_> = (0..20)
            .map(|i| driver(100 - i, (i % 4) as f64 + 0.5, 3.0 + (i % 3) as f64 * 0.5))
            .collect();

        let first = rank(Strategy::Nearest, pickup(), &candidates);
        let second = rank(Strategy::Nearest, pickup(), &candidates);

        assert_eq!(first, second);
    }

    #[test]
    fn preferred_drivers_go_first() {
        let candidates = vec![driver(1, 1.0, 5.0), driver(2, 2.0, 5.0), driver(3, 3.0, 5.0)];
        let ranked = rank(Strategy::Nearest, pickup(), &candidates);

        let prioritized = prioritize(&[Uuid::from_u128(3)], ranked);

        assert_eq!(ids(&prioritized), vec![3, 1, 2]);
    }

    #[test]
    fn parses_strategy_names() {
        assert_eq!("Balanced".parse::<Strategy>(), Ok(Strategy::Balanced));
        assert_eq!(" nearest ".parse::<Strategy>(), Ok(Strategy::Nearest));
        assert!("queue".parse::<Strategy>().is_err());
    }
}
