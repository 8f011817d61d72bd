use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::Coordinates;

/// One attempt to find a driver for a booking.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub tenant_id: Uuid,
    pub pickup: Coordinates,
    pub vehicle_type: Option<String>,
    notified: Vec<NotifiedDriver>,
    pub declined: HashSet<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolution: Resolution,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotifiedDriver {
    pub driver_id: Uuid,
    pub distance_km: f64,
    pub eta_minutes: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Resolution {
    Searching,
    Assigned { driver_id: Uuid },
    Failed { reason: FailureReason },
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    AllDeclined,
    Expired,
}

impl Resolution {
    pub fn name(&self) -> String {
        match self {
            Self::Searching => "searching".into(),
            Self::Assigned { driver_id: _ } => "assigned".into(),
            Self::Failed {
                reason: FailureReason::AllDeclined,
            } => "all_declined".into(),
            Self::Failed {
                reason: FailureReason::Expired,
            } => "expired".into(),
            Self::Cancelled => "cancelled".into(),
        }
    }
}

impl DispatchRequest {
    pub fn new(
        booking_id: Uuid,
        tenant_id: Uuid,
        pickup: Coordinates,
        vehicle_type: Option<String>,
        notified: Vec<NotifiedDriver>,
        now: DateTime<Utc>,
        max_wait: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id,
            tenant_id,
            pickup,
            vehicle_type,
            notified,
            declined: HashSet::new(),
            created_at: now,
            expires_at: now + max_wait,
            resolution: Resolution::Searching,
        }
    }

    /// Drivers notified for this request, in ranking order. Never changes
    /// after creation.
    pub fn notified(&self) -> &[NotifiedDriver] {
        &self.notified
    }

    pub fn notified_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.notified.iter().map(|driver| driver.driver_id)
    }

    pub fn was_notified(&self, driver_id: Uuid) -> bool {
        self.notified.iter().any(|driver| driver.driver_id == driver_id)
    }

    /// Notified and has not declined.
    pub fn is_eligible(&self, driver_id: Uuid) -> bool {
        self.was_notified(driver_id) && !self.declined.contains(&driver_id)
    }

    pub fn remaining(&self) -> usize {
        self.notified_ids()
            .filter(|id| !self.declined.contains(id))
            .count()
    }

    pub fn is_searching(&self) -> bool {
        self.resolution == Resolution::Searching
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn winner(&self) -> Option<Uuid> {
        match self.resolution {
            Resolution::Assigned { driver_id } => Some(driver_id),
            _ => None,
        }
    }
}

/// Parameters of a new dispatch attempt. `radius_km` and `max_wait_secs` fall
/// back to the configured defaults when absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartDispatch {
    pub booking_id: Uuid,
    pub tenant_id: Uuid,
    pub pickup: Coordinates,
    #[serde(default)]
    pub vehicle_type: Option<String>,
    #[serde(default)]
    pub exclude_ids: Vec<Uuid>,
    /// Drivers offered the trip ahead of everybody else.
    #[serde(default)]
    pub preferred_ids: Vec<Uuid>,
    #[serde(default)]
    pub radius_km: Option<f64>,
    #[serde(default)]
    pub max_wait_secs: Option<i64>,
}

impl StartDispatch {
    pub fn new(booking_id: Uuid, tenant_id: Uuid, pickup: Coordinates) -> Self {
        Self {
            booking_id,
            tenant_id,
            pickup,
            vehicle_type: None,
            exclude_ids: vec![],
            preferred_ids: vec![],
            radius_km: None,
            max_wait_secs: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverResponse {
    pub request_id: Uuid,
    pub driver_id: Uuid,
    pub accepted: bool,
    #[serde(default)]
    pub decline_reason: Option<String>,
}

/// Result of `start_dispatch`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Searching {
        request_id: Uuid,
        drivers_notified: usize,
        expires_at: DateTime<Utc>,
    },
    Assigned {
        driver_id: Uuid,
    },
    NoEligibleDrivers,
    AllDeclined,
    Expired,
}

/// Result of feeding one driver reply into the coordinator. Every variant is
/// an ordinary outcome of racing drivers, not an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseOutcome {
    Assigned { driver_id: Uuid },
    Declined { remaining: usize },
    AllDeclined,
    AlreadyAssigned,
    Expired,
    DriverNotEligible,
    DriverUnavailable,
    RequestClosed,
    UnknownRequest,
}

/// Why the store refused to let a driver win (or decline) a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveRejection {
    AlreadyAssigned,
    Expired,
    DriverNotEligible,
    RequestClosed,
    UnknownRequest,
}

impl From<ResolveRejection> for ResponseOutcome {
    fn from(rejection: ResolveRejection) -> Self {
        match rejection {
            ResolveRejection::AlreadyAssigned => Self::AlreadyAssigned,
            ResolveRejection::Expired => Self::Expired,
            ResolveRejection::DriverNotEligible => Self::DriverNotEligible,
            ResolveRejection::RequestClosed => Self::RequestClosed,
            ResolveRejection::UnknownRequest => Self::UnknownRequest,
        }
    }
}

/// Progress of a decline recorded against a live request.
#[derive(Clone, Debug)]
pub enum DeclineProgress {
    Waiting { remaining: usize },
    AllDeclined(DispatchRequest),
}

/// Read model returned by the status query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchStatus {
    pub request_id: Uuid,
    pub booking_id: Uuid,
    pub tenant_id: Uuid,
    pub status: String,
    pub drivers_notified: usize,
    pub drivers_declined: usize,
    pub assigned_driver: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub time_remaining_ms: i64,
}

impl DispatchStatus {
    pub fn of(request: &DispatchRequest, now: DateTime<Utc>) -> Self {
        let time_remaining_ms = match request.is_searching() {
            true => (request.expires_at - now).num_milliseconds().max(0),
            false => 0,
        };

        Self {
            request_id: request.id,
            booking_id: request.booking_id,
            tenant_id: request.tenant_id,
            status: request.resolution.name(),
            drivers_notified: request.notified().len(),
            drivers_declined: request.declined.len(),
            assigned_driver: request.winner(),
            created_at: request.created_at,
            expires_at: request.expires_at,
            time_remaining_ms,
        }
    }
}

/// Running counters of one tenant's dispatch attempts since startup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub total_requests: u64,
    pub successful_assignments: u64,
    pub failed_assignments: u64,
    pub cancelled: u64,
    /// Share of started requests that ended with a driver.
    pub acceptance_rate: f64,
    /// Mean time from start to assignment or failure.
    pub average_search_ms: f64,
}

#[cfg(test)]
fn request_with(drivers: &[Uuid]) -> DispatchRequest {
    let notified = drivers
        .iter()
        .map(|&driver_id| NotifiedDriver {
            driver_id,
            distance_km: 1.0,
            eta_minutes: 2,
        })
        .collect();

    DispatchRequest::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Coordinates::new(48.85, 2.35),
        None,
        notified,
        Utc::now(),
        Duration::seconds(30),
    )
}

#[test]
fn declined_drivers_are_no_longer_eligible() {
    let (d1, d2) = (Uuid::new_v4(), Uuid::new_v4());
    let mut request = request_with(&[d1, d2]);

    assert_eq!(request.remaining(), 2);
    request.declined.insert(d1);

    assert!(request.was_notified(d1));
    assert!(!request.is_eligible(d1));
    assert!(request.is_eligible(d2));
    assert_eq!(request.remaining(), 1);
}

#[test]
fn status_reports_time_remaining_only_while_searching() {
    let mut request = request_with(&[Uuid::new_v4()]);
    let now = request.created_at + Duration::seconds(10);

    let status = DispatchStatus::of(&request, now);
    assert_eq!(status.status, "searching");
    assert_eq!(status.time_remaining_ms, 20_000);

    request.resolution = Resolution::Failed {
        reason: FailureReason::Expired,
    };
    let status = DispatchStatus::of(&request, now);
    assert_eq!(status.status, "expired");
    assert_eq!(status.time_remaining_ms, 0);
}
