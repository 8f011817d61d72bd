use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{
    driver_mismatch_error, invalid_transition_error, terminal_state_error, Error,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub status: Status,
    pub assigned_driver_id: Option<Uuid>,
    pub price: Option<f64>,
    pub history: Vec<StatusChange>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Dispatching,
    Assigned,
    EnRoute,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
    NoDriverFound,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: Status,
    pub at: DateTime<Utc>,
}

impl Status {
    pub fn name(&self) -> String {
        match self {
            Self::Pending => "pending".into(),
            Self::Dispatching => "dispatching".into(),
            Self::Assigned => "assigned".into(),
            Self::EnRoute => "en_route".into(),
            Self::Arrived => "arrived".into(),
            Self::InProgress => "in_progress".into(),
            Self::Completed => "completed".into(),
            Self::Cancelled => "cancelled".into(),
            Self::NoDriverFound => "no_driver".into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoDriverFound)
    }

    /// Statuses in which a driver is attached to the booking.
    pub fn has_driver(&self) -> bool {
        matches!(
            self,
            Self::Assigned | Self::EnRoute | Self::Arrived | Self::InProgress | Self::Completed
        )
    }

    /// Next step of the driver-reported progression, if any.
    pub fn successor(&self) -> Option<Status> {
        match self {
            Self::Assigned => Some(Self::EnRoute),
            Self::EnRoute => Some(Self::Arrived),
            Self::Arrived => Some(Self::InProgress),
            Self::InProgress => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: Status) -> bool {
        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Self::Cancelled) => true,
            (Self::Pending, Self::Dispatching) => true,
            (Self::Dispatching, Self::Pending) => true,
            (Self::Dispatching, Self::Assigned) => true,
            (Self::Dispatching, Self::NoDriverFound) => true,
            (current, next) => current.successor() == Some(next),
        }
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "dispatching" => Ok(Self::Dispatching),
            "assigned" => Ok(Self::Assigned),
            "en_route" => Ok(Self::EnRoute),
            "arrived" => Ok(Self::Arrived),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "no_driver" => Ok(Self::NoDriverFound),
            _ => Err(crate::error::invalid_input_error("unknown booking status")),
        }
    }
}

impl Booking {
    pub fn new(tenant_id: Uuid, price: Option<f64>) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            tenant_id,
            status: Status::Pending,
            assigned_driver_id: None,
            price,
            history: vec![StatusChange {
                status: Status::Pending,
                at: now,
            }],
        }
    }

    pub fn is_dispatching(&self) -> bool {
        self.status == Status::Dispatching
    }

    fn ensure_transition(&self, next: Status) -> Result<(), Error> {
        if self.status.is_terminal() {
            return Err(terminal_state_error());
        }

        if !self.status.can_transition_to(next) {
            return Err(invalid_transition_error());
        }

        Ok(())
    }

    fn apply(&mut self, next: Status, now: DateTime<Utc>) {
        self.status = next;
        self.history.push(StatusChange {
            status: next,
            at: now,
        });
    }

    /// Checks `Pending -> Dispatching` without applying it.
    pub fn check_start_dispatch(&self) -> Result<(), Error> {
        self.ensure_transition(Status::Dispatching)
    }

    #[tracing::instrument(skip(self), fields(booking_id = %self.id))]
    pub fn start_dispatch(&mut self, now: DateTime<Utc>) -> Result<(), Error> {
        self.ensure_transition(Status::Dispatching)?;
        self.apply(Status::Dispatching, now);
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(booking_id = %self.id))]
    pub fn reset_dispatch(&mut self, now: DateTime<Utc>) -> Result<(), Error> {
        self.ensure_transition(Status::Pending)?;
        self.apply(Status::Pending, now);
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(booking_id = %self.id))]
    pub fn assign_driver(&mut self, driver_id: Uuid, now: DateTime<Utc>) -> Result<(), Error> {
        self.ensure_transition(Status::Assigned)?;
        self.assigned_driver_id = Some(driver_id);
        self.apply(Status::Assigned, now);
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(booking_id = %self.id))]
    pub fn mark_no_driver(&mut self, now: DateTime<Utc>) -> Result<(), Error> {
        self.ensure_transition(Status::NoDriverFound)?;
        self.apply(Status::NoDriverFound, now);
        Ok(())
    }

    /// Driver-reported progress. Returns the driver to release when the booking
    /// reaches `Completed` or `Cancelled` with a driver attached.
    #[tracing::instrument(skip(self), fields(booking_id = %self.id))]
    pub fn advance(
        &mut self,
        driver_id: Uuid,
        next: Status,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, Error> {
        if self.status.is_terminal() {
            return Err(terminal_state_error());
        }

        if !self.status.has_driver() {
            return Err(invalid_transition_error());
        }

        if self.assigned_driver_id != Some(driver_id) {
            return Err(driver_mismatch_error());
        }

        if next != Status::Cancelled && self.status.successor() != Some(next) {
            return Err(invalid_transition_error());
        }

        self.apply(next, now);

        match next {
            Status::Completed | Status::Cancelled => Ok(self.assigned_driver_id),
            _ => Ok(None),
        }
    }

    /// Cancellation by the tenant. Returns the driver to release, if one was
    /// attached.
    #[tracing::instrument(skip(self), fields(booking_id = %self.id))]
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<Option<Uuid>, Error> {
        self.ensure_transition(Status::Cancelled)?;

        let freed_driver = match self.status.has_driver() {
            true => self.assigned_driver_id,
            false => None,
        };

        self.apply(Status::Cancelled, now);

        Ok(freed_driver)
    }
}

#[cfg(test)]
fn assigned_booking(driver_id: Uuid) -> Booking {
    let mut booking = Booking::new(Uuid::new_v4(), Some(42.0));
    booking.start_dispatch(Utc::now()).unwrap();
    booking.assign_driver(driver_id, Utc::now()).unwrap();
    booking
}

#[test]
fn full_lifecycle_releases_driver_on_completion() {
    let driver_id = Uuid::new_v4();
    let mut booking = assigned_booking(driver_id);

    assert_eq!(booking.advance(driver_id, Status::EnRoute, Utc::now()), Ok(None));
    assert_eq!(booking.advance(driver_id, Status::Arrived, Utc::now()), Ok(None));
    assert_eq!(booking.advance(driver_id, Status::InProgress, Utc::now()), Ok(None));
    assert_eq!(
        booking.advance(driver_id, Status::Completed, Utc::now()),
        Ok(Some(driver_id))
    );

    assert_eq!(booking.status, Status::Completed);
    assert_eq!(booking.history.len(), 7);
}

#[test]
fn driver_mismatch_leaves_state_unchanged() {
    let driver_id = Uuid::new_v4();
    let mut booking = assigned_booking(driver_id);

    let err = booking
        .advance(Uuid::new_v4(), Status::EnRoute, Utc::now())
        .unwrap_err();

    assert!(err.is_driver_mismatch_error());
    assert_eq!(booking.status, Status::Assigned);
    assert_eq!(booking.assigned_driver_id, Some(driver_id));
}

#[test]
fn skipping_a_step_is_rejected() {
    let driver_id = Uuid::new_v4();
    let mut booking = assigned_booking(driver_id);

    let err = booking
        .advance(driver_id, Status::InProgress, Utc::now())
        .unwrap_err();

    assert!(err.is_invalid_transition_error());
    assert_eq!(booking.status, Status::Assigned);
}

#[test]
fn terminal_states_reject_everything() {
    let driver_id = Uuid::new_v4();

    let mut completed = assigned_booking(driver_id);
    for next in [Status::EnRoute, Status::Arrived, Status::InProgress, Status::Completed] {
        completed.advance(driver_id, next, Utc::now()).unwrap();
    }
    assert!(completed.cancel(Utc::now()).unwrap_err().is_terminal_state_error());
    assert!(completed
        .advance(driver_id, Status::Cancelled, Utc::now())
        .unwrap_err()
        .is_terminal_state_error());

    let mut no_driver = Booking::new(Uuid::new_v4(), None);
    no_driver.start_dispatch(Utc::now()).unwrap();
    no_driver.mark_no_driver(Utc::now()).unwrap();
    assert!(no_driver
        .start_dispatch(Utc::now())
        .unwrap_err()
        .is_terminal_state_error());
}

#[test]
fn no_driver_found_only_from_dispatching() {
    let mut booking = Booking::new(Uuid::new_v4(), None);
    assert!(booking
        .mark_no_driver(Utc::now())
        .unwrap_err()
        .is_invalid_transition_error());

    let mut assigned = assigned_booking(Uuid::new_v4());
    assert!(assigned.mark_no_driver(Utc::now()).is_err());
}

#[test]
fn cancel_before_assignment_frees_nobody() {
    let mut booking = Booking::new(Uuid::new_v4(), None);
    booking.start_dispatch(Utc::now()).unwrap();

    assert_eq!(booking.cancel(Utc::now()), Ok(None));
    assert_eq!(booking.status, Status::Cancelled);
}

#[test]
fn cancel_after_assignment_frees_driver() {
    let driver_id = Uuid::new_v4();
    let mut booking = assigned_booking(driver_id);
    booking.advance(driver_id, Status::EnRoute, Utc::now()).unwrap();

    assert_eq!(booking.cancel(Utc::now()), Ok(Some(driver_id)));
}

#[test]
fn status_names_round_trip() {
    for status in [
        Status::Pending,
        Status::Dispatching,
        Status::Assigned,
        Status::EnRoute,
        Status::Arrived,
        Status::InProgress,
        Status::Completed,
        Status::Cancelled,
        Status::NoDriverFound,
    ] {
        assert_eq!(status.name().parse::<Status>(), Ok(status));
    }
}
