mod booking;
mod dispatch;
mod driver;
mod location;
mod notification;

pub use booking::{Booking, Status as BookingStatus, StatusChange};
pub use dispatch::{
    DeclineProgress, DispatchOutcome, DispatchRequest, DispatchStats, DispatchStatus,
    DriverResponse, FailureReason, NotifiedDriver, Resolution, ResolveRejection,
    ResponseOutcome, StartDispatch,
};
pub use driver::DriverCandidate;
pub use location::Coordinates;
pub use notification::Event;
