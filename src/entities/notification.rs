use serde::{Deserialize, Serialize};

/// Real-time events pushed to drivers and tenant admin channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    #[serde(rename = "booking:dispatch_request")]
    DispatchRequest,
    #[serde(rename = "booking:taken")]
    Taken,
    #[serde(rename = "booking:assigned")]
    Assigned,
    #[serde(rename = "booking:status_changed")]
    StatusChanged,
    #[serde(rename = "dispatch:started")]
    DispatchStarted,
    #[serde(rename = "dispatch:completed")]
    DispatchCompleted,
    #[serde(rename = "dispatch:failed")]
    DispatchFailed,
    #[serde(rename = "dispatch:cancelled")]
    DispatchCancelled,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DispatchRequest => "booking:dispatch_request",
            Self::Taken => "booking:taken",
            Self::Assigned => "booking:assigned",
            Self::StatusChanged => "booking:status_changed",
            Self::DispatchStarted => "dispatch:started",
            Self::DispatchCompleted => "dispatch:completed",
            Self::DispatchFailed => "dispatch:failed",
            Self::DispatchCancelled => "dispatch:cancelled",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[test]
fn serialized_name_matches_the_channel_name() {
    for event in [Event::DispatchRequest, Event::StatusChanged, Event::DispatchCancelled] {
        assert_eq!(serde_json::to_value(event).unwrap(), event.name());
        assert_eq!(
            serde_json::from_value::<Event>(serde_json::json!(event.name())).unwrap(),
            event
        );
    }
}
