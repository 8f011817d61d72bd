//! Per-tenant dispatch counters, kept in memory for the life of the process.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::entities::{DispatchRequest, DispatchStats};

/// How a dispatch request left the live set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settled {
    Assigned,
    Failed,
    Cancelled,
}

#[derive(Debug, Default)]
struct Tally {
    started: u64,
    assigned: u64,
    failed: u64,
    cancelled: u64,
    search_ms: i64,
}

impl Tally {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            total_requests: self.started,
            successful_assignments: self.assigned,
            failed_assignments: self.failed,
            cancelled: self.cancelled,
            acceptance_rate: ratio(self.assigned as f64, self.started),
            average_search_ms: ratio(self.search_ms as f64, self.assigned + self.failed),
        }
    }
}

fn ratio(part: f64, whole: u64) -> f64 {
    match whole {
        0 => 0.0,
        whole => part / whole as f64,
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    tenants: Mutex<HashMap<Uuid, Tally>>,
}

impl Counters {
    pub async fn started(&self, tenant_id: Uuid) {
        self.tenants.lock().await.entry(tenant_id).or_default().started += 1;
    }

    /// Counts each request once; callers only settle requests they moved out
    /// of `Searching` themselves.
    pub async fn settled(&self, request: &DispatchRequest, how: Settled, now: DateTime<Utc>) {
        let search_ms = (now - request.created_at).num_milliseconds().max(0);

        let mut tenants = self.tenants.lock().await;
        let tally = tenants.entry(request.tenant_id).or_default();

        match how {
            Settled::Assigned => {
                tally.assigned += 1;
                tally.search_ms += search_ms;
            }
            Settled::Failed => {
                tally.failed += 1;
                tally.search_ms += search_ms;
            }
            Settled::Cancelled => tally.cancelled += 1,
        }
    }

    pub async fn snapshot(&self, tenant_id: Uuid) -> DispatchStats {
        self.tenants
            .lock()
            .await
            .get(&tenant_id)
            .map(Tally::snapshot)
            .unwrap_or_default()
    }
}

#[tokio::test]
async fn rates_and_averages_cover_finished_searches_only() {
    use crate::entities::Coordinates;
    use chrono::Duration;

    let counters = Counters::default();
    let tenant_id = Uuid::new_v4();
    let start = Utc::now();

    let request = DispatchRequest::new(
        Uuid::new_v4(),
        tenant_id,
        Coordinates::new(48.85, 2.35),
        None,
        vec![],
        start,
        Duration::seconds(30),
    );

    for _ in 0..4 {
        counters.started(tenant_id).await;
    }

    counters
        .settled(&request, Settled::Assigned, start + Duration::seconds(2))
        .await;
    counters
        .settled(&request, Settled::Failed, start + Duration::seconds(4))
        .await;
    counters
        .settled(&request, Settled::Cancelled, start + Duration::seconds(60))
        .await;

    let stats = counters.snapshot(tenant_id).await;

    assert_eq!(stats.total_requests, 4);
    assert_eq!(stats.successful_assignments, 1);
    assert_eq!(stats.failed_assignments, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.acceptance_rate, 0.25);
    assert_eq!(stats.average_search_ms, 3000.0);

    assert_eq!(counters.snapshot(Uuid::new_v4()).await, DispatchStats::default());
}
