use std::sync::Arc;

use tokio::sync::watch;

use dispatch_engine::clock::{Clock, SystemClock};
use dispatch_engine::config::Config;
use dispatch_engine::engine::{sweeper, Collaborators, Engine};
use dispatch_engine::error::{upstream_error, Error};
use dispatch_engine::external::memory::{MemoryBookingStore, MemoryDriverPool, RecordingGateway};
use dispatch_engine::server;
use dispatch_engine::simulation::{Executor, Settings};
use dispatch_engine::store::InMemoryRequestStore;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryRequestStore::new(clock.clone()));
    let pool = Arc::new(MemoryDriverPool::new());
    let bookings = Arc::new(MemoryBookingStore::new());

    let collaborators = Collaborators {
        drivers: pool.clone(),
        driver_status: pool.clone(),
        bookings: bookings.clone(),
        notifier: Arc::new(RecordingGateway::new()),
    };

    let engine = Arc::new(Engine::new(config, clock, store.clone(), collaborators)?);

    let (stop, stopped) = watch::channel(false);
    let sweeper = sweeper::spawn(engine.clone(), stopped);

    match std::env::args().nth(1).as_deref() {
        Some("simulate") => {
            let executor = Executor::new(engine, store, pool, bookings, Settings::default());
            executor.run().await?;
        }
        _ => {
            let addr = server::bind_addr()?;
            let shutdown = async {
                tokio::signal::ctrl_c().await.ok();
            };

            server::serve(engine, addr, shutdown).await?;
        }
    }

    stop.send(true).ok();
    sweeper.await.map_err(upstream_error)?;

    Ok(())
}
