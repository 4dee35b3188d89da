//! Basic usage example for the timeout manager

use std::sync::Arc;

use timeout_manager::{
    CancellationToken, ChannelDispatcher, Duration, PollerConfig, PollerEvent, SqliteConfig,
    StorageConfig, SystemClock, TimeoutPayload, TimeoutPoller,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let cancel_token = CancellationToken::new();

    // Durable storage in the system temp directory
    let storage = StorageConfig::Sqlite(SqliteConfig {
        path: std::env::temp_dir().join("timeout_manager_demo.db"),
        ..SqliteConfig::default()
    });
    let store = storage.open()?;
    let (dispatcher, mut fired) = ChannelDispatcher::new(100);

    // Create the poller with configuration
    let (poller, mut handle) = TimeoutPoller::new(
        PollerConfig::new("demo_endpoint").with_default_poll_interval(Duration::from_secs(5)),
        store,
        Arc::new(dispatcher),
        Arc::new(SystemClock),
        cancel_token.clone(),
    )?;

    // Spawn the poller task
    let poller_task = tokio::spawn(poller.run());

    // Schedule multiple timeouts
    for (destination, secs) in [("short", 1), ("medium", 2), ("long", 3)] {
        handle
            .schedule_after(Duration::from_secs(secs), TimeoutPayload::to(destination))
            .await?;
    }

    println!("Timeouts scheduled! Waiting for them to fire...");

    let mut fired_count = 0;
    while fired_count < 3 {
        if let Some(record) = fired.recv().await {
            println!("Timeout for '{}' fired!", record.payload.destination);
            fired_count += 1;
        }
    }

    // Demonstrate cancellation
    let id = handle
        .schedule_after(Duration::from_secs(10), TimeoutPayload::to("cancelled"))
        .await?;
    println!("Scheduled a timeout that will be cancelled...");

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel(id).await?;
    println!("Timeout cancelled!");

    while let Ok(event) = handle.try_recv_event() {
        if let PollerEvent::DispatchFailed { id, reason } = event {
            println!("Dispatch of {id} failed: {reason}");
        }
    }

    // Shutdown gracefully
    handle.shutdown();
    poller_task.await?;

    println!("Timeout poller shut down successfully!");
    Ok(())
}
