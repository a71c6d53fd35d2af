use adjutant::prelude::*;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct SendDigest {
    user_id: u64,
}

#[async_trait]
impl Task for SendDigest {
    const TYPE_TAG: &'static str = "SendDigest";

    async fn execute(&self) -> anyhow::Result<()> {
        println!("sending digest to user {}", self.user_id);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PruneSessions;

#[async_trait]
impl Task for PruneSessions {
    const TYPE_TAG: &'static str = "PruneSessions";

    async fn execute(&self) -> anyhow::Result<()> {
        println!("pruning sessions");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Reads config/default.toml and ADJUTANT__* variables; with neither
    // present this uses the in-memory driver.
    let config = QueueConfig::load()?;
    let payloads = PayloadRegistry::new()
        .register::<SendDigest>()
        .register::<PruneSessions>();
    let context = QueueContext::new(config, payloads);

    // Queue a few jobs, one of them delayed.
    let dispatcher = context.dispatcher(None).await?;
    dispatcher.dispatch(SendDigest { user_id: 1 }).send().await?;
    dispatcher
        .dispatch(SendDigest { user_id: 2 })
        .then(PruneSessions)
        .send()
        .await?;
    dispatcher.dispatch(SendDigest { user_id: 3 }).delay(1).send().await?;

    // Recurring work goes through the scheduler and a timer source.
    let timer = Arc::new(MemoryTimer::new());
    let mut scheduler = context.scheduler(timer.clone()).await?;
    scheduler.job(PruneSessions).every_minute();
    let summary = scheduler.register().await;
    println!("scheduled: {:?}", summary.scheduled);

    let mut worker = context.worker(None).await?;
    let sleep = context.config().worker.sleep().min(Duration::from_millis(200));
    let shutdown = tokio::time::sleep(Duration::from_secs(2));

    // To keep the demo short, run the timer and the worker for two seconds.
    // A real service would wait for tokio::signal::ctrl_c() instead.
    let (_, processed) = tokio::join!(
        timer.run_with_shutdown(
            Duration::from_millis(100),
            tokio::time::sleep(Duration::from_secs(2)),
        ),
        worker.daemon_with_shutdown("default", sleep, shutdown),
    );
    println!("processed {processed} jobs");
    Ok(())
}
