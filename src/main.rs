use std::io::BufRead;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use oomwatch::enrich::HostCgroups;
use oomwatch::pipeline::record::OomDecision;
use oomwatch::pipeline::transport::SubmitError;
use oomwatch::sinks::{self, KillTally};
use oomwatch::{OomWatcher, WatcherConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    tracing::info!("oomwatch starting");

    // 2. Pipeline
    let config = WatcherConfig::from_env().context("loading configuration")?;
    let source = HostCgroups::new(&config.cgroup_root, &config.proc_root)
        .context("compiling container id patterns")?;
    let watcher = OomWatcher::start(config.clone(), Arc::new(source)).context("starting pipeline")?;

    // 3. Built-in subscribers
    let log_sink = tokio::spawn(sinks::run_log_sink(watcher.subscribe("logger"), config.page_size));
    let tally = Arc::new(Mutex::new(KillTally::new()));
    let tally_sink = tokio::spawn(sinks::run_tally(watcher.subscribe("tally"), Arc::clone(&tally)));
    let reporter_stop = CancellationToken::new();
    let reporter = tokio::spawn(sinks::run_metrics_reporter(
        watcher.metrics_view(),
        Arc::clone(&tally),
        config.metrics_interval(),
        reporter_stop.clone(),
    ));

    // 4. Injector: one JSON decision context per stdin line. The kernel hook
    // adapter feeds the same producer API.
    let mut producer = watcher.producer();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            let decision: OomDecision = match serde_json::from_str(&line) {
                Ok(decision) => decision,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring malformed decision context");
                    continue;
                }
            };
            match producer.submit(&decision) {
                Ok(_) => {}
                Err(SubmitError::Encoding(e)) => tracing::debug!(error = %e, "decision skipped"),
                Err(SubmitError::Overflow) => tracing::debug!("transport full, decision dropped"),
            }
        }
    });

    tracing::info!("oomwatch active. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");

    reporter_stop.cancel();
    if let Err(e) = reporter.await {
        tracing::warn!(error = %e, "metrics reporter ended abnormally");
    }
    let report = watcher.shutdown().await;
    sinks::finish("logger", log_sink).await;
    sinks::finish("tally", tally_sink).await;

    tracing::info!(report = %serde_json::to_string(&report)?, "final counters");
    let tally = tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    tracing::info!(tally = %serde_json::to_string(&*tally)?, "kills by scope");

    Ok(())
}
