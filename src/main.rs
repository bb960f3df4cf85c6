use std::sync::Arc;

use clap::Parser;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use improvement_loop::cli::{apply_fast, format_event, format_report, Args, EventFormat};
use improvement_loop::config::{load_from_file, LoopConfig};
use improvement_loop::self_modify::deployment::InMemoryTarget;
use improvement_loop::sim::{reference_metrics, QueuedFeedback, SimulatedHarness, SimulatedMetrics, SimulatedProducer};
use improvement_loop::sources::http::HttpMetricsSource;
use improvement_loop::sources::{FeedbackItem, MetricsSource};
use improvement_loop::{now_ms, Collaborators, ImprovementLoop, LoopEvent, Pipeline};

fn spawn_printer(rx: broadcast::Receiver<LoopEvent>, format: EventFormat) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = BroadcastStream::new(rx);
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    match format {
                        EventFormat::Pretty => println!("{}", format_event(&event)),
                        EventFormat::Json => match serde_json::to_string(&event) {
                            Ok(line) => println!("{line}"),
                            Err(e) => tracing::warn!(error = %e, "could not serialize event"),
                        },
                        EventFormat::Off => {}
                    }
                    if matches!(event, LoopEvent::LoopStopped) {
                        break;
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event printer lagged");
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    improvement_loop::init_tracing()?;

    let mut config = match &args.config {
        Some(path) => load_from_file(path)?,
        None => LoopConfig::default(),
    };
    if args.fast {
        apply_fast(&mut config);
    }

    let reference = reference_metrics();
    let metrics: Arc<dyn MetricsSource> = match &args.metrics_url {
        Some(url) => Arc::new(HttpMetricsSource::builder(url.clone()).build()),
        None => Arc::new(SimulatedMetrics::new(reference, args.seed)),
    };
    let feedback = Arc::new(QueuedFeedback::default());
    for (i, message) in args.feedback.iter().enumerate() {
        feedback.push(FeedbackItem {
            id: format!("cli-{i}"),
            category: None,
            message: message.clone(),
            rating: 0.2,
            submitted_at_ms: now_ms(),
        });
    }

    let pipeline = Pipeline::new(
        config,
        Collaborators {
            metrics,
            producer: Arc::new(SimulatedProducer::new(args.seed.wrapping_add(1))),
            harness: Arc::new(SimulatedHarness::seeded(reference, args.seed.wrapping_add(2))),
            target: Arc::new(InMemoryTarget::new("simulated")),
            feedback,
        },
    );

    #[cfg(feature = "sqlite-log")]
    let pipeline = match &args.history_db {
        Some(path) => {
            use improvement_loop::self_modify::memory::ImprovementHistory;
            use improvement_loop::self_modify::sqlite_log::SqliteHistoryLog;
            let log = SqliteHistoryLog::open(path)?;
            let history = ImprovementHistory::from_records(log.load_all()?).with_sink(Box::new(log));
            pipeline.with_history(history)
        }
        None => pipeline,
    };

    let pipeline = Arc::new(pipeline);
    let printer = spawn_printer(pipeline.subscribe(), args.events);

    let mut lp = ImprovementLoop::new(Arc::clone(&pipeline));
    if args.iterations > 0 {
        lp = lp.with_max_iterations(args.iterations);
    }
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut task = tokio::spawn(lp.run(stop_rx));

    tokio::select! {
        res = &mut task => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, finishing the current iteration");
            let _ = stop_tx.send(true);
            task.await?;
        }
    }
    printer.await?;

    let report = pipeline.report();
    if args.report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", format_report(&report));
    }
    Ok(())
}
