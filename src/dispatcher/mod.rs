//! The dispatch loop: stdin in, bounded parallel fetches, stdout out.
//!
//! One task per URL under a global concurrency gate; finished reports are
//! handed to a single writer task over a bounded channel, which is the only
//! back-pressure mechanism. Records are emitted in completion order — the
//! `key` field is how consumers correlate them with input.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::app::{log_progress, ErrorType, FetchStats};
use crate::config::{Config, LOGGING_INTERVAL_SECS};
use crate::report::encode_report;
use crate::transport::Transport;
use crate::worker::{FetchResult, Worker};

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Non-blank input lines seen
    pub total_urls: usize,
    /// Fetches that ended with `success = true`
    pub succeeded: usize,
    /// Fetches (or input lines) that ended with `success = false`
    pub failed: usize,
}

/// Runs the worker against stdin/stdout until end of input or interrupt.
///
/// The first SIGINT stops input intake and lets in-flight fetches drain; a
/// second one exits the process immediately.
pub async fn run(config: Config) -> Result<RunSummary> {
    let interrupt = CancellationToken::new();
    spawn_interrupt_handler(interrupt.clone());

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    run_with_io(config, stdin, stdout, interrupt).await
}

fn spawn_interrupt_handler(interrupt: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("Interrupted: waiting for in-flight requests to finish.");
        interrupt.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Second interrupt: exiting immediately.");
            std::process::exit(1);
        }
    });
}

/// The run loop, parameterized over its streams so tests can drive it.
pub async fn run_with_io<R, W>(
    config: Config,
    reader: R,
    writer: W,
    interrupt: CancellationToken,
) -> Result<RunSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let transport = Arc::new(Transport::new());
    let worker = Arc::new(Worker::new(config.clone(), Arc::clone(&transport)));
    let stats = Arc::new(FetchStats::new());
    let completed = Arc::new(AtomicUsize::new(0));
    let start_time = Instant::now();

    // Single writer; producers block when the channel fills, which in turn
    // blocks new dispatch. That is the intended back-pressure.
    let (report_tx, mut report_rx) = mpsc::channel::<Vec<u8>>(config.max_concurrency);
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = report_rx.recv().await {
            writer.write_all(&line).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    });

    // Progress heartbeat; doubles as the idle-connection sweeper.
    let progress_cancel = CancellationToken::new();
    let progress_task = {
        let cancel = progress_cancel.clone();
        let completed = Arc::clone(&completed);
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(LOGGING_INTERVAL_SECS));
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        log_progress(start_time, &completed);
                        transport.sweep_idle();
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    };

    let gate = Arc::new(Semaphore::new(config.max_concurrency));
    let mut tasks = FuturesUnordered::new();
    let mut total_urls = 0usize;
    let mut lines = reader.lines();

    loop {
        let line = tokio::select! {
            _ = interrupt.cancelled() => break,
            line = lines.next_line() => {
                line.context("failed to read from stdin")?
            }
        };
        let Some(line) = line else { break };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        total_urls += 1;

        let url = match Url::parse(&line) {
            Ok(url) => url,
            Err(err) => {
                // Unparseable input still produces exactly one record.
                let result = FetchResult::error(&line, err.to_string());
                stats.record(&result);
                match encode_report(&line, &result) {
                    Some(encoded) => {
                        if report_tx.send(encoded).await.is_err() {
                            break;
                        }
                    }
                    None => stats.increment(ErrorType::EncodingError),
                }
                continue;
            }
        };

        let permit = Arc::clone(&gate)
            .acquire_owned()
            .await
            .expect("concurrency gate closed");
        let worker = Arc::clone(&worker);
        let stats = Arc::clone(&stats);
        let completed = Arc::clone(&completed);
        let report_tx = report_tx.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = permit;
            let result = worker.fetch(&url).await;
            stats.record(&result);
            match encode_report(&line, &result) {
                Some(encoded) => {
                    // A closed channel means the writer failed; the error
                    // surfaces when the writer task is joined below.
                    let _ = report_tx.send(encoded).await;
                }
                None => stats.increment(ErrorType::EncodingError),
            }
            completed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    if !tasks.is_empty() {
        info!("Input finished; draining {} in-flight fetches", tasks.len());
    }
    while let Some(joined) = tasks.next().await {
        if let Err(err) = joined {
            warn!("fetch task failed: {err}");
        }
    }
    // Belt and braces: every per-host slot must be back before we declare the
    // run drained.
    worker.limits().wait().await;

    drop(report_tx);
    writer_task
        .await
        .context("report writer panicked")?
        .context("failed to write reports to stdout")?;

    progress_cancel.cancel();
    let _ = progress_task.await;

    log_progress(start_time, &completed);
    stats.log_summary();

    Ok(RunSummary {
        total_urls,
        succeeded: stats.succeeded(),
        failed: stats.failed(),
    })
}
