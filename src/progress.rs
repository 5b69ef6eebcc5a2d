use std::future::Future;
use std::io::{self, Write};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};

const TICK: Duration = Duration::from_millis(50);
const WIDTH: usize = 40;

/// Drives `work` to completion while a progress line ticks on stderr.
///
/// The indicator runs as a separate task. It is stopped and joined after
/// `work` finishes; `work` itself is never interrupted.
pub(crate) async fn with_progress<F, T>(label: &str, expected: Duration, quiet: bool, work: F) -> T
where
    F: Future<Output = T>,
{
    if quiet {
        return work.await;
    }
    let (stop, stopped) = oneshot::channel();
    let indicator = tokio::spawn(indicate(label.to_owned(), expected, stopped));
    let output = work.await;
    let _ = stop.send(());
    if let Err(err) = indicator.await {
        tracing::debug!(error = %err, "progress indicator failed");
    }
    output
}

/// Waits out the post-rotation settle delay.
pub(crate) async fn settle(delay: Duration, quiet: bool) {
    tracing::info!(delay = %humantime::format_duration(delay), "waiting for key propagation");
    with_progress("Rotating access keys", delay, quiet, time::sleep(delay)).await;
}

async fn indicate(label: String, expected: Duration, mut stopped: oneshot::Receiver<()>) {
    let started = Instant::now();
    let mut interval = time::interval(TICK);
    let mut stderr = io::stderr();
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = interval.tick() => {
                let _ = write!(stderr, "\r{}", line(&label, started.elapsed(), expected));
                let _ = stderr.flush();
            }
        }
    }
    let _ = write!(stderr, "\r{}\r", " ".repeat(label.len() + WIDTH + 32));
    let _ = stderr.flush();
}

fn line(label: &str, elapsed: Duration, expected: Duration) -> String {
    let elapsed_secs = elapsed.as_secs();
    if expected.is_zero() {
        let spinner = ['|', '/', '-', '\\'][(elapsed.as_millis() / TICK.as_millis()) as usize % 4];
        return format!("    {label}: {spinner} [elapsed: {elapsed_secs}s]");
    }
    let ratio = (elapsed.as_secs_f64() / expected.as_secs_f64()).min(1.0);
    let filled = (ratio * WIDTH as f64).round() as usize;
    let left = expected.saturating_sub(elapsed).as_secs();
    format!(
        "    {label}: |{}{}| {:>3}% [elapsed: {elapsed_secs}s left: {left}s]",
        "#".repeat(filled),
        ".".repeat(WIDTH - filled),
        (ratio * 100.0).round() as u32,
    )
}
