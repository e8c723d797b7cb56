//! Progress bar driven by orchestrator host events.

use std::time::Duration;

use folio_core::HostEvent;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;
use tracing::{info, warn};

const TEMPLATE: &str = "{spinner} [{bar:40}] {pos}/{len} pages {msg}";

/// Renders host events until the sender side closes.
///
/// With `visible == false` the bar is hidden but events are still logged.
pub(crate) fn spawn_progress_ui(
    visible: bool,
    mut events: mpsc::UnboundedReceiver<HostEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        if visible {
            bar.set_style(
                ProgressStyle::with_template(TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
        } else {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }

        while let Some(event) = events.recv().await {
            match event {
                HostEvent::Progress(snapshot) => {
                    bar.set_length(snapshot.total_pages as u64);
                    bar.set_position(snapshot.finished_pages as u64);
                    let eta = snapshot
                        .eta_seconds
                        .map_or_else(|| "--".to_string(), |s| format!("{s}s"));
                    let stuck = if snapshot.stuck { " (stalled)" } else { "" };
                    bar.set_message(format!(
                        "{:.0} KiB/s eta {eta}{stuck}",
                        snapshot.bytes_per_second / 1024.0
                    ));
                }
                HostEvent::ChunkStarted {
                    ordinal,
                    total_chunks,
                    pages,
                    ..
                } => {
                    bar.println(format!(
                        "chunk {}/{total_chunks}: pages {}-{}",
                        ordinal + 1,
                        pages.start + 1,
                        pages.end
                    ));
                }
                HostEvent::ChunkCompleted { path, .. } => {
                    info!(path = %path.display(), "chunk written");
                }
                HostEvent::ChunkSkipped { path, .. } => {
                    info!(path = %path.display(), "chunk reused from earlier run");
                }
                HostEvent::ChunkFailed { chunk_id, reason } => {
                    warn!(%chunk_id, %reason, "chunk failed");
                }
                HostEvent::PageFailed { page_index, reason } => {
                    warn!(page = page_index + 1, %reason, "page failed");
                }
                HostEvent::Escalated { extra_attempts, .. } => {
                    warn!(extra_attempts, "download stalled; granting extra attempts");
                }
                HostEvent::Stalled { chunk_id } => {
                    warn!(%chunk_id, "download stalled; abandoning outstanding pages");
                }
            }
        }
        bar.finish_and_clear();
    })
}
