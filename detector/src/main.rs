use figwatch_common::config::Config;
use figwatch_detector::{ControlHandle, Pipeline, PipelineEvent, RunProgress};
use std::io::BufRead;
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        input = %config.input.path.display(),
        output_dir = %config.output.dir.display(),
        extension = config.output.extension,
        min_contour_area = config.detection.min_contour_area,
        min_frame_gap = config.selection.min_frame_gap,
        "starting figwatch"
    );

    let control = ControlHandle::new(config.detection.min_contour_area);
    let mut pipeline = match Pipeline::open(&config, control.clone()).await {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "cannot start run");
            std::process::exit(1);
        }
    };

    tokio::spawn(log_progress(pipeline.progress()));
    tokio::spawn(log_events(pipeline.events()));
    let commands = control.clone();
    std::thread::spawn(move || read_commands(commands));

    let ctrl_c = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current frame");
            ctrl_c.request_stop();
        }
    });

    match pipeline.run().await {
        Ok(summary) => {
            info!(
                outcome = ?summary.outcome,
                frames = summary.frames_processed,
                saved = summary.saved_count,
                output_dir = %summary.output_dir.display(),
                "done"
            );
        }
        Err(e) => {
            error!(error = %e, "run failed");
            std::process::exit(1);
        }
    }
}

/// Log once per whole percent so long runs don't flood the output.
async fn log_progress(mut rx: watch::Receiver<RunProgress>) {
    let mut last_step = None;
    while rx.changed().await.is_ok() {
        let p = rx.borrow_and_update().clone();
        let percent = p.percent_complete.floor() as u32;
        let step = if p.total_frames == 0 {
            // no total: fall back to a heartbeat every 500 frames
            (p.frame_index / 500) as u32
        } else {
            percent
        };
        if last_step == Some(step) {
            continue;
        }
        last_step = Some(step);
        info!(
            frame = p.frame_index,
            total = p.total_frames,
            percent,
            media_secs = p.current_media_time,
            elapsed_secs = p.elapsed_seconds.round(),
            remaining_secs = p.estimated_remaining_seconds.round(),
            "progress"
        );
    }
}

async fn log_events(mut rx: mpsc::UnboundedReceiver<PipelineEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::FrameSaved(record) => info!(
                frame = record.frame_index,
                path = %record.path.display(),
                figures = record.boxes.len(),
                "figure frame saved"
            ),
            PipelineEvent::StateChanged(state) => info!(state = ?state, "state changed"),
        }
    }
}

/// Operator commands on stdin: `pause`/`p` toggles, `stop`/`s` cancels,
/// `sensitivity <n>`/`area <n>` sets the minimum contour area.
///
/// Runs on its own thread so a blocked read never holds up runtime shutdown.
fn read_commands(control: ControlHandle) {
    for line in std::io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "stdin closed, operator commands disabled");
                return;
            }
        };
        if control.state().is_terminal() {
            return;
        }

        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("pause" | "p"), None) => {
                let paused = control.toggle_pause();
                info!(paused, "pause toggled");
            }
            (Some("stop" | "s"), None) => {
                info!("stop requested");
                control.request_stop();
            }
            (Some("sensitivity" | "area"), Some(value)) => match value.parse::<u32>() {
                Ok(area) => {
                    control.set_min_contour_area(area);
                    info!(min_contour_area = area, "sensitivity changed");
                }
                Err(_) => warn!(value, "minimum contour area must be a non-negative integer"),
            },
            (None, _) => {}
            _ => warn!(
                command = line.trim(),
                "unknown command (try: pause, stop, sensitivity <n>)"
            ),
        }
    }
}
