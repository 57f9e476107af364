use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};
use embedstream::config::{LogArgs, StoreArgs, StreamArgs};
use embedstream::consumer::dead_letter_stream;
use embedstream::monitor::{render_dashboard, StreamWatch};
use embedstream::{telemetry, BackpressureSignal, LagMonitor, Shutdown};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "embedstream-monitor",
    about = "Reports stream length, group lag and backpressure"
)]
struct MonitorCli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    streams: StreamArgs,

    #[command(flatten)]
    log: LogArgs,

    /// Seconds between samples
    #[arg(long, env = "EMBEDSTREAM_MONITOR_INTERVAL_SECS", default_value_t = 5)]
    interval_secs: u64,

    /// Stage-1 length that raises a warning
    #[arg(long, env = "EMBEDSTREAM_STAGE1_MAX_LENGTH", default_value_t = 1_000)]
    stage1_max_length: u64,

    /// Stage-1 group lag that raises a warning
    #[arg(long, env = "EMBEDSTREAM_STAGE1_MAX_LAG", default_value_t = 100)]
    stage1_max_lag: u64,

    /// Stage-2 length that raises a warning
    #[arg(long, env = "EMBEDSTREAM_STAGE2_MAX_LENGTH", default_value_t = 500)]
    stage2_max_length: u64,

    /// Stage-2 group lag that raises a warning
    #[arg(long, env = "EMBEDSTREAM_STAGE2_MAX_LAG", default_value_t = 50)]
    stage2_max_lag: u64,

    /// Dead-letter stream length that raises a warning
    #[arg(long, env = "EMBEDSTREAM_DEAD_LETTER_MAX_LENGTH", default_value_t = 0)]
    dead_letter_max_length: u64,

    /// Print one report and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Log reports instead of redrawing the terminal dashboard
    #[arg(long, default_value_t = false)]
    no_dashboard: bool,

    /// Append every signal as a JSON line to this file
    #[arg(long, env = "EMBEDSTREAM_SIGNALS_OUT")]
    signals_out: Option<PathBuf>,
}

impl MonitorCli {
    fn watches(&self) -> Vec<StreamWatch> {
        let stage1 = &self.streams.changes_stream;
        let stage2 = &self.streams.embedded_stream;
        vec![
            StreamWatch::new(stage1.as_str(), self.stage1_max_length, self.stage1_max_lag),
            StreamWatch::new(stage2.as_str(), self.stage2_max_length, self.stage2_max_lag),
            StreamWatch::new(dead_letter_stream(stage1), self.dead_letter_max_length, u64::MAX),
            StreamWatch::new(dead_letter_stream(stage2), self.dead_letter_max_length, u64::MAX),
        ]
    }
}

fn spawn_signal_writer(
    path: PathBuf,
    signals: Receiver<BackpressureSignal>,
) -> Result<thread::JoinHandle<()>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(thread::spawn(move || {
        let mut out = BufWriter::new(file);
        for signal in signals.iter() {
            let written = serde_json::to_writer(&mut out, &signal)
                .map_err(std::io::Error::from)
                .and_then(|_| out.write_all(b"\n"))
                .and_then(|_| out.flush());
            if let Err(err) = written {
                warn!(error = %err, path = %path.display(), "failed to record signal");
            }
        }
    }))
}

fn main() -> Result<()> {
    let cli = MonitorCli::parse();
    telemetry::init(&cli.log.log_level);

    let shutdown = Shutdown::new();
    shutdown
        .install_signal_handlers()
        .context("failed to install signal handlers")?;
    let store = cli.store.open()?;
    let monitor = LagMonitor::new(
        store.clone(),
        cli.watches(),
        Duration::from_secs(cli.interval_secs.max(1)),
    );
    let stage1 = cli.streams.changes_stream.as_str();
    let stage2 = cli.streams.embedded_stream.as_str();

    if cli.once {
        let report = monitor.sample().context("failed to sample streams")?;
        let signals = monitor.evaluate(&report);
        print!("{}", render_dashboard(&report, stage1, stage2, &signals));
        store.close();
        return Ok(());
    }

    let (tx, rx) = unbounded();
    let writer = match cli.signals_out.clone() {
        Some(path) => Some(spawn_signal_writer(path, rx)?),
        None => {
            drop(rx);
            None
        }
    };
    info!(interval_secs = cli.interval_secs, "starting lag monitor");
    let dashboard = !cli.no_dashboard;
    let result = monitor.run(&tx, &shutdown, |report, signals| {
        if dashboard {
            print!("\x1b[2J\x1b[H{}", render_dashboard(report, stage1, stage2, signals));
            let _ = std::io::stdout().flush();
        } else {
            for info in &report.streams {
                info!(
                    stream = %info.name,
                    length = info.length,
                    entries_added = info.entries_added,
                    max_lag = info.groups.iter().map(|g| g.lag()).max().unwrap_or(0),
                    "stream sample"
                );
            }
        }
    });
    drop(tx);
    if let Some(handle) = writer {
        let _ = handle.join();
    }
    store.close();
    result.context("lag monitor failed")
}
