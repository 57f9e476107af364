//! Lag monitor: samples stream length and group lag, raises advisory
//! backpressure signals. It only reads; producers are never paused.

use std::fmt::{self, Write as _};
use std::time::Duration;

use crossbeam_channel::Sender;
use serde::Serialize;
use tracing::{debug, warn};

use crate::shutdown::Shutdown;
use crate::stream::{StreamError, StreamInfo, StreamStore};

/// Limits for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorThresholds {
    /// Stream length above which a `Length` signal is raised.
    pub max_length: u64,
    /// Pending plus undelivered entries above which a group raises `Lag`.
    pub max_group_lag: u64,
}

/// A stream under watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamWatch {
    /// Stream name.
    pub stream: String,
    /// Its limits.
    pub thresholds: MonitorThresholds,
}

impl StreamWatch {
    /// Watches `stream` with the given limits.
    pub fn new(stream: impl Into<String>, max_length: u64, max_group_lag: u64) -> Self {
        Self {
            stream: stream.into(),
            thresholds: MonitorThresholds {
                max_length,
                max_group_lag,
            },
        }
    }
}

/// What crossed its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// The stream holds too many entries.
    Length,
    /// A group is too far behind.
    Lag,
}

/// Advisory telemetry event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackpressureSignal {
    /// Stream concerned.
    pub stream: String,
    /// Group concerned, for `Lag` signals.
    pub group: Option<String>,
    /// Which limit was crossed.
    pub kind: SignalKind,
    /// Measured value.
    pub observed: u64,
    /// Configured limit.
    pub threshold: u64,
}

impl fmt::Display for BackpressureSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.group) {
            (SignalKind::Lag, Some(group)) => write!(
                f,
                "{}/{} lag {} exceeds {}",
                self.stream, group, self.observed, self.threshold
            ),
            _ => write!(
                f,
                "{} length {} exceeds {}",
                self.stream, self.observed, self.threshold
            ),
        }
    }
}

/// One sample of every watched stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagReport {
    /// Epoch milliseconds of the sample.
    pub sampled_at_ms: u64,
    /// Per-stream statistics, in watch order.
    pub streams: Vec<StreamInfo>,
}

impl LagReport {
    /// Statistics of `stream`, if watched.
    pub fn stream(&self, stream: &str) -> Option<&StreamInfo> {
        self.streams.iter().find(|info| info.name == stream)
    }
}

/// Periodic sampler over a fixed set of streams.
#[derive(Debug, Clone)]
pub struct LagMonitor {
    store: StreamStore,
    watches: Vec<StreamWatch>,
    interval: Duration,
}

impl LagMonitor {
    /// Builds a monitor sampling every `interval`.
    pub fn new(store: StreamStore, watches: Vec<StreamWatch>, interval: Duration) -> Self {
        Self {
            store,
            watches,
            interval,
        }
    }

    /// Reads current statistics of every watched stream.
    pub fn sample(&self) -> Result<LagReport, StreamError> {
        let streams = self
            .watches
            .iter()
            .map(|watch| self.store.stream(watch.stream.as_str()).info())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LagReport {
            sampled_at_ms: self.store.now_ms(),
            streams,
        })
    }

    /// Signals for every threshold `report` crosses.
    pub fn evaluate(&self, report: &LagReport) -> Vec<BackpressureSignal> {
        let mut signals = Vec::new();
        for watch in &self.watches {
            let Some(info) = report.stream(&watch.stream) else {
                continue;
            };
            let limits = watch.thresholds;
            if info.length > limits.max_length {
                signals.push(BackpressureSignal {
                    stream: info.name.clone(),
                    group: None,
                    kind: SignalKind::Length,
                    observed: info.length,
                    threshold: limits.max_length,
                });
            }
            for group in &info.groups {
                if group.lag() > limits.max_group_lag {
                    signals.push(BackpressureSignal {
                        stream: info.name.clone(),
                        group: Some(group.name.clone()),
                        kind: SignalKind::Lag,
                        observed: group.lag(),
                        threshold: limits.max_group_lag,
                    });
                }
            }
        }
        signals
    }

    /// Samples until shutdown, logging and forwarding signals. A dropped
    /// receiver only stops forwarding.
    pub fn run(
        &self,
        signals: &Sender<BackpressureSignal>,
        shutdown: &Shutdown,
        mut on_report: impl FnMut(&LagReport, &[BackpressureSignal]),
    ) -> Result<(), StreamError> {
        let mut forwarding = true;
        loop {
            let report = match self.sample() {
                Ok(report) => report,
                Err(StreamError::Closed) if shutdown.is_triggered() => return Ok(()),
                Err(err) => return Err(err),
            };
            let raised = self.evaluate(&report);
            for signal in &raised {
                warn!(
                    stream = %signal.stream,
                    group = signal.group.as_deref().unwrap_or("-"),
                    kind = ?signal.kind,
                    observed = signal.observed,
                    threshold = signal.threshold,
                    "backpressure"
                );
                if forwarding && signals.send(signal.clone()).is_err() {
                    debug!("signal receiver dropped");
                    forwarding = false;
                }
            }
            on_report(&report, &raised);
            if !shutdown.sleep(self.interval) {
                return Ok(());
            }
        }
    }
}

/// Plain-text dashboard of the two pipeline stages and their dead letters.
pub fn render_dashboard(
    report: &LagReport,
    stage1: &str,
    stage2: &str,
    signals: &[BackpressureSignal],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "embedstream pipeline @ {} ms", report.sampled_at_ms);
    for info in &report.streams {
        let _ = writeln!(
            out,
            "{:<32} length {:>8}  added {:>8}",
            info.name, info.length, info.entries_added
        );
        for group in &info.groups {
            let _ = writeln!(
                out,
                "  {:<30} pending {:>6}  undelivered {:>8}  lag {:>8}",
                group.name,
                group.pending,
                group.undelivered,
                group.lag()
            );
        }
    }
    let received = report.stream(stage1).map_or(0, |info| info.entries_added);
    let embedded = report.stream(stage2).map_or(0, |info| info.entries_added);
    if received > 0 {
        let _ = writeln!(
            out,
            "throughput {:.1}% ({embedded} embedded / {received} received)",
            embedded as f64 * 100.0 / received as f64
        );
    }
    if signals.is_empty() {
        let _ = writeln!(out, "status: ok");
    } else {
        for signal in signals {
            let _ = writeln!(out, "warning: {signal}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{GroupStart, StoreOptions};
    use crossbeam_channel::unbounded;

    fn store_with_backlog() -> StreamStore {
        let store = StreamStore::in_memory(StoreOptions::default()).unwrap();
        let stage1 = store.stream("raw_document_changes");
        stage1
            .create_group("embedding_processors", GroupStart::Beginning)
            .unwrap();
        for i in 0..6 {
            stage1.append(&i.to_string()).unwrap();
        }
        stage1
            .read("embedding_processors", "w", 2, Duration::ZERO)
            .unwrap();
        store.stream("embedded_documents").append("{}").unwrap();
        store
    }

    fn monitor(store: StreamStore) -> LagMonitor {
        LagMonitor::new(
            store,
            vec![
                StreamWatch::new("raw_document_changes", 5, 3),
                StreamWatch::new("embedded_documents", 5, 3),
            ],
            Duration::from_millis(1),
        )
    }

    #[test]
    fn raises_length_and_lag_signals() {
        let monitor = monitor(store_with_backlog());
        let report = monitor.sample().unwrap();
        let stage1 = report.stream("raw_document_changes").unwrap();
        assert_eq!(stage1.groups[0].pending, 2);
        assert_eq!(stage1.groups[0].undelivered, 4);

        let signals = monitor.evaluate(&report);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].kind, SignalKind::Length);
        assert_eq!(signals[1].kind, SignalKind::Lag);
        assert_eq!(signals[1].group.as_deref(), Some("embedding_processors"));
        assert_eq!(signals[1].observed, 6);

        let text = render_dashboard(&report, "raw_document_changes", "embedded_documents", &signals);
        assert!(text.contains("throughput 16.7%"));
        assert!(text.contains("warning: raw_document_changes/embedding_processors lag 6 exceeds 3"));
    }

    #[test]
    fn run_forwards_signals_until_shutdown() {
        let monitor = monitor(store_with_backlog());
        let (tx, rx) = unbounded();
        let shutdown = Shutdown::new();
        let mut reports = 0;
        monitor
            .run(&tx, &shutdown, |_, _| {
                reports += 1;
                if reports == 2 {
                    shutdown.trigger();
                }
            })
            .unwrap();
        assert_eq!(reports, 2);
        assert_eq!(rx.try_iter().count(), 4);
    }
}
