//! Log output for the server.
//!
//! Events render as an indented span tree on stderr, so `keygen` output on
//! stdout stays clean. Each line is stamped with the process uptime and the
//! gap since the previous line, which makes slow store calls easy to spot in
//! request logs.

use std::{
    io::IsTerminal,
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

use atomic_time::AtomicInstant;
use derive_more::Debug;
use tap::Pipe;
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use tracing_tree::{HierarchicalLayer, time::FormatTime};

/// Install the global subscriber. `RUST_LOG` overrides `level` when set.
pub fn init(level: LevelFilter) {
    let tree = HierarchicalLayer::default()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_indent_lines(true)
        .with_deferred_spans(true)
        .with_bracketed_fields(true)
        .with_span_retrace(true)
        .with_timer(Uptime::default());
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(tree)
        .with(filter)
        .init();
}

/// Timestamps log lines relative to process start.
#[derive(Debug)]
pub struct Uptime {
    start: Instant,
    #[debug(skip)]
    last_line: AtomicInstant,
}

impl Uptime {
    /// Time since the previous call, or since creation on the first call.
    /// Relaxed ordering: concurrent lines may see slightly skewed gaps.
    fn gap(&self) -> Duration {
        self.last_line
            .swap(Instant::now(), Ordering::Relaxed)
            .pipe(|last| last.elapsed())
    }
}

impl Default for Uptime {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            last_line: AtomicInstant::now(),
        }
    }
}

impl FormatTime for Uptime {
    fn format_time(&self, w: &mut impl std::fmt::Write) -> std::fmt::Result {
        write!(w, "{:.03}s", self.start.elapsed().as_secs_f64())
    }

    // tracing-tree passes the time spent in the current span; the gap
    // between lines reads better across concurrent requests.
    fn style_timestamp(
        &self,
        _ansi: bool,
        _elapsed: Duration,
        w: &mut impl std::fmt::Write,
    ) -> std::fmt::Result {
        write!(w, "+{:>4}ms", self.gap().as_millis())
    }
}
