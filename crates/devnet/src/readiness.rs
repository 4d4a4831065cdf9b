//! Detects when a freshly started node is ready by reading its output.
//!
//! A node prints its ready marker before it has fully settled, so readiness
//! is three steps: the marker shows up on a line that passes the noise
//! filter, a grace period elapses, and the published port accepts a
//! connection.

use std::{fmt, sync::Arc, time::Duration};

use futures_util::StreamExt;
use thiserror::Error;
use tracing::debug;

use crate::{
    engine::{EngineError, LogStream},
    port::{PortProbe, wait_for_port},
};

/// Lines longer than this are treated as pathological output and ignored.
pub const MAX_LOG_LINE_LEN: usize = 1000;
const MAX_PENDING_LINE_BYTES: usize = 64 * 1024;
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

const NOISY_PREFIXES: [&str; 7] = [
    "TRACE ",
    "DEBUG ",
    "INFO ",
    "I[",
    "Storing key:",
    "{\"app_message\":",
    "configuration saved to",
];

/// Default noise filter for node output.
pub fn is_relevant_log_line(line: &str) -> bool {
    !line.is_empty()
        && line.chars().count() <= MAX_LOG_LINE_LEN
        && !NOISY_PREFIXES.iter().any(|prefix| line.starts_with(prefix))
        && !line.chars().any(|ch| ch <= '\u{1f}')
}

/// Predicate deciding which output lines are considered at all.
#[derive(Clone)]
pub struct LineFilter(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl LineFilter {
    pub fn new(filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(filter))
    }

    pub fn accept_all() -> Self {
        Self::new(|_| true)
    }

    pub fn accepts(&self, line: &str) -> bool {
        (self.0)(line)
    }
}

impl Default for LineFilter {
    fn default() -> Self {
        Self::new(is_relevant_log_line)
    }
}

impl fmt::Debug for LineFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LineFilter(..)")
    }
}

/// Reassembles complete lines from arbitrarily chunked output.
///
/// A line that outgrows `MAX_PENDING_LINE_BYTES` is dropped whole: the
/// buffer skips everything up to its terminating newline.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: String,
    discarding: bool,
}

impl LineBuffer {
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=end).collect();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            lines.push(line.trim_end_matches(['\n', '\r']).to_owned());
        }
        if self.pending.len() > MAX_PENDING_LINE_BYTES {
            self.pending.clear();
            self.discarding = true;
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        let rest = rest.trim_end_matches('\r');
        (!rest.is_empty()).then(|| rest.to_owned())
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessDetector {
    ready_phrase: String,
    filter: LineFilter,
    timeout: Duration,
    grace_period: Duration,
}

impl ReadinessDetector {
    pub fn new(ready_phrase: impl Into<String>) -> Self {
        Self {
            ready_phrase: ready_phrase.into(),
            filter: LineFilter::default(),
            timeout: DEFAULT_READY_TIMEOUT,
            grace_period: Duration::ZERO,
        }
    }

    pub fn with_filter(mut self, filter: LineFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn ready_phrase(&self) -> &str {
        &self.ready_phrase
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a single complete line marks the node as ready.
    pub fn is_ready_line(&self, line: &str) -> bool {
        self.filter.accepts(line) && line.contains(&self.ready_phrase)
    }

    /// Consumes `logs` until the ready phrase appears. Returns the matching
    /// line.
    pub async fn wait_for_phrase(&self, mut logs: LogStream) -> Result<String, ReadinessError> {
        let scan = async {
            let mut buffer = LineBuffer::default();
            while let Some(chunk) = logs.next().await {
                for line in buffer.push(&chunk?) {
                    if let Some(found) = self.inspect_line(line) {
                        return Ok(found);
                    }
                }
            }
            if let Some(found) = buffer.finish().and_then(|line| self.inspect_line(line)) {
                return Ok(found);
            }
            Err(ReadinessError::StreamEnded {
                phrase: self.ready_phrase.clone(),
            })
        };

        tokio::time::timeout(self.timeout, scan)
            .await
            .map_err(|_| ReadinessError::PhraseTimeout {
                phrase: self.ready_phrase.clone(),
                timeout_secs: self.timeout.as_secs(),
            })?
    }

    /// Full readiness check: ready phrase, grace period, open port.
    pub async fn await_ready(
        &self,
        logs: LogStream,
        probe: &dyn PortProbe,
        host: &str,
        port: u16,
    ) -> Result<(), ReadinessError> {
        let line = self.wait_for_phrase(logs).await?;
        debug!(%line, grace_secs = self.grace_period.as_secs(), "ready phrase seen");
        tokio::time::sleep(self.grace_period).await;
        if wait_for_port(probe, host, port, self.timeout).await {
            Ok(())
        } else {
            Err(ReadinessError::PortTimeout {
                host: host.to_owned(),
                port,
                timeout_secs: self.timeout.as_secs(),
            })
        }
    }

    fn inspect_line(&self, line: String) -> Option<String> {
        if !self.filter.accepts(&line) {
            return None;
        }
        debug!(target: "devnet::node", "{line}");
        line.contains(&self.ready_phrase).then_some(line)
    }
}

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("ready phrase `{phrase}` did not appear within {timeout_secs}s")]
    PhraseTimeout { phrase: String, timeout_secs: u64 },
    #[error("`{host}:{port}` did not accept connections within {timeout_secs}s")]
    PortTimeout {
        host: String,
        port: u16,
        timeout_secs: u64,
    },
    #[error("node output ended before ready phrase `{phrase}` appeared")]
    StreamEnded { phrase: String },
    #[error(transparent)]
    Logs(#[from] EngineError),
}
