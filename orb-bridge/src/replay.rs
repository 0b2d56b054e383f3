//! File replay feed
//!
//! Streams ticks from a JSONL file, one record per line, in any of the
//! shapes [`crate::feed::parse_message`] accepts. With a pacing multiplier
//! the gaps between tick timestamps are replayed in (scaled) real time;
//! without one the file is pushed as fast as the session consumes it.

use crate::errors::{FeedError, FeedResult};
use crate::feed::parse_message;
use orb_core::Tick;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct ReplayStatistics {
    pub lines_read: u64,
    pub ticks_sent: u64,
    pub lines_skipped: u64,
}

pub struct ReplayFeed {
    path: PathBuf,
    /// 1.0 replays at recorded speed, 10.0 ten times faster
    speed: Option<f64>,
}

impl ReplayFeed {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            speed: None,
        }
    }

    /// Sleep between ticks for their timestamp gap divided by `speed`
    pub fn paced(mut self, speed: f64) -> Self {
        self.speed = (speed > 0.0).then_some(speed);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn spawn(self, sender: mpsc::Sender<Tick>) -> JoinHandle<FeedResult<ReplayStatistics>> {
        tokio::spawn(async move { self.run(sender).await })
    }

    /// Send every tick in the file, then drop `sender` to close the stream.
    /// Unparseable lines are skipped with a warning.
    pub async fn run(&self, sender: mpsc::Sender<Tick>) -> FeedResult<ReplayStatistics> {
        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut stats = ReplayStatistics::default();
        let mut last_timestamp: Option<chrono::DateTime<chrono::Utc>> = None;

        info!("▶️ Replaying {}", self.path.display());
        while let Some(line) = lines.next_line().await? {
            stats.lines_read += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let ticks = match parse_message(line) {
                Ok(ticks) => ticks,
                Err(e) => {
                    warn!("Skipping line {}: {}", stats.lines_read, e);
                    stats.lines_skipped += 1;
                    continue;
                }
            };

            for tick in ticks {
                if let (Some(speed), Some(last)) = (self.speed, last_timestamp) {
                    let gap = (tick.timestamp - last).to_std().unwrap_or(Duration::ZERO);
                    if !gap.is_zero() {
                        tokio::time::sleep(gap.div_f64(speed)).await;
                    }
                }
                last_timestamp = Some(tick.timestamp);

                sender.send(tick).await.map_err(|_| FeedError::ReceiverClosed)?;
                stats.ticks_sent += 1;
            }
        }

        info!(
            "⏹️ Replay finished: {} ticks from {} lines ({} skipped)",
            stats.ticks_sent, stats.lines_read, stats.lines_skipped
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    #[tokio::test]
    async fn test_replays_all_shapes_and_skips_garbage() {
        let file = write_file(&[
            r#"{"symbol":"AAPL","price":100.0,"volume":10,"timestamp":"2024-03-01T14:30:00Z"}"#,
            "",
            "garbage",
            r#"{"sym":"AAPL","c":100.5,"v":20,"s":1709303401000}"#,
            r#"{"results":{"P":101.0,"S":5,"T":"AAPL","t":1709303402000000000}}"#,
        ]);
        let (tx, mut rx) = mpsc::channel(16);

        let stats = ReplayFeed::new(file.path()).run(tx).await.unwrap();
        assert_eq!(stats.lines_read, 5);
        assert_eq!(stats.ticks_sent, 3);
        assert_eq!(stats.lines_skipped, 1);

        let mut prices = Vec::new();
        while let Some(tick) = rx.recv().await {
            prices.push(tick.price);
        }
        assert_eq!(prices, vec![100.0, 100.5, 101.0]);
    }

    #[tokio::test]
    async fn test_pacing_follows_timestamp_gaps() {
        let file = write_file(&[
            r#"{"symbol":"AAPL","price":100.0,"timestamp":"2024-03-01T14:30:00Z"}"#,
            r#"{"symbol":"AAPL","price":100.1,"timestamp":"2024-03-01T14:30:10Z"}"#,
        ]);
        let (tx, mut rx) = mpsc::channel(16);

        let start = tokio::time::Instant::now();
        ReplayFeed::new(file.path()).paced(500.0).run(tx).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(rx.recv().await.unwrap().price, 100.0);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let (tx, _rx) = mpsc::channel(1);
        let result = ReplayFeed::new("/nonexistent/ticks.jsonl").run(tx).await;
        assert!(matches!(result, Err(FeedError::Io(_))));
    }

    #[tokio::test]
    async fn test_stops_when_receiver_drops() {
        let file = write_file(&[
            r#"{"symbol":"AAPL","price":100.0,"timestamp":"2024-03-01T14:30:00Z"}"#,
        ]);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = ReplayFeed::new(file.path()).run(tx).await;
        assert!(matches!(result, Err(FeedError::ReceiverClosed)));
    }
}
