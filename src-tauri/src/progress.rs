//! Batch transfer progress accounting.
//!
//! Speed is recomputed on a coarse cadence rather than per chunk, so small
//! chunk sizes don't make the displayed rate jitter. The rate is measured
//! since session (or resume) start: `(received - resume_offset) / elapsed`.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Minimum interval between speed recomputations.
pub const SPEED_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTransferProgress {
    pub session_id: String,
    pub total_files: u64,
    pub completed_files: u64,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    /// Bytes per second, 0.0 until the first speed sample.
    pub speed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTransferCompleted {
    pub session_id: String,
    pub total_files: u64,
    pub destination_dir: String,
}

/// "1.00 KB", "2.50 GB", "512 B" — largest unit with a value >= 1,
/// two decimal places above bytes.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Percentage in [0, 100]; only defined when total > 0.
pub fn percentage(transferred: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some((transferred.min(total) as f64 / total as f64) * 100.0)
}

/// Whole seconds left at the current rate; None while the rate is unknown.
pub fn eta_seconds(total: u64, transferred: u64, speed: f64) -> Option<u64> {
    if speed <= 0.0 {
        return None;
    }
    let remaining = total.saturating_sub(transferred) as f64;
    Some((remaining / speed).round() as u64)
}

/// Tracks throughput since session/resume start.
pub struct SpeedTracker {
    started: Instant,
    resume_offset: u64,
    last_sample: Instant,
    speed: f64,
}

impl SpeedTracker {
    pub fn new(resume_offset: u64) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            resume_offset,
            last_sample: now,
            speed: 0.0,
        }
    }

    /// Feed the cumulative byte count; recomputes at most once per
    /// SPEED_INTERVAL. Returns the current speed in bytes/second.
    pub fn update(&mut self, transferred: u64) -> f64 {
        let now = Instant::now();
        if now.duration_since(self.last_sample) >= SPEED_INTERVAL {
            self.speed = Self::compute(transferred, self.resume_offset, now - self.started);
            self.last_sample = now;
        }
        self.speed
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    fn compute(received: u64, resume_offset: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        received.saturating_sub(resume_offset) as f64 / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn format_bytes_uses_largest_unit() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * MB), "5.00 MB");
        assert_eq!(format_bytes((2.5 * (1024u64.pow(3) as f64)) as u64), "2.50 GB");
    }

    #[test]
    fn percentage_bounds() {
        assert_eq!(percentage(0, 100), Some(0.0));
        assert_eq!(percentage(100, 100), Some(100.0));
        assert_eq!(percentage(50, 200), Some(25.0));
        assert_eq!(percentage(0, 0), None);
        // Clamped even if a caller over-reports
        assert_eq!(percentage(300, 200), Some(100.0));
    }

    #[test]
    fn eta_from_remaining_over_speed() {
        // total=100MB, transferred=40MB, speed=10MB/s => 6s
        let eta = eta_seconds(100 * MB, 40 * MB, (10 * MB) as f64);
        assert_eq!(eta, Some(6));
        assert_eq!(eta_seconds(100 * MB, 40 * MB, 0.0), None);
    }

    #[test]
    fn speed_is_measured_since_resume() {
        // resumeOffset=10MB, received=50MB, elapsed=8s => 5MB/s
        let speed = SpeedTracker::compute(50 * MB, 10 * MB, Duration::from_secs(8));
        assert_eq!(speed, (5 * MB) as f64);
    }

    #[test]
    fn speed_zero_while_no_time_elapsed() {
        assert_eq!(SpeedTracker::compute(100, 0, Duration::ZERO), 0.0);
    }

    #[test]
    fn tracker_respects_sample_interval() {
        let mut tracker = SpeedTracker::new(0);
        // Immediately after start: below interval, speed stays at 0
        assert_eq!(tracker.update(10 * MB), 0.0);
    }
}
