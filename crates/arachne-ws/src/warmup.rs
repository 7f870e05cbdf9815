//! Decoder warm-up.
//!
//! Runs the frame decoder over a synthetic masked frame of random bytes a
//! configurable number of times, so the first real messages do not pay for
//! cold caches and lazy page faults. Touches no connection or registry state.

use std::hint::black_box;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info};

use crate::config::Options;
use crate::frame::{self, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupReport {
    pub runs: u32,
    pub bytes_per_run: usize,
    pub elapsed: Duration,
}

impl WarmupReport {
    /// Mean time per decode, zero when nothing ran.
    pub fn per_run(&self) -> Duration {
        if self.runs == 0 {
            Duration::ZERO
        } else {
            self.elapsed / self.runs
        }
    }
}

/// Build a masked binary frame carrying `size` random bytes.
pub fn synthetic_frame(size: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    let mut payload = vec![0u8; size];
    rng.fill(&mut payload[..]);
    let key: [u8; 4] = rng.random();
    frame::encode_masked(Opcode::Binary, &payload, key)
}

/// Decode a synthetic frame `options.warmup_runs` times.
pub fn run(options: &Options) -> WarmupReport {
    let size = options.warmup_data_size;
    let raw = synthetic_frame(size);
    // The warm-up frame must never trip the size limit.
    let max_payload = options.max_message_size.max(size as u64);

    info!(runs = options.warmup_runs, bytes = size, "warming up the decoder");
    let start = Instant::now();
    for _ in 0..options.warmup_runs {
        match frame::decode_frame(black_box(&raw), max_payload) {
            Ok((decoded, _)) => {
                black_box(decoded);
            }
            Err(e) => {
                debug!(error = %e, "warm-up decode failed");
                break;
            }
        }
    }
    let report = WarmupReport {
        runs: options.warmup_runs,
        bytes_per_run: size,
        elapsed: start.elapsed(),
    };
    debug!(elapsed = ?report.elapsed, per_run = ?report.per_run(), "warm-up finished");
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_frame_decodes() {
        let raw = synthetic_frame(70_000);
        let decoded = frame::decode(&raw).unwrap();
        assert!(decoded.masked);
        assert_eq!(decoded.opcode, Opcode::Binary);
        assert_eq!(decoded.payload_len(), 70_000);
        // 2 + 8 extended length + 4 mask key
        assert_eq!(raw.len(), 70_000 + 14);
    }

    #[test]
    fn test_run_reports_configuration() {
        let options = Options {
            warmup_runs: 3,
            warmup_data_size: 4096,
            ..Options::default()
        };
        let report = run(&options);
        assert_eq!(report.runs, 3);
        assert_eq!(report.bytes_per_run, 4096);
    }

    #[test]
    fn test_payload_larger_than_limit_still_decodes() {
        let options = Options {
            warmup_runs: 1,
            warmup_data_size: 2048,
            max_message_size: 16,
            ..Options::default()
        };
        assert_eq!(run(&options).runs, 1);
    }

    #[test]
    fn test_zero_runs() {
        let options = Options {
            warmup_runs: 0,
            warmup_data_size: 8,
            ..Options::default()
        };
        let report = run(&options);
        assert_eq!(report.per_run(), Duration::ZERO);
    }
}
