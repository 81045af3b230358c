use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use log::{info, warn};
use prost::Message;

use crate::{
    config::RuntimeConfig,
    evaluation::EvalRound,
    metrics::{StepSnapshot, WindowSummary},
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(runtime: &RuntimeConfig) -> Self {
        Self {
            tensorboard_dir: runtime.tensorboard_dir.clone(),
            tensorboard_flush_every_n: runtime.tensorboard_flush_every_n.max(1),
        }
    }
}

/// Leader-side progress lines and TensorBoard scalars.
///
/// Followers hold a silent logger so call sites need no rank checks.
pub struct Logger {
    enabled: bool,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: &LoggingSettings, is_leader: bool) -> Result<Self, TrainingError> {
        let tensorboard = match (&settings.tensorboard_dir, is_leader) {
            (Some(dir), true) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            _ => None,
        };
        Ok(Self {
            enabled: is_leader,
            tensorboard,
        })
    }

    /// Per-step scalars. `breakdown` holds the objective's named terms.
    pub fn log_training_step(
        &mut self,
        ctr: usize,
        lr: f64,
        snapshot: &StepSnapshot,
        breakdown: &[(&'static str, f32)],
    ) {
        if !self.enabled {
            return;
        }
        self.scalar("train/loss", ctr, snapshot.step_loss);
        self.scalar("train/loss_ema", ctr, snapshot.loss_ema);
        self.scalar("train/grad_norm", ctr, snapshot.grad_norm);
        self.scalar("train/learning_rate", ctr, lr);
        self.scalar("train/target_tokens", ctr, snapshot.tokens as f64);
        for (term, value) in breakdown {
            self.scalar(&format!("train/{term}"), ctr, f64::from(*value));
        }
    }

    /// The progress line covering the steps since the previous one.
    pub fn log_window(&mut self, ctr: usize, lr: f64, window: &WindowSummary) {
        if !self.enabled || window.steps == 0 {
            return;
        }
        info!(
            "ctr={} loss={:.4} loss_ema={:.4} tok/s={:.1} grad_norm={:.3} lr={:.5e} ({} steps in {:.1}s)",
            ctr,
            window.mean_loss,
            window.loss_ema,
            window.tokens_per_sec,
            window.mean_grad_norm,
            lr,
            window.steps,
            window.elapsed.as_secs_f64()
        );
        if window.skipped > 0 {
            info!("{} of {} updates skipped for overflow", window.skipped, window.steps);
        }
        self.scalar("train/tokens_per_sec", ctr, window.tokens_per_sec);
    }

    pub fn log_evaluation(&mut self, ctr: usize, round: &EvalRound) {
        if !self.enabled {
            return;
        }
        for (task, score) in &round.scores {
            self.scalar(&format!("eval/{task}"), ctr, *score);
        }
        self.scalar("eval/global", ctr, round.report.global_score);
    }

    fn scalar(&mut self, tag: &str, ctr: usize, value: f64) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.write_scalar(tag, ctr as i64, value) {
                warn!("dropping tensorboard writer: {err}");
                self.tensorboard = None;
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let timestamp = current_unix_timestamp();
        let hostname = hostname();
        let filename = format!("events.out.tfevents.{}.{}", timestamp, hostname);
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let wall_time = current_wall_time();
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time,
            step,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len = data.len() as u64;

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&len.to_le_bytes());
        let len_crc = masked_crc32(&len_bytes);
        let data_crc = masked_crc32(data.as_ref());

        let len_crc_bytes = len_crc.to_le_bytes();
        let data_crc_bytes = data_crc.to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_crc_matches_tfrecord_reference() {
        // Masked CRC of the empty string as written by TensorFlow.
        assert_eq!(masked_crc32(b""), 0xa282_ead8);
    }

    #[test]
    fn leader_writes_framed_events() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LoggingSettings {
            tensorboard_dir: Some(dir.path().to_path_buf()),
            tensorboard_flush_every_n: 1,
        };
        let mut logger = Logger::new(&settings, true).unwrap();
        logger.scalar("train/loss", 3, 1.5);
        logger.flush();

        let file = fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap().path();
        let bytes = fs::read(file).unwrap();
        let len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
        assert_eq!(bytes.len(), 8 + 4 + len + 4);
        let event = Event::decode(&bytes[12..12 + len]).unwrap();
        assert_eq!(event.step, 3);
        assert_eq!(event.summary.unwrap().value[0].tag, "train/loss");
    }

    #[test]
    fn followers_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LoggingSettings {
            tensorboard_dir: Some(dir.path().join("tb")),
            tensorboard_flush_every_n: 1,
        };
        let mut logger = Logger::new(&settings, false).unwrap();
        logger.scalar("train/loss", 0, 1.0);
        assert!(!dir.path().join("tb").exists());
    }
}
