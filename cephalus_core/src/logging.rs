//! JSON-lines run logs for step frames and TD decisions.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::frame::StateFrame;
use crate::q::DecisionRecord;

fn timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn l2_norm<'a>(values: impl Iterator<Item = &'a f32>) -> f32 {
    values.map(|v| v * v).sum::<f32>().sqrt()
}

/// Appends `value` as one JSON line, creating parent directories and the file as needed.
pub fn append_json_line<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> io::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    serde_json::to_writer(&mut file, value)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    file.write_all(b"\n")
}

#[derive(Debug, Serialize)]
pub struct FrameLogEntry {
    pub stream_id: String,
    pub clock_ticks: u64,
    pub trained: bool,
    pub combined_loss: Option<f32>,
    pub input_count: usize,
    pub state_norm: Option<f32>,
    pub state_gradient_norm: Option<f32>,
    pub timestamp_ms: u128,
}

impl FrameLogEntry {
    pub fn from_frame(frame: &StateFrame) -> Self {
        Self {
            stream_id: frame.stream_id().to_string(),
            clock_ticks: frame.clock_ticks(),
            trained: frame.is_trained(),
            combined_loss: frame.combined_loss(),
            input_count: frame.input_tensors().len(),
            state_norm: frame
                .current_state()
                .map(|state| l2_norm(state.value().iter())),
            state_gradient_norm: frame
                .current_state_gradient()
                .map(|grad| l2_norm(grad.iter())),
            timestamp_ms: timestamp_ms(),
        }
    }
}

/// Logs a frame, typically right after its successor's step trained it.
pub fn log_frame<P: AsRef<Path>>(path: P, frame: &StateFrame) -> io::Result<()> {
    append_json_line(path, &FrameLogEntry::from_frame(frame))
}

#[derive(Debug, Serialize)]
pub struct DecisionLogEntry<'a> {
    #[serde(flatten)]
    pub decision: &'a DecisionRecord,
    pub episode: u64,
    pub timestamp_ms: u128,
}

/// Logs a closed TD decision.
pub fn log_decision<P: AsRef<Path>>(
    path: P,
    decision: &DecisionRecord,
    episode: u64,
) -> io::Result<()> {
    let entry = DecisionLogEntry {
        decision,
        episode,
        timestamp_ms: timestamp_ms(),
    };
    append_json_line(path, &entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Line {
        value: u32,
    }

    #[test]
    fn test_append_json_line_writes_one_record_per_line() {
        let dir = std::env::temp_dir().join(format!("cephalus-log-{}", uuid::Uuid::new_v4()));
        let path = dir.join("run.jsonl");
        append_json_line(&path, &Line { value: 1 }).unwrap();
        append_json_line(&path, &Line { value: 2 }).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["value"], 2);
        fs::remove_dir_all(dir).unwrap();
    }
}
