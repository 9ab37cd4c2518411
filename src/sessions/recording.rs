//! Append-only session recording in asciinema v2 format.
//!
//! The first line of `stream-out` is a JSON header object; every following
//! line is a JSON array event. Output and resize records are interoperable
//! with asciinema players; input records and the terminal `["exit", code,
//! sessionId]` record are extensions.
//!
//! The writer is owned by the session's bridging thread, which is the only
//! producer of output/input/resize records; the exit watcher appends the
//! final exit record after the bridge has finished. An internal mutex makes
//! each record atomic regardless.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

/// Recording header (asciinema v2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Header {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    /// Wall-clock seconds since the epoch at recording start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

impl Header {
    pub fn new(width: u32, height: u32) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs());
        Self {
            version: 2,
            width,
            height,
            timestamp,
            command: None,
            title: None,
            env: None,
        }
    }
}

/// One record of a session recording.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingEvent {
    Header(Header),
    /// PTY output at `time` seconds since the header.
    Output { time: f64, data: String },
    /// Client input at `time` seconds since the header.
    Input { time: f64, data: String },
    /// Terminal resize; `size` is `"{cols}x{rows}"`.
    Resize { time: f64, size: String },
    /// Terminal record: process exit.
    Exit { code: i32, session_id: String },
}

struct Inner {
    file: Option<BufWriter<File>>,
    start: Instant,
}

/// Append-only writer for a single session's `stream-out` file.
pub struct StreamWriter {
    inner: Mutex<Inner>,
}

impl StreamWriter {
    /// Create the recording file and write the header line.
    pub fn create(path: &Path, header: &Header) -> io::Result<Self> {
        let file = File::options()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        let line = serde_json::to_string(header).map_err(io::Error::other)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(Self {
            inner: Mutex::new(Inner {
                file: Some(writer),
                start: Instant::now(),
            }),
        })
    }

    /// Seconds elapsed since the header was written, millisecond precision.
    pub fn elapsed(&self) -> f64 {
        let inner = self.inner.lock().expect("stream writer poisoned");
        elapsed_secs(inner.start)
    }

    fn write_line(&self, value: &Value) -> io::Result<()> {
        let mut inner = self.inner.lock().expect("stream writer poisoned");
        let Some(ref mut file) = inner.file else {
            return Ok(()); // closed — late records are dropped
        };
        let line = serde_json::to_string(value).map_err(io::Error::other)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()
    }

    /// Append an output record with the current elapsed time.
    pub fn write_output(&self, data: &[u8]) -> io::Result<()> {
        let t = {
            let inner = self.inner.lock().expect("stream writer poisoned");
            elapsed_secs(inner.start)
        };
        self.write_line(&json!([t, "o", String::from_utf8_lossy(data)]))
    }

    /// Append an input record with the current elapsed time.
    pub fn write_input(&self, data: &[u8]) -> io::Result<()> {
        let t = {
            let inner = self.inner.lock().expect("stream writer poisoned");
            elapsed_secs(inner.start)
        };
        self.write_line(&json!([t, "i", String::from_utf8_lossy(data)]))
    }

    /// Append a resize record (`"{cols}x{rows}"`).
    pub fn write_resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let t = {
            let inner = self.inner.lock().expect("stream writer poisoned");
            elapsed_secs(inner.start)
        };
        self.write_line(&json!([t, "r", format!("{cols}x{rows}")]))
    }

    /// Append the terminal exit record.
    pub fn write_exit(&self, code: i32, session_id: &str) -> io::Result<()> {
        self.write_line(&json!(["exit", code, session_id]))
    }

    /// Flush and close the file. Idempotent; records written after close are
    /// silently dropped.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("stream writer poisoned");
        if let Some(mut file) = inner.file.take() {
            if let Err(e) = file.flush() {
                warn!("stream writer flush on close failed: {e}");
            }
        }
    }
}

fn elapsed_secs(start: Instant) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let ms = start.elapsed().as_millis() as f64;
    ms / 1000.0
}

/// Read every event of a recording file, header first.
///
/// Corrupt lines are skipped with a warning, matching the tolerance of the
/// metadata loader — a half-written trailing line must not hide the rest of
/// the recording.
pub fn read_events(path: &Path) -> io::Result<Vec<RecordingEvent>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut lines = reader.lines();

    let Some(header_line) = lines.next() else {
        return Ok(events);
    };
    match serde_json::from_str::<Header>(&header_line?) {
        Ok(h) => events.push(RecordingEvent::Header(h)),
        Err(e) => {
            warn!("recording: bad header line: {e}");
            return Ok(events);
        }
    }

    for line in lines {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match parse_event_line(&line) {
            Some(event) => events.push(event),
            None => warn!("recording: skipping corrupt line"),
        }
    }
    Ok(events)
}

/// Parse a single non-header recording line.
pub fn parse_event_line(line: &str) -> Option<RecordingEvent> {
    let value: Value = serde_json::from_str(line).ok()?;
    let arr = value.as_array()?;
    if arr.first()?.as_str() == Some("exit") {
        #[allow(clippy::cast_possible_truncation)]
        return Some(RecordingEvent::Exit {
            code: arr.get(1)?.as_i64()? as i32,
            session_id: arr.get(2)?.as_str()?.to_string(),
        });
    }
    let time = arr.first()?.as_f64()?;
    let kind = arr.get(1)?.as_str()?;
    let data = arr.get(2)?.as_str()?.to_string();
    match kind {
        "o" => Some(RecordingEvent::Output { time, data }),
        "i" => Some(RecordingEvent::Input { time, data }),
        "r" => Some(RecordingEvent::Resize { time, size: data }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");

        let mut header = Header::new(80, 24);
        header.command = Some("echo hello".to_string());
        let writer = StreamWriter::create(&path, &header).unwrap();
        writer.write_output(b"hello\r\n").unwrap();
        writer.write_input(b"abc\n").unwrap();
        writer.write_resize(120, 40).unwrap();
        writer.write_exit(0, "sess-1").unwrap();
        writer.close();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 5);
        assert!(matches!(&events[0], RecordingEvent::Header(h) if h.version == 2 && h.width == 80));
        assert!(
            matches!(&events[1], RecordingEvent::Output { data, .. } if data == "hello\r\n")
        );
        assert!(matches!(&events[2], RecordingEvent::Input { data, .. } if data == "abc\n"));
        assert!(matches!(&events[3], RecordingEvent::Resize { size, .. } if size == "120x40"));
        assert!(
            matches!(&events[4], RecordingEvent::Exit { code: 0, session_id } if session_id == "sess-1")
        );
    }

    #[test]
    fn test_event_times_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");
        let writer = StreamWriter::create(&path, &Header::new(80, 24)).unwrap();
        writer.write_output(b"a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        writer.write_output(b"b").unwrap();
        writer.close();

        let events = read_events(&path).unwrap();
        let times: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                RecordingEvent::Output { time, .. } => Some(*time),
                _ => None,
            })
            .collect();
        assert_eq!(times.len(), 2);
        assert!(times[0] <= times[1]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");
        let writer = StreamWriter::create(&path, &Header::new(80, 24)).unwrap();
        writer.close();
        writer.close();
        // Writes after close are dropped, not errors.
        writer.write_output(b"late").unwrap();
        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_corrupt_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream-out");
        let writer = StreamWriter::create(&path, &Header::new(80, 24)).unwrap();
        writer.write_output(b"ok").unwrap();
        writer.close();

        use std::io::Write as _;
        let mut f = File::options().append(true).open(&path).unwrap();
        f.write_all(b"{not json\n").unwrap();
        f.write_all(b"[0.5, \"o\", \"after\"]\n").unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 3); // header + 2 outputs, corrupt line skipped
    }

    #[test]
    fn test_parse_event_line_unknown_kind() {
        assert!(parse_event_line("[0.1, \"z\", \"data\"]").is_none());
        assert!(parse_event_line("not json").is_none());
    }
}
