use anyhow::{anyhow, Context, Result};
use std::io::BufRead;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use super::payload::parse_frame_payload;
use super::result::DetectionFrame;

/// Producer of tracked detections, one frame at a time.
///
/// Implementations wrap the external detector/tracker. The aggregator treats
/// their output as an oracle: it never looks at pixels and never asks for
/// anything beyond track ids, boxes and confidences.
pub trait DetectionSource {
    /// Source identifier used in log lines.
    fn name(&self) -> &str;

    /// Next processed frame, `Ok(None)` once the stream has ended.
    ///
    /// An `Err` is a transient failure: the caller skips the tick and asks
    /// again.
    fn next_frame(&mut self) -> Result<Option<DetectionFrame>>;

    /// Like `next_frame`, but may return [`FramePoll::Idle`] instead of
    /// blocking so the caller can react to a stop request.
    fn poll_frame(&mut self) -> Result<FramePoll> {
        Ok(match self.next_frame()? {
            Some(frame) => FramePoll::Ready(frame),
            None => FramePoll::Ended,
        })
    }
}

#[derive(Debug)]
pub enum FramePoll {
    Ready(DetectionFrame),
    /// Nothing arrived within the poll interval.
    Idle,
    Ended,
}

/// Replays tracker output written as JSON lines, one frame per line.
pub struct JsonLinesSource<R> {
    name: String,
    reader: R,
    line_no: u64,
    buf: String,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader,
            line_no: 0,
            buf: String::new(),
        }
    }
}

impl<R: BufRead> DetectionSource for JsonLinesSource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self) -> Result<Option<DetectionFrame>> {
        loop {
            self.buf.clear();
            self.line_no += 1;
            let read = self.reader.read_line(&mut self.buf).with_context(|| {
                format!("read detection line {} from {}", self.line_no, self.name)
            })?;
            if read == 0 {
                return Ok(None);
            }
            let line = self.buf.trim();
            if line.is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| anyhow!("{} line {}: parse error: {}", self.name, self.line_no, e))?;
            let frame = parse_frame_payload(&value)
                .with_context(|| format!("{} line {}", self.name, self.line_no))?;
            return Ok(Some(frame));
        }
    }
}

const FRAME_QUEUE_DEPTH: usize = 64;

/// Runs a blocking source on its own reader thread.
///
/// `poll_frame` waits at most `poll_interval` and reports `Idle` otherwise,
/// so a quiet upstream never pins the aggregation loop. The reader thread is
/// detached on drop; it may stay blocked in its read until the process exits.
pub struct ThreadedSource {
    name: String,
    frames: Receiver<Result<Option<DetectionFrame>>>,
    poll_interval: Duration,
    ended: bool,
}

impl ThreadedSource {
    pub fn spawn<S>(mut source: S, poll_interval: Duration) -> Result<Self>
    where
        S: DetectionSource + Send + 'static,
    {
        let name = source.name().to_string();
        let (tx, rx) = mpsc::sync_channel(FRAME_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name(format!("pathguard-source-{}", name))
            .spawn(move || loop {
                let next = source.next_frame();
                let finished = matches!(next, Ok(None));
                if tx.send(next).is_err() || finished {
                    break;
                }
            })
            .with_context(|| format!("spawn reader thread for {}", name))?;
        Ok(Self {
            name,
            frames: rx,
            poll_interval,
            ended: false,
        })
    }
}

impl DetectionSource for ThreadedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self) -> Result<Option<DetectionFrame>> {
        if self.ended {
            return Ok(None);
        }
        match self.frames.recv() {
            Ok(next) => next,
            Err(_) => {
                self.ended = true;
                Ok(None)
            }
        }
    }

    fn poll_frame(&mut self) -> Result<FramePoll> {
        if self.ended {
            return Ok(FramePoll::Ended);
        }
        match self.frames.recv_timeout(self.poll_interval) {
            Ok(Ok(Some(frame))) => Ok(FramePoll::Ready(frame)),
            Ok(Ok(None)) | Err(RecvTimeoutError::Disconnected) => {
                self.ended = true;
                Ok(FramePoll::Ended)
            }
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(FramePoll::Idle),
        }
    }
}
