//! Recorded detector output and offline replay.
//!
//! A trace is JSON lines, one frame per line:
//!
//! ```text
//! {"t_ms": 0, "detections": [ ... ]}
//! {"t_ms": 100, "error": "camera timeout"}
//! ```
//!
//! `t_ms` is optional; frames without it are spaced by the replay interval.
//! Blank lines and lines starting with `#` are ignored.

use std::io::BufRead;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use veriface_core::{AnalyzerError, Detection, FrameReport, VerificationSession, VerifyEvent};

#[derive(Debug, Clone, Deserialize)]
pub struct TraceFrame {
    #[serde(default)]
    pub t_ms: Option<u64>,
    #[serde(default)]
    pub detections: Vec<Detection>,
    /// Detector failure recorded for this frame.
    #[serde(default)]
    pub error: Option<String>,
}

pub fn parse_trace(reader: impl BufRead) -> Result<Vec<TraceFrame>> {
    let mut frames = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("failed to read trace")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let frame = serde_json::from_str(line)
            .with_context(|| format!("trace line {}: invalid frame", index + 1))?;
        frames.push(frame);
    }
    Ok(frames)
}

#[derive(Debug)]
pub struct ReplayStep {
    pub index: usize,
    pub report: FrameReport,
    pub events: Vec<VerifyEvent>,
}

/// Feed `frames` through `session` until it reaches a verdict or the trace
/// ends. Liveness timers are ticked at each frame's timestamp first.
pub fn replay(
    session: &mut VerificationSession,
    frames: &[TraceFrame],
    interval: Duration,
    start: Instant,
) -> Vec<ReplayStep> {
    let mut steps = Vec::with_capacity(frames.len());
    let mut fallback = Duration::ZERO;

    for (index, frame) in frames.iter().enumerate() {
        let offset = frame.t_ms.map(Duration::from_millis).unwrap_or(fallback);
        fallback = offset + interval;
        let now = start + offset;

        session.tick(now);
        let report = match (session.begin_frame(), &frame.error) {
            (Some(ticket), Some(error)) => {
                session.abandon_frame_at(ticket, &AnalyzerError::Backend(error.clone()), now)
            }
            (Some(ticket), None) => session.finish_frame_at(ticket, &frame.detections, now),
            (None, _) => session.snapshot(),
        };
        let terminal = session.is_terminal();
        steps.push(ReplayStep {
            index,
            report,
            events: session.take_events(),
        });
        if terminal {
            break;
        }
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use veriface_core::{FaceBox, Point, Terminal, VerifyConfig};

    fn frame_line(t_ms: u64, descriptor: [f32; 3]) -> String {
        let detection = Detection {
            landmarks: vec![Point::default(); 68],
            descriptor: descriptor.to_vec(),
            bounding_box: FaceBox::new(0.0, 0.0, 220.0, 240.0),
            score: Some(0.9),
        };
        serde_json::json!({ "t_ms": t_ms, "detections": [detection] }).to_string()
    }

    fn session() -> VerificationSession {
        let mut config = VerifyConfig::default();
        config.liveness.enabled = false;
        let mut session = VerificationSession::new(config);
        session.register(&[1.0, 0.0, 0.0]).unwrap();
        session.take_events();
        session
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let input = format!(
            "# recorded 2026-10-01\n\n{}\n{{\"error\": \"timeout\"}}\n",
            frame_line(0, [1.0, 0.0, 0.0])
        );
        let frames = parse_trace(input.as_bytes()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].t_ms, Some(0));
        assert_eq!(frames[0].detections.len(), 1);
        assert_eq!(frames[1].error.as_deref(), Some("timeout"));
        assert!(frames[1].detections.is_empty());
    }

    #[test]
    fn test_parse_reports_line_number() {
        let err = parse_trace("{}\nnot json\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_replay_stops_at_success() {
        let lines: Vec<String> = (0..5).map(|i| frame_line(i * 100, [1.0, 0.0, 0.0])).collect();
        let frames = parse_trace(lines.join("\n").as_bytes()).unwrap();

        let mut session = session();
        let steps = replay(&mut session, &frames, Duration::from_millis(100), Instant::now());

        // Identical descriptors are strong matches: +2 per frame, 3 needed.
        assert_eq!(steps.len(), 2);
        let last = steps.last().unwrap();
        assert_eq!(last.report.terminal, Terminal::Success);
        assert!(last.events.iter().any(|e| matches!(e, VerifyEvent::Success(_))));
    }

    #[test]
    fn test_replay_detector_errors_fail() {
        let frames = parse_trace("{\"error\": \"x\"}\n".repeat(6).as_bytes()).unwrap();

        let mut session = session();
        let steps = replay(&mut session, &frames, Duration::from_millis(100), Instant::now());

        assert_eq!(steps.len(), 4);
        assert_eq!(steps[3].report.terminal, Terminal::Fail);
    }
}
