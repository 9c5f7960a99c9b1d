//! Advisory progress events emitted by the passes.
//!
//! Reporting never changes what a pass does; [Silent] is always a valid sink.

use std::io::Write;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Event<'a> {
    pub stage: &'a str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<&'a str>,
}

impl<'a> Event<'a> {
    pub fn new(stage: &'a str, message: &'a str) -> Self {
        Self {
            stage,
            message,
            fraction: None,
            details: None,
        }
    }

    pub fn fraction(mut self, fraction: f64) -> Self {
        self.fraction = Some(fraction.clamp(0.0, 1.0));
        self
    }

    pub fn details(mut self, details: &'a str) -> Self {
        self.details = Some(details);
        self
    }
}

pub trait Progress {
    fn report(&mut self, event: &Event<'_>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl Progress for Silent {
    fn report(&mut self, _event: &Event<'_>) {}
}

/// Forwards events to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logged;

impl Progress for Logged {
    fn report(&mut self, event: &Event<'_>) {
        tracing::debug!(
            stage = event.stage,
            fraction = event.fraction,
            details = event.details,
            "{}",
            event.message
        );
    }
}

/// Writes one JSON object per event, newline separated.
#[derive(Debug)]
pub struct JsonLines<W: Write> {
    writer: W,
}

impl<W: Write> JsonLines<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Progress for JsonLines<W> {
    fn report(&mut self, event: &Event<'_>) {
        let written = serde_json::to_writer(&mut self.writer, event)
            .map_err(std::io::Error::from)
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush());
        if let Err(err) = written {
            tracing::warn!("dropping progress event: {err}");
        }
    }
}

/// Records events in memory; handy for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct Collected {
    pub events: Vec<(String, String, Option<f64>)>,
}

impl Progress for Collected {
    fn report(&mut self, event: &Event<'_>) {
        self.events.push((
            event.stage.to_string(),
            event.message.to_string(),
            event.fraction,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lines_are_one_object_each() {
        let mut sink = JsonLines::new(Vec::new());
        sink.report(&Event::new("dedup", "accessors").fraction(0.5));
        sink.report(&Event::new("prune", "done").details("3 nodes"));

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["stage"], "dedup");
        assert_eq!(lines[0]["fraction"], 0.5);
        assert!(lines[0].get("details").is_none());
        assert_eq!(lines[1]["details"], "3 nodes");
    }

    #[test]
    fn fraction_is_clamped() {
        assert_eq!(Event::new("a", "b").fraction(1.7).fraction, Some(1.0));
    }
}
