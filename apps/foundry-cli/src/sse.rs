use std::io::BufRead;

use anyhow::{Context, Result};
use foundry_protocol::StreamEvent;

/// One dispatched `event:`/`data:` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

impl Frame {
    pub fn decode(&self) -> Result<StreamEvent> {
        serde_json::from_str(&self.data).with_context(|| format!("decoding {} payload", self.event))
    }
}

/// Pull frames off a `text/event-stream` body; comments and keep-alives are skipped.
pub struct FrameReader<R> {
    reader: R,
    line: String,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for FrameReader<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut event = String::new();
        let mut data = String::new();
        loop {
            self.line.clear();
            let read = match self.reader.read_line(&mut self.line) {
                Ok(n) => n,
                Err(err) => return Some(Err(err.into())),
            };
            let at_eof = read == 0;
            let line = self.line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !data.is_empty() {
                    if event.is_empty() {
                        event.push_str("message");
                    }
                    return Some(Ok(Frame { event, data }));
                }
                if at_eof {
                    return None;
                }
                event.clear();
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("event:") {
                event = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_protocol::EventKind;
    use std::io::Cursor;

    #[test]
    fn frames_are_split_on_blank_lines() {
        let raw = concat!(
            ": keep-alive\n\n",
            "event: command_start\n",
            "data: {\"type\":\"command_start\",\"timestamp\":\"t\",\"data\":{\"pid\":7}}\n\n",
            "event: command_complete\r\n",
            "data: {\"type\":\"command_complete\",\"timestamp\":\"t\",\"data\":{\"exit_code\":0}}\r\n\r\n",
        );
        let frames: Vec<_> = FrameReader::new(Cursor::new(raw))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "command_start");
        let done = frames[1].decode().unwrap();
        assert_eq!(done.kind, EventKind::CommandComplete);
        assert_eq!(done.data["exit_code"], 0);
    }

    #[test]
    fn trailing_frame_without_blank_line_is_kept() {
        let raw = "event: x\ndata: a\ndata: b";
        let frames: Vec<_> = FrameReader::new(Cursor::new(raw))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            frames,
            vec![Frame {
                event: "x".into(),
                data: "a\nb".into()
            }]
        );
    }
}
