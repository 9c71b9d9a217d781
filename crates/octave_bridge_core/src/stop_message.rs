//! Stop banners and stack dumps arriving on the REPL's diagnostic stream.

use crate::patterns::{self, is_empty_line, stack_dump, stop_banner};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    Breakpoint,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Position in the dump, innermost frame first.
    pub id: usize,
    pub name: String,
    pub function: String,
    pub line: u32,
    pub column: u32,
}

impl StackFrame {
    fn synthetic_error() -> Self {
        Self {
            id: 0,
            name: "error".to_string(),
            function: "error".to_string(),
            line: 0,
            column: 0,
        }
    }
}

/// True when the tail of `lines` is a complete stop banner:
/// `stopped in <name> at line <N>`, `<N>: <code>`, then a blank line.
pub fn is_stop_message<S: AsRef<str>>(lines: &[S]) -> bool {
    let [.., first, second, third] = lines else {
        return false;
    };
    stop_banner::FIRST_LINE.is_match(first.as_ref())
        && stop_banner::SECOND_LINE.is_match(second.as_ref())
        && is_empty_line(third.as_ref())
}

/// Frames of an `error: called from` block, or `None` when there is no such block.
pub fn parse_stack_dump<S: AsRef<str>>(lines: &[S]) -> Option<Vec<StackFrame>> {
    let header = lines
        .iter()
        .position(|l| stack_dump::HEADER.is_match(l.as_ref()))?;

    let mut frames = Vec::new();
    for line in &lines[header + 1..] {
        let line = line.as_ref();
        if is_empty_line(line) {
            break;
        }
        let Some(caps) = stack_dump::FRAME.captures(line) else {
            break;
        };
        let (Ok(line_no), Ok(column)) = (caps[2].parse(), caps[3].parse()) else {
            tracing::warn!(line, "Stack frame position out of range");
            break;
        };
        let name = caps[1].to_string();
        let function = name.rsplit('>').next().unwrap_or(&name).to_string();
        frames.push(StackFrame {
            id: frames.len(),
            name,
            function,
            line: line_no,
            column,
        });
    }

    if frames.is_empty() {
        None
    } else {
        Some(frames)
    }
}

/// Single frame built from a `stopped in <name> at line <N>` line.
pub fn banner_frame(line: &str) -> Option<StackFrame> {
    let caps = stop_banner::FIRST_LINE.captures(line)?;
    let location = caps[1].trim();
    let function = Path::new(location)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| location.to_string());
    let line_no = caps[2].parse().ok()?;
    Some(StackFrame {
        id: 0,
        name: function.clone(),
        function,
        line: line_no,
        column: 0,
    })
}

/// One asynchronous stop, as delivered to the outer debugging session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopNotification {
    pub kind: StopKind,
    pub frames: Vec<StackFrame>,
    pub lines: Vec<String>,
}

impl StopNotification {
    /// Build a notification from diagnostic lines. Never fails: an unrecognized
    /// banner yields a single synthetic `error` frame.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Self {
        let kind = if lines
            .iter()
            .any(|l| patterns::ERROR_LINE.is_match(l.as_ref()))
        {
            StopKind::Error
        } else {
            StopKind::Breakpoint
        };

        let frames = parse_stack_dump(lines).unwrap_or_else(|| {
            let banner = lines
                .iter()
                .rev()
                .find_map(|l| banner_frame(l.as_ref()));
            match banner {
                Some(frame) => vec![frame],
                None => {
                    tracing::warn!(lines = lines.len(), "Unrecognized stop banner");
                    vec![StackFrame::synthetic_error()]
                }
            }
        });

        Self {
            kind,
            frames,
            lines: lines.iter().map(|l| l.as_ref().to_string()).collect(),
        }
    }

    pub fn top_frame(&self) -> Option<&StackFrame> {
        self.frames.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_without_stack_dump_synthesizes_one_frame() {
        let lines = ["stopped in foo at line 3", "3: x = 1", ""];
        assert!(is_stop_message(&lines));

        let stop = StopNotification::parse(&lines);
        assert_eq!(stop.kind, StopKind::Breakpoint);
        assert_eq!(
            stop.frames,
            vec![StackFrame {
                id: 0,
                name: "foo".to_string(),
                function: "foo".to_string(),
                line: 3,
                column: 0,
            }]
        );
    }

    #[test]
    fn banner_function_name_comes_from_file_stem() {
        let frame = banner_frame("stopped in /home/user/project/solve.m at line 17")
            .expect("banner should parse");
        assert_eq!(frame.function, "solve");
        assert_eq!(frame.line, 17);
    }

    #[test]
    fn stop_message_needs_full_trailer() {
        assert!(!is_stop_message(&["3: x = 1", ""]));
        assert!(!is_stop_message(&["stopped in foo at line 3", "3: x = 1"]));
        assert!(!is_stop_message(&["stopped in foo at line 3", "3: x = 1", "more"]));
        assert!(is_stop_message(&[
            "warning: something odd",
            "stopped in foo at line 3",
            "3: x = 1",
            "",
        ]));
    }

    #[test]
    fn stack_dump_frames_are_innermost_first() {
        let lines = [
            "error: index (5,_): out of bound 3",
            "error: called from",
            "    helper at line 8 column 5",
            "    main>inner at line 20 column 3",
            "",
            "stopped in /tmp/helper.m at line 8",
            "8:   y = v(5);",
            "",
        ];
        assert!(is_stop_message(&lines));

        let stop = StopNotification::parse(&lines);
        assert_eq!(stop.kind, StopKind::Error);
        assert_eq!(stop.frames.len(), 2);
        assert_eq!(stop.frames[0].id, 0);
        assert_eq!(stop.frames[0].name, "helper");
        assert_eq!(stop.frames[0].line, 8);
        assert_eq!(stop.frames[0].column, 5);
        assert_eq!(stop.frames[1].id, 1);
        assert_eq!(stop.frames[1].name, "main>inner");
        assert_eq!(stop.frames[1].function, "inner");
        assert_eq!(stop.top_frame().map(|f| f.line), Some(8));
    }

    #[test]
    fn stack_dump_stops_at_first_non_frame_line() {
        let lines = [
            "error: called from",
            "    a at line 1 column 1",
            "stopped in a at line 1",
        ];
        let frames = parse_stack_dump(&lines).expect("dump should parse");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn header_without_frames_falls_back_to_banner() {
        let lines = ["error: called from", "", "stopped in bar at line 2", "2: y", ""];
        assert!(parse_stack_dump(&lines).is_none());
        let stop = StopNotification::parse(&lines);
        assert_eq!(stop.frames[0].name, "bar");
        assert_eq!(stop.frames[0].line, 2);
    }

    #[test]
    fn unparseable_banner_yields_synthetic_error_frame() {
        let stop = StopNotification::parse(&["something went sideways", ""]);
        assert_eq!(stop.frames, vec![StackFrame::synthetic_error()]);
        assert_eq!(stop.lines.len(), 2);
    }
}
