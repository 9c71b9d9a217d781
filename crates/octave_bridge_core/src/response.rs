//! Reply completion tests and value extraction for the REPL's primary output.
//!
//! Completion is decided purely from the shape of the trailing lines, since the REPL
//! carries no framing. Extraction is heuristic and never fails: an unrecognized reply
//! is reported as [`ReplyShape::Bare`].

use crate::patterns::{self, is_empty_line};
use crate::BridgeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Non-empty lines of `whos` framing before and after the data rows. The trailing
/// pair is the `Total` footer and the prompt.
const LISTING_LEADING_LINES: usize = 3;
const LISTING_TRAILING_LINES: usize = 2;

/// Which prompt terminates a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    Normal,
    Debug,
    /// Mode unknown: either prompt completes a reply.
    #[default]
    Either,
}

pub fn is_complete<S: AsRef<str>>(lines: &[S], mode: PromptMode) -> bool {
    match mode {
        PromptMode::Debug => is_complete_debug(lines),
        PromptMode::Normal => is_complete_normal(lines),
        PromptMode::Either => is_complete_debug(lines) || is_complete_normal(lines),
    }
}

/// The debug prompt ends the reply, either as the last line or followed by the blank
/// line the REPL echoes after it.
pub fn is_complete_debug<S: AsRef<str>>(lines: &[S]) -> bool {
    match lines {
        [.., prompt, last] if last.as_ref().is_empty() => {
            patterns::DEBUG_PROMPT.is_match(prompt.as_ref())
        }
        [.., last] => patterns::DEBUG_PROMPT.is_match(last.as_ref()),
        [] => false,
    }
}

pub fn is_complete_normal<S: AsRef<str>>(lines: &[S]) -> bool {
    lines
        .last()
        .is_some_and(|last| patterns::NORMAL_PROMPT.is_match(last.as_ref()))
}

fn is_prompt(line: &str) -> bool {
    patterns::DEBUG_PROMPT.is_match(line) || patterns::NORMAL_PROMPT.is_match(line)
}

/// Split a completed reply into its body and its terminating prompt.
///
/// Blank lines before the body (left over from a previous reply's trailing newline)
/// are dropped too.
fn split_prompt<S: AsRef<str>>(lines: &[S]) -> (&[S], Option<&str>) {
    let (body, prompt) = match lines {
        [rest @ .., prompt, last] if last.as_ref().is_empty() && is_prompt(prompt.as_ref()) => {
            (rest, Some(prompt.as_ref()))
        }
        [rest @ .., prompt] if is_prompt(prompt.as_ref()) => (rest, Some(prompt.as_ref())),
        _ => (lines, None),
    };
    let leading = body.iter().take_while(|l| is_empty_line(l.as_ref())).count();
    (&body[leading..], prompt)
}

/// What structured value a completed reply carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyShape {
    /// The classifier needs more lines.
    Incomplete,
    /// Bare prompt or a reply with no extractable value.
    Bare,
    SingleValue { name: String, value: String },
    MultiValue { name: String, rows: Vec<Vec<String>> },
}

impl ReplyShape {
    /// Classify a reply body (prompt already removed).
    pub fn from_body<S: AsRef<str>>(body: &[S]) -> Self {
        if let [only] = body {
            if let Some(caps) = patterns::SINGLE_VALUE.captures(only.as_ref()) {
                return Self::SingleValue {
                    name: caps[1].to_string(),
                    value: caps[2].to_string(),
                };
            }
        }

        if let [header, rows @ .., last] = body {
            if last.as_ref().is_empty() {
                if let Some(caps) = patterns::MULTI_VALUE_HEADER.captures(header.as_ref()) {
                    let rows = rows
                        .iter()
                        .map(|row| tokenize(row.as_ref()))
                        .filter(|row| !row.is_empty())
                        .collect();
                    return Self::MultiValue {
                        name: caps[1].to_string(),
                        rows,
                    };
                }
            }
        }

        if !body.is_empty() {
            tracing::debug!(lines = body.len(), "Reply carries no extractable value");
        }
        Self::Bare
    }

    pub fn is_complete(&self) -> bool {
        !matches!(self, Self::Incomplete)
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::SingleValue { name, .. } | Self::MultiValue { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Grid view of the value; a single value is a 1x1 grid.
    pub fn values(&self) -> Vec<Vec<String>> {
        match self {
            Self::SingleValue { value, .. } => vec![vec![value.clone()]],
            Self::MultiValue { rows, .. } => rows.clone(),
            _ => Vec::new(),
        }
    }

    /// Numeric tokens in row-major order. Malformed tokens are skipped.
    pub fn numbers(&self) -> Vec<f64> {
        self.values()
            .iter()
            .flatten()
            .filter_map(|token| token.parse::<f64>().ok())
            .collect()
    }

    /// Short text rendering: the literal for a single value, rows joined with `; `.
    pub fn value_text(&self) -> Option<String> {
        match self {
            Self::SingleValue { value, .. } => Some(value.clone()),
            Self::MultiValue { rows, .. } => Some(
                rows.iter()
                    .map(|row| row.join(" "))
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            _ => None,
        }
    }
}

fn tokenize(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

/// Classify raw reply lines, terminating prompt included.
pub fn classify<S: AsRef<str>>(lines: &[S], mode: PromptMode) -> ReplyShape {
    if !is_complete(lines, mode) {
        return ReplyShape::Incomplete;
    }
    let (body, _) = split_prompt(lines);
    ReplyShape::from_body(body)
}

/// One completed reply, as resolved by the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    /// Every line of the reply, terminating prompt included.
    pub lines: Vec<String>,
    /// Lines between the command and the prompt.
    pub body: Vec<String>,
    pub prompt: Option<String>,
}

impl Reply {
    pub fn new(lines: Vec<String>) -> Self {
        let (body, prompt) = split_prompt(&lines);
        let body = body.to_vec();
        let prompt = prompt.map(str::to_string);
        Self {
            lines,
            body,
            prompt,
        }
    }

    pub fn shape(&self) -> ReplyShape {
        ReplyShape::from_body(&self.body)
    }

    /// True when the REPL answered with the debug prompt.
    pub fn in_debug_mode(&self) -> bool {
        self.prompt
            .as_deref()
            .is_some_and(|p| patterns::DEBUG_PROMPT.is_match(p))
    }
}

/// Resolve `which` output into name → file path. Prompt lines are ignored.
pub fn parse_symbol_locations<S: AsRef<str>>(lines: &[S]) -> HashMap<String, String> {
    let (body, _) = split_prompt(lines);
    body.iter()
        .filter_map(|line| patterns::SYMBOL_LOCATION.captures(line.as_ref()))
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableAttribute {
    Automatic,
    Complex,
    Formal,
    Global,
    Persistent,
    Other(char),
}

impl From<char> for VariableAttribute {
    fn from(flag: char) -> Self {
        match flag {
            'a' => Self::Automatic,
            'c' => Self::Complex,
            'f' => Self::Formal,
            'g' => Self::Global,
            'p' => Self::Persistent,
            other => Self::Other(other),
        }
    }
}

/// One row of the `whos` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    pub name: String,
    pub dims: Vec<usize>,
    pub class: String,
    pub bytes: Option<u64>,
    pub attributes: Vec<VariableAttribute>,
}

impl VariableDescriptor {
    pub fn is_scalar(&self) -> bool {
        self.dims == [1, 1]
    }

    pub fn dims_text(&self) -> String {
        self.dims
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join("x")
    }

    /// Stand-in text for values too large to render inline.
    pub fn placeholder(&self) -> String {
        format!("{} {} matrix", self.dims_text(), self.class)
    }

    fn parse_row(tokens: &[&str]) -> std::result::Result<Self, String> {
        let (attributes, rest) = match tokens {
            [attr, rest @ ..] if tokens.len() == 5 => {
                (attr.chars().map(VariableAttribute::from).collect(), rest)
            }
            _ if tokens.len() == 4 => (Vec::new(), tokens),
            _ => return Err(format!("expected 4 or 5 tokens, got {}", tokens.len())),
        };
        let [name, size, bytes, class] = rest else {
            return Err(format!("expected 4 or 5 tokens, got {}", tokens.len()));
        };

        let dims = size
            .split('x')
            .map(|d| d.parse::<usize>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid size '{size}': {e}"))?;

        Ok(Self {
            name: name.to_string(),
            dims,
            class: class.to_string(),
            bytes: bytes.parse().ok(),
            attributes,
        })
    }
}

/// Parsed `whos` output. A malformed row stops the listing; rows before it are kept.
#[derive(Debug, Default)]
pub struct VariableListing {
    pub variables: Vec<VariableDescriptor>,
    pub error: Option<BridgeError>,
}

/// Parse a `whos` reply: 3 framing lines before the rows, then the footer and the
/// prompt. Offsets count non-empty lines only, so the listing may be passed with or
/// without its prompt and with any amount of blank padding.
pub fn parse_variable_listing<S: AsRef<str>>(lines: &[S]) -> VariableListing {
    let mut listing = VariableListing::default();
    let mut content: Vec<&str> = lines
        .iter()
        .map(|line| line.as_ref())
        .filter(|line| !is_empty_line(line))
        .collect();
    // A body without its prompt still ends in the footer.
    let trailing = if content.last().is_some_and(|line| is_prompt(line)) {
        LISTING_TRAILING_LINES
    } else {
        LISTING_TRAILING_LINES - 1
    };
    if content.len() <= LISTING_LEADING_LINES + trailing {
        return listing;
    }
    content.truncate(content.len() - trailing);

    for (offset, row) in content[LISTING_LEADING_LINES..].iter().enumerate() {
        let tokens: Vec<&str> = row.split_whitespace().collect();
        // Column separators are not data.
        if tokens.iter().all(|t| t.chars().all(|c| c == '=')) {
            continue;
        }
        match VariableDescriptor::parse_row(&tokens) {
            Ok(descriptor) => listing.variables.push(descriptor),
            Err(message) => {
                let line = LISTING_LEADING_LINES + offset;
                tracing::warn!(line, %message, %row, "Stopped parsing variable listing");
                listing.error = Some(BridgeError::listing_parse(line, message));
                break;
            }
        }
    }
    listing
}

/// Display value for one variable given the reply to evaluating its name.
/// Only 1x1 values are rendered; anything larger gets a placeholder.
pub fn variable_value(descriptor: &VariableDescriptor, reply: &Reply) -> String {
    if descriptor.is_scalar() {
        reply.shape().value_text().unwrap_or_default()
    } else {
        descriptor.placeholder()
    }
}
