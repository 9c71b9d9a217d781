//! Line patterns for the REPL's prompts, reply shapes, stop banners and stack dumps.

use regex::Regex;
use std::sync::LazyLock;

/// Debug-mode prompt, e.g. `debug> ` or `debug:> `.
pub static DEBUG_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^debug:?>\s*$").expect("Static regex is valid"));

/// Normal-mode prompt, e.g. `octave:5> `.
pub static NORMAL_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^octave:([0-9]+)>\s*$").expect("Static regex is valid"));

/// `<name> = <literal>` with exactly one token after the equals sign.
pub static SINGLE_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(\S+)\s*$").expect("Static regex is valid")
});

/// `<name> =` with nothing after the equals sign; rows follow on later lines.
pub static MULTI_VALUE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*$").expect("Static regex is valid")
});

pub mod stop_banner {
    use super::*;

    /// `stopped in <name> at line <N>`
    pub static FIRST_LINE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*stopped in (.+?) at line ([0-9]+)").expect("Static regex is valid")
    });

    /// `<N>: <code-text>`
    pub static SECOND_LINE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*([0-9]+):\s?(.*)$").expect("Static regex is valid"));
}

pub mod stack_dump {
    use super::*;

    pub static HEADER: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*error: called from\s*$").expect("Static regex is valid"));

    /// `<frame> at line <L> column <C>`
    pub static FRAME: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*(\S+) at line ([0-9]+) column ([0-9]+)\s*$")
            .expect("Static regex is valid")
    });
}

/// `'<symbol>' is a function from the file <path>` (or `script`).
pub static SYMBOL_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*'([^']+)' is a (?:[a-z-]+ )?(?:function|script) from the file (.+?)\s*$")
        .expect("Static regex is valid")
});

/// Any diagnostic line the REPL prefixes with `error:`.
pub static ERROR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*error:").expect("Static regex is valid"));

pub fn is_empty_line(line: &str) -> bool {
    line.trim().is_empty()
}
