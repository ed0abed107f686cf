use regex::Regex;
use std::sync::LazyLock;

const ESC: char = '\x1b';

// OSC strings (window titles, hyperlinks) ended by BEL or ST, CSI sequences
// (colors, cursor movement), then two-byte Fe escapes. OSC has to be tried
// before the two-byte form, which would otherwise eat only `ESC ]`.
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:\][^\x07\x1B]*(?:\x07|\x1B\\)|\[[0-?]*[ -/]*[@-~]|[@-Z\\-_])")
        .expect("ANSI pattern is a valid regex")
});

/// Removes terminal escape sequences from captured tool output.
///
/// Text without an escape byte comes back unchanged, and the result never
/// contains one: stray ESC bytes that do not start a recognised sequence are
/// dropped as well.
pub fn strip_ansi(text: &str) -> String {
    if !text.contains(ESC) {
        return text.to_string();
    }
    ANSI_ESCAPE.replace_all(text, "").replace(ESC, "")
}

/// The stream a failed stage is reported with: stderr, or stdout when the tool
/// wrote its diagnostics there instead.
pub fn failure_stream<'a>(stderr: &'a str, stdout: &'a str) -> &'a str {
    if stderr.trim().is_empty() { stdout } else { stderr }
}
