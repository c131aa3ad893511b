use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// CSI sequences (colors, cursor movement) and OSC sequences (titles, links)
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("ANSI escape pattern is valid")
});

/// Strip ANSI escape sequences for display.
///
/// Stored records keep their raw bytes; this is applied on the render path only.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    if !text.contains('\x1b') {
        return Cow::Borrowed(text);
    }
    ANSI_ESCAPE.replace_all(text, "")
}
