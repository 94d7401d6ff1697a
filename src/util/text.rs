use std::borrow::Cow;

use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

/// Removes every complete `<...>` tag from a fragment of feed markup.
///
/// Feed summaries routinely embed HTML (`<p>`, `<a href>`, `<img>`). Only the
/// tags are dropped; the text between them is kept as-is. A `<` with no
/// closing `>` after it is literal text and is kept along with the rest of
/// the input.
///
/// Returns `Cow::Borrowed` when the input contains no `<`.
///
/// # Examples
///
/// ```
/// use relayfeed::util::strip_markup;
///
/// assert_eq!(strip_markup("<p>Hello <b>world</b></p>"), "Hello world");
/// assert_eq!(strip_markup("plain text"), "plain text");
/// assert_eq!(strip_markup("3 < 4"), "3 < 4");
/// ```
pub fn strip_markup(s: &str) -> Cow<'_, str> {
    if !s.contains('<') {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find('<') {
        let Some(close) = rest[open..].find('>') else {
            break;
        };
        out.push_str(&rest[..open]);
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Truncates to at most `max_chars` Unicode scalar values, never splitting a
/// multi-byte character. No ellipsis is appended.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

/// Normalizes a raw feed summary: strips markup, trims, caps the length.
pub fn clean_summary(raw: &str, max_chars: usize) -> String {
    let stripped = strip_markup(raw.trim());
    truncate_chars(stripped.trim(), max_chars).to_string()
}

/// Formats a publication timestamp relative to `now` for listings.
///
/// - under a minute: `Just now`
/// - under an hour: `{n}m ago`
/// - under a day: `{n}h ago`
/// - under a week: `{n}d ago`
/// - otherwise the calendar date, `YYYY-MM-DD`
///
/// Timestamps in the future are treated as `Just now`.
pub fn format_relative(published_at: i64, now: DateTime<Utc>) -> String {
    let diff = now.timestamp().saturating_sub(published_at);
    match diff {
        d if d < 60 => "Just now".to_string(),
        d if d < 3_600 => format!("{}m ago", d / 60),
        d if d < 86_400 => format!("{}h ago", d / 3_600),
        d if d < 604_800 => format!("{}d ago", d / 86_400),
        _ => DateTime::from_timestamp(published_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

/// Fits `s` into `max_width` terminal columns, ending in `…` when cut.
///
/// Wide characters (CJK, emoji) count as two columns.
pub fn fit_width(s: &str, max_width: usize) -> Cow<'_, str> {
    if UnicodeWidthStr::width(s) <= max_width {
        return Cow::Borrowed(s);
    }
    if max_width == 0 {
        return Cow::Borrowed("");
    }

    let budget = max_width - 1;
    let mut used = 0;
    let mut end = 0;
    for (idx, c) in s.char_indices() {
        let w = UnicodeWidthChar::width(c).unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        end = idx + c.len_utf8();
    }
    Cow::Owned(format!("{}…", &s[..end]))
}

fn is_stripped_control(b: u8) -> bool {
    b == 0x7f || (b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r')
}

/// SEC-001: Strips terminal control characters and ANSI escape sequences.
///
/// Feed titles and summaries are attacker-controlled and end up printed to a
/// terminal. Removes C0 controls (except tab, LF, CR), DEL, CSI sequences
/// (`ESC [` ... final byte 0x40-0x7E), OSC sequences (`ESC ]` ... BEL or
/// `ESC \`), and bare ESC bytes.
///
/// Returns `Cow::Borrowed` when there is nothing to strip.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let bytes = s.as_bytes();
    if !bytes.iter().any(|&b| b == 0x1b || is_stripped_control(b)) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            0x1b if bytes.get(i + 1) == Some(&b'[') => {
                i += 2;
                while i < bytes.len() {
                    let c = bytes[i];
                    i += 1;
                    if (0x40..=0x7e).contains(&c) {
                        break;
                    }
                }
            }
            0x1b if bytes.get(i + 1) == Some(&b']') => {
                i += 2;
                while i < bytes.len() {
                    if bytes[i] == 0x07 {
                        i += 1;
                        break;
                    }
                    if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            b if b == 0x1b || is_stripped_control(b) => i += 1,
            _ => {
                let start = i;
                while i < bytes.len() && bytes[i] != 0x1b && !is_stripped_control(bytes[i]) {
                    i += 1;
                }
                // Only ASCII bytes end a run, so the slice stays on a char boundary.
                out.push_str(&s[start..i]);
            }
        }
    }

    Cow::Owned(out)
}
