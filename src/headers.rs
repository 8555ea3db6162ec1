//! Raw header parsing — Message-ID, Subject, and From extraction.
//!
//! Line-oriented and deliberately forgiving: field names match
//! case-insensitively, values are used verbatim (trimmed), and malformed
//! input degrades to defaults instead of erroring. Callers decode the raw
//! bytes with `from_utf8_lossy` before handing them here.

/// Metadata pulled from one message's raw headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    /// Dedup key from the `Message-ID` header. `None` means the message
    /// cannot be deduplicated and must be skipped.
    pub message_id: Option<String>,
    pub subject: String,
    pub sender: String,
}

impl ParsedHeader {
    pub fn parse(raw: &str) -> Self {
        Self {
            message_id: extract_message_id(raw),
            subject: extract_subject(raw),
            sender: extract_sender(raw),
        }
    }
}

/// Split a header line into (name, value) if the name matches.
fn field_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (field, value) = line.split_once(':')?;
    field.eq_ignore_ascii_case(name).then_some(value)
}

/// First `Message-ID` value, trimmed. Empty values count as absent.
fn extract_message_id(raw: &str) -> Option<String> {
    raw.lines()
        .find_map(|line| field_value(line, "message-id"))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Subject with folded continuation lines rejoined.
///
/// A line starting with space or tab immediately after the subject line is
/// a continuation; accumulation stops at the first non-continuation line.
fn extract_subject(raw: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let mut in_subject = false;

    for line in raw.lines() {
        if !in_subject {
            if let Some(value) = field_value(line, "subject") {
                parts.push(value.trim());
                in_subject = true;
            }
        } else if line.starts_with([' ', '\t']) {
            parts.push(line.trim());
        } else {
            break;
        }
    }

    if parts.is_empty() {
        "No Subject".to_string()
    } else {
        parts.join(" ")
    }
}

/// Human-readable sender from the `From` header.
///
/// Precedence for `Name <addr>` style values: display name before the
/// brackets, then a trailing `(Name)` comment, then the bare address.
/// Without brackets, a `(Name)` comment wins over the raw value.
fn extract_sender(raw: &str) -> String {
    let Some(value) = raw.lines().find_map(|line| field_value(line, "from")) else {
        return "Unknown Sender".to_string();
    };
    let value = value.trim();

    if let (Some(open), Some(close)) = (value.find('<'), value.rfind('>'))
        && open < close
    {
        let name = value[..open].trim().trim_matches(['"', '\'']).trim();
        if !name.is_empty() {
            return name.to_string();
        }

        let after = value[close + 1..].trim();
        if let Some(inner) = after.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
            let inner = inner.trim();
            if !inner.is_empty() {
                return inner.to_string();
            }
        }

        return value[open + 1..close].trim().to_string();
    }

    if let (Some(open), Some(close)) = (value.find('('), value.find(')'))
        && open < close
    {
        let name = value[open + 1..close].trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }

    value.to_string()
}
