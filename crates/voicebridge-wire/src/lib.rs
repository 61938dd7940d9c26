//! Escape grammar, key=value tokenizing, and line classification for the
//! upstream voice-client text protocol.
//!
//! The protocol is newline-delimited; each line is whitespace-separated
//! `key=value` tokens with an optional leading event/command token and
//! optional `|`-separated records. See [`classify_line`], [`decode_value`],
//! and [`parse_line`].

use std::collections::BTreeMap;

/// How a raw line from the upstream connection should be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// `notify*` — an asynchronous event, dispatched to the registry immediately.
    Notify,
    /// `error id=1796` — answered with a bare `\n`; never terminates a pending request.
    Keepalive,
    /// `error id=<n>` (n != 1796) — terminates the current pending request.
    Terminator { id: i64 },
    /// Anything else — a payload line, buffered for the current pending request.
    Payload,
}

/// Classifies a single already-trimmed line per the upstream wire format.
pub fn classify_line(raw: &str) -> LineKind {
    if raw.starts_with("notify") {
        return LineKind::Notify;
    }
    if let Some(rest) = raw.strip_prefix("error ") {
        if let Some(id) = extract_error_id(rest) {
            if id == 1796 {
                return LineKind::Keepalive;
            }
            return LineKind::Terminator { id };
        }
    } else if raw == "error" {
        return LineKind::Terminator { id: 0 };
    }
    LineKind::Payload
}

fn extract_error_id(rest: &str) -> Option<i64> {
    for tok in rest.split_whitespace() {
        if let Some(v) = tok.strip_prefix("id=") {
            return v.parse().ok();
        }
    }
    None
}

/// Decodes the upstream's value escape grammar.
///
/// `\s`→space, `\p`→`|`, `\n`→LF, `\r`→CR, `\t`→TAB, `\\`→`\`, `\/`→`/`;
/// any other `\X` decodes to `X` verbatim. A trailing lone backslash is
/// passed through unchanged.
pub fn decode_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('p') => out.push('|'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Encodes a command argument for the wire: escapes backslashes, spaces,
/// and pipes (the inverse of [`decode_value`] for the canonical subset the
/// daemon itself ever sends).
pub fn encode_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\s"),
            '|' => out.push_str("\\p"),
            other => out.push(other),
        }
    }
    out
}

/// A single parsed record: an optional leading bare token (the event or
/// command name) plus its decoded `key=value` fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub event: Option<String>,
    pub fields: BTreeMap<String, String>,
}

impl Record {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Parses one `|`-free line into a [`Record`]. A leading whitespace-delimited
/// token with no `=` is taken as the event/command name; every other token
/// is split on the first `=` into a decoded key/value pair. Flag-only tokens
/// (no `=`, not the leading token — e.g. `-voice`) are recorded with an
/// empty value.
pub fn parse_line(line: &str) -> Record {
    let mut record = Record::default();
    for (i, tok) in line.split_whitespace().enumerate() {
        if i == 0 && !tok.contains('=') {
            record.event = Some(tok.to_string());
            continue;
        }
        match tok.split_once('=') {
            Some((k, v)) => {
                record.fields.insert(k.to_string(), decode_value(v));
            }
            None => {
                record.fields.insert(tok.to_string(), String::new());
            }
        }
    }
    record
}

/// Splits a response line into its top-level `|`-delimited records. Embedded
/// literal `|` in values is never present on the wire (the upstream encodes
/// it as `\p`), so a plain split is correct.
pub fn split_records(line: &str) -> Vec<Record> {
    line.split('|').map(parse_line).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_handles_all_named_escapes() {
        assert_eq!(decode_value("a\\sb"), "a b");
        assert_eq!(decode_value("a\\pb"), "a|b");
        assert_eq!(decode_value("a\\nb"), "a\nb");
        assert_eq!(decode_value("a\\rb"), "a\rb");
        assert_eq!(decode_value("a\\tb"), "a\tb");
        assert_eq!(decode_value("a\\\\b"), "a\\b");
        assert_eq!(decode_value("a\\/b"), "a/b");
    }

    #[test]
    fn decode_falls_back_to_literal_for_unknown_escape() {
        assert_eq!(decode_value("a\\qb"), "aqb");
    }

    #[test]
    fn decode_trailing_backslash_is_passed_through() {
        assert_eq!(decode_value("abc\\"), "abc\\");
    }

    #[test]
    fn encode_escapes_space_pipe_and_backslash() {
        assert_eq!(encode_value("a b|c\\d"), "a\\sb\\pc\\\\d");
    }

    #[test]
    fn round_trip_decode_of_canonical_encode() {
        for s in ["hello world", "a|b|c", "back\\slash", "plain", ""] {
            assert_eq!(decode_value(&encode_value(s)), s);
        }
    }

    #[test]
    fn round_trip_encode_of_canonical_raw() {
        for raw in ["a\\sb\\pc", "\\\\", "nothing-special", ""] {
            assert_eq!(encode_value(&decode_value(raw)), raw);
        }
    }

    #[test]
    fn classify_notify_lines() {
        assert_eq!(classify_line("notifycliententerview clid=5"), LineKind::Notify);
        assert_eq!(classify_line("notifytalkstatuschange status=1"), LineKind::Notify);
    }

    #[test]
    fn classify_keepalive_is_not_a_terminator() {
        assert_eq!(classify_line("error id=1796 msg=ok"), LineKind::Keepalive);
    }

    #[test]
    fn classify_other_error_is_terminator() {
        assert_eq!(classify_line("error id=0 msg=ok"), LineKind::Terminator { id: 0 });
        assert_eq!(classify_line("error id=2568 msg=invalid\\sclientid"), LineKind::Terminator { id: 2568 });
    }

    #[test]
    fn classify_payload_lines() {
        assert_eq!(classify_line("cid=1 pid=0 channel_name=Lobby"), LineKind::Payload);
    }

    #[test]
    fn parse_line_extracts_event_and_fields() {
        let r = parse_line("notifycliententerview clid=17 ctfid=5 client_nickname=alice\\stest");
        assert_eq!(r.event.as_deref(), Some("notifycliententerview"));
        assert_eq!(r.get("clid"), Some("17"));
        assert_eq!(r.get("client_nickname"), Some("alice test"));
    }

    #[test]
    fn parse_line_without_event_token() {
        let r = parse_line("cid=1 channel_name=Lobby\\sRoom -uid");
        assert_eq!(r.event, None);
        assert_eq!(r.get("cid"), Some("1"));
        assert_eq!(r.get("channel_name"), Some("Lobby Room"));
        assert_eq!(r.get("-uid"), Some(""));
    }

    #[test]
    fn split_records_splits_on_top_level_pipe() {
        let records = split_records("clid=1 cid=3|clid=2 cid=3|clid=3 cid=4");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].get("clid"), Some("1"));
        assert_eq!(records[2].get("cid"), Some("4"));
    }

    #[test]
    fn split_records_single_record_has_no_pipe() {
        let records = split_records("error id=0 msg=ok");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.as_deref(), Some("error"));
    }
}
