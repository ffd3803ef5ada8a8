// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lenient syslog line parsing.
//!
//! Container runtimes emit a mix of BSD-style lines with ISO-8601 or classic
//! timestamps and RFC 5424 numbered syslog. The parser accepts all three and
//! never fails: fields absent from the matched shape stay empty and an
//! unrecognized line degrades to priority 0 with the whole payload as
//! content. It runs inline on the listener task, so the content is returned
//! as a slice into the input buffer rather than copied.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};

/// Tag prefix marking messages emitted by the container runtime.
const CONTAINER_TAG_PREFIX: &str = "docker";

/// Single syslog line with the fields the sinks care about.
///
/// Borrows the input buffer; the buffer must stay alive until every sink has
/// serialized the record, which holds because rendering happens synchronously
/// on the listener task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub priority: u8,
    pub facility: u8,
    pub severity: u8,
    pub timestamp: DateTime<Utc>,
    pub hostname: &'a str,
    pub tag: &'a str,
    pub proc_id: Option<&'a str>,
    pub content: &'a [u8],
    /// Original line, kept for pass-through reconstruction.
    pub raw: &'a [u8],
    /// Short container id extracted from a `docker/<id>` tag, empty for any
    /// other tag shape.
    pub container_id: &'a str,
}

struct ParsedFields<'a> {
    timestamp: DateTime<Utc>,
    hostname: &'a str,
    tag: &'a str,
    proc_id: Option<&'a str>,
    content: &'a str,
}

/// Parses one framed syslog line. Never fails.
pub fn parse_line(raw: &[u8]) -> RawRecord<'_> {
    let mut line = raw;
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }

    let (priority, rest) = parse_priority(line);
    let mut record = RawRecord {
        priority,
        facility: priority / 8,
        severity: priority % 8,
        timestamp: Utc::now(),
        hostname: "",
        tag: "",
        proc_id: None,
        content: rest,
        raw,
        container_id: "",
    };

    let Ok(text) = std::str::from_utf8(rest) else {
        return record;
    };
    let Some(fields) = parse_iso_bsd(text)
        .or_else(|| parse_classic_bsd(text))
        .or_else(|| parse_rfc5424(text))
    else {
        return record;
    };

    record.timestamp = fields.timestamp;
    record.hostname = fields.hostname;
    record.tag = fields.tag;
    record.proc_id = fields.proc_id;
    record.content = fields.content.as_bytes();
    if let Some((prefix, container_id)) = fields.tag.split_once('/') {
        if prefix == CONTAINER_TAG_PREFIX {
            record.container_id = container_id;
        }
    }
    record
}

/// Extracts `<PRI>` from the front of the line. A missing or malformed
/// priority yields 0 and leaves the line untouched.
fn parse_priority(line: &[u8]) -> (u8, &[u8]) {
    if line.first() != Some(&b'<') {
        return (0, line);
    }
    let Some(end) = line.iter().position(|&b| b == b'>') else {
        return (0, line);
    };
    if !(2..=4).contains(&end) {
        return (0, line);
    }
    let digits = &line[1..end];
    if !digits.iter().all(u8::is_ascii_digit) {
        return (0, line);
    }
    let Some(priority) = std::str::from_utf8(digits)
        .ok()
        .and_then(|digits| digits.parse::<u8>().ok())
    else {
        return (0, line);
    };
    (priority, &line[end + 1..])
}

/// `YYYY-MM-DDThh:mm:ssZ host tag[pid]: content`
fn parse_iso_bsd(text: &str) -> Option<ParsedFields<'_>> {
    let (timestamp, rest) = text.split_once(' ')?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp).ok()?;
    let (hostname, rest) = rest.split_once(' ')?;
    let (tag, proc_id, content) = parse_tag_content(rest)?;
    Some(ParsedFields {
        timestamp: timestamp.with_timezone(&Utc),
        hostname,
        tag,
        proc_id,
        content,
    })
}

/// `Mon  d hh:mm:ss host tag[pid]: content`, year taken from the clock.
fn parse_classic_bsd(text: &str) -> Option<ParsedFields<'_>> {
    let month = month_number(text.get(..3)?)?;
    let rest = text.get(3..)?.strip_prefix(' ')?;
    // Single-digit days are space padded.
    let rest = rest.trim_start_matches(' ');
    let (day, rest) = rest.split_once(' ')?;
    let day: u32 = day.parse().ok()?;
    let (time, rest) = rest.split_once(' ')?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S").ok()?;
    let date = NaiveDate::from_ymd_opt(Utc::now().year(), month, day)?;
    let (hostname, rest) = rest.split_once(' ')?;
    let (tag, proc_id, content) = parse_tag_content(rest)?;
    Some(ParsedFields {
        timestamp: Utc.from_utc_datetime(&date.and_time(time)),
        hostname,
        tag,
        proc_id,
        content,
    })
}

/// `1 timestamp host app pid msgid sd content`
fn parse_rfc5424(text: &str) -> Option<ParsedFields<'_>> {
    let rest = text.strip_prefix("1 ")?;
    let (timestamp, rest) = rest.split_once(' ')?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp).ok()?;
    let (hostname, rest) = rest.split_once(' ')?;
    let (app, rest) = rest.split_once(' ')?;
    let (pid, rest) = rest.split_once(' ')?;
    let (_msgid, rest) = rest.split_once(' ')?;
    let (_sd, content) = split_structured_data(rest)?;
    Some(ParsedFields {
        timestamp: timestamp.with_timezone(&Utc),
        hostname,
        tag: app,
        proc_id: (pid != "-").then_some(pid),
        content,
    })
}

/// Splits `tag[pid]: content`, tolerating a missing pid and a colon without
/// the trailing space.
fn parse_tag_content(rest: &str) -> Option<(&str, Option<&str>, &str)> {
    let (head, content) = match rest.split_once(": ") {
        Some(parts) => parts,
        None => rest.split_once(':')?,
    };
    match head.split_once('[') {
        Some((tag, pid)) => Some((tag, pid.strip_suffix(']'), content)),
        None => Some((head, None, content)),
    }
}

fn split_structured_data(rest: &str) -> Option<(&str, &str)> {
    if rest == "-" {
        return Some((rest, ""));
    }
    if let Some(content) = rest.strip_prefix("- ") {
        return Some((&rest[..1], content));
    }
    if !rest.starts_with('[') {
        return rest.split_once(' ');
    }
    let bytes = rest.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i] == b'[' {
        i += 1;
        while i < bytes.len() && bytes[i] != b']' {
            if bytes[i] == b'\\' {
                i += 1;
            }
            i += 1;
        }
        if i >= bytes.len() {
            return None;
        }
        i += 1;
    }
    let sd = rest.get(..i)?;
    let content = rest.get(i..)?;
    Some((sd, content.strip_prefix(' ').unwrap_or(content)))
}

fn month_number(name: &str) -> Option<u32> {
    match name {
        "Jan" => Some(1),
        "Feb" => Some(2),
        "Mar" => Some(3),
        "Apr" => Some(4),
        "May" => Some(5),
        "Jun" => Some(6),
        "Jul" => Some(7),
        "Aug" => Some(8),
        "Sep" => Some(9),
        "Oct" => Some(10),
        "Nov" => Some(11),
        "Dec" => Some(12),
        _ => None,
    }
}
