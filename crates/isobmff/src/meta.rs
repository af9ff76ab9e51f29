//! File-level metadata: iTunes-style tag lists and the QuickTime
//! `keys`/`ilst` variant, plus the `©xyz` location string.
//!
//! The same `data` tag means different things depending on its ancestors, so
//! all walking here carries an explicit path stack and leaf handlers check
//! it before interpreting a payload.

use bytes::Bytes;
use demux::FileMetadata;
use tracing::trace;

use crate::boxes::{BoxView, BoxWalker, field};
use crate::fourcc::{self, FourCc};

/// Map an iTunes item tag to the externally visible tag key.
fn itunes_key(tag: FourCc) -> Option<&'static str> {
    match tag.as_bytes() {
        b"\xa9nam" => Some("title"),
        b"\xa9ART" => Some("artist"),
        b"aART" => Some("albumartist"),
        b"\xa9alb" => Some("album"),
        b"\xa9day" => Some("date"),
        b"\xa9gen" => Some("genre"),
        b"\xa9wrt" => Some("composer"),
        b"\xa9cmt" => Some("comment"),
        b"\xa9too" => Some("encoder"),
        b"cprt" => Some("copyright"),
        _ => None,
    }
}

/// Map a QuickTime `mdta` key name (reverse-DNS) to a tag key.
fn quicktime_key(name: &str) -> Option<&'static str> {
    match name {
        "com.apple.quicktime.title" => Some("title"),
        "com.apple.quicktime.artist" => Some("artist"),
        "com.apple.quicktime.album" => Some("album"),
        "com.apple.quicktime.creationdate" => Some("date"),
        "com.apple.quicktime.comment" => Some("comment"),
        "com.apple.quicktime.location.ISO6709" => Some("location"),
        _ => None,
    }
}

/// Parse a `udta` box: iTunes `meta/ilst` tags and the `©xyz` location.
pub fn parse_udta(
    data: &Bytes,
    view: BoxView,
    path: &mut Vec<FourCc>,
    metadata: &mut FileMetadata,
) {
    path.push(fourcc::UDTA);
    for child in BoxWalker::new(data, view.body_start, view.body_end) {
        let Ok(child) = child else { break };
        match child.fourcc.as_bytes() {
            b"meta" => parse_meta(data, child, path, metadata),
            b"\xa9xyz" => {
                if let Some(location) = parse_location(child.body(data)) {
                    metadata.location = Some(location);
                }
            }
            _ => {}
        }
    }
    path.pop();
}

/// Parse a `meta` box in either layout.
///
/// ISO `meta` is a full box (4 bytes of version/flags before children); the
/// QuickTime variant is a bare container. Disambiguated by checking whether
/// a valid `hdlr` header sits at the very start of the body.
pub fn parse_meta(
    data: &Bytes,
    view: BoxView,
    path: &mut Vec<FourCc>,
    metadata: &mut FileMetadata,
) {
    let body = view.body(data);
    let is_bare = body.len() >= 8 && &body[4..8] == b"hdlr";
    let children_start = if is_bare {
        view.body_start
    } else {
        view.body_start + 4
    };

    path.push(fourcc::META);

    // QuickTime layout: a `keys` table names the `ilst` entries by index.
    let mut keys: Vec<String> = Vec::new();
    for child in BoxWalker::new(data, children_start, view.body_end) {
        let Ok(child) = child else { break };
        if child.fourcc == fourcc::KEYS {
            keys = parse_keys(child.body(data));
        }
    }

    for child in BoxWalker::new(data, children_start, view.body_end) {
        let Ok(child) = child else { break };
        if child.fourcc == fourcc::ILST {
            parse_ilst(data, child, path, &keys, metadata);
        }
    }
    path.pop();
}

fn parse_keys(body: &[u8]) -> Vec<String> {
    let Ok(count) = field::u32_at(body, 4) else {
        return Vec::new();
    };
    let mut keys = Vec::with_capacity((count as usize).min(256));
    let mut at = 8usize;
    for _ in 0..count {
        let Ok(size) = field::u32_at(body, at) else {
            break;
        };
        if size < 8 || at + size as usize > body.len() {
            break;
        }
        // 4 size + 4 namespace (`mdta`), then the key name.
        let name = String::from_utf8_lossy(&body[at + 8..at + size as usize]).into_owned();
        keys.push(name);
        at += size as usize;
    }
    keys
}

fn parse_ilst(
    data: &Bytes,
    view: BoxView,
    path: &mut Vec<FourCc>,
    keys: &[String],
    metadata: &mut FileMetadata,
) {
    path.push(fourcc::ILST);
    for item in BoxWalker::new(data, view.body_start, view.body_end) {
        let Ok(item) = item else { break };

        // Under a QuickTime keys list the item tag is a 1-based index into
        // the table; under an iTunes list it is the well-known ©-tag. The
        // path stack tells the handler which world it is in.
        let key = if keys.is_empty() {
            itunes_key(item.fourcc)
        } else {
            let index = u32::from_be_bytes(*item.fourcc.as_bytes()) as usize;
            index
                .checked_sub(1)
                .and_then(|i| keys.get(i))
                .and_then(|name| quicktime_key(name))
        };
        let Some(key) = key else {
            trace!(tag = %item.fourcc, "skipping unrecognized metadata item");
            continue;
        };

        path.push(item.fourcc);
        for child in BoxWalker::new(data, item.body_start, item.body_end) {
            let Ok(child) = child else { break };
            if child.fourcc == fourcc::DATA
                && path.len() >= 2
                && path[path.len() - 2] == fourcc::ILST
                && let Some(value) = parse_data_value(child.body(data))
            {
                if key == "location" {
                    metadata.location = Some(value);
                } else {
                    metadata.tags.push((key.to_string(), value));
                }
            }
        }
        path.pop();
    }
    path.pop();
}

/// A metadata `data` box: 4 bytes type indicator, 4 bytes locale, value.
/// Only UTF-8 text values (type 1) are surfaced.
fn parse_data_value(body: &[u8]) -> Option<String> {
    if body.len() < 8 {
        return None;
    }
    let type_indicator = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    if type_indicator != 1 {
        return None;
    }
    Some(String::from_utf8_lossy(&body[8..]).into_owned())
}

/// `©xyz` location: 2-byte length, 2-byte language, ISO 6709 string.
fn parse_location(body: &[u8]) -> Option<String> {
    if body.len() < 4 {
        return None;
    }
    let len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let value = body.get(4..4 + len)?;
    Some(String::from_utf8_lossy(value).into_owned())
}
