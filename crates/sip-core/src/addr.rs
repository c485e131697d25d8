// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tag and URI helpers for From/To/Contact/Route values.

use smol_str::SmolStr;

/// Header parameters of a name-addr live after the closing `>`; for a bare
/// addr-spec every `;` parameter is a header parameter.
fn header_params(value: &str) -> &str {
    match value.rfind('>') {
        Some(idx) => &value[idx + 1..],
        None => value.split_once(';').map(|(_, p)| p).unwrap_or(""),
    }
}

/// Extracts the `tag` parameter from a From/To header value.
pub fn extract_tag(value: &str) -> Option<SmolStr> {
    header_params(value).split(';').find_map(|segment| {
        let trimmed = segment.trim();
        if trimmed.len() > 4 && trimmed[..4].eq_ignore_ascii_case("tag=") {
            Some(SmolStr::new(&trimmed[4..]))
        } else {
            None
        }
    })
}

/// Returns the value with `;tag=<tag>` appended, unless it already has one.
pub fn with_tag(value: &str, tag: &str) -> SmolStr {
    if extract_tag(value).is_some() {
        SmolStr::new(value)
    } else {
        SmolStr::new(format!("{};tag={}", value.trim_end(), tag))
    }
}

/// URI inside `<...>`, or the value up to its first parameter.
pub fn uri_of(value: &str) -> &str {
    let value = value.trim();
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return value[start + 1..end].trim();
        }
    }
    value.split(';').next().unwrap_or(value).trim()
}

/// Splits a comma-separated list of name-addr values, respecting `<...>`
/// and quoted display names.
pub fn split_addr_list(value: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0u32;
    let mut quoted = false;
    let mut start = 0;
    for (idx, ch) in value.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                out.push(value[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    let tail = value[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}
