// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work item parameter encoding.
//!
//! Parameters travel as one string of `key#value$` records. Inside keys and
//! values a backslash escapes the next character, so `\#`, `\$` and `\\`
//! stand for a literal `#`, `$` and `\`. A backslash before any other
//! character is kept as-is. Pairs with an empty key or an empty value are
//! dropped when encoding.

use std::collections::BTreeMap;

use thiserror::Error;

const FIELD_SEPARATOR: char = '#';
const RECORD_SEPARATOR: char = '$';
const ESCAPE: char = '\\';

/// Parameter blob parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    /// A record ended before its key/value separator.
    #[error("parameter record '{0}' has no key/value separator")]
    MissingFieldSeparator(String),

    /// A value contains a second unescaped key/value separator.
    #[error("parameter '{0}' has more than one key/value separator")]
    ExtraFieldSeparator(String),
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        if matches!(c, FIELD_SEPARATOR | RECORD_SEPARATOR | ESCAPE) {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

/// Serialize key/value pairs into a parameter blob.
pub fn encode<I, K, V>(pairs: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut out = String::new();
    for (key, value) in pairs {
        let (key, value) = (key.as_ref(), value.as_ref());
        if key.is_empty() || value.is_empty() {
            continue;
        }
        escape_into(&mut out, key);
        out.push(FIELD_SEPARATOR);
        escape_into(&mut out, value);
        out.push(RECORD_SEPARATOR);
    }
    out
}

/// Parse a parameter blob back into a map. A final record may omit its `$`.
pub fn decode(blob: &str) -> Result<BTreeMap<String, String>, ParamsError> {
    let mut params = BTreeMap::new();
    let mut key: Option<String> = None;
    let mut current = String::new();
    let mut chars = blob.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.peek() {
                Some(&next @ (FIELD_SEPARATOR | RECORD_SEPARATOR | ESCAPE)) => {
                    current.push(next);
                    chars.next();
                }
                _ => current.push(ESCAPE),
            },
            FIELD_SEPARATOR => {
                if let Some(k) = key.take() {
                    return Err(ParamsError::ExtraFieldSeparator(k));
                }
                key = Some(std::mem::take(&mut current));
            }
            RECORD_SEPARATOR => {
                let k = key
                    .take()
                    .ok_or_else(|| ParamsError::MissingFieldSeparator(current.clone()))?;
                params.insert(k, std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }

    match key {
        Some(k) => {
            params.insert(k, current);
        }
        None if current.is_empty() => {}
        None => return Err(ParamsError::MissingFieldSeparator(current)),
    }

    Ok(params)
}

/// Split a raw parameter string on `separator`, trimming each field.
pub fn split_fields(raw: &str, separator: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(separator).map(|s| s.trim().to_string()).collect()
}
