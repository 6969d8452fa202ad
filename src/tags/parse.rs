// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Parser for a single `--tag` argument.
//!
//! ```text
//! env=prod                                          static tag
//! uri={{"server.REQUEST_URI"}}                      dynamic tag
//! uri={{"server.REQUEST_URI" "^([^?]+)\?.*$" "$1"}} dynamic tag with rewrite
//! ```

use super::TagError;

const DYNAMIC_OPEN: &str = "{{";
const DYNAMIC_CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TagValue {
    Static(String),
    Dynamic {
        source_key: String,
        rewrite: Option<(String, String)>,
    },
}

pub(crate) fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

pub(crate) fn parse_tag_arg(arg: &str) -> Result<(String, TagValue), TagError> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| TagError::MissingSeparator(arg.to_owned()))?;
    if !is_valid_key(key) {
        return Err(TagError::InvalidKey(arg.to_owned()));
    }

    if let Some(inner) = value
        .strip_prefix(DYNAMIC_OPEN)
        .and_then(|v| v.strip_suffix(DYNAMIC_CLOSE))
    {
        let mut strings = quoted_strings(arg, inner)?;
        let value = match strings.len() {
            1 => TagValue::Dynamic {
                source_key: strings.remove(0),
                rewrite: None,
            },
            3 => {
                let replacement = strings.remove(2);
                let pattern = strings.remove(1);
                TagValue::Dynamic {
                    source_key: strings.remove(0),
                    rewrite: Some((pattern, replacement)),
                }
            }
            count => {
                return Err(TagError::WrongArity {
                    arg: arg.to_owned(),
                    count,
                })
            }
        };
        if let TagValue::Dynamic { source_key, .. } = &value {
            if source_key.is_empty() {
                return Err(TagError::EmptyValue(arg.to_owned()));
            }
        }
        return Ok((key.to_owned(), value));
    }

    if value.is_empty() {
        return Err(TagError::EmptyValue(arg.to_owned()));
    }
    // a half-written `{{...}}` must not turn into a static label
    if value.contains(DYNAMIC_OPEN)
        || value.contains(DYNAMIC_CLOSE)
        || value.starts_with('{')
        || value.ends_with('}')
    {
        return Err(TagError::MalformedDynamic(arg.to_owned()));
    }
    if value.contains(',') {
        return Err(TagError::CommaInValue(arg.to_owned()));
    }
    Ok((key.to_owned(), TagValue::Static(value.to_owned())))
}

enum State {
    Between,
    InString(String),
}

/// Splits `"a" "b" "c"` into its strings. `\"` is an escaped quote; any other
/// backslash is kept verbatim so regex escapes survive untouched.
fn quoted_strings(arg: &str, input: &str) -> Result<Vec<String>, TagError> {
    let mut out = vec![];
    let mut state = State::Between;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        state = match state {
            State::Between if c.is_whitespace() => State::Between,
            State::Between if c == '"' => State::InString(String::new()),
            State::Between => {
                return Err(TagError::UnexpectedCharacter {
                    arg: arg.to_owned(),
                    ch: c,
                })
            }
            State::InString(current) if c == '"' => {
                out.push(current);
                State::Between
            }
            State::InString(mut current) if c == '\\' => {
                match chars.next() {
                    Some('"') => current.push('"'),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => return Err(TagError::UnterminatedString(arg.to_owned())),
                }
                State::InString(current)
            }
            State::InString(mut current) => {
                current.push(c);
                State::InString(current)
            }
        };
    }

    match state {
        State::Between => Ok(out),
        State::InString(_) => Err(TagError::UnterminatedString(arg.to_owned())),
    }
}
