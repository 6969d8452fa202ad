// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tag specification and metadata-to-tags resolution.
//!
//! Tags come in two flavours. Static tags are fixed at startup and attached to
//! every upload. Dynamic tags are filled in per trace from the metadata lines
//! the profiler emits alongside each stack, optionally rewritten by a regex.
//!
//! Tag strings are always canonical: keys sorted, `key=value` pairs joined by
//! commas. Identical tag sets therefore produce identical strings, which the
//! collector relies on for grouping.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use thiserror::Error;

mod parse;

use parse::TagValue;

/// Replaces literal commas inside dynamic values, since the comma separates
/// tags.
pub const COMMA_SUBSTITUTE: &str = ";";

/// Errors from parsing `--tag` arguments.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TagError {
    /// No `=` in the argument.
    #[error("tag {0:?} is not of the form key=value")]
    MissingSeparator(String),
    /// The key is empty or has characters outside `[A-Za-z0-9_.]`.
    #[error("tag {0:?} has a key outside [A-Za-z0-9_.]")]
    InvalidKey(String),
    /// Nothing after the `=`, or an empty source key.
    #[error("tag {0:?} has an empty value")]
    EmptyValue(String),
    /// Static values may not contain commas.
    #[error("static tag {0:?} must not contain a comma")]
    CommaInValue(String),
    /// A quoted string inside `{{...}}` never closed.
    #[error("tag {0:?} has an unterminated quoted string")]
    UnterminatedString(String),
    /// Something other than whitespace between quoted strings.
    #[error("tag {arg:?} has unexpected character {ch:?} outside a quoted string")]
    UnexpectedCharacter {
        /// The whole argument.
        arg: String,
        /// The offending character.
        ch: char,
    },
    /// Braces that do not form a complete `{{...}}`.
    #[error("tag {0:?} looks like a dynamic tag but is not wrapped in {{{{...}}}}")]
    MalformedDynamic(String),
    /// A dynamic tag needs one or three quoted strings.
    #[error("dynamic tag {arg:?} takes 1 or 3 quoted strings, found {count}")]
    WrongArity {
        /// The whole argument.
        arg: String,
        /// How many strings were found.
        count: usize,
    },
    /// The same key is both static and dynamic.
    #[error("tag key {0:?} is used by both a static and a dynamic tag")]
    ConflictingKey(String),
    /// The rewrite pattern failed to compile.
    #[error("dynamic tag {arg:?} has an invalid regex: {source}")]
    InvalidRegex {
        /// The whole argument.
        arg: String,
        /// Why the regex did not compile.
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
struct Rewrite {
    pattern: Regex,
    replacement: String,
}

/// A rule that copies one metadata field into one output tag.
#[derive(Debug, Clone)]
pub struct DynamicTag {
    source_key: String,
    target_key: String,
    rewrite: Option<Rewrite>,
}

impl DynamicTag {
    /// Metadata key the value is read from.
    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    /// Tag key the result is written to.
    pub fn target_key(&self) -> &str {
        &self.target_key
    }

    /// True when a regex rewrite is attached.
    pub fn has_rewrite(&self) -> bool {
        self.rewrite.is_some()
    }

    /// Produce the tag value for a raw metadata value.
    pub fn apply(&self, value: &str) -> String {
        let value = match &self.rewrite {
            Some(rewrite) => rewrite
                .pattern
                .replace_all(value, rewrite.replacement.as_str())
                .into_owned(),
            None => value.to_owned(),
        };
        value.replace(',', COMMA_SUBSTITUTE)
    }
}

/// Compiled `--tag` arguments.
#[derive(Debug, Clone, Default)]
pub struct TagSpec {
    static_tags: String,
    dynamic: HashMap<String, Vec<DynamicTag>>,
}

impl TagSpec {
    /// Compile a list of `key=value` / `key={{...}}` arguments.
    pub fn parse_input<I, S>(args: I) -> Result<Self, TagError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut static_tags = BTreeMap::new();
        let mut dynamic: HashMap<String, Vec<DynamicTag>> = HashMap::new();

        for arg in args {
            let arg = arg.as_ref();
            let (target_key, value) = parse::parse_tag_arg(arg)?;
            match value {
                TagValue::Static(value) => {
                    static_tags.insert(target_key, value);
                }
                TagValue::Dynamic {
                    source_key,
                    rewrite,
                } => {
                    let rewrite = rewrite
                        .map(|(pattern, replacement)| {
                            Regex::new(&pattern)
                                .map(|pattern| Rewrite {
                                    pattern,
                                    replacement,
                                })
                                .map_err(|source| TagError::InvalidRegex {
                                    arg: arg.to_owned(),
                                    source,
                                })
                        })
                        .transpose()?;
                    dynamic
                        .entry(source_key.clone())
                        .or_default()
                        .push(DynamicTag {
                            source_key,
                            target_key,
                            rewrite,
                        });
                }
            }
        }

        if let Some(rule) = dynamic
            .values()
            .flatten()
            .find(|rule| static_tags.contains_key(&rule.target_key))
        {
            return Err(TagError::ConflictingKey(rule.target_key.clone()));
        }

        Ok(Self {
            static_tags: join_tags(&static_tags),
            dynamic,
        })
    }

    /// The canonical static tag string, possibly empty.
    pub fn static_tags(&self) -> &str {
        &self.static_tags
    }

    /// True when any rule reads sample metadata.
    pub fn has_dynamic_tags(&self) -> bool {
        !self.dynamic.is_empty()
    }

    /// Rules registered under a metadata key, in configuration order.
    pub fn rules_for(&self, source_key: &str) -> &[DynamicTag] {
        self.dynamic
            .get(source_key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resolve metadata line bodies (marker already stripped) into dynamic
    /// tags. A later line for the same target key overwrites an earlier one.
    pub fn resolve<'a, I>(&self, metadata: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut tags = BTreeMap::new();
        if !self.has_dynamic_tags() {
            return tags;
        }
        for line in metadata {
            let Some((key, value)) = split_metadata(line) else {
                tracing::debug!(line, "ignoring malformed metadata line");
                continue;
            };
            for rule in self.rules_for(key) {
                let value = rule.apply(value);
                if let Some(previous) = tags.insert(rule.target_key.clone(), value) {
                    tracing::debug!(
                        target_key = %rule.target_key,
                        source_key = key,
                        previous = %previous,
                        "overwriting dynamic tag"
                    );
                }
            }
        }
        tags
    }
}

/// Split a metadata line body into `(key, value)`. The key is the last word
/// before the first ` = `; the value is everything after it, trimmed.
pub fn split_metadata(body: &str) -> Option<(&str, &str)> {
    let (lhs, rhs) = body.split_once(" = ").or_else(|| body.split_once('='))?;
    let key = lhs.split_whitespace().next_back()?;
    Some((key, rhs.trim()))
}

/// Join tags as `k1=v1,k2=v2`, in key order.
pub fn join_tags(tags: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in tags {
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(tag_spec: &TagSpec, lines: &[&str]) -> String {
        join_tags(&tag_spec.resolve(lines.iter().copied()))
    }

    #[test]
    fn test_static_and_dynamic_key_conflict() {
        let err = TagSpec::parse_input(["uri=x", r#"uri={{"server.REQUEST_URI"}}"#]).unwrap_err();
        assert!(matches!(err, TagError::ConflictingKey(ref key) if key == "uri"));
        // order of arguments does not matter
        let err = TagSpec::parse_input([r#"uri={{"server.REQUEST_URI"}}"#, "uri=x"]).unwrap_err();
        assert!(matches!(err, TagError::ConflictingKey(_)));
    }

    #[test]
    fn test_parse_input() {
        let tag_spec = TagSpec::parse_input([
            "env=prod",
            r#"uri={{"server.REQUEST_URI" "^([^?]+)\?.*$" "$1"}}"#,
        ])
        .unwrap();
        assert_eq!(tag_spec.static_tags(), "env=prod");
        let rules = tag_spec.rules_for("server.REQUEST_URI");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].source_key(), "server.REQUEST_URI");
        assert_eq!(rules[0].target_key(), "uri");
        assert!(rules[0].has_rewrite());
        assert_eq!(rules[0].apply("/users/list?page=2&x=1"), "/users/list");
        assert_eq!(rules[0].apply("/plain"), "/plain");
        assert_eq!(
            resolve(&tag_spec, &["server.REQUEST_URI = /a/b?c=d"]),
            "uri=/a/b"
        );
    }

    #[test]
    fn test_static_tags_are_sorted() {
        let tag_spec = TagSpec::parse_input(["zone=b", "app.version=1.2", "env=prod"]).unwrap();
        assert_eq!(tag_spec.static_tags(), "app.version=1.2,env=prod,zone=b");
        assert!(!tag_spec.has_dynamic_tags());
    }

    #[test]
    fn test_invalid_regex() {
        let err = TagSpec::parse_input([r#"uri={{"x" "([" "$1"}}"#]).unwrap_err();
        assert!(matches!(err, TagError::InvalidRegex { .. }));
    }

    #[test]
    fn test_metadata_last_write_wins() {
        let tag_spec = TagSpec::parse_input([r#"creator={{"author"}}"#]).unwrap();
        assert_eq!(resolve(&tag_spec, &["author = John Doe"]), "creator=John Doe");
        assert_eq!(
            resolve(&tag_spec, &["author = John Doe", "author = Jane Roe"]),
            "creator=Jane Roe"
        );
        assert_eq!(resolve(&tag_spec, &["unrelated = x"]), "");
    }

    #[test]
    fn test_metadata_value_with_equals_and_commas() {
        let tag_spec = TagSpec::parse_input([r#"q={{"query"}}"#]).unwrap();
        assert_eq!(resolve(&tag_spec, &["query =  a=1,b=2  "]), "q=a=1;b=2");
    }

    #[test]
    fn test_metadata_key_is_last_word() {
        let tag_spec = TagSpec::parse_input([r#"uri={{"server.REQUEST_URI"}}"#]).unwrap();
        assert_eq!(
            resolve(&tag_spec, &["glopeek server.REQUEST_URI = /index.php"]),
            "uri=/index.php"
        );
    }

    #[test]
    fn test_one_source_many_targets() {
        let tag_spec = TagSpec::parse_input([
            r#"path={{"uri" "\?.*$" ""}}"#,
            r#"full_uri={{"uri"}}"#,
        ])
        .unwrap();
        assert_eq!(
            resolve(&tag_spec, &["uri = /x?y=1"]),
            "full_uri=/x?y=1,path=/x"
        );
    }

    // Two different source keys feeding one target key: the later metadata
    // line wins, whichever source it came from.
    #[test]
    fn test_shared_target_key_overwrites_in_line_order() {
        let tag_spec =
            TagSpec::parse_input([r#"who={{"author"}}"#, r#"who={{"editor"}}"#]).unwrap();
        assert_eq!(
            resolve(&tag_spec, &["author = alice", "editor = bob"]),
            "who=bob"
        );
        assert_eq!(
            resolve(&tag_spec, &["editor = bob", "author = alice"]),
            "who=alice"
        );
    }

    #[test]
    fn test_split_metadata() {
        assert_eq!(split_metadata("author = John Doe"), Some(("author", "John Doe")));
        assert_eq!(split_metadata("k = a = b"), Some(("k", "a = b")));
        assert_eq!(split_metadata("k=v"), Some(("k", "v")));
        assert_eq!(split_metadata("no delimiter"), None);
        assert_eq!(split_metadata(" = orphan"), None);
    }
}
