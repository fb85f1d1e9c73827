use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::filter::Filter;

/// The watcher's raw query string is malformed. Kept in storage, excluded
/// from the runtime watcher set — see §7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    UnknownField { field: String },
    MissingValue { field: String },
    BadTimestamp { field: String, value: String },
    EmptyToken { field: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnknownField { field } => write!(f, "unknown query field '{field}'"),
            ParseError::MissingValue { field } => write!(f, "field '{field}' has no value"),
            ParseError::BadTimestamp { field, value } => {
                write!(f, "field '{field}' has unparseable timestamp '{value}'")
            }
            ParseError::EmptyToken { field } => {
                write!(f, "field '{field}' has an empty token in its value list")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse a watcher's raw query string into a [`Filter`].
///
/// Grammar: whitespace-separated clauses of the form `field:v1,v2,...`.
/// `field` is one of `subjects`, `predicates`, `contexts`, `actors`
/// (comma-separated token lists, lower-cased on insert), or `ts_start` /
/// `ts_end` (a single RFC3339 timestamp). An empty string parses to the
/// wildcard filter (matches everything, no window).
pub fn parse(raw: &str) -> Result<Filter, ParseError> {
    let mut filter = Filter::wildcard();

    for clause in raw.split_whitespace() {
        let (field, value) = clause.split_once(':').ok_or_else(|| ParseError::MissingValue {
            field: clause.to_string(),
        })?;
        if value.is_empty() {
            return Err(ParseError::MissingValue {
                field: field.to_string(),
            });
        }

        match field {
            "subjects" => filter.subjects = parse_token_list(field, value)?,
            "predicates" => filter.predicates = parse_token_list(field, value)?,
            "contexts" => filter.contexts = parse_token_list(field, value)?,
            "actors" => filter.actors = parse_token_list(field, value)?,
            "ts_start" => filter.time_start = Some(parse_timestamp(field, value)?),
            "ts_end" => filter.time_end = Some(parse_timestamp(field, value)?),
            other => {
                return Err(ParseError::UnknownField {
                    field: other.to_string(),
                })
            }
        }
    }

    Ok(filter)
}

fn parse_token_list(field: &str, value: &str) -> Result<BTreeSet<String>, ParseError> {
    let mut set = BTreeSet::new();
    for token in value.split(',') {
        if token.is_empty() {
            return Err(ParseError::EmptyToken {
                field: field.to_string(),
            });
        }
        set.insert(token.to_lowercase());
    }
    Ok(set)
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ParseError::BadTimestamp {
            field: field.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_wildcard() {
        assert_eq!(parse("").unwrap(), Filter::wildcard());
    }

    #[test]
    fn parses_required_sets_lower_cased() {
        let filter = parse("subjects:Alice,Bob predicates:is").unwrap();
        assert!(filter.subjects.contains("alice"));
        assert!(filter.subjects.contains("bob"));
        assert!(filter.predicates.contains("is"));
    }

    #[test]
    fn parses_time_window() {
        let filter = parse("ts_start:2025-01-01T00:00:00Z ts_end:2025-02-01T00:00:00Z").unwrap();
        assert!(filter.time_start.is_some());
        assert!(filter.time_end.is_some());
    }

    #[test]
    fn rejects_unknown_field() {
        assert_eq!(
            parse("bogus:x"),
            Err(ParseError::UnknownField {
                field: "bogus".to_string()
            })
        );
    }

    #[test]
    fn rejects_bad_timestamp() {
        assert!(matches!(
            parse("ts_start:not-a-date"),
            Err(ParseError::BadTimestamp { .. })
        ));
    }

    #[test]
    fn rejects_empty_token_in_list() {
        assert!(matches!(
            parse("subjects:alice,,bob"),
            Err(ParseError::EmptyToken { .. })
        ));
    }
}
