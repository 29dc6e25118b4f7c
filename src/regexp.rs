//! Named regular expressions.
//!
//! A [`RegexpSet`] is replaced wholesale on every successful refresh. Filter
//! parameters elsewhere in the crate (`log[]`/`eventlog[]` patterns) may
//! either be a literal regex or the name of an entry in this set; the set is
//! consulted first, and anything it doesn't recognize is compiled as a plain
//! expression.

use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::wire::RegexpRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegexpType {
    Literal,
    IRegex,
    Regex,
    NoMatchIRegex,
    NoMatchRegex,
    GlobPipe,
}

impl RegexpType {
    /// Parse the integer `expression_type` carried on the wire.
    pub fn from_wire(n: i64) -> CoreResult<Self> {
        Ok(match n {
            0 => RegexpType::Literal,
            1 => RegexpType::IRegex,
            2 => RegexpType::Regex,
            3 => RegexpType::NoMatchIRegex,
            4 => RegexpType::NoMatchRegex,
            5 => RegexpType::GlobPipe,
            other => {
                return Err(CoreError::Protocol(format!(
                    "unknown regexp expression_type {other}"
                )))
            }
        })
    }

    fn negated(self) -> bool {
        matches!(self, RegexpType::NoMatchIRegex | RegexpType::NoMatchRegex)
    }
}

#[derive(Debug, Clone)]
pub struct NamedRegexp {
    pub name: String,
    pub expression: String,
    pub expr_type: RegexpType,
    pub delimiter: u8,
    pub case_sensitive: bool,
}

impl NamedRegexp {
    /// Ingest one `regexp` row from a refresh reply,
    /// skipping rows missing mandatory fields with a warning.
    pub fn try_from_row(row: &RegexpRow) -> Option<Self> {
        let name = row.name.clone().filter(|s| !s.is_empty())?;
        let expression = match row.expression.clone() {
            Some(e) => e,
            None => {
                warn!(name, "regexp row missing expression, skipping");
                return None;
            }
        };
        let expr_type = match row.expression_type.and_then(|n| RegexpType::from_wire(n.0).ok()) {
            Some(t) => t,
            None => {
                warn!(name, "regexp row missing/invalid expression_type, skipping");
                return None;
            }
        };
        let case_sensitive = match row.case_sensitive {
            Some(n) => n.0 != 0,
            None => {
                warn!(name, "regexp row missing case_sensitive, skipping");
                return None;
            }
        };
        let delimiter = row
            .exp_delimiter
            .as_ref()
            .and_then(|d| d.bytes().next())
            .unwrap_or(b',');

        Some(NamedRegexp {
            name,
            expression,
            expr_type,
            delimiter,
            case_sensitive,
        })
    }

    fn compiled(&self) -> CoreResult<Regex> {
        compile(&self.expression, self.expr_type, self.case_sensitive)
    }

    fn is_match(&self, value: &str) -> CoreResult<bool> {
        match self.expr_type {
            RegexpType::Literal => {
                if self.case_sensitive {
                    Ok(value == self.expression)
                } else {
                    Ok(value.eq_ignore_ascii_case(&self.expression))
                }
            }
            RegexpType::GlobPipe => Ok(self
                .expression
                .split(self.delimiter as char)
                .any(|pat| glob_match(pat, value, self.case_sensitive))),
            RegexpType::IRegex | RegexpType::Regex => Ok(self.compiled()?.is_match(value)),
            RegexpType::NoMatchIRegex | RegexpType::NoMatchRegex => {
                Ok(!self.compiled()?.is_match(value))
            }
        }
    }
}

fn compile(expression: &str, ty: RegexpType, case_sensitive: bool) -> CoreResult<Regex> {
    let insensitive = matches!(ty, RegexpType::IRegex | RegexpType::NoMatchIRegex) || !case_sensitive;
    RegexBuilder::new(expression)
        .case_insensitive(insensitive)
        .build()
        .map_err(|e| CoreError::Protocol(format!("bad regexp '{expression}': {e}")))
}

fn glob_match(pattern: &str, value: &str, case_sensitive: bool) -> bool {
    let (pattern, value) = if case_sensitive {
        (pattern.to_string(), value.to_string())
    } else {
        (pattern.to_lowercase(), value.to_lowercase())
    };
    glob_match_ci(&pattern, &value)
}

fn glob_match_ci(pattern: &str, value: &str) -> bool {
    // Minimal `*`/`?` glob matcher; no char classes (matches spec's
    // "globPipe" which is shell-glob-like, `|`-delimited alternatives).
    fn go(p: &[u8], v: &[u8]) -> bool {
        match p.first() {
            None => v.is_empty(),
            Some(b'*') => go(&p[1..], v) || (!v.is_empty() && go(p, &v[1..])),
            Some(b'?') => !v.is_empty() && go(&p[1..], &v[1..]),
            Some(&c) => !v.is_empty() && v[0] == c && go(&p[1..], &v[1..]),
        }
    }
    go(pattern.as_bytes(), value.as_bytes())
}

/// Holds the agent's current named-regexp table.
#[derive(Debug, Clone, Default)]
pub struct RegexpSet {
    entries: HashMap<String, NamedRegexp>,
}

impl RegexpSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entire set, as required by a successful refresh
    ///. Rows missing mandatory fields are skipped by
    /// the caller before reaching here.
    pub fn replace_all(&mut self, entries: Vec<NamedRegexp>) {
        self.entries = entries.into_iter().map(|e| (e.name.clone(), e)).collect();
    }

    /// Ingest a full `regexp` reply section, skipping invalid rows.
    pub fn replace_from_rows(&mut self, rows: &[RegexpRow]) {
        let entries = rows.iter().filter_map(NamedRegexp::try_from_row).collect();
        self.replace_all(entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&NamedRegexp> {
        self.entries.get(name)
    }

    /// Match `value` against `pattern`: if `pattern` names an entry in this
    /// set, use its stored type/case-sensitivity; otherwise treat `pattern`
    /// as a literal case-sensitive regex.
    pub fn matches(&self, value: &str, pattern: &str, default_case_sensitive: bool) -> CoreResult<bool> {
        if let Some(named) = self.entries.get(pattern) {
            return named.is_match(value);
        }
        let re = compile(pattern, RegexpType::Regex, default_case_sensitive)?;
        Ok(re.is_match(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, expr: &str, ty: RegexpType, case_sensitive: bool) -> NamedRegexp {
        NamedRegexp {
            name: name.to_string(),
            expression: expr.to_string(),
            expr_type: ty,
            delimiter: b',',
            case_sensitive,
        }
    }

    #[test]
    fn test_replace_all_is_wholesale() {
        let mut set = RegexpSet::new();
        set.replace_all(vec![entry("a", "foo", RegexpType::Regex, true)]);
        assert_eq!(set.len(), 1);
        set.replace_all(vec![entry("b", "bar", RegexpType::Regex, true)]);
        assert_eq!(set.len(), 1);
        assert!(set.get("a").is_none());
        assert!(set.get("b").is_some());
    }

    #[test]
    fn test_named_regex_match() {
        let mut set = RegexpSet::new();
        set.replace_all(vec![entry("errors", "ERROR|FATAL", RegexpType::Regex, true)]);
        assert!(set.matches("2024 ERROR disk full", "errors", true).unwrap());
        assert!(!set.matches("2024 info ok", "errors", true).unwrap());
    }

    #[test]
    fn test_unnamed_pattern_falls_back_to_literal_regex() {
        let set = RegexpSet::new();
        assert!(set.matches("hello world", "wor.d", true).unwrap());
    }

    #[test]
    fn test_nomatch_inverts() {
        let mut set = RegexpSet::new();
        set.replace_all(vec![entry("not_debug", "DEBUG", RegexpType::NoMatchRegex, true)]);
        assert!(set.matches("INFO startup", "not_debug", true).unwrap());
        assert!(!set.matches("DEBUG verbose", "not_debug", true).unwrap());
    }

    #[test]
    fn test_case_insensitive_literal() {
        let mut set = RegexpSet::new();
        set.replace_all(vec![entry("exact", "Shutdown", RegexpType::Literal, false)]);
        assert!(set.matches("shutdown", "exact", true).unwrap());
        assert!(!set.matches("shutdown now", "exact", true).unwrap());
    }

    #[test]
    fn test_replace_from_rows_skips_rows_missing_mandatory_fields() {
        let rows = vec![
            RegexpRow {
                name: Some("good".to_string()),
                expression: Some("ERROR".to_string()),
                expression_type: Some(crate::wire::FlexInt(2)),
                exp_delimiter: None,
                case_sensitive: Some(crate::wire::FlexInt(1)),
            },
            RegexpRow {
                name: Some("missing_expr".to_string()),
                expression: None,
                expression_type: Some(crate::wire::FlexInt(2)),
                exp_delimiter: None,
                case_sensitive: Some(crate::wire::FlexInt(1)),
            },
        ];
        let mut set = RegexpSet::new();
        set.replace_from_rows(&rows);
        assert_eq!(set.len(), 1);
        assert!(set.get("good").is_some());
    }

    #[test]
    fn test_glob_pipe() {
        let mut set = RegexpSet::new();
        set.replace_all(vec![entry("hosts", "web*|db?", RegexpType::GlobPipe, true)]);
        assert!(set.matches("web01", "hosts", true).unwrap());
        assert!(set.matches("db1", "hosts", true).unwrap());
        assert!(!set.matches("cache1", "hosts", true).unwrap());
    }
}
