//! Parsed `name{label=value,…}` stream identifiers.
//!
//! A variable is the key for everything in the store: the RAM map, the
//! record log, and the per-file header indexes are all keyed by a variable's
//! canonical string form. Matching supports a trailing `*` on the name
//! (prefix match) and `*` label values on either side of the comparison.

use std::collections::BTreeMap;
use std::fmt;

use snafu::Snafu;

use crate::proto;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParseError {
    #[snafu(display("unterminated label block in '{}'", input))]
    UnterminatedLabels { input: String },

    #[snafu(display("trailing characters after '}}' in '{}'", input))]
    TrailingCharacters { input: String },

    #[snafu(display("label '{}' has no value in '{}'", label, input))]
    MissingValue { label: String, input: String },
}

/// A textual stream identifier with ordered labels.
///
/// Labels are kept in a `BTreeMap` so the canonical form falls out of
/// iteration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    name: String,
    labels: BTreeMap<String, String>,
}

impl Variable {
    /// Parses a variable from its text form.
    ///
    /// Accepts `name`, `name{}`, and `name{a=b,c=d}`. Empty chunks between
    /// commas are ignored; a chunk without `=` is an error.
    pub fn parse(text: &str) -> Result<Variable, ParseError> {
        let Some(brace) = text.find('{') else {
            if text.contains('}') {
                return Err(ParseError::UnterminatedLabels {
                    input: text.to_string(),
                });
            }
            return Ok(Variable {
                name: text.to_string(),
                labels: BTreeMap::new(),
            });
        };

        let name = text[..brace].to_string();
        let rest = &text[brace + 1..];
        let Some(end) = rest.find('}') else {
            return Err(ParseError::UnterminatedLabels {
                input: text.to_string(),
            });
        };
        if !rest[end + 1..].is_empty() {
            return Err(ParseError::TrailingCharacters {
                input: text.to_string(),
            });
        }

        let mut labels = BTreeMap::new();
        for chunk in rest[..end].split(',') {
            if chunk.is_empty() {
                continue;
            }
            let Some((label, value)) = chunk.split_once('=') else {
                return Err(ParseError::MissingValue {
                    label: chunk.to_string(),
                    input: text.to_string(),
                });
            };
            labels.insert(label.to_string(), value.to_string());
        }

        Ok(Variable {
            name,
            labels,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Renders the canonical string form: the name, then `{k=v,…}` with
    /// labels in lexicographic order. An empty label set renders as the bare
    /// name.
    pub fn to_canonical(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let mut out = String::with_capacity(self.name.len() + 16 * self.labels.len());
        out.push_str(&self.name);
        out.push('{');
        for (i, (label, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(label);
            out.push('=');
            out.push_str(value);
        }
        out.push('}');
        out
    }

    /// Whether `self` satisfies the `query` pattern.
    ///
    /// The query's name may end in `*` for a prefix match. Every label the
    /// query carries must be present on `self` with an equal value, with `*`
    /// on either side matching anything.
    pub fn matches(&self, query: &Variable) -> bool {
        if let Some(prefix) = query.name.strip_suffix('*') {
            if !self.name.starts_with(prefix) {
                return false;
            }
        } else if self.name != query.name {
            return false;
        }

        for (label, want) in &query.labels {
            match self.labels.get(label) {
                Some(have) => {
                    if want != "*" && have != "*" && want != have {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }

    pub fn from_proto(p: &proto::StreamVariable) -> Variable {
        let labels = p
            .label
            .iter()
            .map(|l| (l.label.clone(), l.value.clone().unwrap_or_default()))
            .collect();
        Variable {
            name: p.name.clone(),
            labels,
        }
    }

    pub fn to_proto(&self) -> proto::StreamVariable {
        proto::StreamVariable {
            name: self.name.clone(),
            label: self
                .labels
                .iter()
                .map(|(label, value)| proto::Label {
                    label: label.clone(),
                    value: Some(value.clone()),
                })
                .collect(),
            r#type: None,
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(text: &str) -> Variable {
        Variable::parse(text).expect("test variable should parse")
    }

    #[test]
    fn parse_bare_name() {
        let v = var("/system/cpu");
        assert_eq!(v.name(), "/system/cpu");
        assert_eq!(v.to_canonical(), "/system/cpu");
    }

    #[test]
    fn parse_empty_label_block() {
        assert_eq!(var("/system/cpu{}").to_canonical(), "/system/cpu");
    }

    #[test]
    fn canonical_sorts_labels() {
        let v = var("/net/bytes{iface=eth0,direction=in}");
        assert_eq!(v.to_canonical(), "/net/bytes{direction=in,iface=eth0}");
    }

    #[test]
    fn parse_rejects_unterminated_braces() {
        assert!(matches!(
            Variable::parse("/x{a=b"),
            Err(ParseError::UnterminatedLabels { .. })
        ));
        assert!(matches!(
            Variable::parse("/x}a=b"),
            Err(ParseError::UnterminatedLabels { .. })
        ));
    }

    #[test]
    fn parse_rejects_trailing_text() {
        assert!(matches!(
            Variable::parse("/x{a=b}c"),
            Err(ParseError::TrailingCharacters { .. })
        ));
    }

    #[test]
    fn parse_rejects_label_without_value() {
        assert!(matches!(
            Variable::parse("/x{ab}"),
            Err(ParseError::MissingValue { .. })
        ));
    }

    #[test]
    fn exact_name_match() {
        assert!(var("/a/b").matches(&var("/a/b")));
        assert!(!var("/a/b").matches(&var("/a/c")));
    }

    #[test]
    fn prefix_name_match() {
        let query = var("/system/*");
        assert!(var("/system/cpu").matches(&query));
        assert!(var("/system/memory{host=a}").matches(&query));
        assert!(!var("/net/bytes").matches(&query));
    }

    #[test]
    fn label_subset_match() {
        let query = var("/x{host=a}");
        assert!(var("/x{host=a,job=web}").matches(&query));
        assert!(!var("/x{host=b,job=web}").matches(&query));
        assert!(!var("/x").matches(&query));
    }

    #[test]
    fn wildcard_label_matches_either_side() {
        assert!(var("/x{host=a}").matches(&var("/x{host=*}")));
        assert!(var("/x{host=*}").matches(&var("/x{host=a}")));
    }

    #[test]
    fn proto_roundtrip_preserves_canonical_form() {
        let v = var("/x{b=2,a=1}");
        let p = v.to_proto();
        assert_eq!(Variable::from_proto(&p), v);
        assert_eq!(p.label[0].label, "a");
    }
}
