//! Builds and refines `namespace` label matchers.
//!
//! Two isomorphic matcher forms flow through the proxy: the engine form
//! ([`promql_parser::label::Matcher`]) used when rewriting PromQL
//! expressions and selectors, and the wire form ([`LabelMatcher`]) used by
//! the remote-read protocol. Both are produced by the same size rule and a
//! lossless pairwise translation exists between them.

use prometheus_auth_data::Set;
use promql_parser::label::{MatchOp, Matcher};
use regex::Regex;

use crate::prompb::{label_matcher, LabelMatcher};

pub const NAMESPACE_MATCH_NAME: &str = "namespace";
pub const EXPORTED_NAMESPACE_MATCH_NAME: &str = "exported_namespace";

/// Matches no real namespace: Kubernetes namespace names are DNS-1123
/// labels and cannot contain underscores, so this value enforces empty
/// results without a dedicated code path downstream.
pub const NONE_NAMESPACE: &str = "______";

#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("invalid matcher regex {value:?}: {source}")]
    InvalidRegex {
        value: String,
        #[source]
        source: Box<regex::Error>,
    },
    #[error("invalid matcher type {0}")]
    InvalidType(i32),
}

/// Produces the engine-form matcher restricting `name` to `namespaces`.
pub fn namespace_matcher(name: &str, namespaces: &Set) -> Result<Matcher, MatcherError> {
    let (op, value) = namespace_op_value(namespaces)?;
    Ok(Matcher {
        op,
        name: name.to_string(),
        value,
    })
}

/// Produces the wire-form matcher restricting `namespace` to `namespaces`.
pub fn namespace_label_matcher(namespaces: &Set) -> LabelMatcher {
    let mut values = namespaces.values();
    let (r#type, value) = match namespaces.len() {
        0 => (label_matcher::Type::Eq, NONE_NAMESPACE.to_string()),
        1 => (
            label_matcher::Type::Eq,
            values.next().expect("length checked").to_string(),
        ),
        _ => (label_matcher::Type::Re, namespaces.join("|")),
    };
    LabelMatcher {
        r#type: r#type as i32,
        name: NAMESPACE_MATCH_NAME.to_string(),
        value,
    }
}

fn namespace_op_value(namespaces: &Set) -> Result<(MatchOp, String), MatcherError> {
    let mut values = namespaces.values();
    match namespaces.len() {
        0 => Ok((MatchOp::Equal, NONE_NAMESPACE.to_string())),
        1 => Ok((
            MatchOp::Equal,
            values.next().expect("length checked").to_string(),
        )),
        _ => {
            let value = namespaces.join("|");
            let re = compile(&value)?;
            Ok((MatchOp::Re(re), value))
        }
    }
}

/// Restricts a user-supplied engine-form matcher list to `namespaces`.
///
/// An existing matcher on the namespace label (or its `exported_namespace`
/// alias unless `strict` is set) is refined in place; otherwise a fresh
/// namespace matcher is appended. The user's predicate is only ever
/// narrowed, and applying this twice with the same set is equivalent to
/// applying it once.
pub fn filter_matchers(
    namespaces: &Set,
    mut matchers: Vec<Matcher>,
    strict: bool,
) -> Result<Vec<Matcher>, MatcherError> {
    let mut refined_existing = false;
    for matcher in matchers.iter_mut() {
        if matcher.name == NAMESPACE_MATCH_NAME
            || (!strict && matcher.name == EXPORTED_NAMESPACE_MATCH_NAME)
        {
            let refined =
                refine(namespaces, |value| matches_op(&matcher.op, &matcher.value, value))?;
            let (op, value) = namespace_op_value(&refined)?;
            matcher.op = op;
            matcher.value = value;
            refined_existing = true;
            break;
        }
    }

    if !refined_existing {
        matchers.push(namespace_matcher(NAMESPACE_MATCH_NAME, namespaces)?);
    }
    Ok(matchers)
}

/// Restricts a user-supplied wire-form matcher list to `namespaces`.
///
/// Only the `namespace` label is recognized on this path.
pub fn filter_label_matchers(
    namespaces: &Set,
    mut matchers: Vec<LabelMatcher>,
) -> Result<Vec<LabelMatcher>, MatcherError> {
    let mut refined_existing = false;
    for matcher in matchers.iter_mut() {
        if matcher.name == NAMESPACE_MATCH_NAME {
            let r#type = label_matcher::Type::try_from(matcher.r#type)
                .map_err(|_| MatcherError::InvalidType(matcher.r#type))?;
            let refined = refine(namespaces, |value| {
                matches_label_type(r#type, &matcher.value, value)
            })?;
            *matcher = namespace_label_matcher(&refined);
            refined_existing = true;
            break;
        }
    }

    if !refined_existing {
        matchers.push(namespace_label_matcher(namespaces));
    }
    Ok(matchers)
}

/// Evaluates the user predicate against every allowed namespace; the result
/// is the subset the user may still see.
fn refine<F>(allowed: &Set, matches: F) -> Result<Set, MatcherError>
where
    F: Fn(&str) -> Result<bool, MatcherError>,
{
    let mut refined = Set::default();
    for namespace in allowed.values() {
        if matches(namespace)? {
            refined.insert(namespace);
        }
    }
    Ok(refined)
}

fn matches_op(op: &MatchOp, pattern: &str, value: &str) -> Result<bool, MatcherError> {
    match op {
        MatchOp::Equal => Ok(pattern == value),
        MatchOp::NotEqual => Ok(pattern != value),
        MatchOp::Re(_) => Ok(anchored(pattern)?.is_match(value)),
        MatchOp::NotRe(_) => Ok(!anchored(pattern)?.is_match(value)),
    }
}

fn matches_label_type(
    r#type: label_matcher::Type,
    pattern: &str,
    value: &str,
) -> Result<bool, MatcherError> {
    match r#type {
        label_matcher::Type::Eq => Ok(pattern == value),
        label_matcher::Type::Neq => Ok(pattern != value),
        label_matcher::Type::Re => Ok(anchored(pattern)?.is_match(value)),
        label_matcher::Type::Nre => Ok(!anchored(pattern)?.is_match(value)),
    }
}

/// Prometheus regex matchers are fully anchored; evaluation here must agree.
fn anchored(pattern: &str) -> Result<Regex, MatcherError> {
    compile(&format!("^(?:{pattern})$"))
}

fn compile(pattern: &str) -> Result<Regex, MatcherError> {
    Regex::new(pattern).map_err(|source| MatcherError::InvalidRegex {
        value: pattern.to_string(),
        source: Box::new(source),
    })
}

/// Translates engine-form matchers to the wire form, preserving type, name
/// and value.
pub fn to_label_matchers(matchers: &[Matcher]) -> Vec<LabelMatcher> {
    matchers
        .iter()
        .map(|matcher| {
            let r#type = match matcher.op {
                MatchOp::Equal => label_matcher::Type::Eq,
                MatchOp::NotEqual => label_matcher::Type::Neq,
                MatchOp::Re(_) => label_matcher::Type::Re,
                MatchOp::NotRe(_) => label_matcher::Type::Nre,
            };
            LabelMatcher {
                r#type: r#type as i32,
                name: matcher.name.clone(),
                value: matcher.value.clone(),
            }
        })
        .collect()
}

/// Translates wire-form matchers to the engine form, preserving type, name
/// and value.
pub fn from_label_matchers(matchers: &[LabelMatcher]) -> Result<Vec<Matcher>, MatcherError> {
    matchers
        .iter()
        .map(|matcher| {
            let op = match label_matcher::Type::try_from(matcher.r#type)
                .map_err(|_| MatcherError::InvalidType(matcher.r#type))?
            {
                label_matcher::Type::Eq => MatchOp::Equal,
                label_matcher::Type::Neq => MatchOp::NotEqual,
                label_matcher::Type::Re => MatchOp::Re(compile(&matcher.value)?),
                label_matcher::Type::Nre => MatchOp::NotRe(compile(&matcher.value)?),
            };
            Ok(Matcher {
                op,
                name: matcher.name.clone(),
                value: matcher.value.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> Set {
        Set::new(values.iter().copied())
    }

    #[test]
    fn empty_set_produces_the_sentinel() {
        let matcher = namespace_matcher("namespace", &Set::default()).expect("matcher");
        assert!(matches!(matcher.op, MatchOp::Equal));
        assert_eq!(matcher.value, NONE_NAMESPACE);

        let wire = namespace_label_matcher(&Set::default());
        assert_eq!(wire.r#type, label_matcher::Type::Eq as i32);
        assert_eq!(wire.value, NONE_NAMESPACE);
    }

    #[test]
    fn single_namespace_produces_equality() {
        let matcher = namespace_matcher("namespace", &set(&["ns-a"])).expect("matcher");
        assert!(matches!(matcher.op, MatchOp::Equal));
        assert_eq!(matcher.value, "ns-a");
    }

    #[test]
    fn multiple_namespaces_produce_a_sorted_regex() {
        let matcher = namespace_matcher("namespace", &set(&["ns-b", "ns-a"])).expect("matcher");
        assert!(matches!(matcher.op, MatchOp::Re(_)));
        assert_eq!(matcher.value, "ns-a|ns-b");

        let wire = namespace_label_matcher(&set(&["ns-b", "ns-a"]));
        assert_eq!(wire.r#type, label_matcher::Type::Re as i32);
        assert_eq!(wire.value, "ns-a|ns-b");
    }

    #[test]
    fn appends_when_no_namespace_matcher_exists() {
        let user = vec![Matcher {
            op: MatchOp::Equal,
            name: "foo".to_string(),
            value: "bar".to_string(),
        }];
        let filtered = filter_matchers(&set(&["ns-a"]), user, false).expect("filter");
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[1].name, "namespace");
        assert_eq!(filtered[1].value, "ns-a");
    }

    #[test]
    fn allowed_equality_matcher_is_preserved() {
        let user = vec![Matcher {
            op: MatchOp::Equal,
            name: "namespace".to_string(),
            value: "ns-a".to_string(),
        }];
        let filtered = filter_matchers(&set(&["ns-a", "ns-b"]), user, false).expect("filter");
        assert_eq!(filtered.len(), 1);
        assert!(matches!(filtered[0].op, MatchOp::Equal));
        assert_eq!(filtered[0].value, "ns-a");
    }

    #[test]
    fn disallowed_equality_matcher_becomes_the_sentinel() {
        let user = vec![Matcher {
            op: MatchOp::Equal,
            name: "namespace".to_string(),
            value: "ns-c".to_string(),
        }];
        let filtered = filter_matchers(&set(&["ns-a", "ns-b"]), user, false).expect("filter");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].value, NONE_NAMESPACE);
    }

    #[test]
    fn regex_matcher_is_intersected_with_the_allowed_set() {
        let user = vec![Matcher {
            op: MatchOp::Re(Regex::new("ns-.*").expect("regex")),
            name: "namespace".to_string(),
            value: "ns-.*".to_string(),
        }];
        let filtered = filter_matchers(&set(&["ns-a", "ns-b", "other"]), user, false).expect("filter");
        assert_eq!(filtered.len(), 1);
        assert!(matches!(filtered[0].op, MatchOp::Re(_)));
        assert_eq!(filtered[0].value, "ns-a|ns-b");
    }

    #[test]
    fn regex_evaluation_is_anchored() {
        // "ns" must not match "ns-a" the way an unanchored search would.
        let user = vec![Matcher {
            op: MatchOp::Re(Regex::new("ns").expect("regex")),
            name: "namespace".to_string(),
            value: "ns".to_string(),
        }];
        let filtered = filter_matchers(&set(&["ns-a", "ns-b"]), user, false).expect("filter");
        assert_eq!(filtered[0].value, NONE_NAMESPACE);
    }

    #[test]
    fn negative_matchers_narrow_to_the_complement_within_the_set() {
        let user = vec![Matcher {
            op: MatchOp::NotEqual,
            name: "namespace".to_string(),
            value: "ns-a".to_string(),
        }];
        let filtered = filter_matchers(&set(&["ns-a", "ns-b", "ns-c"]), user, false).expect("filter");
        assert!(matches!(filtered[0].op, MatchOp::Re(_)));
        assert_eq!(filtered[0].value, "ns-b|ns-c");
    }

    #[test]
    fn exported_namespace_alias_is_recognized_unless_strict() {
        let user = || {
            vec![Matcher {
                op: MatchOp::Equal,
                name: "exported_namespace".to_string(),
                value: "ns-c".to_string(),
            }]
        };

        let filtered = filter_matchers(&set(&["ns-a"]), user(), false).expect("filter");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].value, NONE_NAMESPACE);

        let strict = filter_matchers(&set(&["ns-a"]), user(), true).expect("filter");
        assert_eq!(strict.len(), 2);
        assert_eq!(strict[0].value, "ns-c");
        assert_eq!(strict[1].name, "namespace");
    }

    #[test]
    fn filtering_is_idempotent() {
        let namespaces = set(&["ns-a", "ns-b"]);
        let once = filter_matchers(&namespaces, Vec::new(), false).expect("filter");
        let twice = filter_matchers(&namespaces, once.clone(), false).expect("filter");
        assert_eq!(once.len(), twice.len());
        assert_eq!(once[0].name, twice[0].name);
        assert_eq!(once[0].value, twice[0].value);

        let empty_once = filter_matchers(&Set::default(), Vec::new(), false).expect("filter");
        let empty_twice = filter_matchers(&Set::default(), empty_once.clone(), false).expect("filter");
        assert_eq!(empty_twice.len(), 1);
        assert_eq!(empty_twice[0].value, NONE_NAMESPACE);
    }

    #[test]
    fn wire_matchers_follow_the_same_rules() {
        let user = vec![LabelMatcher {
            r#type: label_matcher::Type::Eq as i32,
            name: "namespace".to_string(),
            value: "ns-a".to_string(),
        }];
        let filtered = filter_label_matchers(&set(&["ns-a", "ns-b"]), user).expect("filter");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].value, "ns-a");

        let appended =
            filter_label_matchers(&set(&["ns-a", "ns-b"]), Vec::new()).expect("filter");
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].r#type, label_matcher::Type::Re as i32);
        assert_eq!(appended[0].value, "ns-a|ns-b");
    }

    #[test]
    fn wire_path_ignores_the_exported_namespace_alias() {
        let user = vec![LabelMatcher {
            r#type: label_matcher::Type::Eq as i32,
            name: "exported_namespace".to_string(),
            value: "ns-c".to_string(),
        }];
        let filtered = filter_label_matchers(&set(&["ns-a"]), user).expect("filter");
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[1].name, "namespace");
    }

    #[test]
    fn translation_preserves_type_name_and_value() {
        let engine = vec![
            Matcher {
                op: MatchOp::Equal,
                name: "namespace".to_string(),
                value: "ns-a".to_string(),
            },
            Matcher {
                op: MatchOp::NotEqual,
                name: "foo".to_string(),
                value: "bar".to_string(),
            },
            Matcher {
                op: MatchOp::Re(Regex::new("a|b").expect("regex")),
                name: "namespace".to_string(),
                value: "a|b".to_string(),
            },
            Matcher {
                op: MatchOp::NotRe(Regex::new("c.*").expect("regex")),
                name: "job".to_string(),
                value: "c.*".to_string(),
            },
        ];

        let wire = to_label_matchers(&engine);
        let expected = [
            label_matcher::Type::Eq,
            label_matcher::Type::Neq,
            label_matcher::Type::Re,
            label_matcher::Type::Nre,
        ];
        for (matcher, (orig, ty)) in wire.iter().zip(engine.iter().zip(expected)) {
            assert_eq!(matcher.r#type, ty as i32);
            assert_eq!(matcher.name, orig.name);
            assert_eq!(matcher.value, orig.value);
        }

        let back = from_label_matchers(&wire).expect("translate");
        for (matcher, orig) in back.iter().zip(&engine) {
            assert_eq!(matcher.name, orig.name);
            assert_eq!(matcher.value, orig.value);
            assert_eq!(
                std::mem::discriminant(&matcher.op),
                std::mem::discriminant(&orig.op)
            );
        }
    }

    #[test]
    fn unknown_wire_matcher_type_is_rejected() {
        let bad = vec![LabelMatcher {
            r#type: 17,
            name: "namespace".to_string(),
            value: "ns-a".to_string(),
        }];
        assert!(from_label_matchers(&bad).is_err());
        assert!(filter_label_matchers(&set(&["ns-a"]), bad).is_err());
    }
}
