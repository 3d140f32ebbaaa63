//! PromQL rewriting: injects namespace matchers into user-supplied
//! expressions and selectors without evaluating anything locally.

use prometheus_auth_data::Set;
use promql_parser::parser::{self, Expr, VectorSelector};

use crate::matcher::{filter_matchers, MatcherError};

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("{0}")]
    Parse(String),
    #[error("{0:?} is not a series selector")]
    NotASelector(String),
    #[error(transparent)]
    Matcher(#[from] MatcherError),
}

/// Rewrites a single series selector (a `match[]` parameter) so it only
/// matches the allowed namespaces.
pub fn rewrite_selector(
    namespaces: &Set,
    selector: &str,
    strict: bool,
) -> Result<String, RewriteError> {
    let expr = parser::parse(selector).map_err(RewriteError::Parse)?;
    match expr {
        Expr::VectorSelector(mut vs) => {
            rewrite_vector_selector(namespaces, &mut vs, strict)?;
            Ok(vs.to_string())
        }
        _ => Err(RewriteError::NotASelector(selector.to_string())),
    }
}

/// Rewrites a full PromQL expression: every vector selector in the tree has
/// its matchers restricted to the allowed namespaces.
pub fn rewrite_expression(
    namespaces: &Set,
    expression: &str,
    strict: bool,
) -> Result<String, RewriteError> {
    let mut expr = parser::parse(expression).map_err(RewriteError::Parse)?;
    rewrite_expr(namespaces, &mut expr, strict)?;
    Ok(expr.to_string())
}

fn rewrite_expr(namespaces: &Set, expr: &mut Expr, strict: bool) -> Result<(), RewriteError> {
    match expr {
        Expr::VectorSelector(vs) => rewrite_vector_selector(namespaces, vs, strict)?,
        Expr::MatrixSelector(ms) => rewrite_vector_selector(namespaces, &mut ms.vs, strict)?,
        Expr::Aggregate(agg) => {
            rewrite_expr(namespaces, &mut agg.expr, strict)?;
            if let Some(param) = agg.param.as_mut() {
                rewrite_expr(namespaces, param, strict)?;
            }
        }
        Expr::Binary(bin) => {
            rewrite_expr(namespaces, &mut bin.lhs, strict)?;
            rewrite_expr(namespaces, &mut bin.rhs, strict)?;
        }
        Expr::Unary(unary) => rewrite_expr(namespaces, &mut unary.expr, strict)?,
        Expr::Paren(paren) => rewrite_expr(namespaces, &mut paren.expr, strict)?,
        Expr::Subquery(subquery) => rewrite_expr(namespaces, &mut subquery.expr, strict)?,
        Expr::Call(call) => {
            for arg in call.args.args.iter_mut() {
                rewrite_expr(namespaces, arg, strict)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn rewrite_vector_selector(
    namespaces: &Set,
    vs: &mut VectorSelector,
    strict: bool,
) -> Result<(), RewriteError> {
    let matchers = std::mem::take(&mut vs.matchers.matchers);
    vs.matchers.matchers = filter_matchers(namespaces, matchers, strict)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> Set {
        Set::new(values.iter().copied())
    }

    #[test]
    fn bare_metric_selector_gains_a_namespace_matcher() {
        let out = rewrite_selector(&set(&["ns-a"]), "test_metric1", false).expect("rewrite");
        assert!(out.starts_with("test_metric1"), "got {out}");
        assert!(out.contains(r#"namespace="ns-a""#), "got {out}");
    }

    #[test]
    fn multiple_namespaces_become_a_regex_matcher() {
        let out = rewrite_selector(&set(&["ns-b", "ns-a"]), "test_metric1", false).expect("rewrite");
        assert!(out.contains(r#"namespace=~"ns-a|ns-b""#), "got {out}");
    }

    #[test]
    fn empty_set_pins_the_selector_to_the_sentinel() {
        let out = rewrite_selector(&Set::default(), "test_metric1", false).expect("rewrite");
        assert!(out.contains(r#"namespace="______""#), "got {out}");
    }

    #[test]
    fn existing_matchers_are_kept() {
        let out =
            rewrite_selector(&set(&["ns-a"]), r#"{foo="boo"}"#, false).expect("rewrite");
        assert!(out.contains(r#"foo="boo""#), "got {out}");
        assert!(out.contains(r#"namespace="ns-a""#), "got {out}");
    }

    #[test]
    fn user_namespace_matcher_is_refined_in_place() {
        let out = rewrite_selector(&set(&["ns-a", "ns-b"]), r#"{namespace="ns-c"}"#, false)
            .expect("rewrite");
        assert!(out.contains(r#"namespace="______""#), "got {out}");

        let kept = rewrite_selector(&set(&["ns-a", "ns-b"]), r#"{namespace="ns-a"}"#, false)
            .expect("rewrite");
        assert!(kept.contains(r#"namespace="ns-a""#), "got {kept}");
        assert!(!kept.contains("______"), "got {kept}");
    }

    #[test]
    fn invalid_selector_reports_a_parse_error() {
        assert!(matches!(
            rewrite_selector(&set(&["ns-a"]), "-not-a-valid-metric-name", false),
            Err(RewriteError::Parse(_))
        ));
    }

    #[test]
    fn non_selector_expression_is_rejected() {
        assert!(matches!(
            rewrite_selector(&set(&["ns-a"]), "rate(test_metric1[5m])", false),
            Err(RewriteError::NotASelector(_))
        ));
    }

    #[test]
    fn every_selector_in_an_expression_is_rewritten() {
        let out = rewrite_expression(
            &set(&["ns-a"]),
            "sum(rate(test_metric1[5m])) / sum(rate(test_metric2[5m]))",
            false,
        )
        .expect("rewrite");
        assert_eq!(out.matches(r#"namespace="ns-a""#).count(), 2, "got {out}");
    }

    #[test]
    fn subqueries_and_parens_are_walked() {
        let out = rewrite_expression(
            &set(&["ns-a"]),
            "max_over_time((test_metric1 + test_metric2)[30m:1m])",
            false,
        )
        .expect("rewrite");
        assert_eq!(out.matches(r#"namespace="ns-a""#).count(), 2, "got {out}");
    }

    #[test]
    fn rewriting_an_expression_twice_is_idempotent() {
        let namespaces = set(&["ns-a", "ns-b"]);
        let once =
            rewrite_expression(&namespaces, "sum(test_metric1)", false).expect("rewrite");
        let twice = rewrite_expression(&namespaces, &once, false).expect("rewrite");
        assert_eq!(once, twice);
    }

    #[test]
    fn literals_pass_through() {
        let out = rewrite_expression(&set(&["ns-a"]), "1 + 2", false).expect("rewrite");
        assert!(!out.contains("namespace"), "got {out}");
    }
}
