//! Condition expression language used by `expression` gate predicates.
//!
//! Grammar:
//! ```text
//! ConditionExpr  ::= Clause ( '&&' Clause )*
//! Clause         ::= Key Operator Literal
//! Key            ::= identifier ( '.' identifier )*
//! Operator       ::= '=' | '==' | '!=' | '>' | '>=' | '<' | '<='
//! Literal        ::= QuotedString | BareWord | Number | Boolean
//! ```
//!
//! Ordering operators compare numerically; a side that does not parse as a
//! number makes the clause false.

use strata_types::StrataError;

/// A parsed condition expression consisting of one or more clauses joined by `&&`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpr {
    pub clauses: Vec<Clause>,
}

/// A single comparison clause: `key op value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub key: String,
    pub operator: Operator,
    pub value: String,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Parse a condition string into a [`ConditionExpr`].
///
/// An empty or whitespace-only input produces an expression with zero clauses,
/// which [`evaluate_condition`] treats as always true.
pub fn parse_condition(input: &str) -> Result<ConditionExpr, StrataError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(ConditionExpr {
            clauses: Vec::new(),
        });
    }

    let mut clauses = Vec::new();
    for part in trimmed.split("&&") {
        clauses.push(parse_clause(part.trim())?);
    }

    Ok(ConditionExpr { clauses })
}

fn parse_clause(input: &str) -> Result<Clause, StrataError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(make_error("empty clause"));
    }

    let (key_end, operator, op_len) = find_operator(input)?;

    let key = input[..key_end].trim().to_string();
    if key.is_empty() {
        return Err(make_error("missing key before operator"));
    }
    for seg in key.split('.') {
        if seg.is_empty() || !seg.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(make_error(&format!("invalid key segment: '{seg}'")));
        }
    }

    let raw_value = input[key_end + op_len..].trim();
    if raw_value.is_empty() {
        return Err(make_error(&format!("missing value after operator in '{input}'")));
    }

    Ok(Clause {
        key,
        operator,
        value: strip_quotes(raw_value),
    })
}

fn find_operator(input: &str) -> Result<(usize, Operator, usize), StrataError> {
    // Scan for the first operator, skipping quoted regions.
    let bytes = input.as_bytes();
    let followed_by_eq = |i: usize| i + 1 < bytes.len() && bytes[i + 1] == b'=';
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'!' if followed_by_eq(i) => return Ok((i, Operator::NotEq, 2)),
            b'>' if followed_by_eq(i) => return Ok((i, Operator::Ge, 2)),
            b'<' if followed_by_eq(i) => return Ok((i, Operator::Le, 2)),
            b'>' => return Ok((i, Operator::Gt, 1)),
            b'<' => return Ok((i, Operator::Lt, 1)),
            b'=' if followed_by_eq(i) => return Ok((i, Operator::Eq, 2)),
            b'=' => return Ok((i, Operator::Eq, 1)),
            _ => i += 1,
        }
    }
    Err(make_error(&format!("no operator found in '{input}'")))
}

fn strip_quotes(s: &str) -> String {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
        {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn make_error(msg: &str) -> StrataError {
    StrataError::InvalidDefinition(format!("condition parse error: {msg}"))
}

fn as_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn clause_holds(clause: &Clause, actual: &str) -> bool {
    let numbers = as_number(actual).zip(as_number(&clause.value));
    match clause.operator {
        Operator::Eq => match numbers {
            Some((a, b)) => a == b,
            None => actual == clause.value,
        },
        Operator::NotEq => match numbers {
            Some((a, b)) => a != b,
            None => actual != clause.value,
        },
        Operator::Gt => numbers.is_some_and(|(a, b)| a > b),
        Operator::Ge => numbers.is_some_and(|(a, b)| a >= b),
        Operator::Lt => numbers.is_some_and(|(a, b)| a < b),
        Operator::Le => numbers.is_some_and(|(a, b)| a <= b),
    }
}

/// Evaluate a condition expression against values provided by a resolver function.
///
/// The `resolve` function maps a key (e.g. `"score"`, `"payload.coverage"`) to its
/// string value. Keys not found should resolve to an empty string.
///
/// An expression with zero clauses (from an empty input) evaluates to `true`.
pub fn evaluate_condition(expr: &ConditionExpr, resolve: &dyn Fn(&str) -> String) -> bool {
    expr.clauses
        .iter()
        .all(|clause| clause_holds(clause, &resolve(&clause.key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_resolve(key: &str) -> String {
        match key {
            "passed" => "true".to_string(),
            "score" => "0.82".to_string(),
            "violations" => "0".to_string(),
            "payload.reviewer" => "lint".to_string(),
            _ => String::new(),
        }
    }

    #[test]
    fn simple_equality() {
        let expr = parse_condition("passed=true").unwrap();
        assert_eq!(expr.clauses.len(), 1);
        assert_eq!(expr.clauses[0].key, "passed");
        assert_eq!(expr.clauses[0].operator, Operator::Eq);
        assert_eq!(expr.clauses[0].value, "true");
        assert!(evaluate_condition(&expr, &report_resolve));

        let expr = parse_condition("passed==false").unwrap();
        assert_eq!(expr.clauses[0].operator, Operator::Eq);
        assert!(!evaluate_condition(&expr, &report_resolve));
    }

    #[test]
    fn not_equal() {
        let expr = parse_condition("payload.reviewer!=human").unwrap();
        assert_eq!(expr.clauses[0].operator, Operator::NotEq);
        assert!(evaluate_condition(&expr, &report_resolve));
    }

    #[test]
    fn numeric_comparisons() {
        assert!(evaluate_condition(
            &parse_condition("score>=0.8").unwrap(),
            &report_resolve
        ));
        assert!(!evaluate_condition(
            &parse_condition("score>0.9").unwrap(),
            &report_resolve
        ));
        assert!(evaluate_condition(
            &parse_condition("violations<1").unwrap(),
            &report_resolve
        ));
        assert!(evaluate_condition(
            &parse_condition("violations<=0").unwrap(),
            &report_resolve
        ));
        // Numeric equality ignores formatting differences.
        assert!(evaluate_condition(
            &parse_condition("violations=0.0").unwrap(),
            &report_resolve
        ));
    }

    #[test]
    fn ordering_on_non_numeric_is_false() {
        let expr = parse_condition("payload.reviewer>1").unwrap();
        assert!(!evaluate_condition(&expr, &report_resolve));
        let expr = parse_condition("missing<5").unwrap();
        assert!(!evaluate_condition(&expr, &report_resolve));
    }

    #[test]
    fn compound_condition() {
        let expr = parse_condition("passed=true && score>=0.8 && violations=0").unwrap();
        assert_eq!(expr.clauses.len(), 3);
        assert!(evaluate_condition(&expr, &report_resolve));

        let expr = parse_condition("passed=true && score>=0.9").unwrap();
        assert!(!evaluate_condition(&expr, &report_resolve));
    }

    #[test]
    fn empty_condition_always_true() {
        let expr = parse_condition("   ").unwrap();
        assert!(expr.clauses.is_empty());
        assert!(evaluate_condition(&expr, &report_resolve));
    }

    #[test]
    fn quoted_string_values() {
        let expr = parse_condition(r#"payload.reviewer="lint""#).unwrap();
        assert_eq!(expr.clauses[0].value, "lint");
        assert!(evaluate_condition(&expr, &report_resolve));

        let expr = parse_condition("payload.reviewer='a>b'").unwrap();
        assert_eq!(expr.clauses[0].value, "a>b");
    }

    #[test]
    fn parse_error_invalid_syntax() {
        assert!(parse_condition("score").is_err());
        assert!(parse_condition("score>=0.8 && ").is_err());
        assert!(parse_condition(">=1").is_err());
        assert!(parse_condition("score>=").is_err());
        assert!(parse_condition("bad key=1").is_err());
    }
}
