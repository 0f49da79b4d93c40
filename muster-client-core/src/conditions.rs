use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, tag, tag_no_case, take_while1},
    character::complete::{char, multispace0, none_of},
    combinator::{map, opt, recognize, value},
    multi::{many0, separated_list0},
    number::complete::double,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("Could not parse predicate: {0}")]
    Parse(String),

    #[error("Trailing input after predicate: {0}")]
    TrailingInput(String),
}

/// A dynamically-typed fact value, as supplied by the machine-facts gatherer
/// or an admin condition script.
#[derive(Debug, Clone, PartialEq)]
pub enum FactValue {
    Str(String),
    Int(i64),
    Real(f64),
    Bool(bool),
    Date(DateTime<Utc>),
    List(Vec<FactValue>),
}

pub type Facts = BTreeMap<String, FactValue>;

impl From<&str> for FactValue {
    fn from(s: &str) -> Self {
        FactValue::Str(s.to_string())
    }
}

impl FactValue {
    pub fn from_plist(value: &plist::Value) -> Option<FactValue> {
        Some(match value {
            plist::Value::String(s) => FactValue::Str(s.clone()),
            plist::Value::Boolean(b) => FactValue::Bool(*b),
            plist::Value::Integer(i) => FactValue::Int(i.as_signed()?),
            plist::Value::Real(r) => FactValue::Real(*r),
            plist::Value::Date(d) => {
                FactValue::Date(DateTime::<Utc>::from(std::time::SystemTime::from(*d)))
            }
            plist::Value::Array(items) => {
                FactValue::List(items.iter().filter_map(FactValue::from_plist).collect())
            }
            _ => return None,
        })
    }

    pub fn to_plist(&self) -> plist::Value {
        match self {
            FactValue::Str(s) => plist::Value::String(s.clone()),
            FactValue::Int(i) => plist::Value::Integer((*i).into()),
            FactValue::Real(r) => plist::Value::Real(*r),
            FactValue::Bool(b) => plist::Value::Boolean(*b),
            FactValue::Date(d) => {
                plist::Value::Date(plist::Date::from(std::time::SystemTime::from(*d)))
            }
            FactValue::List(items) => {
                plist::Value::Array(items.iter().map(FactValue::to_plist).collect())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(FactValue),
    Key(String),
    CastDate(Box<Operand>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
    BeginsWith,
    EndsWith,
    Like,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Compare(Operand, CompareOp, Operand),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// A bare boolean operand, e.g. `x86_64_capable`.
    Truth(Operand),
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

/// Case-insensitive word token with a boundary check, so `notify` is never
/// read as the literal `NO` followed by `tify`.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    move |input: &'a str| {
        let (rest, matched) = tag_no_case(word)(input)?;
        match rest.chars().next() {
            Some(c) if c.is_ascii_alphanumeric() || c == '_' => Err(nom::Err::Error(
                nom::error::Error::new(input, nom::error::ErrorKind::Tag),
            )),
            _ => Ok((rest, matched)),
        }
    }
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'))(input)
}

fn string_literal(input: &str) -> IResult<&str, String> {
    let double_quoted = delimited(
        char('"'),
        opt(escaped_transform(
            none_of("\\\""),
            '\\',
            alt((
                value('"', char('"')),
                value('\\', char('\\')),
                value('\'', char('\'')),
            )),
        )),
        char('"'),
    );
    let single_quoted = delimited(
        char('\''),
        opt(escaped_transform(
            none_of("\\'"),
            '\\',
            alt((
                value('"', char('"')),
                value('\\', char('\\')),
                value('\'', char('\'')),
            )),
        )),
        char('\''),
    );
    map(alt((double_quoted, single_quoted)), |s| s.unwrap_or_default())(input)
}

fn number_literal(input: &str) -> IResult<&str, FactValue> {
    let (rest, n) = double(input)?;
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 && !input_has_dot(input, rest) {
        Ok((rest, FactValue::Int(n as i64)))
    } else {
        Ok((rest, FactValue::Real(n)))
    }
}

fn input_has_dot(before: &str, after: &str) -> bool {
    before[..before.len() - after.len()].contains('.')
}

fn list_literal(input: &str) -> IResult<&str, FactValue> {
    map(
        delimited(
            ws(char('{')),
            separated_list0(ws(char(',')), literal),
            ws(char('}')),
        ),
        FactValue::List,
    )(input)
}

fn literal(input: &str) -> IResult<&str, FactValue> {
    alt((
        map(string_literal, FactValue::Str),
        map(keyword("TRUE"), |_| FactValue::Bool(true)),
        map(keyword("YES"), |_| FactValue::Bool(true)),
        map(keyword("FALSE"), |_| FactValue::Bool(false)),
        map(keyword("NO"), |_| FactValue::Bool(false)),
        list_literal,
        number_literal,
    ))(input)
}

fn cast_operand(input: &str) -> IResult<&str, Operand> {
    map(
        tuple((
            tag_no_case("CAST"),
            ws(char('(')),
            operand,
            ws(char(',')),
            string_literal,
            ws(char(')')),
        )),
        |(_, _, inner, _, _kind, _)| Operand::CastDate(Box::new(inner)),
    )(input)
}

fn operand(input: &str) -> IResult<&str, Operand> {
    ws(alt((
        cast_operand,
        map(literal, Operand::Literal),
        map(identifier, |k: &str| Operand::Key(k.to_string())),
    )))(input)
}

fn compare_op(input: &str) -> IResult<&str, CompareOp> {
    ws(alt((
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::Ne, tag("!=")),
        value(CompareOp::Le, tag("<=")),
        value(CompareOp::Ge, tag(">=")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::Gt, tag(">")),
        value(CompareOp::Eq, tag("=")),
        value(CompareOp::BeginsWith, keyword("BEGINSWITH")),
        value(CompareOp::EndsWith, keyword("ENDSWITH")),
        value(CompareOp::Contains, keyword("CONTAINS")),
        value(CompareOp::Like, keyword("LIKE")),
        value(CompareOp::In, keyword("IN")),
    )))(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    // An optional ANY prefix is accepted; list-valued facts already compare
    // element-wise.
    let (input, _) = opt(ws(keyword("ANY")))(input)?;
    let (input, left) = operand(input)?;
    let (input, rest) = opt(pair(compare_op, operand))(input)?;
    match rest {
        Some((op, right)) => Ok((input, Expr::Compare(left, op, right))),
        None => Ok((input, Expr::Truth(left))),
    }
}

fn primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        map(preceded(keyword("NOT"), primary), |e| Expr::Not(Box::new(e))),
        delimited(ws(char('(')), or_expr, ws(char(')'))),
        comparison,
    )))(input)
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = primary(input)?;
    let (input, rest) = many0(preceded(ws(keyword("AND")), primary))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, next| Expr::And(Box::new(acc), Box::new(next))),
    ))
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(ws(keyword("OR")), and_expr))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, next| Expr::Or(Box::new(acc), Box::new(next))),
    ))
}

fn parse(input: &str) -> Result<Expr, ConditionError> {
    let (rest, expr) =
        or_expr(input).map_err(|e| ConditionError::Parse(e.to_string()))?;
    if !rest.trim().is_empty() {
        return Err(ConditionError::TrailingInput(rest.trim().to_string()));
    }
    Ok(expr)
}

fn resolve(operand: &Operand, facts: &Facts) -> Option<FactValue> {
    match operand {
        Operand::Literal(v) => Some(v.clone()),
        Operand::Key(k) => facts.get(k).cloned(),
        Operand::CastDate(inner) => {
            let v = resolve(inner, facts)?;
            match v {
                FactValue::Str(s) => DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|d| FactValue::Date(d.with_timezone(&Utc))),
                FactValue::Date(d) => Some(FactValue::Date(d)),
                _ => None,
            }
        }
    }
}

fn values_equal(a: &FactValue, b: &FactValue) -> bool {
    use FactValue::*;
    match (a, b) {
        (Int(x), Real(y)) | (Real(y), Int(x)) => (*x as f64) == *y,
        (Str(x), Str(y)) => x == y,
        (Int(x), Int(y)) => x == y,
        (Real(x), Real(y)) => x == y,
        (Bool(x), Bool(y)) => x == y,
        (Date(x), Date(y)) => x == y,
        (List(x), List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        _ => false,
    }
}

fn values_ordering(a: &FactValue, b: &FactValue) -> Option<std::cmp::Ordering> {
    use FactValue::*;
    match (a, b) {
        (Int(x), Int(y)) => Some(x.cmp(y)),
        (Real(x), Real(y)) => x.partial_cmp(y),
        (Int(x), Real(y)) => (*x as f64).partial_cmp(y),
        (Real(x), Int(y)) => x.partial_cmp(&(*y as f64)),
        (Str(x), Str(y)) => Some(x.cmp(y)),
        (Date(x), Date(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[char], t: &[char]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..]))
            }
            (Some('?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    inner(&p, &t)
}

fn compare_scalar(left: &FactValue, op: CompareOp, right: &FactValue) -> bool {
    use CompareOp::*;
    match op {
        Eq => values_equal(left, right),
        Ne => !values_equal(left, right),
        Lt | Le | Gt | Ge => match values_ordering(left, right) {
            Some(ord) => match op {
                Lt => ord == std::cmp::Ordering::Less,
                Le => ord != std::cmp::Ordering::Greater,
                Gt => ord == std::cmp::Ordering::Greater,
                Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            },
            None => false,
        },
        In => match (left, right) {
            (v, FactValue::List(items)) => items.iter().any(|i| values_equal(v, i)),
            (FactValue::Str(needle), FactValue::Str(haystack)) => haystack.contains(needle),
            _ => false,
        },
        Contains => match (left, right) {
            (FactValue::List(items), v) => items.iter().any(|i| values_equal(v, i)),
            (FactValue::Str(haystack), FactValue::Str(needle)) => haystack.contains(needle),
            _ => false,
        },
        BeginsWith => match (left, right) {
            (FactValue::Str(s), FactValue::Str(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        EndsWith => match (left, right) {
            (FactValue::Str(s), FactValue::Str(suffix)) => s.ends_with(suffix.as_str()),
            _ => false,
        },
        Like => match (left, right) {
            (FactValue::Str(s), FactValue::Str(pattern)) => wildcard_match(pattern, s),
            _ => false,
        },
    }
}

fn compare(left: Option<FactValue>, op: CompareOp, right: Option<FactValue>) -> bool {
    match (left, right) {
        (Some(l), Some(r)) => {
            // List-valued facts satisfy a comparison when any element does,
            // except for operators that treat the list as a collection.
            match (&l, op) {
                (FactValue::List(items), CompareOp::Contains) | (FactValue::List(items), CompareOp::Eq)
                | (FactValue::List(items), CompareOp::Ne) => {
                    if matches!(&r, FactValue::List(_)) || op == CompareOp::Contains {
                        compare_scalar(&l, op, &r)
                    } else {
                        items.iter().any(|item| compare_scalar(item, op, &r))
                    }
                }
                (FactValue::List(items), _) => {
                    items.iter().any(|item| compare_scalar(item, op, &r))
                }
                _ => compare_scalar(&l, op, &r),
            }
        }
        // Missing keys are unequal to everything and fail ordering tests.
        (None, Some(_)) | (Some(_), None) => op == CompareOp::Ne,
        (None, None) => false,
    }
}

fn eval(expr: &Expr, facts: &Facts) -> bool {
    match expr {
        Expr::Compare(left, op, right) => {
            compare(resolve(left, facts), *op, resolve(right, facts))
        }
        Expr::And(a, b) => eval(a, facts) && eval(b, facts),
        Expr::Or(a, b) => eval(a, facts) || eval(b, facts),
        Expr::Not(inner) => !eval(inner, facts),
        Expr::Truth(operand) => match resolve(operand, facts) {
            Some(FactValue::Bool(b)) => b,
            Some(FactValue::Str(s)) => !s.is_empty(),
            Some(FactValue::Int(i)) => i != 0,
            Some(_) => true,
            None => false,
        },
    }
}

/// Evaluates a predicate against the fact map. Evaluation is total: missing
/// keys compare unequal and fail ordering tests. Only a malformed predicate
/// is an error.
pub fn predicate_is_true(predicate: &str, facts: &Facts) -> Result<bool, ConditionError> {
    let expr = parse(predicate)?;
    Ok(eval(&expr, facts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn facts() -> Facts {
        let mut f = Facts::new();
        f.insert("machine_type".into(), FactValue::Str("laptop".into()));
        f.insert("os_vers".into(), FactValue::Str("14.4.1".into()));
        f.insert("os_vers_major".into(), FactValue::Int(14));
        f.insert("arch".into(), FactValue::Str("arm64".into()));
        f.insert("x86_64_capable".into(), FactValue::Bool(true));
        f.insert(
            "ipv4_address".into(),
            FactValue::List(vec![
                FactValue::Str("10.1.2.3".into()),
                FactValue::Str("192.168.0.4".into()),
            ]),
        );
        f.insert(
            "catalogs".into(),
            FactValue::List(vec![
                FactValue::Str("testing".into()),
                FactValue::Str("production".into()),
            ]),
        );
        f.insert(
            "date".into(),
            FactValue::Date(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
        );
        f
    }

    #[test]
    fn test_equality_and_connectives() {
        let f = facts();
        assert!(predicate_is_true(r#"machine_type == "laptop""#, &f).unwrap());
        assert!(!predicate_is_true(r#"machine_type == "desktop""#, &f).unwrap());
        assert!(predicate_is_true(
            r#"machine_type == "laptop" AND os_vers_major >= 14"#,
            &f
        )
        .unwrap());
        assert!(predicate_is_true(
            r#"machine_type == "desktop" OR arch == "arm64""#,
            &f
        )
        .unwrap());
        assert!(predicate_is_true(r#"NOT machine_type == "desktop""#, &f).unwrap());
    }

    #[test]
    fn test_missing_keys_are_total() {
        let f = facts();
        assert!(!predicate_is_true(r#"nonexistent == "anything""#, &f).unwrap());
        assert!(predicate_is_true(r#"nonexistent != "anything""#, &f).unwrap());
        assert!(!predicate_is_true("nonexistent > 4", &f).unwrap());
    }

    #[test]
    fn test_membership_and_string_operators() {
        let f = facts();
        assert!(predicate_is_true(r#""production" IN catalogs"#, &f).unwrap());
        assert!(predicate_is_true(r#"catalogs CONTAINS "testing""#, &f).unwrap());
        assert!(predicate_is_true(r#"os_vers BEGINSWITH "14.""#, &f).unwrap());
        assert!(predicate_is_true(r#"os_vers ENDSWITH ".1""#, &f).unwrap());
        assert!(predicate_is_true(r#"os_vers LIKE "14.*""#, &f).unwrap());
        assert!(predicate_is_true(r#"os_vers LIKE "1?.4.1""#, &f).unwrap());
        assert!(!predicate_is_true(r#"os_vers LIKE "13.*""#, &f).unwrap());
    }

    #[test]
    fn test_list_facts_match_any_element() {
        let f = facts();
        assert!(predicate_is_true(r#"ANY ipv4_address BEGINSWITH "10.""#, &f).unwrap());
        assert!(predicate_is_true(r#"ipv4_address BEGINSWITH "192.""#, &f).unwrap());
        assert!(!predicate_is_true(r#"ipv4_address BEGINSWITH "172.""#, &f).unwrap());
    }

    #[test]
    fn test_date_cast() {
        let f = facts();
        assert!(predicate_is_true(
            r#"date > CAST("2024-01-01T00:00:00Z", "DATE")"#,
            &f
        )
        .unwrap());
        assert!(!predicate_is_true(
            r#"date > CAST("2030-01-01T00:00:00Z", "DATE")"#,
            &f
        )
        .unwrap());
    }

    #[test]
    fn test_bare_boolean_fact() {
        let f = facts();
        assert!(predicate_is_true("x86_64_capable", &f).unwrap());
        assert!(!predicate_is_true("nonexistent_flag", &f).unwrap());
    }

    #[test]
    fn test_parse_errors() {
        let f = facts();
        assert!(predicate_is_true(r#"machine_type == "#, &f).is_err());
        assert!(predicate_is_true(r#"(machine_type == "laptop""#, &f).is_err());
    }

    #[test]
    fn test_keyword_prefixed_identifiers() {
        let mut f = facts();
        f.insert("notify".into(), FactValue::Str("on".into()));
        f.insert("yes_flag".into(), FactValue::Bool(true));
        f.insert("android_build".into(), FactValue::Str("x".into()));

        assert!(predicate_is_true(r#"notify == "on""#, &f).unwrap());
        assert!(predicate_is_true("yes_flag", &f).unwrap());
        // An identifier starting with "and" must not terminate the AND
        // chain.
        assert!(predicate_is_true(r#"android_build == "x""#, &f).unwrap());
    }

    #[test]
    fn test_numeric_comparisons() {
        let f = facts();
        assert!(predicate_is_true("os_vers_major > 13", &f).unwrap());
        assert!(predicate_is_true("os_vers_major <= 14", &f).unwrap());
        assert!(predicate_is_true("os_vers_major == 14.0", &f).unwrap());
    }
}
