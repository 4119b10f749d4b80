//! Fee-line formula language.
//!
//! A formula combines decimal literals and references to other lines of the
//! same order with `+ - * /`, unary minus and parentheses. A reference is a
//! line number wrapped in parentheses, e.g. `(1) + (2) - (4.1)`: any
//! parenthesised token made only of letters, digits, `.` and `_` names a line.
//! Anything else is rejected at parse time; nothing is ever executed.

use crate::models::{FeeLine, MilestoneAmounts, MilestoneKey};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormulaError {
    #[error("formula is empty")]
    Empty,
    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unexpected {found} at position {pos}")]
    UnexpectedToken { found: String, pos: usize },
    #[error("unexpected end of formula")]
    UnexpectedEnd,
    #[error("reference to unknown line ({0})")]
    UnknownLine(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("arithmetic overflow")]
    Overflow,
}

/// How evaluation failures are handled when a formula line is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormulaMode {
    /// Unknown references read as zero; a failing formula yields zero for
    /// the affected milestone and the failure is reported, not raised.
    #[default]
    Legacy,
    /// Any failure aborts the calculation.
    Strict,
}

impl FormulaMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Strict => "strict",
        }
    }
}

impl FromStr for FormulaMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown formula mode '{other}'")),
        }
    }
}

// ============================================================================
// Lexing
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Decimal),
    Ref(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {n}"),
            Token::Ref(r) => write!(f, "reference ({r})"),
            Token::Plus => f.write_str("'+'"),
            Token::Minus => f.write_str("'-'"),
            Token::Star => f.write_str("'*'"),
            Token::Slash => f.write_str("'/'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

fn is_ref_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_'
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, FormulaError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push((Token::Plus, i));
                i += 1;
            }
            '-' => {
                tokens.push((Token::Minus, i));
                i += 1;
            }
            '*' => {
                tokens.push((Token::Star, i));
                i += 1;
            }
            '/' => {
                tokens.push((Token::Slash, i));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, i));
                i += 1;
            }
            '(' => {
                if let Some((name, end)) = scan_reference(&chars, i) {
                    tokens.push((Token::Ref(name), i));
                    i = end;
                } else {
                    tokens.push((Token::LParen, i));
                    i += 1;
                }
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = Decimal::from_str(&literal)
                    .map_err(|_| FormulaError::InvalidNumber(literal.clone()))?;
                tokens.push((Token::Number(value), start));
            }
            ch => return Err(FormulaError::UnexpectedChar { ch, pos: i }),
        }
    }

    Ok(tokens)
}

/// `( name )` starting at `open`; returns the name and the index after `)`.
fn scan_reference(chars: &[char], open: usize) -> Option<(String, usize)> {
    let mut i = open + 1;
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    let start = i;
    while i < chars.len() && is_ref_char(chars[i]) {
        i += 1;
    }
    let name: String = chars[start..i].iter().collect();
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    if name.is_empty() || chars.get(i) != Some(&')') {
        return None;
    }
    Some((name, i + 1))
}

// ============================================================================
// Parsing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(Decimal),
    Ref(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expression(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn factor(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            Some((Token::Number(n), _)) => Ok(Expr::Number(n)),
            Some((Token::Ref(r), _)) => Ok(Expr::Ref(r)),
            Some((Token::Minus, _)) => Ok(Expr::Neg(Box::new(self.factor()?))),
            Some((Token::Plus, _)) => self.factor(),
            Some((Token::LParen, _)) => {
                let inner = self.expression()?;
                match self.next() {
                    Some((Token::RParen, _)) => Ok(inner),
                    Some((found, pos)) => Err(FormulaError::UnexpectedToken {
                        found: found.to_string(),
                        pos,
                    }),
                    None => Err(FormulaError::UnexpectedEnd),
                }
            }
            Some((found, pos)) => Err(FormulaError::UnexpectedToken {
                found: found.to_string(),
                pos,
            }),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }
}

/// A parsed fee-line formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(FormulaError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression()?;
        if let Some((found, pos)) = parser.next() {
            return Err(FormulaError::UnexpectedToken {
                found: found.to_string(),
                pos,
            });
        }
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Line numbers referenced by the formula, in order of appearance.
    pub fn references(&self) -> Vec<&str> {
        fn walk<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
            match expr {
                Expr::Number(_) => {}
                Expr::Ref(r) => out.push(r),
                Expr::Neg(inner) => walk(inner, out),
                Expr::Binary(_, lhs, rhs) => {
                    walk(lhs, out);
                    walk(rhs, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.expr, &mut out);
        out
    }

    /// Evaluates with `resolve` supplying each referenced line's value;
    /// `None` means the line does not exist.
    pub fn evaluate<F>(&self, resolve: F) -> Result<Decimal, FormulaError>
    where
        F: Fn(&str) -> Option<Decimal>,
    {
        fn eval<F: Fn(&str) -> Option<Decimal>>(expr: &Expr, resolve: &F) -> Result<Decimal, FormulaError> {
            match expr {
                Expr::Number(n) => Ok(*n),
                Expr::Ref(r) => resolve(r).ok_or_else(|| FormulaError::UnknownLine(r.clone())),
                Expr::Neg(inner) => Ok(-eval(inner, resolve)?),
                Expr::Binary(op, lhs, rhs) => {
                    let a = eval(lhs, resolve)?;
                    let b = eval(rhs, resolve)?;
                    let result = match op {
                        BinOp::Add => a.checked_add(b),
                        BinOp::Sub => a.checked_sub(b),
                        BinOp::Mul => a.checked_mul(b),
                        BinOp::Div if b.is_zero() => return Err(FormulaError::DivisionByZero),
                        BinOp::Div => a.checked_div(b),
                    };
                    result.ok_or(FormulaError::Overflow)
                }
            }
        }
        eval(&self.expr, &resolve).map(|v| v.normalize())
    }
}

// ============================================================================
// Fee-line evaluation
// ============================================================================

/// A formula that could not be evaluated for a line (and milestone, when the
/// failure was specific to one).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line_number}{}: {error}", .key.map(|k| format!(" [{k}]")).unwrap_or_default())]
pub struct FormulaFailure {
    pub line_number: String,
    pub key: Option<MilestoneKey>,
    pub error: FormulaError,
}

/// Computes every formula line in debit-note order for each milestone key.
///
/// Each computed line replaces its amounts and is marked calculated; later
/// lines see the new values, earlier lines see whatever amounts a referenced
/// line held before it was computed. Lines without a formula are untouched.
///
/// In [`FormulaMode::Legacy`] failures are collected and returned; in
/// [`FormulaMode::Strict`] the first failure is returned as the error.
pub fn evaluate_fee_lines(
    lines: &mut [FeeLine],
    keys: &[MilestoneKey],
    mode: FormulaMode,
) -> Result<Vec<FormulaFailure>, FormulaFailure> {
    let mut current: HashMap<String, MilestoneAmounts> = lines
        .iter()
        .map(|l| (l.line_number.clone(), l.amounts.clone()))
        .collect();
    let mut failures = Vec::new();

    for line in lines.iter_mut() {
        let Some(source) = line.formula.as_deref().filter(|f| !f.trim().is_empty()) else {
            continue;
        };

        let formula = match Formula::parse(source) {
            Ok(f) => Some(f),
            Err(error) => {
                let failure = FormulaFailure {
                    line_number: line.line_number.clone(),
                    key: None,
                    error,
                };
                if mode == FormulaMode::Strict {
                    return Err(failure);
                }
                failures.push(failure);
                None
            }
        };

        let mut computed = MilestoneAmounts::new();
        for key in keys {
            let value = match &formula {
                None => Decimal::ZERO,
                Some(formula) => {
                    let result = formula.evaluate(|reference| match current.get(reference) {
                        Some(amounts) => Some(amounts.amount_or_zero(key)),
                        None if mode == FormulaMode::Legacy => Some(Decimal::ZERO),
                        None => None,
                    });
                    match result {
                        Ok(v) => v,
                        Err(error) => {
                            let failure = FormulaFailure {
                                line_number: line.line_number.clone(),
                                key: Some(*key),
                                error,
                            };
                            if mode == FormulaMode::Strict {
                                return Err(failure);
                            }
                            failures.push(failure);
                            Decimal::ZERO
                        }
                    }
                }
            };
            computed.insert(*key, value);
        }

        current.insert(line.line_number.clone(), computed.clone());
        line.amounts = computed;
        line.is_calculated = true;
    }

    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LineType;
    use rust_decimal_macros::dec;

    fn values(pairs: &[(&str, Decimal)]) -> impl Fn(&str) -> Option<Decimal> {
        let map: HashMap<String, Decimal> = pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        move |r: &str| map.get(r).copied()
    }

    fn amounts(pairs: &[(MilestoneKey, Decimal)]) -> MilestoneAmounts {
        pairs.iter().copied().collect()
    }

    #[test]
    fn parses_references_and_precedence() {
        let f = Formula::parse("(1) + (2) * 2 - (4.1)").unwrap();
        assert_eq!(f.references(), vec!["1", "2", "4.1"]);
        let v = f
            .evaluate(values(&[("1", dec!(100)), ("2", dec!(10)), ("4.1", dec!(5))]))
            .unwrap();
        assert_eq!(v, dec!(115));
    }

    #[test]
    fn grouping_parentheses_are_not_references() {
        let f = Formula::parse("((1) + (2)) * 0.5").unwrap();
        let v = f.evaluate(values(&[("1", dec!(300)), ("2", dec!(100))])).unwrap();
        assert_eq!(v, dec!(200));
    }

    #[test]
    fn unary_minus_and_decimals() {
        let f = Formula::parse("-(A) + 2.5").unwrap();
        assert_eq!(f.evaluate(values(&[("A", dec!(1))])).unwrap(), dec!(1.5));
    }

    #[test]
    fn rejects_anything_outside_the_grammar() {
        assert_eq!(Formula::parse("  "), Err(FormulaError::Empty));
        assert!(matches!(
            Formula::parse("__import__('os')"),
            Err(FormulaError::UnexpectedChar { .. })
        ));
        assert!(matches!(Formula::parse("(1) +"), Err(FormulaError::UnexpectedEnd)));
        assert!(matches!(Formula::parse("(1) (2)"), Err(FormulaError::UnexpectedToken { .. })));
        assert!(matches!(Formula::parse("1.2.3"), Err(FormulaError::InvalidNumber(_))));
        assert!(matches!(Formula::parse("((1) + 2"), Err(FormulaError::UnexpectedEnd)));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let f = Formula::parse("(1) / (2)").unwrap();
        assert_eq!(
            f.evaluate(values(&[("1", dec!(5)), ("2", Decimal::ZERO)])),
            Err(FormulaError::DivisionByZero)
        );
    }

    #[test]
    fn unknown_reference_is_reported_by_evaluate() {
        let f = Formula::parse("(9)").unwrap();
        assert_eq!(f.evaluate(values(&[])), Err(FormulaError::UnknownLine("9".into())));
    }

    #[test]
    fn total_line_sums_items_per_milestone() {
        let y1 = MilestoneKey::yearly(1);
        let s1 = MilestoneKey::semester(1);
        let mut lines = vec![
            FeeLine::new("1", LineType::Item).with_amounts(amounts(&[(y1, dec!(1000)), (s1, dec!(550))])),
            FeeLine::new("2", LineType::Item).with_amounts(amounts(&[(y1, dec!(200))])),
            FeeLine::new("3", LineType::Total).with_formula("(1)+(2)"),
        ];

        let failures = evaluate_fee_lines(&mut lines, &[y1, s1], FormulaMode::Legacy).unwrap();
        assert!(failures.is_empty());
        assert_eq!(lines[2].amounts.get(&y1), Some(dec!(1200)));
        assert_eq!(lines[2].amounts.get(&s1), Some(dec!(550)));
        assert!(lines[2].is_calculated);
        assert!(!lines[0].is_calculated);
    }

    #[test]
    fn backward_reference_sees_stale_amounts() {
        let y1 = MilestoneKey::yearly(1);
        let mut lines = vec![
            FeeLine::new("A", LineType::Subtotal).with_formula("(B)"),
            FeeLine::new("B", LineType::Subtotal)
                .with_formula("(C)")
                .with_amounts(amounts(&[(y1, dec!(7))])),
            FeeLine::new("C", LineType::Item).with_amounts(amounts(&[(y1, dec!(50))])),
        ];

        evaluate_fee_lines(&mut lines, &[y1], FormulaMode::Legacy).unwrap();
        // A ran before B was recomputed and kept B's stored value.
        assert_eq!(lines[0].amounts.get(&y1), Some(dec!(7)));
        assert_eq!(lines[1].amounts.get(&y1), Some(dec!(50)));
    }

    #[test]
    fn forward_reference_sees_computed_amounts() {
        let y1 = MilestoneKey::yearly(1);
        let mut lines = vec![
            FeeLine::new("1", LineType::Item).with_amounts(amounts(&[(y1, dec!(10))])),
            FeeLine::new("2", LineType::Subtotal).with_formula("(1) * 3"),
            FeeLine::new("3", LineType::Total).with_formula("(2) + (1)"),
        ];
        evaluate_fee_lines(&mut lines, &[y1], FormulaMode::Legacy).unwrap();
        assert_eq!(lines[2].amounts.get(&y1), Some(dec!(40)));
    }

    #[test]
    fn legacy_mode_zeroes_failures_and_reports_them() {
        let y1 = MilestoneKey::yearly(1);
        let mut lines = vec![
            FeeLine::new("1", LineType::Item).with_amounts(amounts(&[(y1, dec!(10))])),
            FeeLine::new("2", LineType::Subtotal).with_formula("(1) / 0"),
            FeeLine::new("3", LineType::Subtotal).with_formula("(1) + (missing)"),
            FeeLine::new("4", LineType::Total).with_formula("(1) +* 2"),
        ];

        let failures = evaluate_fee_lines(&mut lines, &[y1], FormulaMode::Legacy).unwrap();
        assert_eq!(lines[1].amounts.get(&y1), Some(Decimal::ZERO));
        assert_eq!(lines[2].amounts.get(&y1), Some(dec!(10)));
        assert_eq!(lines[3].amounts.get(&y1), Some(Decimal::ZERO));

        let failed: Vec<&str> = failures.iter().map(|f| f.line_number.as_str()).collect();
        assert_eq!(failed, vec!["2", "4"]);
        assert_eq!(failures[0].error, FormulaError::DivisionByZero);
        assert_eq!(failures[1].key, None);
    }

    #[test]
    fn strict_mode_stops_at_first_failure() {
        let y1 = MilestoneKey::yearly(1);
        let mut lines = vec![
            FeeLine::new("1", LineType::Item).with_amounts(amounts(&[(y1, dec!(10))])),
            FeeLine::new("2", LineType::Total).with_formula("(1) + (nope)"),
        ];
        let failure = evaluate_fee_lines(&mut lines, &[y1], FormulaMode::Strict).unwrap_err();
        assert_eq!(failure.line_number, "2");
        assert_eq!(failure.key, Some(y1));
        assert_eq!(failure.error, FormulaError::UnknownLine("nope".into()));
        assert_eq!(failure.to_string(), "line 2 [yearly_1]: reference to unknown line (nope)");
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("STRICT".parse::<FormulaMode>(), Ok(FormulaMode::Strict));
        assert_eq!(FormulaMode::default(), FormulaMode::Legacy);
        assert!("lenient".parse::<FormulaMode>().is_err());
    }
}
