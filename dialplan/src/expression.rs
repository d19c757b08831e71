//! Default evaluator for `$[...]` expressions.
//!
//! Operators, loosest first: `c ? a :: b`, `|`, `&`, comparisons
//! (`= == != < > <= >=`), `+ -`, `* / %`, regex match (`:` anchored, `=~`
//! anywhere), unary `-` and `!`. Operands are bare words, numbers or double
//! quoted strings. Empty text and `0` are false. A regex holding operator
//! characters has to be quoted: `$[${NUM} : "555(.*)"]`.

use regex::Regex;
use tracing::warn;

use crate::error::DialplanError;

pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expr: &str) -> Result<String, DialplanError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ArithmeticEvaluator;

impl ExpressionEvaluator for ArithmeticEvaluator {
    fn evaluate(&self, expr: &str) -> Result<String, DialplanError> {
        let tokens = tokenize(expr)?;
        if tokens.is_empty() {
            return Ok(String::new());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let value = parser.ternary()?;
        if parser.pos != parser.tokens.len() {
            return Err(DialplanError::Expression(format!(
                "syntax error near {:?} in {expr}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Op(&'static str),
}

const OPERATORS: &[&str] = &[
    "::", "==", "!=", "<=", ">=", "=~", "(", ")", "|", "&", "=", "<", ">", "+", "-", "*",
    "/", "%", ":", "?", "!",
];

fn tokenize(expr: &str) -> Result<Vec<Token>, DialplanError> {
    let mut tokens = Vec::new();
    let mut rest = expr;
    while let Some(c) = rest.chars().next() {
        if c.is_whitespace() {
            rest = &rest[c.len_utf8()..];
            continue;
        }
        if c == '"' {
            let end = rest[1..].find('"').ok_or_else(|| {
                DialplanError::Expression(format!("unterminated string in {expr}"))
            })?;
            tokens.push(Token::Word(rest[1..end + 1].to_string()));
            rest = &rest[end + 2..];
            continue;
        }
        if let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            tokens.push(Token::Op(*op));
            rest = &rest[op.len()..];
            continue;
        }
        let end = rest
            .char_indices()
            .find(|(_, ch)| {
                ch.is_whitespace()
                    || *ch == '"'
                    || OPERATORS.iter().any(|op| op.starts_with(*ch))
            })
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        tokens.push(Token::Word(rest[..end].to_string()));
        rest = &rest[end..];
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn parse(s: &str) -> Option<Number> {
        let s = s.trim();
        if let Ok(i) = s.parse::<i64>() {
            return Some(Number::Int(i));
        }
        s.parse::<f64>().ok().filter(|f| f.is_finite()).map(Number::Float)
    }

    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    fn render(self) -> String {
        match self {
            Number::Int(i) => i.to_string(),
            Number::Float(f) => f.to_string(),
        }
    }
}

fn is_false(value: &str) -> bool {
    value.is_empty() || Number::parse(value).map(|n| n.as_f64() == 0.0).unwrap_or(false)
}

fn bool_str(b: bool) -> String {
    let s = if b { "1" } else { "0" };
    s.to_string()
}

fn number(value: &str, op: &str) -> Number {
    Number::parse(value).unwrap_or_else(|| {
        warn!("non-numeric argument {value:?} to {op}");
        Number::Int(0)
    })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn eat(&mut self, ops: &[&str]) -> Option<&'static str> {
        let op = self.peek_op()?;
        if ops.contains(&op) {
            self.pos += 1;
            Some(op)
        } else {
            None
        }
    }

    fn ternary(&mut self) -> Result<String, DialplanError> {
        let condition = self.or()?;
        if self.eat(&["?"]).is_none() {
            return Ok(condition);
        }
        let when_true = self.ternary()?;
        if self.eat(&["::"]).is_none() {
            return Err(DialplanError::Expression("expected :: in ternary".to_string()));
        }
        let when_false = self.ternary()?;
        Ok(if is_false(&condition) {
            when_false
        } else {
            when_true
        })
    }

    fn or(&mut self) -> Result<String, DialplanError> {
        let mut left = self.and()?;
        while self.eat(&["|"]).is_some() {
            let right = self.and()?;
            if is_false(&left) {
                left = right;
            }
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<String, DialplanError> {
        let mut left = self.comparison()?;
        while self.eat(&["&"]).is_some() {
            let right = self.comparison()?;
            if is_false(&left) || is_false(&right) {
                left = "0".to_string();
            }
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<String, DialplanError> {
        let mut left = self.additive()?;
        while let Some(op) = self.eat(&["=", "==", "!=", "<", ">", "<=", ">="]) {
            let right = self.additive()?;
            let ordering = match (Number::parse(&left), Number::parse(&right)) {
                (Some(a), Some(b)) => a
                    .as_f64()
                    .partial_cmp(&b.as_f64())
                    .unwrap_or(std::cmp::Ordering::Equal),
                _ => left.cmp(&right),
            };
            let result = match op {
                "=" | "==" => ordering.is_eq(),
                "!=" => ordering.is_ne(),
                "<" => ordering.is_lt(),
                ">" => ordering.is_gt(),
                "<=" => ordering.is_le(),
                _ => ordering.is_ge(),
            };
            left = bool_str(result);
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<String, DialplanError> {
        let mut left = self.multiplicative()?;
        while let Some(op) = self.eat(&["+", "-"]) {
            let right = self.multiplicative()?;
            let (a, b) = (number(&left, op), number(&right, op));
            let result = match (a, b, op) {
                (Number::Int(a), Number::Int(b), "+") => a.checked_add(b).map(Number::Int),
                (Number::Int(a), Number::Int(b), _) => a.checked_sub(b).map(Number::Int),
                (a, b, "+") => Some(Number::Float(a.as_f64() + b.as_f64())),
                (a, b, _) => Some(Number::Float(a.as_f64() - b.as_f64())),
            }
            .ok_or_else(|| DialplanError::Expression("overflow".to_string()))?;
            left = result.render();
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<String, DialplanError> {
        let mut left = self.matching()?;
        while let Some(op) = self.eat(&["*", "/", "%"]) {
            let right = self.matching()?;
            let (a, b) = (number(&left, op), number(&right, op));
            if op != "*" && b.as_f64() == 0.0 {
                return Err(DialplanError::Expression("division by zero".to_string()));
            }
            let result = match (a, b, op) {
                (Number::Int(a), Number::Int(b), "*") => a.checked_mul(b).map(Number::Int),
                (Number::Int(a), Number::Int(b), "/") => a.checked_div(b).map(Number::Int),
                (Number::Int(a), Number::Int(b), _) => a.checked_rem(b).map(Number::Int),
                (a, b, "*") => Some(Number::Float(a.as_f64() * b.as_f64())),
                (a, b, "/") => Some(Number::Float(a.as_f64() / b.as_f64())),
                (a, b, _) => Some(Number::Float(a.as_f64() % b.as_f64())),
            }
            .ok_or_else(|| DialplanError::Expression("overflow".to_string()))?;
            left = result.render();
        }
        Ok(left)
    }

    fn matching(&mut self) -> Result<String, DialplanError> {
        let mut left = self.unary()?;
        while let Some(op) = self.eat(&[":", "=~"]) {
            let pattern = self.unary()?;
            let pattern = if op == ":" {
                format!("^(?:{pattern})")
            } else {
                pattern
            };
            let re = Regex::new(&pattern)
                .map_err(|err| DialplanError::Expression(format!("bad regex: {err}")))?;
            left = match re.captures(&left) {
                Some(caps) if caps.len() > 1 => caps
                    .get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
                Some(caps) => caps
                    .get(0)
                    .map(|m| m.as_str().chars().count())
                    .unwrap_or(0)
                    .to_string(),
                None if re.captures_len() > 1 => String::new(),
                None => "0".to_string(),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<String, DialplanError> {
        if self.eat(&["-"]).is_some() {
            let value = self.unary()?;
            let negated = match number(&value, "-") {
                Number::Int(i) => i.checked_neg().map(Number::Int),
                Number::Float(f) => Some(Number::Float(-f)),
            }
            .ok_or_else(|| DialplanError::Expression("overflow".to_string()))?;
            return Ok(negated.render());
        }
        if self.eat(&["!"]).is_some() {
            let value = self.unary()?;
            return Ok(bool_str(is_false(&value)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<String, DialplanError> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Word(word)) => {
                self.pos += 1;
                Ok(word)
            }
            Some(Token::Op("(")) => {
                self.pos += 1;
                let value = self.ternary()?;
                if self.eat(&[")"]).is_none() {
                    return Err(DialplanError::Expression("missing )".to_string()));
                }
                Ok(value)
            }
            Some(Token::Op(op)) => Err(DialplanError::Expression(format!(
                "unexpected operator {op}"
            ))),
            None => Err(DialplanError::Expression(
                "unexpected end of expression".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str) -> String {
        ArithmeticEvaluator.evaluate(expr).unwrap()
    }

    #[test]
    fn arithmetic() {
        assert_eq!("3", eval("1 + 2"));
        assert_eq!("7", eval("1+2*3"));
        assert_eq!("9", eval("(1 + 2) * 3"));
        assert_eq!("2", eval("7 / 3"));
        assert_eq!("1", eval("7 % 3"));
        assert_eq!("2.5", eval("5 / 2.0"));
        assert_eq!("-4", eval("-4"));
        assert_eq!("1", eval("3 - 2"));
        assert!(ArithmeticEvaluator.evaluate("1 / 0").is_err());
    }

    #[test]
    fn integer_overflow_is_an_error() {
        assert_eq!("-9223372036854775808", eval("-9223372036854775807 - 1"));
        assert!(ArithmeticEvaluator.evaluate("-(-9223372036854775807 - 1)").is_err());
        assert!(ArithmeticEvaluator.evaluate("9223372036854775807 + 1").is_err());
        assert!(ArithmeticEvaluator.evaluate("9223372036854775807 * 2").is_err());
        assert!(ArithmeticEvaluator.evaluate("(-9223372036854775807 - 1) / -1").is_err());
        assert_eq!("9223372036854775807", eval("--9223372036854775807"));
    }

    #[test]
    fn comparisons_and_logic() {
        assert_eq!("1", eval("10 > 9"));
        assert_eq!("0", eval("abc = abd"));
        assert_eq!("1", eval("\"\" = \"\""));
        assert_eq!("1", eval("2 == 2.0"));
        assert_eq!("foo", eval("0 | foo"));
        assert_eq!("5", eval("5 | 6"));
        assert_eq!("0", eval("5 & 0"));
        assert_eq!("1", eval("!0"));
        assert_eq!("yes", eval("1 = 1 ? yes :: no"));
        assert_eq!("no", eval("1 = 2 ? yes :: no"));
    }

    #[test]
    fn regex_matching() {
        assert_eq!("3", eval("5551234 : 555"));
        assert_eq!("0", eval("4155551234 : 555"));
        assert_eq!("1234", eval("5551234 : \"555(.*)\""));
        assert_eq!("3", eval("4155551234 =~ 555"));
    }

    #[test]
    fn syntax_errors() {
        assert!(ArithmeticEvaluator.evaluate("1 +").is_err());
        assert!(ArithmeticEvaluator.evaluate("(1").is_err());
        assert!(ArithmeticEvaluator.evaluate("1 2").is_err());
        assert_eq!("", eval("   "));
    }
}
