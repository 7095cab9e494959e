//! Calculator Utility
//!
//! Evaluates arithmetic expressions with `+ - * / ^`, unary minus and
//! parentheses. `^` binds tightest and is right-associative. Nesting of
//! parentheses, signs and exponents is capped at [`MAX_NESTING`].

use async_trait::async_trait;
use serde_json::json;

use agent_core::{
    ExecuteResult, ExecutionContext, Result as CoreResult, Utility, UtilityDescriptor,
};

use crate::error::{Result, UtilityError};

/// Deepest nesting the parser will descend into
pub const MAX_NESTING: usize = 256;

/// Longest expression accepted from the model
pub const MAX_EXPR_LEN: usize = 4096;

/// Utility for arithmetic
pub struct CalcUtility;

impl CalcUtility {
    pub const ID: &'static str = "calc";
}

#[async_trait]
impl Utility for CalcUtility {
    fn descriptor(&self) -> UtilityDescriptor {
        UtilityDescriptor::new(
            Self::ID,
            "Evaluate an arithmetic expression. Supports + - * / ^ and parentheses.",
            json!({
                "type": "object",
                "properties": {
                    "expr": {
                        "type": "string",
                        "minLength": 1,
                        "maxLength": MAX_EXPR_LEN,
                        "description": "Expression to evaluate (e.g., '2 + 2', '(1.5 + 2) * 4')"
                    }
                },
                "required": ["expr"],
                "additionalProperties": false
            }),
        )
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        _ctx: &ExecutionContext,
    ) -> CoreResult<ExecuteResult> {
        let expr = args
            .get("expr")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let value = evaluate(expr)?;
        tracing::debug!(%expr, value, "Evaluated expression");

        Ok(ExecuteResult::success(format_number(value))
            .with_data(json!({ "expr": expr, "value": value })))
    }
}

/// Render integral values without a trailing `.0`
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

/// Evaluate an expression
pub fn evaluate(expr: &str) -> Result<f64> {
    let mut parser = Parser {
        chars: expr.chars().filter(|c| !c.is_whitespace()).collect(),
        pos: 0,
        depth: 0,
    };
    if parser.chars.is_empty() {
        return Err(UtilityError::InvalidExpression("empty expression".into()));
    }

    let value = parser.sum()?;
    if let Some(c) = parser.peek() {
        return Err(UtilityError::InvalidExpression(format!(
            "unexpected '{c}' at position {}",
            parser.pos + 1
        )));
    }
    if value.is_finite() {
        Ok(value)
    } else {
        Err(UtilityError::NonFinite)
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(UtilityError::InvalidExpression(format!(
                "nesting deeper than {MAX_NESTING} at position {}",
                self.pos + 1
            )));
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    // sum := product (('+' | '-') product)*
    fn sum(&mut self) -> Result<f64> {
        let mut value = self.product()?;
        loop {
            if self.eat('+') {
                value += self.product()?;
            } else if self.eat('-') {
                value -= self.product()?;
            } else {
                return Ok(value);
            }
        }
    }

    // product := power (('*' | '/') power)*
    fn product(&mut self) -> Result<f64> {
        let mut value = self.power()?;
        loop {
            if self.eat('*') {
                value *= self.power()?;
            } else if self.eat('/') {
                let divisor = self.power()?;
                if divisor == 0.0 {
                    return Err(UtilityError::DivisionByZero);
                }
                value /= divisor;
            } else {
                return Ok(value);
            }
        }
    }

    // power := unary ('^' power)?
    fn power(&mut self) -> Result<f64> {
        let base = self.unary()?;
        if self.eat('^') {
            let exponent = self.nested(Self::power)?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    // unary := '-' unary | '+' unary | atom
    fn unary(&mut self) -> Result<f64> {
        if self.eat('-') {
            return Ok(-self.nested(Self::unary)?);
        }
        if self.eat('+') {
            return self.nested(Self::unary);
        }
        self.atom()
    }

    // atom := number | '(' sum ')'
    fn atom(&mut self) -> Result<f64> {
        if self.eat('(') {
            let value = self.nested(Self::sum)?;
            if !self.eat(')') {
                return Err(UtilityError::InvalidExpression("missing ')'".into()));
            }
            return Ok(value);
        }

        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(match self.peek() {
                Some(c) => UtilityError::InvalidExpression(format!(
                    "unexpected '{c}' at position {}",
                    self.pos + 1
                )),
                None => UtilityError::InvalidExpression("unexpected end of expression".into()),
            });
        }

        let literal: String = self.chars[start..self.pos].iter().collect();
        literal
            .parse()
            .map_err(|_| UtilityError::InvalidExpression(format!("bad number '{literal}'")))
    }
}
