//! Restricted expression language for PySR-exported equations.
//!
//! Operators can ship calibration fixes as plain-text formulas instead of
//! re-exporting an ONNX graph, so evaluation has to be sandboxed: a fixed
//! function set, clamped inputs, and hard failure on anything unknown.
//! Grammar: `+ - * /`, parentheses, numeric literals, variables, and the
//! guarded calls `sqrt square exp log sin cos tan`.

use std::collections::HashMap;

/// Error type for equation parsing and evaluation.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EquationError {
    #[error("Unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unexpected token at position {0}")]
    UnexpectedToken(usize),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Evaluation produced a non-finite value")]
    NonFinite,
}

/// Guarded function set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Sqrt,
    Square,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
}

impl Func {
    fn from_name(name: &str) -> Option<Func> {
        match name {
            "sqrt" => Some(Func::Sqrt),
            "square" => Some(Func::Square),
            "exp" => Some(Func::Exp),
            "log" => Some(Func::Log),
            "sin" => Some(Func::Sin),
            "cos" => Some(Func::Cos),
            "tan" => Some(Func::Tan),
            _ => None,
        }
    }

    /// Apply with input clamping so no argument can produce NaN or overflow.
    fn apply(self, x: f64) -> f64 {
        match self {
            Func::Sqrt => x.max(0.0).sqrt(),
            Func::Square => x * x,
            Func::Exp => x.clamp(-50.0, 50.0).exp(),
            Func::Log => x.max(1e-9).ln(),
            Func::Sin => x.sin(),
            Func::Cos => x.cos(),
            Func::Tan => x.clamp(-1e6, 1e6).tan(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Unary(Box<Expr>),
    Binary(Op, Box<Expr>, Box<Expr>),
    Call(Func, Box<Expr>),
}

impl Expr {
    /// Parse an equation string.
    pub fn parse(input: &str) -> Result<Expr, EquationError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(EquationError::UnexpectedToken(parser.pos));
        }
        Ok(expr)
    }

    /// Evaluate against a variable map. Any unknown variable, division by
    /// zero, or non-finite result is an error the caller falls back from.
    pub fn eval(&self, vars: &HashMap<&str, f64>) -> Result<f64, EquationError> {
        let value = self.eval_inner(vars)?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(EquationError::NonFinite)
        }
    }

    fn eval_inner(&self, vars: &HashMap<&str, f64>) -> Result<f64, EquationError> {
        match self {
            Expr::Num(n) => Ok(*n),
            Expr::Var(name) => vars
                .get(name.as_str())
                .copied()
                .ok_or_else(|| EquationError::UnknownVariable(name.clone())),
            Expr::Unary(inner) => Ok(-inner.eval_inner(vars)?),
            Expr::Binary(op, lhs, rhs) => {
                let l = lhs.eval_inner(vars)?;
                let r = rhs.eval_inner(vars)?;
                match op {
                    Op::Add => Ok(l + r),
                    Op::Sub => Ok(l - r),
                    Op::Mul => Ok(l * r),
                    Op::Div => {
                        if r.abs() < 1e-12 {
                            Err(EquationError::DivisionByZero)
                        } else {
                            Ok(l / r)
                        }
                    }
                }
            }
            Expr::Call(func, arg) => Ok(func.apply(arg.eval_inner(vars)?)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, EquationError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == 'e'
                        || (chars[i] == '-' && i > start && chars[i - 1] == 'e'))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| EquationError::UnexpectedChar(c, start))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(EquationError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expression(&mut self) -> Result<Expr, EquationError> {
        let mut lhs = self.term()?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some(Op::Add),
            Some(Token::Minus) => Some(Op::Sub),
            _ => None,
        } {
            self.advance();
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, EquationError> {
        let mut lhs = self.factor()?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some(Op::Mul),
            Some(Token::Slash) => Some(Op::Div),
            _ => None,
        } {
            self.advance();
            let rhs = self.factor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr, EquationError> {
        match self.advance() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Minus) => Ok(Expr::Unary(Box::new(self.factor()?))),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(EquationError::UnexpectedEnd),
                }
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    let func = Func::from_name(&name)
                        .ok_or(EquationError::UnknownFunction(name))?;
                    self.advance();
                    let arg = self.expression()?;
                    match self.advance() {
                        Some(Token::RParen) => Ok(Expr::Call(func, Box::new(arg))),
                        _ => Err(EquationError::UnexpectedEnd),
                    }
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(_) => Err(EquationError::UnexpectedToken(self.pos - 1)),
            None => Err(EquationError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, f64)]) -> HashMap<&'static str, f64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_arithmetic_precedence() {
        let expr = Expr::parse("1 + 2 * 3").unwrap();
        assert_eq!(expr.eval(&HashMap::new()).unwrap(), 7.0);

        let expr = Expr::parse("(1 + 2) * 3").unwrap();
        assert_eq!(expr.eval(&HashMap::new()).unwrap(), 9.0);
    }

    #[test]
    fn test_variables_and_functions() {
        let expr = Expr::parse("sqrt(square(x)) + log(y)").unwrap();
        let v = vars(&[("x", -3.0), ("y", 1.0)]);
        assert!((expr.eval(&v).unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_unary_minus() {
        let expr = Expr::parse("-x * 2").unwrap();
        assert_eq!(expr.eval(&vars(&[("x", 3.0)])).unwrap(), -6.0);
    }

    #[test]
    fn test_guarded_inputs() {
        // sqrt of a negative is clamped, log of zero is floored.
        let expr = Expr::parse("sqrt(x)").unwrap();
        assert_eq!(expr.eval(&vars(&[("x", -4.0)])).unwrap(), 0.0);

        let expr = Expr::parse("exp(x)").unwrap();
        assert!(expr.eval(&vars(&[("x", 1000.0)])).unwrap().is_finite());
    }

    #[test]
    fn test_unknown_function_rejected() {
        assert_eq!(
            Expr::parse("system(1)"),
            Err(EquationError::UnknownFunction("system".to_string()))
        );
    }

    #[test]
    fn test_unknown_variable_rejected() {
        let expr = Expr::parse("x + 1").unwrap();
        assert_eq!(
            expr.eval(&HashMap::new()),
            Err(EquationError::UnknownVariable("x".to_string()))
        );
    }

    #[test]
    fn test_division_by_zero() {
        let expr = Expr::parse("1 / x").unwrap();
        assert_eq!(
            expr.eval(&vars(&[("x", 0.0)])),
            Err(EquationError::DivisionByZero)
        );
    }

    #[test]
    fn test_realistic_calibration_equation() {
        let expr =
            Expr::parse("0.8 * capacity_score + 0.2 * sqrt(price_volatility)").unwrap();
        let v = vars(&[("capacity_score", 0.5), ("price_volatility", 0.04)]);
        assert!((expr.eval(&v).unwrap() - 0.44).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(Expr::parse("1 + 2 )").is_err());
        assert!(Expr::parse("").is_err());
    }
}
