//! Evaluator for dependency-manifest conditions.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or   := and ("or" and)*
//! and  := not ("and" not)*
//! not  := "not" not | cmp
//! cmp  := atom (("==" | "!=") atom)?
//! atom := "(" or ")" | string | "true" | "false" | identifier
//! ```

use pinset_schema::{DepsError, VarValue};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Eq,
    Ne,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' | '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(format!("expected '=' after '{c}'"));
                }
                tokens.push(if c == '=' { Token::Eq } else { Token::Ne });
            }
            '"' | '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(q) if q == c => break,
                        Some(ch) => s.push(ch),
                        None => return Err("unterminated string".to_owned()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    vars: &'a BTreeMap<String, VarValue>,
}

enum Failure {
    Undefined(String),
    Invalid(String),
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn or(&mut self) -> Result<VarValue, Failure> {
        let mut value = self.and()?;
        while self.keyword("or") {
            self.pos += 1;
            let rhs = self.and()?;
            value = VarValue::Bool(as_bool(&value)? || as_bool(&rhs)?);
        }
        Ok(value)
    }

    fn and(&mut self) -> Result<VarValue, Failure> {
        let mut value = self.not()?;
        while self.keyword("and") {
            self.pos += 1;
            let rhs = self.not()?;
            value = VarValue::Bool(as_bool(&value)? && as_bool(&rhs)?);
        }
        Ok(value)
    }

    fn not(&mut self) -> Result<VarValue, Failure> {
        if self.keyword("not") {
            self.pos += 1;
            let value = self.not()?;
            return Ok(VarValue::Bool(!as_bool(&value)?));
        }
        self.cmp()
    }

    fn cmp(&mut self) -> Result<VarValue, Failure> {
        let lhs = self.atom()?;
        let negate = match self.peek() {
            Some(Token::Eq) => false,
            Some(Token::Ne) => true,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.atom()?;
        let equal = match (&lhs, &rhs) {
            (VarValue::Str(a), VarValue::Str(b)) => a == b,
            (VarValue::Bool(a), VarValue::Bool(b)) => a == b,
            _ => {
                return Err(Failure::Invalid(format!(
                    "cannot compare '{lhs}' with '{rhs}'"
                )))
            }
        };
        Ok(VarValue::Bool(equal != negate))
    }

    fn atom(&mut self) -> Result<VarValue, Failure> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| Failure::Invalid("unexpected end of condition".to_owned()))?;
        self.pos += 1;
        match token {
            Token::LParen => {
                let value = self.or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(Failure::Invalid("missing ')'".to_owned()));
                }
                self.pos += 1;
                Ok(value)
            }
            Token::Str(s) => Ok(VarValue::Str(s)),
            Token::Ident(word) => match word.as_str() {
                "true" | "True" => Ok(VarValue::Bool(true)),
                "false" | "False" => Ok(VarValue::Bool(false)),
                "and" | "or" | "not" => Err(Failure::Invalid(format!("unexpected '{word}'"))),
                name => self
                    .vars
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Failure::Undefined(name.to_owned())),
            },
            other => Err(Failure::Invalid(format!("unexpected {other:?}"))),
        }
    }
}

fn as_bool(value: &VarValue) -> Result<bool, Failure> {
    match value {
        VarValue::Bool(b) => Ok(*b),
        VarValue::Str(s) => Err(Failure::Invalid(format!("'{s}' is not a boolean"))),
    }
}

/// Evaluate `condition` against `vars`. An empty condition is true.
pub fn evaluate(condition: &str, vars: &BTreeMap<String, VarValue>) -> Result<bool, DepsError> {
    let invalid = |reason: String| DepsError::InvalidCondition {
        condition: condition.to_owned(),
        reason,
    };
    if condition.trim().is_empty() {
        return Ok(true);
    }
    let tokens = tokenize(condition).map_err(invalid)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        vars,
    };
    let result = parser.or().and_then(|v| {
        if parser.pos < parser.tokens.len() {
            return Err(Failure::Invalid(format!(
                "trailing input at token {}",
                parser.pos + 1
            )));
        }
        as_bool(&v)
    });
    result.map_err(|f| match f {
        Failure::Undefined(name) => DepsError::UndefinedVar(name),
        Failure::Invalid(reason) => invalid(reason),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, VarValue> {
        BTreeMap::from([
            ("checkout_linux".to_owned(), VarValue::Bool(true)),
            ("checkout_mac".to_owned(), VarValue::Bool(false)),
            ("host_os".to_owned(), VarValue::Str("linux".to_owned())),
            ("target_cpu".to_owned(), VarValue::Str("arm64".to_owned())),
        ])
    }

    #[test]
    fn boolean_operators_and_precedence() {
        let v = vars();
        assert!(evaluate("checkout_linux", &v).unwrap());
        assert!(!evaluate("not checkout_linux", &v).unwrap());
        assert!(evaluate("checkout_mac or checkout_linux and True", &v).unwrap());
        assert!(!evaluate("(checkout_mac or checkout_linux) and false", &v).unwrap());
        assert!(evaluate("", &v).unwrap());
    }

    #[test]
    fn string_comparisons() {
        let v = vars();
        assert!(evaluate("host_os == \"linux\"", &v).unwrap());
        assert!(evaluate("target_cpu != 'x64' and host_os == 'linux'", &v).unwrap());
        assert!(!evaluate("host_os == 'mac'", &v).unwrap());
    }

    #[test]
    fn undefined_variable_is_reported() {
        let err = evaluate("checkout_fuchsia", &vars()).unwrap_err();
        assert!(matches!(err, DepsError::UndefinedVar(ref n) if n == "checkout_fuchsia"));
    }

    #[test]
    fn malformed_conditions_rejected() {
        let v = vars();
        for bad in [
            "host_os",
            "checkout_linux ==",
            "(checkout_linux",
            "host_os == checkout_linux",
            "checkout_linux checkout_mac",
            "a = b",
        ] {
            assert!(
                matches!(evaluate(bad, &v), Err(DepsError::InvalidCondition { .. })),
                "{bad} should be invalid"
            );
        }
    }
}
