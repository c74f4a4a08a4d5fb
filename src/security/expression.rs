// ============================================================================
// Permission Expressions
// ============================================================================
//
// Boolean trees over named checks and a small interpreter for them.
//
// Grammar (keywords are case-insensitive, check names may contain spaces):
//
//   expr    := term ("or" term)*
//   term    := factor ("and" factor)*
//   factor  := "not" factor | "(" expr ")" | name
//   name    := word+
//
// ============================================================================

use super::check::{CheckContext, CheckTiming};
use crate::core::{EngineError, Result};
use crate::dictionary::EntityDictionary;
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

lazy_static! {
    static ref TOKEN: Regex = Regex::new(r"\(|\)|[^\s()]+").expect("token pattern is valid");
}

/// Outcome of evaluating an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionResult {
    Pass,
    Fail,
    /// A commit-time check was reached in [`EvaluationMode::ImmediateOnly`]
    /// and the result depends on it.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    /// Commit-time checks evaluate to `Deferred`.
    ImmediateOnly,
    /// Every check is evaluated.
    AllChecks,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionExpression {
    And(Vec<PermissionExpression>),
    Or(Vec<PermissionExpression>),
    Not(Box<PermissionExpression>),
    Check(String),
}

impl PermissionExpression {
    pub fn check(name: impl Into<String>) -> Self {
        Self::Check(name.into())
    }

    /// Passes only if every child passes.
    pub fn all(children: Vec<PermissionExpression>) -> Self {
        Self::And(children)
    }

    /// Passes if any child passes.
    pub fn any(children: Vec<PermissionExpression>) -> Self {
        Self::Or(children)
    }

    pub fn negate(child: PermissionExpression) -> Self {
        Self::Not(Box::new(child))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let tokens: Vec<&str> = TOKEN.find_iter(text).map(|m| m.as_str()).collect();
        if tokens.is_empty() {
            return Err(EngineError::InvalidSyntax(
                "empty permission expression".to_string(),
            ));
        }

        let mut parser = Parser {
            tokens,
            position: 0,
        };
        let expression = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(EngineError::InvalidSyntax(format!(
                "unexpected '{}' in permission expression '{}'",
                token, text
            )));
        }
        Ok(expression)
    }

    /// Every check name referenced by the tree, in order of appearance.
    pub fn check_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_names(names);
                }
            }
            Self::Not(child) => child.collect_names(names),
            Self::Check(name) => names.push(name),
        }
    }

    /// Evaluates the tree, short-circuiting on the first decisive child.
    pub fn evaluate(
        &self,
        dictionary: &EntityDictionary,
        context: &CheckContext<'_>,
        mode: EvaluationMode,
    ) -> Result<ExpressionResult> {
        match self {
            Self::And(children) => {
                let mut deferred = false;
                for child in children {
                    match child.evaluate(dictionary, context, mode)? {
                        ExpressionResult::Fail => return Ok(ExpressionResult::Fail),
                        ExpressionResult::Deferred => deferred = true,
                        ExpressionResult::Pass => {}
                    }
                }
                Ok(if deferred {
                    ExpressionResult::Deferred
                } else {
                    ExpressionResult::Pass
                })
            }

            Self::Or(children) => {
                let mut deferred = false;
                for child in children {
                    match child.evaluate(dictionary, context, mode)? {
                        ExpressionResult::Pass => return Ok(ExpressionResult::Pass),
                        ExpressionResult::Deferred => deferred = true,
                        ExpressionResult::Fail => {}
                    }
                }
                Ok(if deferred {
                    ExpressionResult::Deferred
                } else {
                    ExpressionResult::Fail
                })
            }

            Self::Not(child) => Ok(match child.evaluate(dictionary, context, mode)? {
                ExpressionResult::Pass => ExpressionResult::Fail,
                ExpressionResult::Fail => ExpressionResult::Pass,
                ExpressionResult::Deferred => ExpressionResult::Deferred,
            }),

            Self::Check(name) => {
                let check = dictionary.check(name).ok_or_else(|| {
                    EngineError::Configuration(format!("unknown check '{}'", name))
                })?;

                if mode == EvaluationMode::ImmediateOnly && check.timing() == CheckTiming::Commit {
                    return Ok(ExpressionResult::Deferred);
                }

                Ok(if check.ok(context) {
                    ExpressionResult::Pass
                } else {
                    ExpressionResult::Fail
                })
            }
        }
    }

    fn is_compound(&self) -> bool {
        matches!(self, Self::And(_) | Self::Or(_))
    }

    fn fmt_child(child: &Self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if child.is_compound() {
            write!(f, "({})", child)
        } else {
            write!(f, "{}", child)
        }
    }
}

impl fmt::Display for PermissionExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(children) | Self::Or(children) => {
                let keyword = if matches!(self, Self::And(_)) { "and" } else { "or" };
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", keyword)?;
                    }
                    Self::fmt_child(child, f)?;
                }
                Ok(())
            }
            Self::Not(child) => {
                write!(f, "not ")?;
                Self::fmt_child(child, f)
            }
            Self::Check(name) => write!(f, "{}", name),
        }
    }
}

struct Parser<'a> {
    tokens: Vec<&'a str>,
    position: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.position).copied()
    }

    fn next(&mut self) -> Option<&'a str> {
        let token = self.peek();
        self.position += 1;
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.eq_ignore_ascii_case(keyword))
    }

    fn parse_or(&mut self) -> Result<PermissionExpression> {
        let mut children = vec![self.parse_and()?];
        while self.peek_keyword("or") {
            self.next();
            children.push(self.parse_and()?);
        }
        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            PermissionExpression::Or(children)
        })
    }

    fn parse_and(&mut self) -> Result<PermissionExpression> {
        let mut children = vec![self.parse_factor()?];
        while self.peek_keyword("and") {
            self.next();
            children.push(self.parse_factor()?);
        }
        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            PermissionExpression::And(children)
        })
    }

    fn parse_factor(&mut self) -> Result<PermissionExpression> {
        match self.peek() {
            None => Err(EngineError::InvalidSyntax(
                "permission expression ended unexpectedly".to_string(),
            )),
            Some(token) if token.eq_ignore_ascii_case("not") => {
                self.next();
                Ok(PermissionExpression::negate(self.parse_factor()?))
            }
            Some("(") => {
                self.next();
                let inner = self.parse_or()?;
                match self.next() {
                    Some(")") => Ok(inner),
                    _ => Err(EngineError::InvalidSyntax(
                        "missing ')' in permission expression".to_string(),
                    )),
                }
            }
            Some(")") => Err(EngineError::InvalidSyntax(
                "unexpected ')' in permission expression".to_string(),
            )),
            Some(_) => self.parse_name(),
        }
    }

    fn parse_name(&mut self) -> Result<PermissionExpression> {
        let mut words = Vec::new();
        while let Some(token) = self.peek() {
            if token == "(" || token == ")" || is_keyword(token) {
                break;
            }
            words.push(token);
            self.next();
        }
        if words.is_empty() {
            return Err(EngineError::InvalidSyntax(
                "expected a check name".to_string(),
            ));
        }
        Ok(PermissionExpression::Check(words.join(" ")))
    }
}

fn is_keyword(token: &str) -> bool {
    ["and", "or", "not"]
        .iter()
        .any(|keyword| token.eq_ignore_ascii_case(keyword))
}

#[cfg(test)]
mod tests {
    use super::*;
    use PermissionExpression as E;

    #[test]
    fn parses_multi_word_names_and_precedence() {
        let parsed = E::parse("principal is admin OR owner and not (locked or archived)").unwrap();
        assert_eq!(
            parsed,
            E::any(vec![
                E::check("principal is admin"),
                E::all(vec![
                    E::check("owner"),
                    E::negate(E::any(vec![E::check("locked"), E::check("archived")])),
                ]),
            ])
        );
        assert_eq!(
            parsed.check_names(),
            vec!["principal is admin", "owner", "locked", "archived"]
        );
    }

    #[test]
    fn display_round_trips_through_parse() {
        let text = "(a or b) and not (c and d)";
        let parsed = E::parse(text).unwrap();
        assert_eq!(parsed.to_string(), text);
        assert_eq!(E::parse(&parsed.to_string()).unwrap(), parsed);
    }

    #[test]
    fn rejects_malformed_expressions() {
        for text in ["", "a and", "(a or b", "a )", "not", "and b"] {
            let err = E::parse(text).unwrap_err();
            assert!(matches!(err, EngineError::InvalidSyntax(_)), "{text}");
        }
    }
}
