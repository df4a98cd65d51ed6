// Copyright (c) 2025 - Cowboy AI, Inc.
//! Service Filters
//!
//! Tracker scope is expressed as an LDAP-style filter over service
//! properties. The constructor used by the flow primitives always
//! narrows by interface first:
//!
//! ```text
//! for_interface("db", None)            → (objectClass=db)
//! for_interface("db", Some("(tier=gold)")) → (&(objectClass=db)(tier=gold))
//! ```
//!
//! The supported grammar is the subset the registry needs:
//! equality `(key=value)`, presence `(key=*)`, conjunction `(&…)`,
//! disjunction `(|…)`, and negation `(!…)`.
//!
//! Syntax errors are fatal at flow-materialization time
//! ([`FlowError::FilterSyntax`]).

use serde_json::Value;

use crate::errors::{FlowError, FlowResult};
use crate::host::ServiceProperties;

/// The property key every registration carries for its interface
pub const OBJECT_CLASS: &str = "objectClass";

/// A parsed, matchable tracker filter
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceFilter {
    raw: String,
    expr: FilterExpr,
}

impl ServiceFilter {
    /// Build the filter for `interface`, optionally narrowed by a user
    /// expression
    ///
    /// # Errors
    ///
    /// [`FlowError::FilterSyntax`] if the user expression is malformed.
    pub fn for_interface(interface: &str, expression: Option<&str>) -> FlowResult<Self> {
        let raw = match expression {
            None => format!("({OBJECT_CLASS}={interface})"),
            Some(user) => format!("(&({OBJECT_CLASS}={interface}){user})"),
        };
        Self::parse(&raw)
    }

    /// Parse a complete filter string
    ///
    /// # Errors
    ///
    /// [`FlowError::FilterSyntax`] if the string is malformed.
    pub fn parse(raw: &str) -> FlowResult<Self> {
        let mut parser = Parser {
            input: raw,
            pos: 0,
        };
        let expr = parser.parse_filter()?;
        parser.skip_whitespace();
        if parser.pos != raw.len() {
            return Err(FlowError::FilterSyntax(format!(
                "unexpected trailing input at byte {} in {raw:?}",
                parser.pos
            )));
        }
        Ok(Self {
            raw: raw.to_string(),
            expr,
        })
    }

    /// Whether `properties` satisfy this filter
    pub fn matches(&self, properties: &ServiceProperties) -> bool {
        self.expr.matches(properties)
    }

    /// The filter in its textual form
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for ServiceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FilterExpr {
    Equals(String, String),
    Present(String),
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    fn matches(&self, properties: &ServiceProperties) -> bool {
        match self {
            FilterExpr::Equals(key, expected) => properties
                .get(key)
                .map(|value| value_text_matches(value, expected))
                .unwrap_or(false),
            FilterExpr::Present(key) => properties.contains_key(key),
            FilterExpr::And(clauses) => clauses.iter().all(|c| c.matches(properties)),
            FilterExpr::Or(clauses) => clauses.iter().any(|c| c.matches(properties)),
            FilterExpr::Not(clause) => !clause.matches(properties),
        }
    }
}

/// Compare a property value against the textual form used in filters
fn value_text_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        Value::Number(n) => n.to_string() == expected,
        Value::Bool(b) => b.to_string() == expected,
        _ => false,
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse_filter(&mut self) -> FlowResult<FilterExpr> {
        self.skip_whitespace();
        self.expect('(')?;
        let expr = match self.peek() {
            Some('&') => {
                self.advance();
                FilterExpr::And(self.parse_clauses()?)
            }
            Some('|') => {
                self.advance();
                FilterExpr::Or(self.parse_clauses()?)
            }
            Some('!') => {
                self.advance();
                FilterExpr::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_comparison()?,
            None => return Err(self.error("unterminated filter")),
        };
        self.skip_whitespace();
        self.expect(')')?;
        Ok(expr)
    }

    fn parse_clauses(&mut self) -> FlowResult<Vec<FilterExpr>> {
        let mut clauses = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('(') => clauses.push(self.parse_filter()?),
                Some(')') => break,
                Some(other) => {
                    return Err(self.error(&format!("expected '(' or ')', found {other:?}")))
                }
                None => return Err(self.error("unterminated composite filter")),
            }
        }
        if clauses.is_empty() {
            return Err(self.error("composite filter requires at least one clause"));
        }
        Ok(clauses)
    }

    fn parse_comparison(&mut self) -> FlowResult<FilterExpr> {
        let key = self.take_until(&['=', '(', ')'])?;
        let key = key.trim();
        if key.is_empty() {
            return Err(self.error("empty attribute name"));
        }
        self.expect('=')?;
        let value = self.take_until(&['(', ')'])?;
        if value == "*" {
            Ok(FilterExpr::Present(key.to_string()))
        } else {
            Ok(FilterExpr::Equals(key.to_string(), value.to_string()))
        }
    }

    fn take_until(&mut self, stops: &[char]) -> FlowResult<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if stops.contains(&c) {
                return Ok(self.input[start..self.pos].to_string());
            }
            self.advance();
        }
        Err(self.error("unterminated filter"))
    }

    fn expect(&mut self, wanted: char) -> FlowResult<()> {
        match self.peek() {
            Some(c) if c == wanted => {
                self.advance();
                Ok(())
            }
            Some(other) => Err(self.error(&format!("expected {wanted:?}, found {other:?}"))),
            None => Err(self.error(&format!("expected {wanted:?}, found end of input"))),
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.advance();
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn error(&self, message: &str) -> FlowError {
        FlowError::FilterSyntax(format!("{message} at byte {} in {:?}", self.pos, self.input))
    }
}
