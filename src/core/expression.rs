//! `${...}` placeholders in target URLs, rendered per exchange.

use std::fmt;

use thiserror::Error;

use crate::core::exchange::Exchange;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExpressionError {
    #[error("Unknown placeholder '${{{0}}}'")]
    UnknownPlaceholder(String),

    #[error("Unterminated placeholder in '{0}'")]
    Unterminated(String),

    #[error("No value for placeholder '${{{0}}}'")]
    MissingValue(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placeholder {
    Method,
    Path,
    Query,
    Header(String),
    Property(String),
    Env(String),
}

impl Placeholder {
    fn parse(expr: &str) -> Result<Self, ExpressionError> {
        let expr = expr.trim();
        let placeholder = match expr {
            "method" => Self::Method,
            "path" => Self::Path,
            "query" => Self::Query,
            _ => match expr.split_once('.') {
                Some(("header", name)) if !name.is_empty() => Self::Header(name.to_string()),
                Some(("property", key)) if !key.is_empty() => Self::Property(key.to_string()),
                Some(("env", var)) if !var.is_empty() => Self::Env(var.to_string()),
                _ => return Err(ExpressionError::UnknownPlaceholder(expr.to_string())),
            },
        };
        Ok(placeholder)
    }

    fn evaluate(&self, exchange: &Exchange) -> Option<String> {
        match self {
            Self::Method => Some(exchange.request.method.to_string()),
            Self::Path => Some(exchange.request.path().to_string()),
            // an absent query renders empty rather than failing
            Self::Query => Some(exchange.request.query().unwrap_or_default().to_string()),
            Self::Header(name) => exchange.request.header(name).map(str::to_string),
            Self::Property(key) => exchange.property_str(key),
            Self::Env(var) => std::env::var(var).ok(),
        }
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Method => write!(f, "method"),
            Self::Path => write!(f, "path"),
            Self::Query => write!(f, "query"),
            Self::Header(name) => write!(f, "header.{name}"),
            Self::Property(key) => write!(f, "property.{key}"),
            Self::Env(var) => write!(f, "env.{var}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// A URL with placeholders. Parsed once, rendered on every resolution.
#[derive(Debug, Clone)]
pub struct UrlTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl UrlTemplate {
    pub fn is_template(s: &str) -> bool {
        s.contains("${")
    }

    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| ExpressionError::Unterminated(source.to_string()))?;
            segments.push(Segment::Placeholder(Placeholder::parse(&after[..end])?));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn render(&self, exchange: &Exchange) -> Result<String, ExpressionError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(placeholder) => {
                    let value = placeholder
                        .evaluate(exchange)
                        .ok_or_else(|| ExpressionError::MissingValue(placeholder.to_string()))?;
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }
}
