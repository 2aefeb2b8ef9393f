//! Templated string values.
//!
//! A template is literal text with `{{ expr }}` placeholders. Supported
//! expressions:
//!
//! | Expression                              | Renders to                               |
//! |-----------------------------------------|------------------------------------------|
//! | `ds`                                    | logical date as `YYYY-MM-DD`             |
//! | `ds_nodash`                             | logical date as `YYYYMMDD`               |
//! | `logical_date.strftime('<fmt>')`        | logical date formatted with `<fmt>`      |
//! | `execution_date.strftime('<fmt>')`      | alias of the above                       |
//! | `var.value.<name>`                      | top-level variable `<name>`              |
//! | `var.json.<dotted.path>`                | nested variable at `<dotted.path>`       |
//!
//! Templates are parsed once when a declaration is loaded, so syntax errors
//! surface as [`EngineError::InvalidTemplate`] before anything runs. Missing
//! variables surface at render time as [`EngineError::UnresolvedVariable`].

use std::fmt;

use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::variables::Variables;
use crate::EngineError;

/// Everything a template can read at render time.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub logical_date: NaiveDate,
    pub variables: &'a Variables,
}

impl<'a> RenderContext<'a> {
    pub fn new(logical_date: NaiveDate, variables: &'a Variables) -> Self {
        Self { logical_date, variables }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Ds,
    DsNodash,
    DateFormat(String),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, EngineError> {
        let invalid = |reason: &str| EngineError::InvalidTemplate {
            template: source.to_owned(),
            reason: reason.to_owned(),
        };

        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_owned()));
            }
            let after_open = &rest[open + 2..];
            let close = after_open
                .find("}}")
                .ok_or_else(|| invalid("unterminated '{{'"))?;
            let expr = parse_expr(after_open[..close].trim()).map_err(|reason| invalid(&reason))?;
            segments.push(Segment::Expr(expr));
            rest = &after_open[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_owned()));
        }

        Ok(Self {
            source: source.to_owned(),
            segments,
        })
    }

    /// A template with no placeholders.
    pub fn literal(text: impl Into<String>) -> Self {
        let text = text.into();
        let segments = if text.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Literal(text.clone())]
        };
        Self { source: text, segments }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The text of a placeholder-free template.
    pub fn as_literal(&self) -> Option<&str> {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
            .then_some(self.source.as_str())
    }

    /// Dotted variable paths this template reads.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Expr(Expr::Variable(path)) => Some(path.as_str()),
            _ => None,
        })
    }

    pub fn render(&self, ctx: &RenderContext<'_>) -> Result<String, EngineError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(Expr::Ds) => {
                    out.push_str(&ctx.logical_date.format("%Y-%m-%d").to_string())
                }
                Segment::Expr(Expr::DsNodash) => {
                    out.push_str(&ctx.logical_date.format("%Y%m%d").to_string())
                }
                Segment::Expr(Expr::DateFormat(fmt)) => {
                    out.push_str(&ctx.logical_date.format(fmt).to_string())
                }
                Segment::Expr(Expr::Variable(path)) => out.push_str(&ctx.variables.render(path)?),
            }
        }
        Ok(out)
    }
}

fn parse_expr(expr: &str) -> Result<Expr, String> {
    match expr {
        "ds" => return Ok(Expr::Ds),
        "ds_nodash" => return Ok(Expr::DsNodash),
        "" => return Err("empty expression".to_owned()),
        _ => {}
    }

    if let Some(name) = expr.strip_prefix("var.value.") {
        if name.is_empty() || name.contains('.') {
            return Err(format!("'var.value' takes a single variable name, got '{name}'"));
        }
        return Ok(Expr::Variable(name.to_owned()));
    }
    if let Some(path) = expr.strip_prefix("var.json.") {
        if path.split('.').any(str::is_empty) {
            return Err(format!("malformed variable path '{path}'"));
        }
        return Ok(Expr::Variable(path.to_owned()));
    }

    let call = expr
        .strip_prefix("logical_date.strftime(")
        .or_else(|| expr.strip_prefix("execution_date.strftime("));
    if let Some(args) = call {
        let arg = args
            .strip_suffix(')')
            .ok_or_else(|| "unclosed strftime call".to_owned())?
            .trim();
        let fmt = unquote(arg)
            .ok_or_else(|| format!("strftime expects a quoted format, got {arg}"))?;
        if StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error)) {
            return Err(format!("invalid strftime format '{fmt}'"));
        }
        return Ok(Expr::DateFormat(fmt.to_owned()));
    }

    Err(format!("unsupported expression '{expr}'"))
}

fn unquote(arg: &str) -> Option<&str> {
    ['\'', '"'].into_iter().find_map(|q| {
        arg.strip_prefix(q)
            .and_then(|s| s.strip_suffix(q))
            .filter(|inner| !inner.contains(q))
    })
}

impl TryFrom<String> for Template {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Template::parse(&value)
    }
}

impl From<Template> for String {
    fn from(value: Template) -> Self {
        value.source
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
