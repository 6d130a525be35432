//! Template engine for dynamic responses.
//!
//! Templates are strings containing `{{ expression }}` placeholders. An
//! expression is either a variable lookup (`id`, `body.user.name`,
//! `items.0`) or one of a closed set of built-in helpers:
//!
//! | Helper                      | Output                                   |
//! |-----------------------------|------------------------------------------|
//! | `timestamp` / `now [fmt]`   | current UTC time, ISO-8601 or strftime   |
//! | `random min max`            | uniform integer in `min..=max`           |
//! | `uuid`                      | version 4 UUID                           |
//! | `responseTime`              | milliseconds since `startTime`           |
//!
//! Helpers accept both `{{random 1 10}}` and `{{random(1, 10)}}`.

use crate::error::{TemplateError, TemplateFault};
use chrono::format::{Item, StrftimeItems};
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use uuid::Uuid;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Template engine for rendering dynamic responses.
#[derive(Debug, Clone, Default)]
pub struct TemplateEngine;

/// Per-request data templates are evaluated against.
///
/// Flat values are merged in call order, so a later merge wins on key
/// collision. The dispatcher merges path params, then query, then body,
/// then sets `startTime`. Each source is also reachable under its own
/// namespace (`path.*`, `query.*`, `body.*`, `headers.*`).
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    values: Map<String, Value>,
    sections: Map<String, Value>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path_params(mut self, params: &Map<String, Value>) -> Self {
        self.merge(params);
        self.sections
            .insert("path".to_string(), Value::Object(params.clone()));
        self
    }

    pub fn with_query(mut self, query: &Map<String, Value>) -> Self {
        self.merge(query);
        self.sections
            .insert("query".to_string(), Value::Object(query.clone()));
        self
    }

    /// Object bodies are merged field by field; any body is reachable as `body`.
    pub fn with_body(mut self, body: Option<&Value>) -> Self {
        if let Some(body) = body {
            if let Value::Object(fields) = body {
                self.merge(fields);
            }
            self.sections.insert("body".to_string(), body.clone());
        }
        self
    }

    pub fn with_headers(mut self, headers: &Map<String, Value>) -> Self {
        self.sections
            .insert("headers".to_string(), Value::Object(headers.clone()));
        self
    }

    /// Request arrival time in epoch milliseconds.
    pub fn with_start_time(mut self, start_time: impl Into<Value>) -> Self {
        self.values.insert("startTime".to_string(), start_time.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Resolve a dotted path such as `body.items.0.name`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let segments: Vec<&str> = path.split('.').collect();
        self.lookup(segments.as_slice())
    }

    /// `startTime` when present and numeric.
    pub fn start_time_ms(&self) -> Option<f64> {
        self.values.get("startTime").and_then(Value::as_f64)
    }

    fn merge(&mut self, fields: &Map<String, Value>) {
        for (key, value) in fields {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// A dotted path whose head names a section resolves in that section, so
    /// request fields called `path` or `body` cannot shadow it.
    fn lookup<S: AsRef<str>>(&self, segments: &[S]) -> Option<&Value> {
        let (head, rest) = segments.split_first()?;
        let head: &str = head.as_ref();
        let root = if rest.is_empty() {
            self.values.get(head).or_else(|| self.sections.get(head))
        } else {
            self.sections.get(head).or_else(|| self.values.get(head))
        }?;
        rest.iter().try_fold(root, |current, segment| match current {
            Value::Object(map) => map.get(segment.as_ref()),
            Value::Array(items) => segment
                .as_ref()
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

/// A parsed template, ready to evaluate.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Expr(Expr),
}

#[derive(Debug, Clone)]
enum Expr {
    Var(Vec<String>),
    Literal(String),
    Timestamp(Option<Arg>),
    Random(Arg, Arg),
    Uuid,
    ResponseTime,
}

#[derive(Debug, Clone)]
enum Arg {
    Int(i64),
    Str(String),
    Var(Vec<String>),
}

#[derive(Debug)]
enum Token {
    Bare(String),
    Quoted(String),
}

impl Template {
    /// Parse a template string.
    pub fn compile(source: &str) -> Result<Self, TemplateError> {
        let fail = |fault| TemplateError::new(source, fault);
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after_open = &rest[start + OPEN.len()..];
            let end = after_open
                .find(CLOSE)
                .ok_or_else(|| fail(TemplateFault::Unterminated(offset + start)))?;
            segments.push(Segment::Expr(parse_expr(&after_open[..end]).map_err(fail)?));

            let consumed = start + OPEN.len() + end + CLOSE.len();
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Evaluate against a context. An empty result is an error.
    pub fn render(&self, ctx: &RequestContext) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(expr) => {
                    let value =
                        eval(expr, ctx).map_err(|fault| TemplateError::new(&self.source, fault))?;
                    out.push_str(&value);
                }
            }
        }

        if out.is_empty() {
            return Err(TemplateError::new(&self.source, TemplateFault::EmptyOutput));
        }
        Ok(out)
    }
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        Self
    }

    /// Whether a string contains placeholder syntax.
    pub fn is_template(s: &str) -> bool {
        s.contains(OPEN)
    }

    /// Render a template string with the given context.
    pub fn render(&self, template: &str, ctx: &RequestContext) -> Result<String, TemplateError> {
        Template::compile(template)?.render(ctx)
    }

    /// Render every templated string leaf of a JSON value.
    ///
    /// Non-string leaves and strings without placeholders are returned
    /// unchanged. The first failing leaf aborts rendering; its JSON path is
    /// recorded in [`TemplateError::location`].
    pub fn render_json(&self, value: &Value, ctx: &RequestContext) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) if Self::is_template(s) => self.render(s, ctx).map(Value::String),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    self.render_json(item, ctx)
                        .map_err(|e| e.nested(&format!("[{}]", i)))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(fields) => {
                let mut rendered = Map::new();
                for (key, item) in fields {
                    let item = self
                        .render_json(item, ctx)
                        .map_err(|e| e.nested(&format!(".{}", key)))?;
                    rendered.insert(key.clone(), item);
                }
                Ok(Value::Object(rendered))
            }
            _ => Ok(value.clone()),
        }
    }
}

impl TemplateError {
    fn nested(mut self, segment: &str) -> Self {
        let rest = self.location.strip_prefix('$').unwrap_or(&self.location);
        self.location = format!("${}{}", segment, rest);
        self
    }
}

fn call_syntax() -> &'static Regex {
    static CALL: OnceLock<Regex> = OnceLock::new();
    CALL.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)$").expect("call syntax regex is valid")
    })
}

fn integer_literal() -> &'static Regex {
    static INT: OnceLock<Regex> = OnceLock::new();
    INT.get_or_init(|| Regex::new(r"^-?[0-9]+$").expect("integer regex is valid"))
}

fn parse_expr(raw: &str) -> Result<Expr, TemplateFault> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(TemplateFault::EmptyExpression);
    }

    let (head, args) = match call_syntax().captures(raw) {
        Some(caps) => (Token::Bare(caps[1].to_string()), tokenize(&caps[2])?),
        None => {
            let mut tokens = tokenize(raw)?.into_iter();
            let head = tokens.next().ok_or(TemplateFault::EmptyExpression)?;
            (head, tokens.collect())
        }
    };

    let name = match head {
        Token::Quoted(text) if args.is_empty() => return Ok(Expr::Literal(text)),
        Token::Quoted(text) => return Err(TemplateFault::UnknownHelper(text)),
        Token::Bare(name) => name,
    };

    let argc = args.len();
    let arity = move |helper: &'static str, expected: &'static str| TemplateFault::Arity {
        helper,
        expected,
        got: argc,
    };

    match name.as_str() {
        "uuid" if args.is_empty() => Ok(Expr::Uuid),
        "uuid" => Err(arity("uuid", "0")),
        "responseTime" if args.is_empty() => Ok(Expr::ResponseTime),
        "responseTime" => Err(arity("responseTime", "0")),
        "timestamp" | "now" => match args.len() {
            0 => Ok(Expr::Timestamp(None)),
            1 => {
                let format = args.into_iter().next().map(parse_arg);
                Ok(Expr::Timestamp(format))
            }
            _ => Err(arity("now", "0 or 1")),
        },
        "random" => {
            let mut it = args.into_iter().map(parse_arg);
            match (it.next(), it.next(), it.next()) {
                (Some(min), Some(max), None) => Ok(Expr::Random(min, max)),
                _ => Err(arity("random", "2")),
            }
        }
        _ if !args.is_empty() => Err(TemplateFault::UnknownHelper(name)),
        _ => Ok(Expr::Var(split_path(&name))),
    }
}

/// Split on whitespace and commas, keeping quoted strings intact.
fn tokenize(raw: &str) -> Result<Vec<Token>, TemplateFault> {
    let mut tokens = Vec::new();
    let mut chars = raw.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() || ch == ',' {
            chars.next();
        } else if ch == '"' || ch == '\'' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some(c) if c == ch => break,
                    Some('\\') => match chars.next() {
                        Some(escaped) => text.push(escaped),
                        None => return Err(TemplateFault::UnterminatedString),
                    },
                    Some(c) => text.push(c),
                    None => return Err(TemplateFault::UnterminatedString),
                }
            }
            tokens.push(Token::Quoted(text));
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == ',' {
                    break;
                }
                word.push(c);
                chars.next();
            }
            tokens.push(Token::Bare(word));
        }
    }

    Ok(tokens)
}

fn parse_arg(token: Token) -> Arg {
    match token {
        Token::Quoted(text) => Arg::Str(text),
        Token::Bare(word) if integer_literal().is_match(&word) => match word.parse() {
            Ok(n) => Arg::Int(n),
            Err(_) => Arg::Str(word),
        },
        Token::Bare(word) => Arg::Var(split_path(&word)),
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.').map(String::from).collect()
}

fn eval(expr: &Expr, ctx: &RequestContext) -> Result<String, TemplateFault> {
    match expr {
        Expr::Var(path) => Ok(ctx.lookup(path.as_slice()).map(display).unwrap_or_default()),
        Expr::Literal(text) => Ok(text.clone()),
        Expr::Uuid => Ok(Uuid::new_v4().to_string()),
        Expr::Timestamp(None) => Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        Expr::Timestamp(Some(arg)) => {
            let format = match arg {
                Arg::Str(s) => s.clone(),
                Arg::Int(n) => n.to_string(),
                Arg::Var(path) => ctx.lookup(path.as_slice()).map(display).unwrap_or_default(),
            };
            let invalid = StrftimeItems::new(&format).any(|item| matches!(item, Item::Error));
            if invalid {
                return Err(TemplateFault::InvalidTimeFormat(format));
            }
            Ok(Utc::now().format(&format).to_string())
        }
        Expr::Random(min, max) => {
            let min = int_arg(min, ctx)?;
            let max = int_arg(max, ctx)?;
            if min > max {
                return Err(TemplateFault::InvalidRange { min, max });
            }
            Ok(rand::thread_rng().gen_range(min..=max).to_string())
        }
        Expr::ResponseTime => {
            let now = now_millis() as f64;
            // Missing or non-numeric startTime falls back to now.
            let start = ctx.start_time_ms().unwrap_or(now);
            Ok(((now - start).max(0.0) as i64).to_string())
        }
    }
}

fn int_arg(arg: &Arg, ctx: &RequestContext) -> Result<i64, TemplateFault> {
    let invalid = |arg: String| TemplateFault::InvalidArgument {
        helper: "random",
        arg,
    };
    match arg {
        Arg::Int(n) => Ok(*n),
        Arg::Str(s) => s.trim().parse().map_err(|_| invalid(s.clone())),
        Arg::Var(path) => match ctx.lookup(path.as_slice()) {
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| invalid(n.to_string())),
            Some(Value::String(s)) => s.trim().parse().map_err(|_| invalid(s.clone())),
            _ => Err(invalid(path.join("."))),
        },
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
