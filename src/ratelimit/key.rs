//! Rate limit key resolution.
//!
//! A key expression is a template of literal text and request variables,
//! for example `$http_x_api_key` or `${remote_addr}-${cookie_session}`.
//! Resolution never fails: an expression that evaluates to nothing falls
//! back to the client address.

use std::fmt;

use super::policy::Policy;
use super::request::RequestAttributes;

/// Key expression used when a policy does not configure one.
pub const DEFAULT_KEY: &str = "$remote_addr";

/// A request variable referenced from a key expression.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Variable {
    RemoteAddr,
    Host,
    RequestUri,
    Uri,
    Args,
    /// Header name, already in `-` separated form.
    Header(String),
    Cookie(String),
    Arg(String),
    Unknown,
}

impl Variable {
    fn from_name(name: &str) -> Self {
        match name {
            "remote_addr" => Variable::RemoteAddr,
            "host" => Variable::Host,
            "request_uri" => Variable::RequestUri,
            "uri" => Variable::Uri,
            "args" | "query_string" => Variable::Args,
            _ => {
                if let Some(header) = name.strip_prefix("http_") {
                    Variable::Header(header.replace('_', "-"))
                } else if let Some(cookie) = name.strip_prefix("cookie_") {
                    Variable::Cookie(cookie.to_string())
                } else if let Some(arg) = name.strip_prefix("arg_") {
                    Variable::Arg(arg.to_string())
                } else {
                    Variable::Unknown
                }
            }
        }
    }

    fn evaluate<R: RequestAttributes + ?Sized>(&self, request: &R, out: &mut String) {
        match self {
            Variable::RemoteAddr => {
                if let Some(addr) = request.remote_addr() {
                    out.push_str(&addr.to_string());
                }
            }
            Variable::Host => out.push_str(request.host().unwrap_or_default()),
            Variable::RequestUri => {
                out.push_str(request.path());
                if let Some(query) = request.query() {
                    out.push('?');
                    out.push_str(query);
                }
            }
            Variable::Uri => out.push_str(request.path()),
            Variable::Args => out.push_str(request.query().unwrap_or_default()),
            Variable::Header(name) => out.push_str(request.header(name).unwrap_or_default()),
            Variable::Cookie(name) => {
                if let Some(value) = request.header("cookie").and_then(|c| find_pair(c, ';', name)) {
                    out.push_str(value);
                }
            }
            Variable::Arg(name) => {
                if let Some(value) = request.query().and_then(|q| find_pair(q, '&', name)) {
                    out.push_str(value);
                }
            }
            Variable::Unknown => {}
        }
    }
}

/// Find `name=value` in a `sep` separated list.
fn find_pair<'a>(list: &'a str, sep: char, name: &str) -> Option<&'a str> {
    list.split(sep).find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then_some(v)
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(Variable),
}

/// A parsed key expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExpression {
    segments: Vec<Segment>,
}

impl KeyExpression {
    /// Parse an expression. Parsing is lenient: anything that is not a
    /// well-formed variable reference is kept as literal text.
    pub fn parse(expression: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = expression;

        while let Some(pos) = rest.find('$') {
            literal.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
                match braced.find('}') {
                    Some(end) => (&braced[..end], end + 2),
                    None => ("", 0),
                }
            } else {
                let end = after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(after.len());
                (&after[..end], end)
            };

            if name.is_empty() {
                literal.push('$');
                rest = after;
                continue;
            }

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Variable(Variable::from_name(name)));
            rest = &after[consumed..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self { segments }
    }

    /// Evaluate against a request. Missing attributes contribute nothing.
    pub fn evaluate<R: RequestAttributes + ?Sized>(&self, request: &R) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(variable) => variable.evaluate(request, &mut out),
            }
        }
        out
    }
}

/// Resolve the rate limit key value for a request.
///
/// Falls back to the raw client address when the policy's expression
/// yields an empty string.
pub fn resolve<R: RequestAttributes + ?Sized>(policy: &Policy, request: &R) -> String {
    let value = KeyExpression::parse(policy.key_expression()).evaluate(request);
    if !value.is_empty() {
        return value;
    }
    request
        .remote_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default()
}

/// A key value scoped to its policy namespace.
///
/// This is the lookup key for both the local decision cache and the
/// shared counter, so it must be unique per (route, client) pair across
/// the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedKey {
    namespaced: String,
    namespace_len: usize,
}

impl NamespacedKey {
    /// Create a key as `namespace` directly followed by `key_value`.
    pub fn new(namespace: &str, key_value: &str) -> Self {
        let mut namespaced = String::with_capacity(namespace.len() + key_value.len());
        namespaced.push_str(namespace);
        namespaced.push_str(key_value);
        Self {
            namespaced,
            namespace_len: namespace.len(),
        }
    }

    /// The namespace part.
    pub fn namespace(&self) -> &str {
        &self.namespaced[..self.namespace_len]
    }

    /// The key value part.
    pub fn key_value(&self) -> &str {
        &self.namespaced[self.namespace_len..]
    }

    /// The full key.
    pub fn as_str(&self) -> &str {
        &self.namespaced
    }
}

impl fmt::Display for NamespacedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.namespaced)
    }
}
