//! Template engine for dynamic responses.
//!
//! Renders `{{ ... }}` expressions embedded in stored content. An expression
//! is either a function call from the registry (`now(dd/MM/yyyy)`,
//! `uuid()`...) or a variable reference (`request.body`,
//! `request.headers[x-id]`). A failing expression is left in place verbatim;
//! rendering itself never fails.

use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::debug;

/// Why a single expression could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("unresolved variable '{0}'")]
    UnresolvedVariable(String),

    #[error("bad argument to {function}(): {message}")]
    BadArgument { function: String, message: String },

    #[error("malformed expression '{0}'")]
    Syntax(String),
}

/// A registry function. `None` arguments are variable references that did
/// not resolve.
pub type TemplateFunction =
    Arc<dyn Fn(&[Option<String>]) -> Result<String, TemplateError> + Send + Sync>;

/// Request view exposed to templates as the `request` variable.
#[derive(Debug, Clone, Default)]
pub struct EvaluableRequest {
    pub body: Option<String>,
    pub path: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    /// Path variables and query arguments.
    pub params: BTreeMap<String, String>,
}

impl EvaluableRequest {
    pub fn new(body: Option<&str>, params: &[(&str, &str)]) -> Self {
        Self {
            body: body.map(str::to_string),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    fn to_value(&self) -> Value {
        json!({
            "body": self.body,
            "path": self.path,
            "method": self.method,
            "headers": self.headers,
            "params": self.params,
        })
    }
}

/// Variables visible to expressions.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    variables: HashMap<String, Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with `request` bound.
    pub fn with_request(request: &EvaluableRequest) -> Self {
        let mut ctx = Self::new();
        ctx.set_request(request);
        ctx
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn set_request(&mut self, request: &EvaluableRequest) {
        self.set_variable("request", request.to_value());
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Resolve a reference such as `request.headers[X-Id]` or
    /// `request.body/customer/name`.
    pub fn lookup(&self, reference: &str) -> Result<String, TemplateError> {
        let unresolved = || TemplateError::UnresolvedVariable(reference.to_string());

        let root_end = reference.find(['.', '[', '/']).unwrap_or(reference.len());
        let mut current = self.variables.get(&reference[..root_end]).ok_or_else(unresolved)?.clone();
        let mut rest = &reference[root_end..];

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(['.', '[', '/']).unwrap_or(after.len());
                current = child(&current, &after[..end]).ok_or_else(unresolved)?;
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let end = after.find(']').ok_or_else(|| TemplateError::Syntax(reference.to_string()))?;
                let key = after[..end].trim().trim_matches(|c| c == '\'' || c == '"');
                current = child(&current, key).ok_or_else(unresolved)?;
                rest = &after[end + 1..];
            } else {
                // A JSON pointer into the current value (parsed if it is a string).
                let structured = match current {
                    Value::String(ref s) => serde_json::from_str(s).map_err(|_| unresolved())?,
                    other => other,
                };
                current = structured.pointer(rest).cloned().ok_or_else(unresolved)?;
                rest = "";
            }
        }

        match current {
            Value::Null => Err(unresolved()),
            Value::String(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }
}

/// Field of an object, matching keys case-insensitively as a fallback.
fn child(value: &Value, key: &str) -> Option<Value> {
    let object = value.as_object()?;
    object
        .get(key)
        .or_else(|| {
            object
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
        .cloned()
}

/// Expression renderer with a function registry.
#[derive(Clone)]
pub struct TemplateEngine {
    functions: HashMap<String, TemplateFunction>,
}

impl TemplateEngine {
    /// Create an engine with the built-in functions registered.
    pub fn new() -> Self {
        let mut engine = Self {
            functions: HashMap::new(),
        };

        engine.register("now", now_fn);
        engine.register("timestamp", |_| Ok(chrono::Utc::now().timestamp().to_string()));
        engine.register("uuid", |_| Ok(uuid_v4()));
        engine.register("randomInt", random_int_fn);
        engine.register("randomString", random_string_fn);
        engine.register("randomBoolean", |_| Ok(rand::thread_rng().gen::<bool>().to_string()));
        engine.register("upper", |args| Ok(first_arg(args, "upper")?.to_uppercase()));
        engine.register("lower", |args| Ok(first_arg(args, "lower")?.to_lowercase()));
        engine.register("base64", |args| {
            Ok(base64::engine::general_purpose::STANDARD.encode(first_arg(args, "base64")?))
        });
        engine.register("default", default_fn);

        engine
    }

    /// Register (or replace) a function.
    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&[Option<String>]) -> Result<String, TemplateError> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
    }

    /// Render `template`. Unresolvable expressions are kept verbatim.
    pub fn render(&self, template: &str, ctx: &EvalContext) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            let end = start + 2 + len + 2;
            out.push_str(&rest[..start]);

            let expression = &rest[start + 2..end - 2];
            match self.evaluate(expression, ctx) {
                Ok(value) => out.push_str(&value),
                Err(e) => {
                    debug!(expression = %expression.trim(), error = %e, "Expression left unrendered");
                    out.push_str(&rest[start..end]);
                }
            }
            rest = &rest[end..];
        }

        out.push_str(rest);
        out
    }

    /// Evaluate a single expression (the text between the delimiters).
    pub fn evaluate(&self, expression: &str, ctx: &EvalContext) -> Result<String, TemplateError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(TemplateError::Syntax(expression.to_string()));
        }
        if let Some(literal) = unquote(expression) {
            return Ok(literal.to_string());
        }

        match call_regex().captures(expression) {
            Some(caps) => {
                let name = &caps[1];
                let function = self
                    .functions
                    .get(name)
                    .ok_or_else(|| TemplateError::UnknownFunction(name.to_string()))?;
                let args: Vec<Option<String>> = split_args(&caps[2])
                    .into_iter()
                    .map(|arg| evaluate_arg(arg, ctx))
                    .collect();
                function(&args)
            }
            None => ctx.lookup(expression),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn call_regex() -> &'static Regex {
    static CALL: OnceLock<Regex> = OnceLock::new();
    CALL.get_or_init(|| {
        Regex::new(r"(?s)^([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)$").expect("call pattern is valid")
    })
}

fn unquote(arg: &str) -> Option<&str> {
    let quoted = arg.len() >= 2
        && ((arg.starts_with('\'') && arg.ends_with('\'')) || (arg.starts_with('"') && arg.ends_with('"')));
    quoted.then(|| &arg[1..arg.len() - 1])
}

/// Split on top-level commas; quotes and brackets protect their content.
fn split_args(raw: &str) -> Vec<&str> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in raw.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[' | '(') => depth += 1,
            (None, ']' | ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                args.push(raw[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    args.push(raw[start..].trim());
    args
}

/// Quoted arguments are literals; an unquoted argument is a variable
/// reference when its root name is bound and a literal otherwise.
fn evaluate_arg(arg: &str, ctx: &EvalContext) -> Option<String> {
    if let Some(literal) = unquote(arg) {
        return Some(literal.to_string());
    }
    let root_end = arg.find(['.', '[', '/']).unwrap_or(arg.len());
    if ctx.is_bound(&arg[..root_end]) {
        ctx.lookup(arg).ok()
    } else {
        Some(arg.to_string())
    }
}

fn first_arg(args: &[Option<String>], function: &str) -> Result<String, TemplateError> {
    match args.first() {
        Some(Some(value)) => Ok(value.clone()),
        Some(None) => Err(TemplateError::BadArgument {
            function: function.to_string(),
            message: "argument did not resolve".to_string(),
        }),
        None => Err(TemplateError::BadArgument {
            function: function.to_string(),
            message: "missing argument".to_string(),
        }),
    }
}

fn default_fn(args: &[Option<String>]) -> Result<String, TemplateError> {
    let fallback = args.get(1).cloned().flatten().unwrap_or_default();
    match args.first() {
        Some(Some(value)) if !value.is_empty() => Ok(value.clone()),
        _ => Ok(fallback),
    }
}

/// `now()` is epoch milliseconds; `now(pattern)` is local time formatted
/// with date pattern letters (`dd/MM/yyyy HH:mm:ss`).
fn now_fn(args: &[Option<String>]) -> Result<String, TemplateError> {
    match args.first() {
        None => Ok(chrono::Utc::now().timestamp_millis().to_string()),
        Some(None) => Err(TemplateError::BadArgument {
            function: "now".to_string(),
            message: "pattern did not resolve".to_string(),
        }),
        Some(Some(pattern)) => {
            let format = date_pattern_to_strftime(pattern).map_err(|message| TemplateError::BadArgument {
                function: "now".to_string(),
                message,
            })?;
            Ok(chrono::Local::now().format(&format).to_string())
        }
    }
}

/// Convert date pattern letters to a chrono format string.
pub fn date_pattern_to_strftime(pattern: &str) -> Result<String, String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            // Quoted literal; '' is an escaped quote.
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
                continue;
            }
            let mut j = i + 1;
            while j < chars.len() && chars[j] != '\'' {
                push_literal(&mut out, chars[j]);
                j += 1;
            }
            if j == chars.len() {
                return Err(format!("unterminated quote in '{}'", pattern));
            }
            i = j + 1;
            continue;
        }
        if !c.is_ascii_alphabetic() {
            push_literal(&mut out, c);
            i += 1;
            continue;
        }

        let mut run = 1;
        while chars.get(i + run) == Some(&c) {
            run += 1;
        }
        let spec = match (c, run) {
            ('y', 2) => "%y",
            ('y', _) => "%Y",
            ('M', 1) => "%-m",
            ('M', 2) => "%m",
            ('M', 3) => "%b",
            ('M', _) => "%B",
            ('d', 1) => "%-d",
            ('d', _) => "%d",
            ('H', 1) => "%-H",
            ('H', _) => "%H",
            ('h', 1) => "%-I",
            ('h', _) => "%I",
            ('m', 1) => "%-M",
            ('m', _) => "%M",
            ('s', 1) => "%-S",
            ('s', _) => "%S",
            ('S', 1..=3) => "%3f",
            ('S', 4..=6) => "%6f",
            ('S', _) => "%9f",
            ('a', _) => "%p",
            ('E', 1..=3) => "%a",
            ('E', _) => "%A",
            ('D', _) => "%j",
            ('Z', _) => "%z",
            ('X', _) => "%:z",
            ('z', _) => "%Z",
            _ => return Err(format!("illegal pattern letter '{}'", c)),
        };
        out.push_str(spec);
        i += run;
    }
    Ok(out)
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}

fn uuid_v4() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffff_ffff_ffff,
    )
}

fn parse_arg<T: std::str::FromStr>(
    args: &[Option<String>],
    index: usize,
    default: T,
    function: &str,
) -> Result<T, TemplateError> {
    match args.get(index) {
        None => Ok(default),
        Some(Some(raw)) => raw.trim().parse().map_err(|_| TemplateError::BadArgument {
            function: function.to_string(),
            message: format!("'{}' is not a number", raw),
        }),
        Some(None) => Err(TemplateError::BadArgument {
            function: function.to_string(),
            message: "argument did not resolve".to_string(),
        }),
    }
}

fn random_int_fn(args: &[Option<String>]) -> Result<String, TemplateError> {
    let min: i64 = parse_arg(args, 0, 0, "randomInt")?;
    let max: i64 = parse_arg(args, 1, 100, "randomInt")?;
    if min > max {
        return Err(TemplateError::BadArgument {
            function: "randomInt".to_string(),
            message: format!("min {} is greater than max {}", min, max),
        });
    }
    Ok(rand::thread_rng().gen_range(min..=max).to_string())
}

fn random_string_fn(args: &[Option<String>]) -> Result<String, TemplateError> {
    let len: usize = parse_arg(args, 0, 32, "randomString")?;
    Ok(rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_ctx() -> EvalContext {
        let mut request = EvaluableRequest::new(
            Some(r#"{"customer": {"name": "Laurent", "tags": ["a", "b"]}}"#),
            &[("id", "42"), ("name", "Laurent")],
        );
        request.method = "POST".to_string();
        request.path = "/orders/42".to_string();
        request.headers.insert("X-Trace-Id".to_string(), "abc".to_string());
        EvalContext::with_request(&request)
    }

    #[test]
    fn test_simple_template() {
        let engine = TemplateEngine::new();
        let request = EvaluableRequest::new(Some("hello world!"), &[("name", "Laurent")]);
        let ctx = EvalContext::with_request(&request);

        let result = engine.render("Today is {{ now(dd/MM/yyyy) }} and {{ request.body }}", &ctx);

        let today = chrono::Local::now().format("%d/%m/%Y").to_string();
        assert_eq!(result, format!("Today is {} and hello world!", today));
    }

    #[test]
    fn test_contextless_template() {
        let engine = TemplateEngine::new();
        let template = "{\"signedAt\": \"{{ now() }}\", \"fullName\": \"Laurent Broudoux\", \"email\": \"laurent@microcks.io\", \"age\": 41} \n";

        let content = engine.render(template, &EvalContext::new());
        assert!(content.starts_with("{\"signedAt\": \"1"));
        assert!(content.ends_with("\"age\": 41} \n"));
    }

    #[test]
    fn test_unresolved_expression_kept_verbatim() {
        let engine = TemplateEngine::new();
        let result = engine.render("A {{ request.body }} B {{ nope() }} C {{ upper('x') }}", &EvalContext::new());
        assert_eq!(result, "A {{ request.body }} B {{ nope() }} C X");
    }

    #[test]
    fn test_unbalanced_delimiters_are_literal() {
        let engine = TemplateEngine::new();
        assert_eq!(engine.render("{{ upper('a') }} and {{ open", &EvalContext::new()), "A and {{ open");
        assert_eq!(engine.render("no templates }}", &EvalContext::new()), "no templates }}");
    }

    #[test]
    fn test_request_accessors() {
        let engine = TemplateEngine::new();
        let ctx = request_ctx();
        assert_eq!(engine.render("{{request.method}} {{ request.path }}", &ctx), "POST /orders/42");
        assert_eq!(engine.render("{{ request.params[id] }}", &ctx), "42");
        assert_eq!(engine.render("{{ request.headers['x-trace-id'] }}", &ctx), "abc");
        assert_eq!(engine.render("{{ request.body/customer/name }}", &ctx), "Laurent");
        assert_eq!(engine.render("{{ request.body/customer/tags }}", &ctx), r#"["a","b"]"#);
        assert_eq!(
            engine.render("{{ request.params[missing] }}", &ctx),
            "{{ request.params[missing] }}"
        );
    }

    #[test]
    fn test_string_functions() {
        let engine = TemplateEngine::new();
        let ctx = request_ctx();
        assert_eq!(engine.render("{{ upper(request.params[name]) }}", &ctx), "LAURENT");
        assert_eq!(engine.render("{{ lower('MiXeD') }}", &ctx), "mixed");
        assert_eq!(engine.render("{{ base64('hello') }}", &ctx), "aGVsbG8=");
        assert_eq!(engine.render("{{ default(request.params[missing], 'anon') }}", &ctx), "anon");
        assert_eq!(engine.render("{{ default(request.params[id], 'anon') }}", &ctx), "42");
    }

    #[test]
    fn test_random_functions() {
        let engine = TemplateEngine::new();
        let ctx = EvalContext::new();

        let uuid = engine.render("{{ uuid() }}", &ctx);
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.chars().nth(14), Some('4'));

        for _ in 0..20 {
            let n: i64 = engine.render("{{ randomInt(5, 7) }}", &ctx).parse().unwrap();
            assert!((5..=7).contains(&n));
        }
        assert_eq!(engine.render("{{ randomString(12) }}", &ctx).len(), 12);
        let b = engine.render("{{ randomBoolean() }}", &ctx);
        assert!(b == "true" || b == "false");
        assert_eq!(engine.render("{{ randomInt(9, 1) }}", &ctx), "{{ randomInt(9, 1) }}");
    }

    #[test]
    fn test_date_pattern_conversion() {
        assert_eq!(date_pattern_to_strftime("dd/MM/yyyy").unwrap(), "%d/%m/%Y");
        assert_eq!(
            date_pattern_to_strftime("yyyy-MM-dd'T'HH:mm:ss.SSS").unwrap(),
            "%Y-%m-%dT%H:%M:%S.%3f"
        );
        assert_eq!(date_pattern_to_strftime("EEE, d MMM yy '%'").unwrap(), "%a, %-d %b %y %%");
        assert!(date_pattern_to_strftime("qq").is_err());
        assert!(date_pattern_to_strftime("'open").is_err());
    }

    #[test]
    fn test_fraction_width_follows_run_length() {
        assert_eq!(date_pattern_to_strftime("ss.S").unwrap(), "%S.%3f");
        assert_eq!(date_pattern_to_strftime("ss.SSSSSS").unwrap(), "%S.%6f");
        assert_eq!(date_pattern_to_strftime("ss.SSSSSSSSS").unwrap(), "%S.%9f");

        let engine = TemplateEngine::new();
        let rendered = engine.render("{{ now(SSSSSS) }}", &EvalContext::new());
        assert_eq!(rendered.len(), 6);
        assert!(rendered.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_quoted_pattern_with_comma() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{ now('yyyy, MM') }}", &EvalContext::new());
        assert_eq!(result, chrono::Local::now().format("%Y, %m").to_string());
    }

    #[test]
    fn test_custom_function_and_variable() {
        let mut engine = TemplateEngine::new();
        engine.register("greet", |args| Ok(format!("hi {}", first_arg(args, "greet")?)));

        let mut ctx = EvalContext::new();
        ctx.set_variable("user", json!({"name": "ada"}));
        assert_eq!(engine.render("{{ greet(user.name) }}!", &ctx), "hi ada!");
        assert_eq!(engine.render("{{ greet(bob) }}", &ctx), "hi bob");
    }
}
