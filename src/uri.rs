//! URI templating shared by dispatching and test runners.
//!
//! Path patterns mark variable parts either as `{name}` or as `/:name`.
//! Both forms are recognized everywhere so a stored example and a runtime
//! request always see the same templated representation of a path.

use crate::model::Parameter;
use std::collections::BTreeMap;

/// Instantiate `pattern` with `parameters`.
///
/// Parameters naming a path variable are substituted in place using path
/// encoding. All others are appended as query arguments using form
/// encoding, in the order given.
pub fn instantiate(pattern: &str, parameters: &[Parameter]) -> String {
    let mut uri = pattern.to_string();
    let mut query = String::new();

    for param in parameters {
        let brace_form = format!("{{{}}}", param.name);
        let colon_form = format!("/:{}", param.name);

        if uri.contains(&brace_form) {
            uri = uri.replace(&brace_form, &encode_path(&param.value));
        } else if let Some(pos) = find_colon_variable(&uri, &colon_form) {
            let start = pos + 1;
            let end = start + param.name.len() + 1;
            uri.replace_range(start..end, &encode_path(&param.value));
        } else {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&encode_query(&param.name));
            query.push('=');
            query.push_str(&encode_query(&param.value));
        }
    }

    if !query.is_empty() {
        if !uri.contains('?') {
            uri.push('?');
        } else if !uri.ends_with('?') && !uri.ends_with('&') {
            uri.push('&');
        }
        uri.push_str(&query);
    }
    uri
}

/// Locate `/:name` where the variable name is not the prefix of a longer one.
fn find_colon_variable(uri: &str, colon_form: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(found) = uri[offset..].find(colon_form) {
        let pos = offset + found;
        let after = pos + colon_form.len();
        match uri[after..].chars().next() {
            Some(c) if is_name_char(c) => offset = after,
            _ => return Some(pos),
        }
    }
    None
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Whether `pattern` contains at least one variable part.
pub fn has_variables(pattern: &str) -> bool {
    pattern.contains("/:") || pattern.contains("/{") || pattern.starts_with('{')
}

/// Variable names of `pattern`, in order of appearance.
pub fn variable_names(pattern: &str) -> Vec<String> {
    PathTemplate::parse(pattern)
        .segments
        .into_iter()
        .filter_map(|s| match s {
            TemplateSegment::Param(name) => Some(name),
            TemplateSegment::Literal(_) => None,
        })
        .collect()
}

/// Extract variable values from `path` according to `pattern`.
///
/// Returns `None` when the path does not have the pattern's shape. An empty
/// segment where a variable is expected yields an empty value, which is
/// distinct from the variable being absent.
pub fn extract_variables(pattern: &str, path: &str) -> Option<BTreeMap<String, String>> {
    PathTemplate::parse(pattern).matches(path)
}

/// Percent-encode a value for use inside a path.
///
/// Unreserved characters, sub-delimiters, `:`, `@` and `/` are kept.
pub fn encode_path(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if is_path_char(byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

fn is_path_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'-' | b'.' | b'_' | b'~' | b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+'
                | b',' | b';' | b'=' | b':' | b'@' | b'/'
        )
}

/// Form-encode a query name or value (space becomes `+`).
pub fn encode_query(value: &str) -> String {
    urlencoding::encode(value).replace("%20", "+")
}

/// Decode a form-encoded query component.
pub fn decode_query(value: &str) -> String {
    let spaced = value.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|v| v.into_owned())
        .unwrap_or(spaced)
}

/// Parse a query string into parameters, preserving order.
pub fn parse_query_string(query: &str) -> Vec<Parameter> {
    let query = query.strip_prefix('?').unwrap_or(query);
    let mut params = Vec::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((key, value)) => params.push(Parameter::new(decode_query(key), decode_query(value))),
            None => params.push(Parameter::new(decode_query(part), "")),
        }
    }

    params
}

struct PathTemplate {
    segments: Vec<TemplateSegment>,
}

enum TemplateSegment {
    Literal(String),
    Param(String),
}

impl PathTemplate {
    fn parse(template: &str) -> Self {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut chars = template.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if closed && !name.is_empty() {
                        if !current.is_empty() {
                            segments.push(TemplateSegment::Literal(std::mem::take(&mut current)));
                        }
                        segments.push(TemplateSegment::Param(name));
                    } else {
                        current.push('{');
                        current.push_str(&name);
                    }
                }
                '/' if chars.peek() == Some(&':') => {
                    chars.next();
                    current.push('/');
                    let mut name = String::new();
                    while let Some(&c) = chars.peek() {
                        if !is_name_char(c) {
                            break;
                        }
                        name.push(c);
                        chars.next();
                    }
                    if name.is_empty() {
                        current.push(':');
                    } else {
                        segments.push(TemplateSegment::Literal(std::mem::take(&mut current)));
                        segments.push(TemplateSegment::Param(name));
                    }
                }
                _ => current.push(ch),
            }
        }

        if !current.is_empty() {
            segments.push(TemplateSegment::Literal(current));
        }

        Self { segments }
    }

    fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let mut params = BTreeMap::new();
        let mut remaining = path;

        for (idx, segment) in self.segments.iter().enumerate() {
            match segment {
                TemplateSegment::Literal(lit) => {
                    remaining = remaining.strip_prefix(lit.as_str())?;
                }
                TemplateSegment::Param(name) => {
                    // A variable never spans a path separator.
                    let segment_end = remaining.find('/').unwrap_or(remaining.len());
                    let end_pos = match self.segments.get(idx + 1) {
                        Some(TemplateSegment::Literal(next_lit)) => remaining[..segment_end]
                            .find(next_lit.as_str())
                            .unwrap_or(segment_end),
                        _ => segment_end,
                    };

                    let value = &remaining[..end_pos];
                    let decoded = urlencoding::decode(value)
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| value.to_string());
                    params.insert(name.clone(), decoded);
                    remaining = &remaining[end_pos..];
                }
            }
        }

        // Must consume entire path
        if remaining.is_empty() {
            Some(params)
        } else {
            None
        }
    }
}
