//! Partition path resolution.
//!
//! The output sub-path for a session is derived from a small template
//! dialect: single-quoted literals, a `date()` token and `payload.<field>`
//! references, joined with `+`. The template is parsed once at startup into
//! tagged tokens and evaluated against a single sample record at session
//! open time. It is not a general expression evaluator.
//!
//! Resolution never fails: a missing field, a null value or an unparsable
//! sample substitutes the literal `unknown` for that reference only.

use chrono::NaiveDate;
use serde_json::Value;

use crate::contracts::SinkError;

/// Fallback substituted for an unresolvable field reference.
pub const UNKNOWN_SEGMENT: &str = "unknown";

/// Canonical driver identifier field; values carry a fixed prefix upstream.
const DRIVER_ID_FIELD: &str = "driver_id";
const DRIVER_ID_PREFIX: &str = "DRIVER-";

/// One parsed template segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A quoted literal, emitted verbatim.
    Literal(String),
    /// `date()`: today's date, ISO 8601.
    Date,
    /// `payload.<field>`: a top-level field of the sample record.
    FieldRef(String),
}

/// A parsed partition path template.
///
/// An empty template resolves to the default `date=<today>` layout.
#[derive(Debug, Clone, Default)]
pub struct PartitionTemplate {
    tokens: Vec<Token>,
}

impl PartitionTemplate {
    /// Parses a template string into tokens.
    ///
    /// Segments are separated by `+` outside quotes. Unknown segment forms
    /// are a configuration error, rejected at startup.
    pub fn parse(template: &str) -> Result<Self, SinkError> {
        let template = template.trim();
        if template.is_empty() {
            return Ok(Self::default());
        }

        let mut tokens = Vec::new();
        for segment in split_segments(template)? {
            let segment = segment.trim();
            if segment.is_empty() {
                return Err(SinkError::Config(
                    "partition template has an empty segment".into(),
                ));
            }
            if let Some(inner) = segment.strip_prefix('\'') {
                let inner = inner.strip_suffix('\'').ok_or_else(|| {
                    SinkError::Config(format!("unterminated literal in segment `{}`", segment))
                })?;
                tokens.push(Token::Literal(inner.to_string()));
            } else if segment == "date()" {
                tokens.push(Token::Date);
            } else if let Some(field) = segment.strip_prefix("payload.") {
                if field.is_empty() || !field.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    return Err(SinkError::Config(format!(
                        "invalid field reference `{}`",
                        segment
                    )));
                }
                tokens.push(Token::FieldRef(field.to_string()));
            } else {
                return Err(SinkError::Config(format!(
                    "unsupported template segment `{}` (expected 'literal', date() or payload.<field>)",
                    segment
                )));
            }
        }

        Ok(Self { tokens })
    }

    /// True when the template was empty and the default date layout applies.
    pub fn is_default(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Resolves the template against a sample record for the given date.
    ///
    /// The sample is parsed as JSON at most once, and only when the template
    /// contains field references.
    pub fn resolve(&self, sample: &[u8], today: NaiveDate) -> String {
        let date = today.format("%Y-%m-%d");
        if self.tokens.is_empty() {
            return format!("date={}", date);
        }

        let parsed: Option<Value> = if self.tokens.iter().any(|t| matches!(t, Token::FieldRef(_))) {
            match serde_json::from_slice(sample) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(error = %e, "sample record is not valid JSON, using unknown for field references");
                    None
                }
            }
        } else {
            None
        };

        let mut path = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => path.push_str(text),
                Token::Date => path.push_str(&date.to_string()),
                Token::FieldRef(field) => path.push_str(&resolve_field(parsed.as_ref(), field)),
            }
        }
        path
    }
}

fn resolve_field(parsed: Option<&Value>, field: &str) -> String {
    let value = match parsed.and_then(|v| v.get(field)) {
        Some(Value::Null) | None => {
            tracing::debug!(field, "field missing or null in sample, using unknown");
            return UNKNOWN_SEGMENT.to_string();
        }
        Some(value) => value,
    };

    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if field == DRIVER_ID_FIELD {
        if let Some(stripped) = text.strip_prefix(DRIVER_ID_PREFIX) {
            return stripped.to_string();
        }
    }
    text
}

/// Splits on `+` outside single quotes.
fn split_segments(template: &str) -> Result<Vec<&str>, SinkError> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut in_quote = false;
    for (i, c) in template.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '+' if !in_quote => {
                segments.push(&template[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_quote {
        return Err(SinkError::Config(
            "unterminated quote in partition template".into(),
        ));
    }
    segments.push(&template[start..]);
    Ok(segments)
}
