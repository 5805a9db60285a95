use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::{AppError, AppResult};
use crate::knowledge::WIKIPEDIA_NOT_FOUND;

const DESCRIPTION_CHARS: usize = 80;
const DETAIL_CHARS: usize = 100;
const SUMMARY_CHARS: usize = 150;
const LABEL_CHARS: usize = 60;
const WEB_RESULTS_SHOWN: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MindMap {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: String,
}

pub fn sanitize_mermaid_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '(' | ')' | '{' | '}' | '[' | ']' => {
                out.push('\\');
                out.push(ch);
            }
            '"' => out.push_str("&quot;"),
            '#' => {}
            _ => out.push(ch),
        }
    }
    out.trim().to_string()
}

fn prefix(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn str_field<'a>(place: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    place.get(key).and_then(Value::as_str)
}

fn array_field<'a>(place: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    place
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

/// Renders `place_data` as a mermaid `mindmap`. Interests are listed only when they
/// appear in the description, details or summary text.
pub fn generate_mind_map(place_data: &Value, interests: &[String]) -> AppResult<MindMap> {
    let place = match place_data {
        Value::Object(place) if !place.get("error").is_some_and(is_truthy) => place,
        _ => {
            return Err(AppError::Validation(
                "Cannot generate a scheme from invalid place data".into(),
            ))
        }
    };

    let title = str_field(place, "title").unwrap_or("Location");
    let confidence = str_field(place, "ai_confidence").unwrap_or("Unknown");
    let description = str_field(place, "description").unwrap_or_default();
    let summary = str_field(place, "wikipedia_summary").unwrap_or_default();
    let details = array_field(place, "details");

    let mut lines = Vec::new();
    lines.push("mindmap".to_string());
    lines.push(format!("  root(({}))", sanitize_mermaid_text(title)));
    lines.push(format!("    (AI Confidence: {})", sanitize_mermaid_text(confidence)));

    if !description.is_empty() {
        lines.push(format!(
            "    (Desc: {}...)",
            sanitize_mermaid_text(&prefix(description, DESCRIPTION_CHARS))
        ));
    }

    if !details.is_empty() {
        lines.push("    ::icon(fa fa-list-ul) Key Details".to_string());
        for detail in details.iter().filter_map(Value::as_str) {
            if !detail.trim().is_empty() {
                lines.push(format!(
                    "      - {}",
                    sanitize_mermaid_text(&prefix(detail, DETAIL_CHARS))
                ));
            }
        }
    }

    if !summary.is_empty() && summary != WIKIPEDIA_NOT_FOUND {
        lines.push("    ::icon(fa fa-wikipedia-w) Wikipedia Summary".to_string());
        lines.push(format!(
            "      ... {} ...",
            sanitize_mermaid_text(&prefix(summary, SUMMARY_CHARS))
        ));
    }

    let web_results = array_field(place, "web_results");
    if !web_results.is_empty() {
        lines.push("    ::icon(fa fa-globe) Web Results".to_string());
        for result in web_results.iter().take(WEB_RESULTS_SHOWN) {
            let title = result
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("No title");
            lines.push(format!(
                "      > {}...",
                sanitize_mermaid_text(&prefix(title, LABEL_CHARS))
            ));
        }
    }

    let mut haystack = String::from(description);
    for detail in details {
        haystack.push(' ');
        match detail {
            Value::String(s) => haystack.push_str(s),
            other => haystack.push_str(&other.to_string()),
        }
    }
    haystack.push(' ');
    haystack.push_str(summary);
    let haystack = haystack.to_lowercase();

    let related: Vec<&String> = interests
        .iter()
        .filter(|interest| haystack.contains(&interest.to_lowercase()))
        .collect();
    if !related.is_empty() {
        lines.push("    ::icon(fa fa-star) Related User Interests".to_string());
        for interest in related {
            lines.push(format!("      * {}", sanitize_mermaid_text(&capitalize(interest))));
        }
    }

    let sources: Vec<&str> = array_field(place, "sources")
        .iter()
        .filter_map(Value::as_str)
        .filter(|s| !s.trim().is_empty() && *s != "N/A")
        .collect();
    if !sources.is_empty() {
        lines.push("    ::icon(fa fa-link) Sources".to_string());
        for source in sources {
            lines.push(format!("      > {}", source_label(source)));
        }
    }

    Ok(MindMap {
        kind: "mermaid_mindmap",
        data: lines.join("\n"),
    })
}

fn source_label(source: &str) -> String {
    let is_link = source.starts_with("http://") || source.starts_with("https://");
    match source.split('/').nth(2).filter(|_| is_link) {
        Some(domain) => format!(
            r#"<a href="{}" target="_blank">{}</a>"#,
            source.replace('"', "&quot;"),
            sanitize_mermaid_text(domain)
        ),
        None => format!("{}...", sanitize_mermaid_text(&prefix(source, LABEL_CHARS))),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}
