//! Schema-driven extraction over JSON and HTML responses.
//!
//! JSON is tried first: a response that declares a JSON content type, or
//! declares none and looks like JSON, is decoded and its item array returned
//! as-is. Anything else (including JSON that fails to decode) is parsed as
//! HTML and walked with the schema's CSS selectors.

use rebound_core::error::AppError;
use rebound_core::models::{
    ExtractedItem, Extraction, ExtractionSchema, ExtractionSource, FetchResult,
};
use rebound_core::traits::Extractor;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

const ATTR_PREFIX: &str = "attr:";

/// Keys probed, in order, for the item array of a JSON object payload.
const JSON_ITEM_KEYS: &[&str] = &["items", "results"];

/// Extractor backed by `serde_json` and `scraper`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectorExtractor;

impl SelectorExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Extractor for SelectorExtractor {
    fn extract(
        &self,
        result: &FetchResult,
        schema: &ExtractionSchema,
    ) -> Result<Extraction, AppError> {
        if looks_like_json(result) {
            match serde_json::from_slice::<Value>(&result.body) {
                Ok(value) => {
                    let items = json_items(value);
                    tracing::debug!(items = items.len(), "Extracted structured items");
                    return Ok(Extraction {
                        source: ExtractionSource::Structured,
                        items,
                        status_code: result.status,
                    });
                }
                Err(e) => {
                    tracing::debug!(error = %e, "JSON decode failed, falling back to HTML");
                }
            }
        }

        extract_html(&result.text(), schema, result.status)
    }
}

/// Run the HTML path over already-obtained markup.
///
/// Without a `list_selector` there are no containers and the result is
/// empty. Each container yields one object with every schema field present,
/// `null` where a sub-selector matched nothing.
pub fn extract_html(
    html: &str,
    schema: &ExtractionSchema,
    status_code: u16,
) -> Result<Extraction, AppError> {
    let empty = || Extraction {
        source: ExtractionSource::Semistructured,
        items: Vec::new(),
        status_code,
    };

    let Some(list_selector) = schema.list_selector.as_deref() else {
        return Ok(empty());
    };
    let list_selector = parse_selector(list_selector)?;
    let fields = compile_fields(schema)?;

    let document = Html::parse_document(html);
    let items: Vec<Value> = document
        .select(&list_selector)
        .map(|container| {
            let item: ExtractedItem = fields
                .iter()
                .map(|(name, field)| (name.to_string(), field.evaluate(container)))
                .collect();
            Value::Object(item)
        })
        .collect();

    tracing::debug!(items = items.len(), "Extracted semi-structured items");
    Ok(Extraction {
        items,
        ..empty()
    })
}

enum FieldExpr {
    /// Attribute of the container element itself.
    Attr(String),
    /// First descendant matching the selector.
    Select(Selector),
}

impl FieldExpr {
    fn evaluate(&self, container: ElementRef<'_>) -> Value {
        match self {
            FieldExpr::Attr(name) => container
                .value()
                .attr(name)
                .map_or(Value::Null, |v| Value::String(v.to_string())),
            FieldExpr::Select(selector) => container
                .select(selector)
                .next()
                .map_or(Value::Null, |el| Value::String(element_value(el))),
        }
    }
}

fn compile_fields(schema: &ExtractionSchema) -> Result<Vec<(&str, FieldExpr)>, AppError> {
    schema
        .fields
        .iter()
        .map(|(name, expr)| {
            let expr = expr.trim();
            let field = match expr.strip_prefix(ATTR_PREFIX) {
                Some(attr) => FieldExpr::Attr(attr.trim().to_string()),
                None => FieldExpr::Select(parse_selector(expr)?),
            };
            Ok((name.as_str(), field))
        })
        .collect()
}

fn parse_selector(raw: &str) -> Result<Selector, AppError> {
    Selector::parse(raw).map_err(|e| AppError::ParseError(format!("Invalid selector '{raw}': {e}")))
}

/// Image source, then link target, then trimmed text.
fn element_value(el: ElementRef<'_>) -> String {
    let element = el.value();
    if element.name() == "img"
        && let Some(src) = element.attr("src").filter(|s| !s.is_empty())
    {
        return src.to_string();
    }
    if let Some(href) = element.attr("href").filter(|h| !h.is_empty()) {
        return href.to_string();
    }
    el.text().collect::<String>().trim().to_string()
}

fn looks_like_json(result: &FetchResult) -> bool {
    match result.content_type() {
        Some(ct) => is_json_content_type(&ct),
        None => matches!(
            result.body.iter().find(|b| !b.is_ascii_whitespace()),
            Some(b'{') | Some(b'[')
        ),
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    content_type.contains("application/json")
        || content_type.contains("text/json")
        || content_type.contains("+json")
        || content_type.contains("charset=json")
}

fn json_items(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => JSON_ITEM_KEYS
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) if !items.is_empty() => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}
