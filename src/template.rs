//! Record-to-document mapping and `{{field}}` placeholder substitution.

use serde_json::{Map, Value};

use crate::error::TemplateError;
use crate::source::SourceRecord;

/// Document data produced from a record.
pub type DocumentData = Map<String, Value>;

/// Turns a source record into document data.
pub trait FieldMapper: Send + Sync {
    fn map(&self, record: &SourceRecord) -> Result<DocumentData, TemplateError>;
}

/// Renders a template against document data.
pub trait TemplateRenderer: Send + Sync {
    /// Checks that a template can be used at all, before any record is seen.
    fn validate(&self, template: &str) -> Result<(), TemplateError>;

    fn render(&self, template: &str, data: &DocumentData) -> Result<String, TemplateError>;
}

/// Copies record fields into document fields.
///
/// With no rules every record field is passed through unchanged. Each rule
/// copies `source` to `target`; required rules fail when the source field is
/// absent or null.
#[derive(Debug, Clone, Default)]
pub struct FieldMapping {
    rules: Vec<MappingRule>,
}

#[derive(Debug, Clone)]
struct MappingRule {
    target: String,
    source: String,
    required: bool,
}

impl FieldMapping {
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn require(mut self, target: impl Into<String>, source: impl Into<String>) -> Self {
        self.rules.push(MappingRule {
            target: target.into(),
            source: source.into(),
            required: true,
        });
        self
    }

    pub fn optional(mut self, target: impl Into<String>, source: impl Into<String>) -> Self {
        self.rules.push(MappingRule {
            target: target.into(),
            source: source.into(),
            required: false,
        });
        self
    }
}

impl FieldMapper for FieldMapping {
    fn map(&self, record: &SourceRecord) -> Result<DocumentData, TemplateError> {
        let mut data = if self.rules.is_empty() {
            record.fields.clone()
        } else {
            let mut data = Map::new();
            for rule in &self.rules {
                match record.fields.get(&rule.source) {
                    Some(value) if !value.is_null() => {
                        data.insert(rule.target.clone(), value.clone());
                    }
                    _ if rule.required => {
                        return Err(TemplateError::MissingField(rule.source.clone()))
                    }
                    _ => {}
                }
            }
            data
        };
        data.entry("id")
            .or_insert_with(|| Value::String(record.id.clone()));
        Ok(data)
    }
}

/// `{{name}}` substitution. Placeholder names are trimmed; values must be
/// strings, numbers or booleans.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderTemplate;

impl PlaceholderTemplate {
    pub fn new() -> Self {
        Self
    }

    fn walk<F>(template: &str, mut on_placeholder: F) -> Result<String, TemplateError>
    where
        F: FnMut(&str) -> Result<String, TemplateError>,
    {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or(TemplateError::Unterminated(offset + start))?;
            out.push_str(&on_placeholder(after[..end].trim())?);
            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

impl TemplateRenderer for PlaceholderTemplate {
    fn validate(&self, template: &str) -> Result<(), TemplateError> {
        if template.trim().is_empty() {
            return Err(TemplateError::Empty);
        }
        Self::walk(template, |_| Ok(String::new())).map(|_| ())
    }

    fn render(&self, template: &str, data: &DocumentData) -> Result<String, TemplateError> {
        Self::walk(template, |name| match data.get(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(Value::Bool(b)) => Ok(b.to_string()),
            Some(Value::Null) | None => Err(TemplateError::MissingField(name.to_string())),
            Some(_) => Err(TemplateError::NotScalar {
                field: name.to_string(),
            }),
        })
    }
}

/// Makes a rendered filename safe for an archive entry.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, value: Value) -> SourceRecord {
        SourceRecord::new(id, value.as_object().cloned().unwrap())
    }

    #[test]
    fn test_placeholders_are_substituted() {
        let data = FieldMapping::passthrough()
            .map(&record("r1", json!({"client": "Acme", "total": 12.5, "paid": false})))
            .unwrap();

        let out = PlaceholderTemplate
            .render("<text>{{ client }} owes {{total}} (paid: {{paid}}) #{{id}}</text>", &data)
            .unwrap();

        assert_eq!(out, "<text>Acme owes 12.5 (paid: false) #r1</text>");
    }

    #[test]
    fn test_missing_and_structured_values_fail() {
        let data = FieldMapping::passthrough()
            .map(&record("r1", json!({"items": [1, 2]})))
            .unwrap();

        assert_eq!(
            PlaceholderTemplate.render("{{client}}", &data),
            Err(TemplateError::MissingField("client".into()))
        );
        assert_eq!(
            PlaceholderTemplate.render("{{items}}", &data),
            Err(TemplateError::NotScalar {
                field: "items".into()
            })
        );
    }

    #[test]
    fn test_unterminated_placeholder_reports_offset() {
        assert_eq!(
            PlaceholderTemplate.validate("ok {{a}} then {{broken"),
            Err(TemplateError::Unterminated(14))
        );
        assert_eq!(PlaceholderTemplate.validate("   "), Err(TemplateError::Empty));
        assert!(PlaceholderTemplate.validate("<svg>{{x}}</svg>").is_ok());
    }

    #[test]
    fn test_mapping_rules_rename_and_require() {
        let mapping = FieldMapping::default()
            .require("customer", "Client Name")
            .optional("note", "Notes");

        let data = mapping
            .map(&record("r7", json!({"Client Name": "Initech"})))
            .unwrap();
        assert_eq!(data.get("customer"), Some(&json!("Initech")));
        assert_eq!(data.get("note"), None);
        assert_eq!(data.get("id"), Some(&json!("r7")));

        assert_eq!(
            mapping.map(&record("r8", json!({"Client Name": null}))),
            Err(TemplateError::MissingField("Client Name".into()))
        );
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename(" Acme/Q3: draft?.pdf "), "Acme_Q3_ draft_.pdf");
        assert_eq!(sanitize_filename("..hidden"), "hidden");
    }
}
