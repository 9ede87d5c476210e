//! Notification message templates

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::types::Action;

type RenderFn = dyn Fn(&Value) -> Result<String, String> + Send + Sync;

/// How to turn a change payload into a message
#[derive(Clone)]
pub enum MessageTemplate {
    /// Text with `{field.path}` placeholders. `{{` and `}}` are literal braces,
    /// numeric path segments index into arrays.
    Pattern(String),
    /// Arbitrary rendering; an `Err` is treated like a malformed payload
    Custom(Arc<RenderFn>),
}

impl MessageTemplate {
    pub fn pattern(pattern: impl Into<String>) -> Self {
        MessageTemplate::Pattern(pattern.into())
    }

    pub fn custom<F>(render: F) -> Self
    where
        F: Fn(&Value) -> Result<String, String> + Send + Sync + 'static,
    {
        MessageTemplate::Custom(Arc::new(render))
    }

    pub fn render(&self, payload: &Value) -> SyncResult<String> {
        let rendered = match self {
            MessageTemplate::Pattern(pattern) => render_pattern(pattern, payload),
            MessageTemplate::Custom(render) => render(payload),
        };
        rendered.map_err(SyncError::PayloadMalformed)
    }
}

impl fmt::Debug for MessageTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageTemplate::Pattern(p) => f.debug_tuple("Pattern").field(p).finish(),
            MessageTemplate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<&str> for MessageTemplate {
    fn from(pattern: &str) -> Self {
        MessageTemplate::pattern(pattern)
    }
}

impl From<String> for MessageTemplate {
    fn from(pattern: String) -> Self {
        MessageTemplate::Pattern(pattern)
    }
}

/// Per-action templates for one binding. Actions without a template
/// produce no notification.
#[derive(Debug, Clone, Default)]
pub struct NotifyTemplates {
    create: Option<MessageTemplate>,
    update: Option<MessageTemplate>,
    delete: Option<MessageTemplate>,
}

impl NotifyTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    /// `"{id} created in <kind>"` and friends
    pub fn defaults_for(resource_kind: &str) -> Self {
        let kind = resource_kind.replace('{', "{{").replace('}', "}}");
        Self::new()
            .on(Action::Create, format!("{{id}} created in {}", kind))
            .on(Action::Update, format!("{{id}} updated in {}", kind))
            .on(Action::Delete, format!("{{id}} deleted in {}", kind))
    }

    pub fn on(mut self, action: Action, template: impl Into<MessageTemplate>) -> Self {
        let slot = match action {
            Action::Create => &mut self.create,
            Action::Update => &mut self.update,
            Action::Delete => &mut self.delete,
        };
        *slot = Some(template.into());
        self
    }

    pub fn for_action(&self, action: Action) -> Option<&MessageTemplate> {
        match action {
            Action::Create => self.create.as_ref(),
            Action::Update => self.update.as_ref(),
            Action::Delete => self.delete.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_none() && self.update.is_none() && self.delete.is_none()
    }
}

fn render_pattern(pattern: &str, payload: &Value) -> Result<String, String> {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut path = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => path.push(ch),
                        None => return Err(format!("unclosed placeholder in {:?}", pattern)),
                    }
                }
                out.push_str(&lookup(payload, path.trim())?);
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(format!("unmatched '}}' in {:?}", pattern)),
            other => out.push(other),
        }
    }

    Ok(out)
}

/// Resolve a dotted path to a scalar rendered as text
fn lookup(payload: &Value, path: &str) -> Result<String, String> {
    if path.is_empty() {
        return Err("empty placeholder".to_string());
    }

    let mut current = payload;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| format!("missing field `{}`", path))?;
    }

    match current {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Err(format!("field `{}` is null", path)),
        Value::Array(_) | Value::Object(_) => Err(format!("field `{}` is not a scalar", path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(pattern: &str, payload: Value) -> SyncResult<String> {
        MessageTemplate::pattern(pattern).render(&payload)
    }

    #[test]
    fn test_nested_and_indexed_paths() {
        let payload = json!({
            "id": 7,
            "title": "Broken login",
            "assignee": {"name": "Kim"},
            "tags": ["auth", "urgent"],
            "open": true
        });
        assert_eq!(
            render("#{id} {title} ({assignee.name}, {tags.1}, open={open})", payload).unwrap(),
            "#7 Broken login (Kim, urgent, open=true)"
        );
    }

    #[test]
    fn test_escaped_braces() {
        assert_eq!(
            render("{{literal}} {id}}}", json!({"id": 1})).unwrap(),
            "{literal} 1}"
        );
    }

    #[test]
    fn test_missing_null_and_nested_values_fail() {
        let payload = json!({"id": null, "meta": {"a": 1}, "list": [1]});
        for pattern in ["{title}", "{id}", "{meta}", "{list.3}", "{list.x}", "{}"] {
            assert!(
                matches!(render(pattern, payload.clone()), Err(SyncError::PayloadMalformed(_))),
                "{} should fail",
                pattern
            );
        }
    }

    #[test]
    fn test_malformed_pattern_fails() {
        assert!(render("{id", json!({"id": 1})).is_err());
        assert!(render("id}", json!({"id": 1})).is_err());
    }

    #[test]
    fn test_custom_template() {
        let template = MessageTemplate::custom(|payload| {
            payload
                .get("count")
                .and_then(Value::as_u64)
                .map(|n| format!("{} items", n))
                .ok_or_else(|| "no count".to_string())
        });
        assert_eq!(template.render(&json!({"count": 3})).unwrap(), "3 items");
        assert_eq!(
            template.render(&json!({})),
            Err(SyncError::PayloadMalformed("no count".to_string()))
        );
    }

    #[test]
    fn test_default_templates() {
        let templates = NotifyTemplates::defaults_for("tickets");
        let create = templates.for_action(Action::Create).unwrap();
        assert_eq!(create.render(&json!({"id": 5})).unwrap(), "5 created in tickets");
        assert!(!templates.is_empty());
        assert!(NotifyTemplates::new().for_action(Action::Delete).is_none());
    }
}
