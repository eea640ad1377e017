//! Email body rendering via `minijinja`.
//!
//! The built-in `notification.html` template ships with the crate. An
//! operator can replace it by pointing `template_dir` at a directory
//! holding their own `notification.html`. The `.html` name turns on HTML
//! auto-escaping, so producer-supplied text never injects markup.

use std::path::Path;

use minijinja::{Environment, context};
use serde::Serialize;

use kiln_types::NotificationDraft;

use crate::error::NotifyError;

const TEMPLATE_NAME: &str = "notification.html";
const BUILTIN: &str = include_str!("../templates/notification.html");

/// Header shown above every message.
pub const DEFAULT_TITLE: &str = "Kiln Notification";

#[derive(Debug, Serialize)]
struct Row<'a> {
    label: String,
    value: &'a str,
}

/// `old_stage` -> `Old stage`.
pub fn metadata_label(key: &str) -> String {
    let spaced = key.replace('_', " ");
    let mut chars = spaced.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

/// Renders notification drafts to HTML.
#[derive(Debug)]
pub struct EmailRenderer {
    env: Environment<'static>,
    title: String,
    footer: String,
}

impl EmailRenderer {
    /// Renderer using the built-in template.
    pub fn builtin() -> Result<Self, NotifyError> {
        Self::from_source(BUILTIN.to_owned())
    }

    /// Renderer using `{dir}/notification.html`.
    pub fn from_dir(dir: &str) -> Result<Self, NotifyError> {
        let path = Path::new(dir).join(TEMPLATE_NAME);
        let source = std::fs::read_to_string(&path)
            .map_err(|e| NotifyError::Template(format!("failed to read {}: {e}", path.display())))?;
        Self::from_source(source)
    }

    /// Built-in template, or the one in `dir` when given.
    pub fn load(dir: Option<&str>) -> Result<Self, NotifyError> {
        dir.map_or_else(Self::builtin, Self::from_dir)
    }

    fn from_source(source: String) -> Result<Self, NotifyError> {
        let mut env = Environment::new();
        env.add_template_owned(TEMPLATE_NAME, source)
            .map_err(|e| {
                NotifyError::Template(format!("failed to add notification template: {e}"))
            })?;
        Ok(Self {
            env,
            title: DEFAULT_TITLE.to_owned(),
            footer: "You are receiving this because you are registered on the Kiln platform."
                .to_owned(),
        })
    }

    /// Render the HTML body of a draft.
    pub fn render(&self, draft: &NotificationDraft) -> Result<String, NotifyError> {
        let rows: Vec<Row<'_>> = draft
            .metadata
            .iter()
            .map(|(key, value)| Row {
                label: metadata_label(key),
                value,
            })
            .collect();
        self.env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| NotifyError::Template(format!("missing notification template: {e}")))?
            .render(context! {
                title => self.title,
                footer => self.footer,
                recipient_name => draft.recipient_name,
                message => draft.message,
                rows => rows,
            })
            .map_err(|e| NotifyError::Template(format!("failed to render notification: {e}")))
    }
}
