//! Handlebars template rendering for certificate documents.

use async_trait::async_trait;
use handlebars::Handlebars;
use serde_json::Value;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

use crate::html::prepend_to_head;

/// Template file extension under the template directory.
const TEMPLATE_EXTENSION: &str = "hbs";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid template identifier: {0:?}")]
    InvalidTemplateId(String),
    #[error("template {path} could not be read: {source}")]
    TemplateMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("template {template} failed to render: {message}")]
    Compile { template: String, message: String },
    #[error("rendered document could not be rewritten: {0}")]
    Document(String),
}

/// Turns a template identifier and data context into an HTML document.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(&self, template_id: &str, context: &Value) -> Result<String, RenderError>;
}

/// Renders `<template_dir>/<id>.hbs` and points relative asset URLs at
/// the local asset server through a `<base>` element.
pub struct HandlebarsRenderer {
    registry: Handlebars<'static>,
    template_dir: PathBuf,
    base_tag: String,
}

impl HandlebarsRenderer {
    pub fn new(template_dir: impl Into<PathBuf>, asset_base_url: &url::Url) -> Self {
        Self {
            registry: Handlebars::new(),
            template_dir: template_dir.into(),
            base_tag: format!(r#"<base href="{}">"#, asset_base_url.as_str()),
        }
    }

    fn template_path(&self, template_id: &str) -> Result<PathBuf, RenderError> {
        let valid = !template_id.is_empty()
            && template_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !template_id.contains("..");
        if !valid {
            return Err(RenderError::InvalidTemplateId(template_id.to_string()));
        }
        Ok(self
            .template_dir
            .join(format!("{template_id}.{TEMPLATE_EXTENSION}")))
    }
}

#[async_trait]
impl TemplateRenderer for HandlebarsRenderer {
    async fn render(&self, template_id: &str, context: &Value) -> Result<String, RenderError> {
        let path = self.template_path(template_id)?;
        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| RenderError::TemplateMissing {
                path: path.clone(),
                source,
            })?;

        let html = self
            .registry
            .render_template(&source, context)
            .map_err(|err| RenderError::Compile {
                template: template_id.to_string(),
                message: err.to_string(),
            })?;

        debug!(template = template_id, html_bytes = html.len(), "Template rendered");

        prepend_to_head(&html, &self.base_tag).map_err(RenderError::Document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn renderer(dir: &TempDir) -> HandlebarsRenderer {
        let base = url::Url::parse("http://localhost:8000/").unwrap();
        HandlebarsRenderer::new(dir.path(), &base)
    }

    #[tokio::test]
    async fn test_render_injects_base_tag() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("basic.hbs"),
            "<html><head><style>h1{}</style></head><body><h1>{{data.user.firstname}}</h1></body></html>",
        )
        .unwrap();

        let html = renderer(&dir)
            .render("basic", &json!({ "data": { "user": { "firstname": "john" } } }))
            .await
            .unwrap();

        assert!(html.contains(r#"<head><base href="http://localhost:8000/"><style>"#));
        assert!(html.contains("<h1>john</h1>"));
    }

    #[tokio::test]
    async fn test_builtin_eq_helper() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("eq.hbs"),
            "<head></head>{{#if (eq data.kind \"merit\")}}MERIT{{else}}PLAIN{{/if}}",
        )
        .unwrap();
        let renderer = renderer(&dir);

        let merit = renderer
            .render("eq", &json!({ "data": { "kind": "merit" } }))
            .await
            .unwrap();
        let plain = renderer
            .render("eq", &json!({ "data": { "kind": "other" } }))
            .await
            .unwrap();

        assert!(merit.ends_with("MERIT"));
        assert!(plain.ends_with("PLAIN"));
    }

    #[tokio::test]
    async fn test_missing_template() {
        let dir = TempDir::new().unwrap();
        let err = renderer(&dir).render("absent", &json!({})).await.unwrap_err();

        assert!(matches!(err, RenderError::TemplateMissing { .. }));
    }

    #[tokio::test]
    async fn test_compile_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.hbs"), "{{#if data}}unterminated").unwrap();

        let err = renderer(&dir).render("broken", &json!({ "data": 1 })).await.unwrap_err();
        assert!(matches!(err, RenderError::Compile { .. }));
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let renderer = renderer(&dir);

        for id in ["../secrets", "a/b", "", ".."] {
            let err = renderer.render(id, &json!({})).await.unwrap_err();
            assert!(matches!(err, RenderError::InvalidTemplateId(_)), "accepted {id:?}");
        }
    }
}
