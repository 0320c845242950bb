//! Merges document fields into an HTML template.
//!
//! Templates are plain text with `{{ field }}` (escaped) and `{{{ field }}}`
//! (raw) placeholders. Nothing in a template is executed; only the keys the
//! document's [`TemplateBindings`] resolve can be referenced.

use std::{
    cell::Cell,
    io,
    path::{Path, PathBuf},
    rc::Rc,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use lol_html::{RewriteStrSettings, element, html_content::ContentType, rewrite_str};
use thiserror::Error;

use crate::domain::certificates::{CertificateFields, CertificateNumber};

use super::types::PageGeometry;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("template `{path}` could not be read")]
    TemplateMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("embedded asset `{path}` could not be read")]
    AssetMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("template syntax error at byte {offset}: {reason}")]
    TemplateSyntax { offset: usize, reason: String },
    #[error("failed to inject print stylesheet: {0}")]
    Rewrite(String),
}

/// HTML template text loaded from disk.
#[derive(Debug, Clone)]
pub struct TemplateSource {
    path: PathBuf,
    html: String,
}

impl TemplateSource {
    pub async fn load(path: &Path) -> Result<Self, ComposeError> {
        let html = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ComposeError::TemplateMissing {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            html,
        })
    }

    pub fn from_string(html: impl Into<String>) -> Self {
        Self {
            path: PathBuf::from("<inline>"),
            html: html.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_str(&self) -> &str {
        &self.html
    }
}

/// Binary resource inlined into the document, typically the background image.
#[derive(Debug, Clone)]
pub struct EmbeddedAsset {
    mime: String,
    bytes: Vec<u8>,
}

impl EmbeddedAsset {
    pub async fn load(path: &Path) -> Result<Self, ComposeError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ComposeError::AssetMissing {
                path: path.to_path_buf(),
                source,
            })?;
        let mime = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self { mime, bytes })
    }

    pub fn from_bytes(mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime: mime.into(),
            bytes,
        }
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.bytes))
    }
}

/// Values a template's placeholders resolve against.
pub trait TemplateBindings {
    /// Value for `key`, or `None` when the document kind has no such field.
    fn lookup(&self, key: &str) -> Option<&str>;
}

/// Fields a certificate template may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateField {
    Name,
    Course,
    Date,
    CertNumber,
    AssetDataUri,
}

impl TemplateField {
    fn parse(key: &str) -> Option<Self> {
        match key {
            "name" => Some(Self::Name),
            "course" => Some(Self::Course),
            "date" => Some(Self::Date),
            "certNumber" => Some(Self::CertNumber),
            "templatePath" | "assetDataUri" => Some(Self::AssetDataUri),
            _ => None,
        }
    }
}

struct CertificateBindings<'a> {
    fields: &'a CertificateFields,
    number: &'a CertificateNumber,
    asset_uri: String,
}

impl TemplateBindings for CertificateBindings<'_> {
    fn lookup(&self, key: &str) -> Option<&str> {
        let value: &str = match TemplateField::parse(key)? {
            TemplateField::Name => &self.fields.subject_name,
            TemplateField::Course => &self.fields.subject_label,
            TemplateField::Date => &self.fields.issue_date,
            TemplateField::CertNumber => self.number.as_str(),
            TemplateField::AssetDataUri => &self.asset_uri,
        };
        Some(value)
    }
}

/// Produce a self-contained certificate document ready for the rendering
/// engine.
pub fn compose(
    template: &TemplateSource,
    fields: &CertificateFields,
    number: &CertificateNumber,
    asset: &EmbeddedAsset,
    page: &PageGeometry,
) -> Result<String, ComposeError> {
    let bindings = CertificateBindings {
        fields,
        number,
        asset_uri: asset.data_uri(),
    };
    compose_document(template, &bindings, page)
}

/// Merge `bindings` into any template and add the print stylesheet for
/// `page`.
pub fn compose_document(
    template: &TemplateSource,
    bindings: &dyn TemplateBindings,
    page: &PageGeometry,
) -> Result<String, ComposeError> {
    let merged = substitute(template.as_str(), bindings)?;
    inject_print_stylesheet(&merged, &page.print_stylesheet())
}

fn substitute(template: &str, bindings: &dyn TemplateBindings) -> Result<String, ComposeError> {
    let mut output = String::with_capacity(template.len() * 2);
    let mut rest = template;
    let mut consumed = 0;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let offset = consumed + start;
        let after_open = &rest[start + 2..];

        let (raw, body, close) = match after_open.strip_prefix('{') {
            Some(body) => (true, body, "}}}"),
            None => (false, after_open, "}}"),
        };
        let Some(end) = body.find(close) else {
            return Err(ComposeError::TemplateSyntax {
                offset,
                reason: "unterminated placeholder".to_string(),
            });
        };

        let key = body[..end].trim();
        let value = bindings
            .lookup(key)
            .ok_or_else(|| ComposeError::TemplateSyntax {
                offset,
                reason: format!("unknown field `{key}`"),
            })?;

        if raw {
            output.push_str(value);
        } else {
            push_escaped(&mut output, value);
        }

        let advance = start + 2 + usize::from(raw) + end + close.len();
        consumed += advance;
        rest = &rest[advance..];
    }

    output.push_str(rest);
    Ok(output)
}

// Braces are escaped too so substituted values can never form placeholders.
fn push_escaped(output: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&#39;"),
            '{' => output.push_str("&#123;"),
            '}' => output.push_str("&#125;"),
            other => output.push(other),
        }
    }
}

fn inject_print_stylesheet(html: &str, stylesheet: &str) -> Result<String, ComposeError> {
    let injected = Rc::new(Cell::new(false));

    let rewritten = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("head", {
                let injected = Rc::clone(&injected);
                move |el| {
                    if !injected.get() {
                        el.prepend(stylesheet, ContentType::Html);
                        injected.set(true);
                    }
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| ComposeError::Rewrite(err.to_string()))?;

    if injected.get() {
        return Ok(rewritten);
    }

    // Stay behind a leading doctype so the engine keeps standards mode.
    let (prologue, body) = rewritten.split_at(doctype_end(&rewritten));
    Ok(format!("{prologue}{stylesheet}{body}"))
}

fn doctype_end(html: &str) -> usize {
    let trimmed = html.trim_start();
    let leading = html.len() - trimmed.len();
    let is_doctype = trimmed
        .get(..9)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("<!doctype"));
    if !is_doctype {
        return 0;
    }
    trimmed
        .find('>')
        .map_or(0, |close| leading + close + 1)
}
