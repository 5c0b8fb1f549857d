//! Branded email document shell around rendered markdown.
//!
//! The HTML comes from the rendered blocks; the plain-text part comes from
//! the source markdown, never from the HTML.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::markdown::{FONT_STACK, MUTED_COLOR, escape_html, markdown_to_text, render};

/// Fixed desktop width of the content column.
pub const CONTENT_WIDTH_PX: u32 = 600;

const PREHEADER_MAX_CHARS: usize = 100;

/// Which branded header to use. Body structure is identical across templates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    #[default]
    Standard,
    Urgent,
    Quote,
}

impl TemplateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Urgent => "urgent",
            Self::Quote => "quote",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Standard => "Response",
            Self::Urgent => "Priority Response",
            Self::Quote => "Quote",
        }
    }

    fn accent(self) -> &'static str {
        match self {
            Self::Standard => "#1a73e8",
            Self::Urgent => "#d93025",
            Self::Quote => "#188038",
        }
    }
}

impl FromStr for TemplateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "urgent" => Ok(Self::Urgent),
            "quote" => Ok(Self::Quote),
            other => Err(format!("unknown template '{other}'")),
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for [`wrap`].
#[derive(Debug, Clone)]
pub struct WrapOptions {
    pub template: TemplateKind,
    pub subject: String,
    /// Inbox preview text. Defaults to the start of the plain-text body.
    pub preheader: Option<String>,
    pub brand_name: String,
}

impl WrapOptions {
    pub fn new(template: TemplateKind, subject: impl Into<String>) -> Self {
        Self {
            template,
            subject: subject.into(),
            preheader: None,
            brand_name: "Mission Control".to_string(),
        }
    }

    pub fn with_preheader(mut self, preheader: impl Into<String>) -> Self {
        self.preheader = Some(preheader.into());
        self
    }

    pub fn with_brand(mut self, brand_name: impl Into<String>) -> Self {
        self.brand_name = brand_name.into();
        self
    }
}

/// A complete email body pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrappedEmail {
    pub html: String,
    pub text: String,
}

/// Render markdown and wrap it in one step.
pub fn render_email(markdown: &str, options: &WrapOptions) -> WrappedEmail {
    let rendered = render(markdown);
    wrap(&rendered.html, markdown, options)
}

/// Wrap rendered body HTML in the document shell. `source_markdown` is the
/// markdown the body was rendered from and feeds the plain-text part.
pub fn wrap(body_html: &str, source_markdown: &str, options: &WrapOptions) -> WrappedEmail {
    let body_text = markdown_to_text(source_markdown);
    let preheader = options
        .preheader
        .clone()
        .unwrap_or_else(|| preview_of(&body_text));

    let template = options.template;
    let accent = template.accent();
    let label = template.label();
    let subject = escape_html(&options.subject);
    let brand = escape_html(&options.brand_name);
    let preheader = escape_html(&preheader);
    let width = CONTENT_WIDTH_PX;

    let html = format!(
        r#"<!DOCTYPE html PUBLIC "-//W3C//DTD XHTML 1.0 Transitional//EN" "http://www.w3.org/TR/xhtml1/DTD/xhtml1-transitional.dtd">
<html xmlns="http://www.w3.org/1999/xhtml" lang="en">
<head>
<meta http-equiv="Content-Type" content="text/html; charset=UTF-8" />
<meta name="viewport" content="width=device-width, initial-scale=1.0" />
<meta http-equiv="X-UA-Compatible" content="IE=edge" />
<meta name="x-apple-disable-message-reformatting" />
<title>{subject}</title>
<style type="text/css">
body{{margin:0;padding:0;width:100%!important;-webkit-text-size-adjust:100%;-ms-text-size-adjust:100%;}}
table,td{{mso-table-lspace:0pt;mso-table-rspace:0pt;}}
@media only screen and (max-width:620px){{.email-container{{width:100%!important;max-width:100%!important;}}.email-body{{padding:20px!important;}}}}
</style>
</head>
<body style="margin:0;padding:0;background-color:#f4f5f7;">
<span style="display:none;font-size:1px;line-height:1px;max-height:0;max-width:0;height:0;opacity:0;overflow:hidden;mso-hide:all;color:transparent;">{preheader}</span>
<table role="presentation" width="100%" cellpadding="0" cellspacing="0" border="0" style="width:100%;background-color:#f4f5f7;"><tr><td align="center" style="padding:24px 12px;">
<!--[if mso]><table role="presentation" width="{width}" align="center" cellpadding="0" cellspacing="0" border="0"><tr><td><![endif]-->
<table role="presentation" class="email-container" width="{width}" cellpadding="0" cellspacing="0" border="0" style="width:100%;max-width:{width}px;background-color:#ffffff;">
<tr><td style="padding:20px 32px;border-bottom:3px solid {accent};font-family:{FONT_STACK};font-size:14px;line-height:20px;font-weight:700;letter-spacing:0.5px;text-transform:uppercase;color:{accent};">{brand} | {label}</td></tr>
<tr><td class="email-body" style="padding:32px;">
{body_html}
</td></tr>
<tr><td style="padding:16px 32px 24px 32px;font-family:{FONT_STACK};font-size:12px;line-height:18px;color:{MUTED_COLOR};">In reply to: {subject}</td></tr>
</table>
<!--[if mso]></td></tr></table><![endif]-->
</td></tr></table>
</body>
</html>"#
    );

    let text = if body_text.is_empty() {
        format!("-- \n{}", options.brand_name)
    } else {
        format!("{body_text}\n\n-- \n{}", options.brand_name)
    };

    WrappedEmail { html, text }
}

fn preview_of(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREHEADER_MAX_CHARS {
        return flat;
    }
    let mut preview: String = flat.chars().take(PREHEADER_MAX_CHARS - 3).collect();
    preview.push_str("...");
    preview
}
