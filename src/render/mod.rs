//! Markdown rendering for outbound email.
//!
//! Pure functions, no I/O:
//! - [`render`]: markdown → table-based HTML blocks + plain text
//! - [`wrap`]: body HTML → full branded document + plain text

pub mod markdown;
pub mod template;

pub use markdown::{RenderedMarkdown, contains_table, escape_html, markdown_to_text, render};
pub use template::{CONTENT_WIDTH_PX, TemplateKind, WrapOptions, WrappedEmail, render_email, wrap};
