//! Markdown to email-safe HTML.
//!
//! Email clients disagree on nearly all layout CSS but agree on nested
//! tables, so every block is emitted as a `role="presentation"` table with
//! inline styles. The renderer never fails: anything it does not recognise
//! becomes paragraph text.
//!
//! Supported syntax:
//! - `#`, `##`, `###` headings (`#` renders at level 2, the subject line is the h1)
//! - `---` / `***` / `___` horizontal rules
//! - `-`, `*`, `+` bullets and `1.` / `1)` ordered items
//! - pipe tables with a `|---|:---:|` separator line
//! - `**bold**`, `__bold__`, `*italic*`, `_italic_`, `` `code` ``, `[text](https://..)`
//! - lines starting with `<` pass through as raw HTML

use std::sync::LazyLock;

use regex::Regex;

pub(crate) const FONT_STACK: &str =
    "-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,Helvetica,Arial,sans-serif";
pub(crate) const TEXT_COLOR: &str = "#202124";
pub(crate) const MUTED_COLOR: &str = "#5f6368";
const BORDER_COLOR: &str = "#dadce0";
const HEADER_BG: &str = "#f1f3f4";
const LINK_COLOR: &str = "#1a73e8";

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,3})\s+(.+)$").expect("valid regex"));
static RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:-{3,}|\*{3,}|_{3,})$").expect("valid regex"));
static UNORDERED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*+]\s+(.+)$").expect("valid regex"));
static ORDERED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,9})[.)]\s+(.+)$").expect("valid regex"));
static TABLE_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\|?\s*:?-+:?\s*(?:\|\s*:?-+:?\s*)*\|?$").expect("valid regex")
});

static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^&(?:[A-Za-z][A-Za-z0-9]{1,31}|#[0-9]{1,7}|#[xX][0-9A-Fa-f]{1,6});")
        .expect("valid regex")
});

static CODE_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("valid regex"));
static LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\]]+)\]\((https?://[^\s)]+)\)").expect("valid regex")
});
static BOLD_ITALIC_STARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*\*\*([^*\s](?:[^*]*[^*\s])?)\*\*\*").expect("valid regex")
});
static BOLD_ITALIC_UNDERSCORES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"___([^_\s](?:[^_]*[^_\s])?)___").expect("valid regex"));
static BOLD_STARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("valid regex"));
static BOLD_UNDERSCORES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__(.+?)__").expect("valid regex"));
// Italic spans never cross a tag emitted by an earlier pass.
static ITALIC_STAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*([^*\s<>](?:[^*<>]*[^*\s<>])?)\*").expect("valid regex")
});
static ITALIC_UNDERSCORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"_([^_\s<>](?:[^_<>]*[^_\s<>])?)_").expect("valid regex")
});

/// Output of [`render`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedMarkdown {
    /// Concatenated block fragments, one per line.
    pub html: String,
    /// Plain-text fallback derived from the same markdown.
    pub text: String,
}

/// Column alignment from a table separator line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Align {
    Left,
    Center,
    Right,
}

impl Align {
    fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Center => "center",
            Self::Right => "right",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Block {
    Heading {
        level: u8,
        text: String,
    },
    Rule,
    List {
        ordered: bool,
        start: u32,
        items: Vec<String>,
    },
    Table {
        header: Vec<String>,
        align: Vec<Align>,
        rows: Vec<Vec<String>>,
    },
    Paragraph(String),
    Html(String),
}

struct PendingList {
    ordered: bool,
    start: u32,
    items: Vec<String>,
}

/// Render markdown into table-based email HTML plus a plain-text fallback.
pub fn render(markdown: &str) -> RenderedMarkdown {
    if markdown.trim().is_empty() {
        return RenderedMarkdown::default();
    }

    let blocks = parse_blocks(markdown);
    let html = blocks
        .iter()
        .map(render_block)
        .collect::<Vec<_>>()
        .join("\n");

    RenderedMarkdown {
        html,
        text: blocks_to_text(&blocks),
    }
}

/// Plain-text rendition of markdown: emphasis markers stripped, bullets as
/// `•`, tables flattened to tab-separated rows.
pub fn markdown_to_text(markdown: &str) -> String {
    if markdown.trim().is_empty() {
        return String::new();
    }
    blocks_to_text(&parse_blocks(markdown))
}

/// Escape text for HTML. Existing character references (`&amp;`, `&#39;`,
/// `&#x2014;`) are left alone so repeated passes never double-encode.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for (i, ch) in text.char_indices() {
        match ch {
            '&' if ENTITY.is_match(&text[i..]) => out.push('&'),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

// ── Block tokenizer ─────────────────────────────────────────────────

/// Whether the markdown holds at least one well-formed pipe table.
pub fn contains_table(markdown: &str) -> bool {
    parse_blocks(markdown)
        .iter()
        .any(|block| matches!(block, Block::Table { .. }))
}

pub(crate) fn parse_blocks(markdown: &str) -> Vec<Block> {
    let lines: Vec<&str> = markdown.lines().collect();
    let mut blocks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut list: Option<PendingList> = None;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim();

        if line.contains('|') && lines.get(i + 1).is_some_and(|next| is_table_separator(next)) {
            flush_paragraph(&mut paragraph, &mut blocks);
            flush_list(&mut list, &mut blocks);

            let header = split_row(line);
            let align = parse_alignment(lines[i + 1].trim(), header.len());
            let mut rows = Vec::new();
            i += 2;
            while let Some(row) = lines.get(i).map(|l| l.trim()) {
                if row.is_empty() || !row.contains('|') {
                    break;
                }
                rows.push(fit_row(split_row(row), header.len()));
                i += 1;
            }
            blocks.push(Block::Table {
                header,
                align,
                rows,
            });
            continue;
        }

        if line.is_empty() {
            flush_paragraph(&mut paragraph, &mut blocks);
            flush_list(&mut list, &mut blocks);
        } else if let Some(caps) = HEADING.captures(line) {
            flush_paragraph(&mut paragraph, &mut blocks);
            flush_list(&mut list, &mut blocks);
            blocks.push(Block::Heading {
                level: (caps[1].len() as u8).max(2),
                text: caps[2].trim().to_string(),
            });
        } else if RULE.is_match(line) {
            flush_paragraph(&mut paragraph, &mut blocks);
            flush_list(&mut list, &mut blocks);
            blocks.push(Block::Rule);
        } else if let Some(caps) = UNORDERED_ITEM.captures(line) {
            flush_paragraph(&mut paragraph, &mut blocks);
            push_item(&mut list, &mut blocks, false, 1, &caps[1]);
        } else if let Some(caps) = ORDERED_ITEM.captures(line) {
            flush_paragraph(&mut paragraph, &mut blocks);
            let start = caps[1].parse().unwrap_or(1);
            push_item(&mut list, &mut blocks, true, start, &caps[2]);
        } else if line.starts_with('<') {
            flush_paragraph(&mut paragraph, &mut blocks);
            flush_list(&mut list, &mut blocks);
            blocks.push(Block::Html(lines[i].to_string()));
        } else {
            flush_list(&mut list, &mut blocks);
            paragraph.push(line);
        }
        i += 1;
    }

    flush_paragraph(&mut paragraph, &mut blocks);
    flush_list(&mut list, &mut blocks);
    blocks
}

fn push_item(
    list: &mut Option<PendingList>,
    blocks: &mut Vec<Block>,
    ordered: bool,
    start: u32,
    item: &str,
) {
    if list.as_ref().is_some_and(|l| l.ordered != ordered) {
        flush_list(list, blocks);
    }
    list.get_or_insert_with(|| PendingList {
        ordered,
        start,
        items: Vec::new(),
    })
    .items
    .push(item.trim().to_string());
}

fn flush_paragraph(paragraph: &mut Vec<&str>, blocks: &mut Vec<Block>) {
    if !paragraph.is_empty() {
        blocks.push(Block::Paragraph(paragraph.join(" ")));
        paragraph.clear();
    }
}

fn flush_list(list: &mut Option<PendingList>, blocks: &mut Vec<Block>) {
    if let Some(l) = list.take() {
        blocks.push(Block::List {
            ordered: l.ordered,
            start: l.start,
            items: l.items,
        });
    }
}

fn is_table_separator(line: &str) -> bool {
    let line = line.trim();
    line.contains('|') && line.contains('-') && TABLE_SEPARATOR.is_match(line)
}

fn split_row(line: &str) -> Vec<String> {
    let line = line.trim();
    let line = line.strip_prefix('|').unwrap_or(line);
    let line = line.strip_suffix('|').unwrap_or(line);
    line.split('|').map(|cell| cell.trim().to_string()).collect()
}

fn fit_row(mut cells: Vec<String>, width: usize) -> Vec<String> {
    cells.resize(width, String::new());
    cells
}

fn parse_alignment(separator: &str, width: usize) -> Vec<Align> {
    let mut align: Vec<Align> = split_row(separator)
        .iter()
        .map(|cell| match (cell.starts_with(':'), cell.ends_with(':')) {
            (true, true) => Align::Center,
            (false, true) => Align::Right,
            _ => Align::Left,
        })
        .collect();
    align.resize(width, Align::Left);
    align
}

// ── Block rendering ─────────────────────────────────────────────────

fn text_style(size: u32, line_height: u32) -> String {
    format!(
        "font-family:{FONT_STACK};font-size:{size}px;line-height:{line_height}px;color:{TEXT_COLOR};"
    )
}

fn presentation_table(cell_style: &str, content: &str) -> String {
    format!(
        r#"<table role="presentation" width="100%" cellpadding="0" cellspacing="0" border="0" style="width:100%;border-collapse:collapse;"><tr><td style="{cell_style}">{content}</td></tr></table>"#
    )
}

fn render_block(block: &Block) -> String {
    match block {
        Block::Paragraph(text) => presentation_table(
            &format!("padding:0 0 16px 0;{}", text_style(16, 24)),
            &format_inline(text),
        ),
        Block::Heading { level, text } => {
            let (size, line_height) = if *level <= 2 { (20, 28) } else { (17, 24) };
            presentation_table(
                "padding:8px 0 12px 0;",
                &format!(
                    r#"<h{level} style="margin:0;font-weight:700;{}">{}</h{level}>"#,
                    text_style(size, line_height),
                    format_inline(text)
                ),
            )
        }
        Block::Rule => presentation_table(
            "padding:8px 0 24px 0;",
            &format!(
                r#"<div style="border-top:1px solid {BORDER_COLOR};height:1px;line-height:1px;font-size:1px;">&nbsp;</div>"#
            ),
        ),
        Block::List {
            ordered,
            start,
            items,
        } => render_list(*ordered, *start, items),
        Block::Table {
            header,
            align,
            rows,
        } => render_table(header, align, rows),
        Block::Html(raw) => raw.clone(),
    }
}

fn render_list(ordered: bool, start: u32, items: &[String]) -> String {
    let cell = text_style(16, 24);
    let rows: String = items
        .iter()
        .enumerate()
        .map(|(n, item)| {
            let marker = if ordered {
                format!("{}.", start as usize + n)
            } else {
                "&#8226;".to_string()
            };
            format!(
                r#"<tr><td width="24" valign="top" style="width:24px;padding:0 0 8px 0;{cell}">{marker}</td><td valign="top" style="padding:0 0 8px 0;{cell}">{}</td></tr>"#,
                format_inline(item)
            )
        })
        .collect();

    presentation_table(
        "padding:0 0 8px 0;",
        &format!(
            r#"<table role="presentation" width="100%" cellpadding="0" cellspacing="0" border="0" style="width:100%;border-collapse:collapse;">{rows}</table>"#
        ),
    )
}

fn render_table(header: &[String], align: &[Align], rows: &[Vec<String>]) -> String {
    let cell = format!("padding:8px 12px;border:1px solid {BORDER_COLOR};{}", text_style(14, 20));

    let head: String = header
        .iter()
        .zip(align)
        .map(|(text, a)| {
            format!(
                r#"<th align="{a}" style="{cell}background-color:{HEADER_BG};font-weight:700;text-align:{a};">{}</th>"#,
                format_inline(text),
                a = a.as_str()
            )
        })
        .collect();

    let body: String = rows
        .iter()
        .map(|row| {
            let cells: String = row
                .iter()
                .zip(align)
                .map(|(text, a)| {
                    format!(
                        r#"<td align="{a}" style="{cell}text-align:{a};">{}</td>"#,
                        format_inline(text),
                        a = a.as_str()
                    )
                })
                .collect();
            format!("<tr>{cells}</tr>")
        })
        .collect();

    format!(
        r#"<table role="presentation" width="100%" cellpadding="0" cellspacing="0" border="0" style="width:100%;border-collapse:collapse;margin:0 0 16px 0;"><tr>{head}</tr>{body}</table>"#
    )
}

// ── Inline formatting ───────────────────────────────────────────────

/// Escape once, then apply inline markup to text runs only. Code spans are
/// emitted verbatim and link targets never pass through emphasis.
fn format_inline(text: &str) -> String {
    let escaped = escape_html(text);
    let mut out = String::with_capacity(escaped.len() + 32);
    let mut last = 0;

    for caps in CODE_SPAN.captures_iter(&escaped) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&format_links(&escaped[last..whole.start()]));
        out.push_str(&format!(
            r#"<code style="font-family:Menlo,Consolas,'Courier New',monospace;font-size:14px;background-color:{HEADER_BG};padding:1px 4px;">{}</code>"#,
            &caps[1]
        ));
        last = whole.end();
    }
    out.push_str(&format_links(&escaped[last..]));
    out
}

fn format_links(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in LINK.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&emphasize(&text[last..whole.start()]));
        out.push_str(&format!(
            r#"<a href="{}" style="color:{LINK_COLOR};text-decoration:underline;">{}</a>"#,
            &caps[2],
            emphasize(&caps[1])
        ));
        last = whole.end();
    }
    out.push_str(&emphasize(&text[last..]));
    out
}

fn emphasize(text: &str) -> String {
    let s = BOLD_ITALIC_STARS.replace_all(text, "<strong><em>${1}</em></strong>");
    let s = underscore_spans(&s, &BOLD_ITALIC_UNDERSCORES, "<strong><em>", "</em></strong>");
    let s = BOLD_STARS.replace_all(&s, "<strong>${1}</strong>");
    let s = BOLD_UNDERSCORES.replace_all(&s, "<strong>${1}</strong>");
    let s = ITALIC_STAR.replace_all(&s, "<em>${1}</em>");
    underscore_spans(&s, &ITALIC_UNDERSCORE, "<em>", "</em>")
}

/// Replace underscore-delimited spans that are not part of a word, so
/// `snake_case_names` stay literal while `_a_ _b_` yields two spans.
fn underscore_spans(text: &str, re: &Regex, open: &str, close: &str) -> String {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let before = text[..whole.start()].chars().next_back();
        let after = text[whole.end()..].chars().next();
        if before.is_some_and(is_word) || after.is_some_and(is_word) {
            continue;
        }
        out.push_str(&text[last..whole.start()]);
        out.push_str(open);
        out.push_str(inner.as_str());
        out.push_str(close);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    out
}

// ── Plain text ──────────────────────────────────────────────────────

fn blocks_to_text(blocks: &[Block]) -> String {
    blocks
        .iter()
        .map(|block| match block {
            Block::Paragraph(text) => strip_inline(text),
            Block::Heading { text, .. } => strip_inline(text),
            Block::Rule => "----------".to_string(),
            Block::List {
                ordered,
                start,
                items,
            } => items
                .iter()
                .enumerate()
                .map(|(n, item)| {
                    if *ordered {
                        format!("{}. {}", *start as usize + n, strip_inline(item))
                    } else {
                        format!("• {}", strip_inline(item))
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Block::Table { header, rows, .. } => std::iter::once(header)
                .chain(rows)
                .map(|row| {
                    row.iter()
                        .map(|cell| strip_inline(cell))
                        .collect::<Vec<_>>()
                        .join("\t")
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Block::Html(raw) => strip_html(raw),
        })
        .filter(|chunk| !chunk.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn strip_inline(text: &str) -> String {
    let s = LINK.replace_all(text, "${1} (${2})");
    let s = CODE_SPAN.replace_all(&s, "${1}");
    let s = BOLD_ITALIC_STARS.replace_all(&s, "${1}");
    let s = underscore_spans(&s, &BOLD_ITALIC_UNDERSCORES, "", "");
    let s = BOLD_STARS.replace_all(&s, "${1}");
    let s = BOLD_UNDERSCORES.replace_all(&s, "${1}");
    let s = ITALIC_STAR.replace_all(&s, "${1}");
    underscore_spans(&s, &ITALIC_UNDERSCORE, "", "")
}

/// Strip HTML tags from content (basic).
fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
