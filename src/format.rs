//! Markdown-ish answer text to HTML.
//!
//! Answers from the knowledge base lean heavily on pipe tables and inline
//! emphasis. Tables are lifted into real `<table>` markup; everything else
//! keeps its line structure.

use regex::Regex;
use std::sync::LazyLock;

static BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*([^*\n]+?)\*\*|__([^_\n]+?)__").expect("valid regex"));
static ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\s][^*\n]*?)\*").expect("valid regex"));
static CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`\n]+)`").expect("valid regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"</?([a-zA-Z][a-zA-Z0-9]*)(\s[^<>]*)?/?>").expect("valid regex")
});

/// Attribute-free tags that may pass through to the exported page.
const SAFE_TAGS: [&str; 11] = ["b", "i", "em", "strong", "code", "br", "sup", "sub", "u", "p", "span"];
static SEPARATOR_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s|:\-]+$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Center,
    Right,
}

impl Align {
    fn from_separator_cell(cell: &str) -> Option<Self> {
        let cell = cell.trim();
        match (cell.starts_with(':'), cell.ends_with(':') && cell.len() > 1) {
            (true, true) => Some(Align::Center),
            (true, false) => Some(Align::Left),
            (false, true) => Some(Align::Right),
            (false, false) => None,
        }
    }

    fn as_css(self) -> &'static str {
        match self {
            Align::Left => "left",
            Align::Center => "center",
            Align::Right => "right",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// Rows that preceded a separator row.
    pub header: Vec<Vec<String>>,
    pub rows: Vec<Vec<String>>,
    pub align: Vec<Option<Align>>,
}

/// Full pipeline: punctuation, tables, inline markup.
pub fn to_html(text: &str) -> String {
    let text = normalize_punctuation(text);
    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if lines[i].contains('|') {
            let start = i;
            while i < lines.len() && lines[i].contains('|') {
                i += 1;
            }
            let table = parse_table(&lines[start..i]);
            out.push(table_html(&table));
        } else {
            out.push(markup_html(lines[i]));
            i += 1;
        }
    }
    out.join("\n")
}

pub fn normalize_punctuation(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => out.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => out.push('"'),
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2212}' => {
                out.push('-')
            }
            '\u{2026}' => out.push_str("..."),
            '\u{00A0}' | '\u{2009}' | '\u{202F}' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}

/// Bold, italic and inline code to HTML. Text is not escaped here, and code
/// spans are left untouched by the emphasis rules.
pub fn inline_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for code in CODE.find_iter(text) {
        out.push_str(&emphasis(&text[last..code.start()]));
        let inner = &code.as_str()[1..code.len() - 1];
        out.push_str(&format!("<code>{inner}</code>"));
        last = code.end();
    }
    out.push_str(&emphasis(&text[last..]));
    out
}

fn emphasis(text: &str) -> String {
    let text = BOLD.replace_all(text, |caps: &regex::Captures| {
        let inner = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        format!("<strong>{inner}</strong>")
    });
    ITALIC.replace_all(&text, "<em>$1</em>").into_owned()
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

pub fn parse_table(lines: &[&str]) -> Table {
    let mut table = Table {
        header: Vec::new(),
        rows: Vec::new(),
        align: Vec::new(),
    };
    for line in lines {
        let cells = split_row(line);
        if SEPARATOR_ROW.is_match(line) && line.contains('-') {
            table.align = cells.iter().map(|c| Align::from_separator_cell(c)).collect();
            // The first separator promotes what came before it to the header.
            if table.header.is_empty() {
                table.header = std::mem::take(&mut table.rows);
            }
            continue;
        }
        table.rows.push(cells);
    }
    table
}

fn split_row(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let trimmed = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix('|').unwrap_or(trimmed);
    trimmed.split('|').map(|cell| cell.trim().to_string()).collect()
}

/// Text that already carries only plain formatting tags is kept as markup;
/// anything else is escaped first.
fn markup_html(text: &str) -> String {
    if has_only_safe_tags(text) {
        inline_markup(text)
    } else {
        inline_markup(&escape_html(text))
    }
}

fn has_only_safe_tags(text: &str) -> bool {
    let mut tags = TAG.captures_iter(text).peekable();
    if tags.peek().is_none() {
        return false;
    }
    tags.all(|caps| {
        let name = caps.get(1).map_or("", |m| m.as_str()).to_ascii_lowercase();
        caps.get(2).is_none() && SAFE_TAGS.contains(&name.as_str())
    })
}

fn table_html(table: &Table) -> String {
    let mut html = String::from("<div class=\"table-scroll\"><table>");
    let emit = |row: &[String], tag: &str, html: &mut String| {
        html.push_str("<tr>");
        for (idx, cell) in row.iter().enumerate() {
            match table.align.get(idx).copied().flatten() {
                Some(align) => {
                    html.push_str(&format!("<{tag} style=\"text-align:{}\">", align.as_css()))
                }
                None => html.push_str(&format!("<{tag}>")),
            }
            html.push_str(&markup_html(cell));
            html.push_str(&format!("</{tag}>"));
        }
        html.push_str("</tr>");
    };
    if !table.header.is_empty() {
        html.push_str("<thead>");
        for row in &table.header {
            emit(row, "th", &mut html);
        }
        html.push_str("</thead>");
    }
    html.push_str("<tbody>");
    for row in &table.rows {
        emit(row, "td", &mut html);
    }
    html.push_str("</tbody></table></div>");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_separator_row_dropped() {
        let table = parse_table(&["a|b", "---|---", "1|2"]);
        assert_eq!(table.header, vec![vec!["a".to_string(), "b".to_string()]]);
        assert_eq!(table.rows, vec![vec!["1".to_string(), "2".to_string()]]);
    }

    #[test]
    fn test_table_html_has_one_data_row() {
        let html = to_html("a|b\n---|---\n1|2");
        assert_eq!(
            html,
            "<div class=\"table-scroll\"><table><thead><tr><th>a</th><th>b</th></tr></thead>\
             <tbody><tr><td>1</td><td>2</td></tr></tbody></table></div>"
        );
    }

    #[test]
    fn test_alignment_from_colons() {
        let table = parse_table(&["| Species | Yield |", "|:---|---:|", "| *Brachiaria* | 12 |"]);
        assert_eq!(table.align, vec![Some(Align::Left), Some(Align::Right)]);
        let html = table_html(&table);
        assert!(html.contains("<td style=\"text-align:left\"><em>Brachiaria</em></td>"));
        assert!(html.contains("<td style=\"text-align:right\">12</td>"));
    }

    #[test]
    fn test_cells_escaped_unless_tagged() {
        let table = parse_table(&["x | y", "a<b | <b>bold</b>"]);
        let html = table_html(&table);
        assert!(html.contains("<td>a&lt;b</td>"));
        assert!(html.contains("<td><b>bold</b></td>"));
    }

    #[test]
    fn test_non_table_lines_pass_through() {
        let html = to_html("Intro line\n\n**Key point**: use `pH` tests");
        assert_eq!(
            html,
            "Intro line\n\n<strong>Key point</strong>: use <code>pH</code> tests"
        );
    }

    #[test]
    fn test_text_around_table_wrapped_in_container() {
        let html = to_html("Before\n| a | b |\n| 1 | 2 |\nAfter");
        let lines: Vec<&str> = html.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Before");
        assert!(lines[1].starts_with("<div class=\"table-scroll\"><table><tbody>"));
        assert_eq!(lines[2], "After");
    }

    #[test]
    fn test_code_spans_keep_emphasis_markers() {
        assert_eq!(
            inline_markup("call `__init__` or `*args`, then **save**"),
            "call <code>__init__</code> or <code>*args</code>, then <strong>save</strong>"
        );
    }

    #[test]
    fn test_non_table_lines_escaped() {
        let html = to_html("Soil pH < 5 & high Al\n<script>alert(1)</script>\n<b onclick=\"x()\">hi</b>");
        let lines: Vec<&str> = html.lines().collect();
        assert_eq!(lines[0], "Soil pH &lt; 5 &amp; high Al");
        assert_eq!(lines[1], "&lt;script&gt;alert(1)&lt;/script&gt;");
        assert!(lines[2].starts_with("&lt;b onclick="));
        assert_eq!(to_html("<b>Leucaena</b> is a legume"), "<b>Leucaena</b> is a legume");
    }

    #[test]
    fn test_normalize_punctuation() {
        assert_eq!(
            normalize_punctuation("\u{201C}Guinea grass\u{201D} \u{2013} it\u{2019}s fine\u{2026}"),
            "\"Guinea grass\" - it's fine..."
        );
    }
}
