//! Index page over the bundle.

use camino::Utf8PathBuf;

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Renders a page linking every file, in the given order.
#[must_use]
pub fn render_index(run_id: &str, files: &[Utf8PathBuf]) -> String {
    let title = escape_html(run_id);
    let items: String = files
        .iter()
        .map(|file| {
            let name = escape_html(file.as_str());
            format!("    <li><a href=\"{name}\">{name}</a></li>\n")
        })
        .collect();
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n  <meta charset=\"utf-8\">\n  <title>{title}</title>\n</head>\n<body>\n  <h1>{title}</h1>\n  <ul>\n{items}  </ul>\n</body>\n</html>\n"
    )
}
