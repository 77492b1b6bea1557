//! HTML body helpers.
//!
//! Inbound HTML is flattened to plain text for prompts and previews;
//! outbound plain text is wrapped into minimal HTML for the email body.

/// Strip HTML tags from content, keeping line structure.
///
/// `<br>` becomes a newline and `</p>` a paragraph break before tags are
/// dropped. Horizontal whitespace is normalized per line.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(pos) = rest.find('<') {
        text.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let Some(end) = rest.find('>') else {
            // Unterminated tag, drop the remainder.
            rest = "";
            break;
        };
        let tag = rest[1..end].trim().to_ascii_lowercase();
        if tag.starts_with("br") {
            text.push('\n');
        } else if tag == "/p" || tag == "/div" {
            text.push_str("\n\n");
        }
        rest = &rest[end + 1..];
    }
    text.push_str(rest);

    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    // Normalize horizontal whitespace per line, cap blank runs at one line.
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(&line);
        out.push('\n');
    }
    out.trim().to_string()
}

/// Wrap plain text into minimal HTML: escaped entities, blank-line-separated
/// paragraphs, single newlines as `<br />`.
pub fn plain_to_html(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");

    let mut out = String::with_capacity(escaped.len() + 32);
    for paragraph in escaped.split("\n\n") {
        let paragraph = paragraph.trim_matches('\n');
        if paragraph.is_empty() {
            continue;
        }
        out.push_str("<p>");
        out.push_str(&paragraph.replace('\n', "<br />"));
        out.push_str("</p>");
    }
    if out.is_empty() {
        out.push_str("<p></p>");
    }
    out
}
