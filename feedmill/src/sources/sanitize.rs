/*!
Canonical HTML cleaning applied to every adapter's item content before it
is persisted: scripts, styles and event handlers are dropped, links and
images are preserved.
*/

use ego_tree::NodeRef;
use scraper::{Html, Node};

/// Elements removed together with their subtree.
const BLOCKED_ELEMENTS: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "link", "meta", "base", "form",
];

/// Elements with no closing tag.
const VOID_ELEMENTS: &[&str] = &["img", "br", "hr", "source", "wbr"];

/// Scrub an HTML fragment. Unknown elements are kept (tags intact), text
/// is re-escaped, `on*` attributes and `javascript:` URLs are dropped.
pub fn clean_html(input: &str) -> String {
    let fragment = Html::parse_fragment(input);
    let mut out = String::with_capacity(input.len());
    write_children(fragment.tree.root(), &mut out);
    out
}

/// Collect image URLs from a fragment, for the item's media list.
pub fn collect_image_urls(input: &str) -> Vec<String> {
    let fragment = Html::parse_fragment(input);
    let selector = scraper::Selector::parse("img[src]").expect("static selector");
    fragment
        .select(&selector)
        .filter_map(|el| el.value().attr("src"))
        .filter(|src| !src.starts_with("data:") && !src.starts_with("javascript:"))
        .map(str::to_string)
        .collect()
}

fn write_children(node: NodeRef<'_, Node>, out: &mut String) {
    for child in node.children() {
        write_node(child, out);
    }
}

fn write_node(node: NodeRef<'_, Node>, out: &mut String) {
    match node.value() {
        Node::Text(text) => {
            push_escaped_text(&text.text, out);
        }
        Node::Element(el) => {
            let name = el.name();
            if BLOCKED_ELEMENTS.contains(&name) {
                return;
            }
            // parse_fragment wraps content in a synthetic <html> element.
            if name == "html" {
                write_children(node, out);
                return;
            }
            out.push('<');
            out.push_str(name);
            for (attr_name, attr_value) in el.attrs() {
                if !attr_allowed(attr_name, attr_value) {
                    continue;
                }
                out.push(' ');
                out.push_str(attr_name);
                out.push_str("=\"");
                push_escaped_attr(attr_value, out);
                out.push('"');
            }
            if VOID_ELEMENTS.contains(&name) {
                out.push_str("/>");
                return;
            }
            out.push('>');
            write_children(node, out);
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
        _ => {} // comments, doctype, processing instructions
    }
}

fn attr_allowed(name: &str, value: &str) -> bool {
    if name.starts_with("on") {
        return false;
    }
    if (name == "href" || name == "src") && value.trim_start().to_lowercase().starts_with("javascript:")
    {
        return false;
    }
    true
}

fn push_escaped_text(text: &str, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
}

fn push_escaped_attr(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scripts_and_event_handlers() {
        let dirty = r#"<p onclick="evil()">Hello <b>world</b></p><script>alert(1)</script>"#;
        let clean = clean_html(dirty);
        assert!(!clean.contains("script"));
        assert!(!clean.contains("onclick"));
        assert!(clean.contains("<p>"));
        assert!(clean.contains("<b>world</b>"));
    }

    #[test]
    fn preserves_links_and_images() {
        let html = r#"<a href="https://example.com/a">link</a><img src="https://example.com/i.png" alt="pic">"#;
        let clean = clean_html(html);
        assert!(clean.contains(r#"href="https://example.com/a""#));
        assert!(clean.contains(r#"src="https://example.com/i.png""#));
    }

    #[test]
    fn drops_javascript_urls() {
        let html = r#"<a href="javascript:alert(1)">x</a>"#;
        let clean = clean_html(html);
        assert!(!clean.contains("javascript:"));
        assert!(clean.contains("<a>"));
    }

    #[test]
    fn collects_media_urls() {
        let html = r#"<p><img src="https://a/1.png"><img src="data:image/png;base64,xx"></p>"#;
        let urls = collect_image_urls(html);
        assert_eq!(urls, vec!["https://a/1.png".to_string()]);
    }
}
