/*!
OPML import/export. Export groups sources by category; import is the
inverse, so export-then-import is the identity on (title, url, category).
*/

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use rocket::{get, post, State};
use serde::Serialize;

use super::auth::AuthUser;
use super::envelope::{ok, ApiResult};
use super::AppState;
use crate::error::Error;
use crate::store::{NewSource, SourceRow};

#[derive(Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlEntry {
    pub title: Option<String>,
    pub url: String,
    pub category: Option<String>,
}

#[post("/api/opml/import", data = "<body>")]
pub async fn import_opml(
    state: &State<AppState>,
    user: AuthUser,
    body: String,
) -> ApiResult<ImportSummary> {
    let entries = parse_opml(&body)?;
    let mut imported = 0;
    let mut skipped = 0;
    for entry in entries {
        let new_source = NewSource {
            kind: "rss".to_string(),
            url: entry.url,
            title: entry.title,
            category: entry.category,
            ..Default::default()
        };
        match state.store.create_source(user.user_id, &new_source).await {
            Ok(_) => imported += 1,
            // Already subscribed; imports are idempotent.
            Err(Error::Conflict(_)) => skipped += 1,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ok(ImportSummary { imported, skipped }))
}

#[get("/api/opml/export")]
pub async fn export_opml(state: &State<AppState>, user: AuthUser) -> Result<String, super::envelope::ApiError> {
    let sources = state.store.list_sources(user.user_id).await?;
    Ok(render_opml(&sources)?)
}

pub fn parse_opml(raw: &str) -> Result<Vec<OpmlEntry>, Error> {
    let mut reader = Reader::from_str(raw);
    let mut entries = Vec::new();
    let mut category_stack: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if let Some(entry) = entry_from_outline(&e, &category_stack)? {
                    entries.push(entry);
                    category_stack.push(None);
                } else {
                    let text = attr(&e, "text")?.or(attr(&e, "title")?);
                    category_stack.push(text);
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                if let Some(entry) = entry_from_outline(&e, &category_stack)? {
                    entries.push(entry);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                category_stack.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Error::InvalidInput(format!("OPML is not well-formed: {}", e)));
            }
        }
    }
    Ok(entries)
}

fn entry_from_outline(
    e: &BytesStart<'_>,
    category_stack: &[Option<String>],
) -> Result<Option<OpmlEntry>, Error> {
    let Some(url) = attr(e, "xmlUrl")? else {
        return Ok(None);
    };
    let category = category_stack.iter().rev().find_map(|c| c.clone());
    Ok(Some(OpmlEntry {
        title: attr(e, "text")?.or(attr(e, "title")?),
        url,
        category,
    }))
}

fn attr(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, Error> {
    let found = e
        .try_get_attribute(name)
        .map_err(|err| Error::InvalidInput(format!("bad OPML attribute: {}", err)))?;
    match found {
        Some(a) => {
            let value = a
                .unescape_value()
                .map_err(|err| Error::InvalidInput(format!("bad OPML attribute value: {}", err)))?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

fn to_internal<E: std::fmt::Display>(e: E) -> Error {
    Error::Internal(anyhow::anyhow!("OPML write: {}", e))
}

pub fn render_opml(sources: &[SourceRow]) -> Result<String, Error> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(to_internal)?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer.write_event(Event::Start(opml)).map_err(to_internal)?;

    writer
        .write_event(Event::Start(BytesStart::new("head")))
        .map_err(to_internal)?;
    writer
        .write_event(Event::Start(BytesStart::new("title")))
        .map_err(to_internal)?;
    writer
        .write_event(Event::Text(BytesText::new("Feedmill subscriptions")))
        .map_err(to_internal)?;
    writer
        .write_event(Event::End(BytesEnd::new("title")))
        .map_err(to_internal)?;
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .map_err(to_internal)?;

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .map_err(to_internal)?;

    // Group by category, uncategorized sources first.
    let mut categories: Vec<Option<&str>> = Vec::new();
    for source in sources {
        let cat = source.category.as_deref();
        if !categories.contains(&cat) {
            categories.push(cat);
        }
    }

    for category in categories {
        if let Some(category) = category {
            let mut group = BytesStart::new("outline");
            group.push_attribute(("text", category));
            writer.write_event(Event::Start(group)).map_err(to_internal)?;
        }
        for source in sources.iter().filter(|s| s.category.as_deref() == category) {
            let mut outline = BytesStart::new("outline");
            outline.push_attribute(("type", "rss"));
            if let Some(title) = &source.title {
                outline.push_attribute(("text", title.as_str()));
            }
            outline.push_attribute(("xmlUrl", source.url.as_str()));
            writer.write_event(Event::Empty(outline)).map_err(to_internal)?;
        }
        if category.is_some() {
            writer
                .write_event(Event::End(BytesEnd::new("outline")))
                .map_err(to_internal)?;
        }
    }

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .map_err(to_internal)?;
    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .map_err(to_internal)?;

    String::from_utf8(writer.into_inner())
        .map_err(|e| Error::Internal(anyhow::anyhow!("OPML is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(title: &str, url: &str, category: Option<&str>) -> SourceRow {
        SourceRow {
            id: 0,
            user_id: 0,
            kind: "rss".to_string(),
            url: url.to_string(),
            title: Some(title.to_string()),
            category: category.map(str::to_string),
            position: 0,
            proxy_mode: None,
            refresh_mode: None,
            custom_interval_minutes: None,
            last_updated: None,
            last_error: None,
            etag: None,
            last_modified: None,
            is_image_mode: false,
            hide_from_timeline: false,
            params_json: None,
            email_last_uid: 0,
        }
    }

    #[test]
    fn export_then_import_is_identity_on_title_url_category() {
        let sources = vec![
            source("Plain", "https://example.com/a.xml", None),
            source("Tech & More", "https://example.com/b.xml", Some("Tech")),
            source("Tech Two", "https://example.com/c.xml?x=1&y=2", Some("Tech")),
        ];
        let rendered = render_opml(&sources).expect("render");
        let parsed = parse_opml(&rendered).expect("parse");

        let tuples: Vec<(Option<String>, String, Option<String>)> = parsed
            .into_iter()
            .map(|e| (e.title, e.url, e.category))
            .collect();
        assert_eq!(
            tuples,
            vec![
                (
                    Some("Plain".to_string()),
                    "https://example.com/a.xml".to_string(),
                    None
                ),
                (
                    Some("Tech & More".to_string()),
                    "https://example.com/b.xml".to_string(),
                    Some("Tech".to_string())
                ),
                (
                    Some("Tech Two".to_string()),
                    "https://example.com/c.xml?x=1&y=2".to_string(),
                    Some("Tech".to_string())
                ),
            ]
        );
    }

    #[test]
    fn malformed_opml_is_invalid_input() {
        let err = parse_opml("<opml><body><outline").unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }
}
