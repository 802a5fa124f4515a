use anyhow::{Context, Result};
use futures::TryStreamExt;
use mailparse::MailHeaderMap;
use tracing::debug;

use super::{parse_params, sanitize, EmailParams, FetchContext, FetchOutcome, FetchedItem};
use crate::store::SourceRow;

/// Pull new messages from an IMAP mailbox.
///
/// Only UIDs above the source's recorded high-water mark are fetched; the
/// mark advances monotonically after ingestion. Subject becomes the item
/// title, the message body (HTML preferred) becomes the content.
pub async fn fetch(ctx: &FetchContext, source: &SourceRow) -> Result<FetchOutcome> {
    let params: EmailParams = parse_params(source)?;
    let password = ctx
        .secrets
        .decrypt(&params.password_enc)
        .context("failed to decrypt IMAP password")?;

    let tcp = tokio::net::TcpStream::connect((params.host.as_str(), params.port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", params.host, params.port))?;
    let connector = tokio_native_tls::TlsConnector::from(
        native_tls::TlsConnector::new().context("failed to build TLS connector")?,
    );
    let tls_stream = connector
        .connect(&params.host, tcp)
        .await
        .context("TLS handshake failed")?;

    let client = async_imap::Client::new(tls_stream);
    let mut session = client
        .login(&params.username, &password)
        .await
        .map_err(|(e, _)| anyhow::anyhow!("IMAP login failed: {}", e))?;

    session
        .select(&params.folder)
        .await
        .with_context(|| format!("failed to select folder {}", params.folder))?;

    let last_uid = source.email_last_uid.max(0) as u32;
    // "UID n:*" always matches the newest message even when its UID is
    // below n, so the result is filtered again below.
    let uids = session
        .uid_search(format!("UID {}:*", last_uid.saturating_add(1)))
        .await
        .context("UID search failed")?;

    let mut new_uids: Vec<u32> = uids.into_iter().filter(|u| *u > last_uid).collect();
    new_uids.sort_unstable();

    if new_uids.is_empty() {
        session.logout().await.ok();
        return Ok(FetchOutcome::default());
    }

    debug!(
        "email source {}: {} new messages above uid {}",
        source.id,
        new_uids.len(),
        last_uid
    );

    let set = new_uids
        .iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let messages: Vec<_> = {
        let stream = session
            .uid_fetch(&set, "RFC822")
            .await
            .context("UID fetch failed")?;
        stream.try_collect().await.context("failed to read messages")?
    };

    let mut items = Vec::with_capacity(messages.len());
    let mut highest = last_uid;
    for msg in &messages {
        let Some(uid) = msg.uid else { continue };
        highest = highest.max(uid);
        let Some(body) = msg.body() else { continue };
        match message_to_item(body, uid) {
            Ok(item) => items.push(item),
            Err(e) => {
                tracing::warn!("email source {}: skipping unparseable message {}: {}", source.id, uid, e);
            }
        }
    }

    session.logout().await.ok();

    Ok(FetchOutcome {
        items,
        last_uid: Some(highest as i64),
        ..Default::default()
    })
}

fn message_to_item(raw: &[u8], uid: u32) -> Result<FetchedItem> {
    let mail = mailparse::parse_mail(raw).context("failed to parse message")?;

    let title = mail
        .headers
        .get_first_value("Subject")
        .unwrap_or_else(|| format!("(no subject, uid {})", uid));
    let author = mail.headers.get_first_value("From");
    let published_at = mail
        .headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|epoch| chrono::DateTime::from_timestamp(epoch, 0));

    let body = best_body(&mail).unwrap_or_default();
    let content = if body.is_empty() {
        None
    } else {
        Some(sanitize::clean_html(&body))
    };
    let media_urls = content
        .as_deref()
        .map(sanitize::collect_image_urls)
        .unwrap_or_default();

    Ok(FetchedItem {
        title,
        url: None,
        media_urls,
        author,
        published_at,
        content,
        external_id: None,
    })
}

/// Prefer the HTML part, fall back to text/plain wrapped in <pre>.
fn best_body(mail: &mailparse::ParsedMail) -> Option<String> {
    if mail.ctype.mimetype.eq_ignore_ascii_case("text/html") {
        return mail.get_body().ok();
    }
    let mut plain = None;
    for part in &mail.subparts {
        if part.ctype.mimetype.eq_ignore_ascii_case("text/html") {
            if let Ok(body) = part.get_body() {
                return Some(body);
            }
        }
        if part.ctype.mimetype.eq_ignore_ascii_case("text/plain") && plain.is_none() {
            plain = part.get_body().ok();
        }
        if let Some(nested) = best_body(part) {
            return Some(nested);
        }
    }
    if mail.subparts.is_empty() && mail.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
        plain = mail.get_body().ok();
    }
    plain.map(|p| format!("<pre>{}</pre>", p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_message() {
        let raw = b"Subject: Weekly digest\r\nFrom: news@example.com\r\nDate: Mon, 01 Jan 2024 10:00:00 +0000\r\nContent-Type: text/plain\r\n\r\nHello there";
        let item = message_to_item(raw, 7).expect("parse");
        assert_eq!(item.title, "Weekly digest");
        assert_eq!(item.author.as_deref(), Some("news@example.com"));
        assert!(item.published_at.is_some());
        assert!(item.content.as_deref().unwrap().contains("Hello there"));
    }

    #[test]
    fn missing_subject_gets_placeholder() {
        let raw = b"From: a@b.c\r\nContent-Type: text/plain\r\n\r\nx";
        let item = message_to_item(raw, 42).expect("parse");
        assert!(item.title.contains("42"));
        assert!(item.published_at.is_none());
    }
}
