use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::error;
use mailparse::{dateparse, parse_mail, DispositionType, MailHeaderMap, MailParseError, ParsedMail};

use crate::error::MigrationError;
use crate::message::{EmailAttachment, EmailMessage};

const FALLBACK_ATTACHMENT_NAME: &str = "attachment";

// Parse one raw RFC822 message into the normalized shape, decoding
// attachment bodies down to raw bytes.
pub fn parse_message(raw: &[u8]) -> Result<EmailMessage, MigrationError> {
    try_parse(raw).map_err(|e| MigrationError::Parse(format!("{:#}", e)))
}

// Parse every fetched body in order, dropping the ones that cannot be
// parsed (or that came back without a body at all). Returns the parsed
// messages plus the number of dropped ones.
pub fn parse_all<'a, I>(bodies: I) -> (Vec<EmailMessage>, usize)
where
    I: IntoIterator<Item = Option<&'a [u8]>>,
{
    let mut messages = Vec::new();
    let mut skipped = 0;

    for body in bodies {
        match body {
            Some(raw) => match parse_message(raw) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    error!("Error parsing email: {}", err);
                    skipped += 1;
                }
            },
            None => {
                error!("Error parsing email: fetch response carried no body");
                skipped += 1;
            }
        }
    }

    (messages, skipped)
}

fn try_parse(raw: &[u8]) -> anyhow::Result<EmailMessage> {
    let parsed = parse_mail(raw).context("invalid MIME structure")?;

    let mut headers = HashMap::new();
    for header in &parsed.headers {
        headers
            .entry(header.get_key())
            .or_insert_with(|| header.get_value());
    }

    let (text, html) = extract_bodies(&parsed).context("cannot decode message body")?;
    let attachments = extract_attachments(&parsed).context("cannot decode attachment")?;

    let date = parsed
        .headers
        .get_first_value("Date")
        .and_then(|value| dateparse(&value).ok())
        .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds, 0));

    Ok(EmailMessage {
        from: parsed.headers.get_first_value("From"),
        to: parsed.headers.get_first_value("To"),
        subject: parsed.headers.get_first_value("Subject"),
        text,
        html,
        headers,
        attachments,
        message_id: parsed.headers.get_first_value("Message-ID"),
        in_reply_to: parsed.headers.get_first_value("In-Reply-To"),
        references: parsed.headers.get_first_value("References"),
        date,
    })
}

// First non-attachment text/plain part becomes the text body, first
// text/html part the HTML body. Later duplicates are ignored.
fn extract_bodies(root: &ParsedMail) -> Result<(Option<String>, Option<String>), MailParseError> {
    let mut text = None;
    let mut html = None;
    collect_bodies(root, &mut text, &mut html)?;
    Ok((text, html))
}

fn collect_bodies(
    part: &ParsedMail,
    text: &mut Option<String>,
    html: &mut Option<String>,
) -> Result<(), MailParseError> {
    if part.subparts.is_empty() {
        if is_attachment(part) {
            return Ok(());
        }
        let mimetype = part.ctype.mimetype.to_ascii_lowercase();
        if mimetype.starts_with("text/html") {
            if html.is_none() {
                *html = Some(part.get_body()?);
            }
        } else if mimetype.starts_with("text/") && text.is_none() {
            *text = Some(part.get_body()?);
        }
        return Ok(());
    }

    for subpart in &part.subparts {
        collect_bodies(subpart, text, html)?;
    }
    Ok(())
}

fn extract_attachments(root: &ParsedMail) -> Result<Vec<EmailAttachment>, MailParseError> {
    let mut attachments = Vec::new();
    collect_attachments(root, &mut attachments)?;
    Ok(attachments)
}

fn collect_attachments(
    part: &ParsedMail,
    attachments: &mut Vec<EmailAttachment>,
) -> Result<(), MailParseError> {
    if part.subparts.is_empty() {
        if is_attachment(part) {
            attachments.push(EmailAttachment {
                filename: part_filename(part)
                    .unwrap_or_else(|| FALLBACK_ATTACHMENT_NAME.to_string()),
                content: part.get_body_raw()?,
                content_type: part.ctype.mimetype.clone(),
            });
        }
        return Ok(());
    }

    for subpart in &part.subparts {
        collect_attachments(subpart, attachments)?;
    }
    Ok(())
}

// A leaf counts as an attachment when it is marked as one, or when it
// carries a filename regardless of disposition. Inline parts with a
// name (cid-referenced images, attached logs) land here too.
fn is_attachment(part: &ParsedMail) -> bool {
    matches!(
        part.get_content_disposition().disposition,
        DispositionType::Attachment
    ) || part_filename(part).is_some()
}

// Filename from the disposition parameters, else the content-type name
// parameter.
fn part_filename(part: &ParsedMail) -> Option<String> {
    part.get_content_disposition()
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}
