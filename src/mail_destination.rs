use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::debug;
use mailparse::{addrparse, MailAddr};

use crate::error::MigrationError;
use crate::message::EmailMessage;
use crate::settings::DestinationConfig;

const SMTPS_PORT: u16 = 465;
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

// Seam between the delivery loop and the SMTP transport, so the loop is
// testable without a server. Taking self by value in close makes a
// second close unrepresentable.
#[async_trait]
pub trait SendEmail {
    async fn send_email(&self, email: &EmailMessage) -> Result<(), MigrationError>;

    fn close(self)
    where
        Self: Sized;
}

// Outbound half of the migration: a pooled SMTP transport that connects
// on first use and redelivers normalized messages.
pub struct MailDestination {
    config: DestinationConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl MailDestination {
    pub fn new(config: DestinationConfig) -> Result<Self, MigrationError> {
        let transport = build_transport(&config)
            .map_err(|e| MigrationError::DestinationConnection(e.to_string()))?;
        Ok(Self { config, transport })
    }
}

#[async_trait]
impl SendEmail for MailDestination {
    async fn send_email(&self, email: &EmailMessage) -> Result<(), MigrationError> {
        let message = build_message(email, &self.config)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| MigrationError::Delivery(e.to_string()))?;
        debug!("Email sent successfully: {}", email.subject_or_placeholder());
        Ok(())
    }

    // Dropping the transport closes the pooled connections.
    fn close(self) {
        debug!("-- destination transport closed");
    }
}

fn build_transport(
    config: &DestinationConfig,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, lettre::transport::smtp::Error> {
    let credentials = Credentials::new(config.email.clone(), config.password.clone());

    let builder =
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host).port(config.port);

    let builder = if config.use_tls {
        let mut tls_builder = TlsParameters::builder(config.host.clone());
        if config.accept_invalid_certs {
            tls_builder = tls_builder
                .dangerous_accept_invalid_certs(true)
                .dangerous_accept_invalid_hostnames(true);
        }
        let tls_parameters = tls_builder.build()?;
        if config.port == SMTPS_PORT {
            builder.tls(Tls::Wrapper(tls_parameters))
        } else {
            builder.tls(Tls::Required(tls_parameters))
        }
    } else {
        builder.tls(Tls::None)
    };

    Ok(builder.credentials(credentials).build())
}

// Assemble the outgoing message. Envelope gaps fall back to the
// destination account, subject to the placeholder; threading headers and
// the origination date are carried over verbatim when present.
pub(crate) fn build_message(
    email: &EmailMessage,
    config: &DestinationConfig,
) -> Result<Message, MigrationError> {
    let account: Mailbox = config.email.parse().map_err(|e| {
        MigrationError::Delivery(format!(
            "destination address {:?} is not usable as a fallback: {}",
            config.email, e
        ))
    })?;

    // None makes the builder stamp a generated Message-ID; every
    // delivered message carries one.
    let mut builder = Message::builder()
        .from(mailbox_or(email.from.as_deref(), &account))
        .to(mailbox_or(email.to.as_deref(), &account))
        .subject(email.subject_or_placeholder())
        .message_id(email.message_id.clone());

    if let Some(in_reply_to) = &email.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }
    if let Some(references) = &email.references {
        builder = builder.references(references.clone());
    }
    if let Some(date) = email.date {
        builder = builder.date(date.into());
    }

    let text = email.text.clone().unwrap_or_default();
    let message = if email.attachments.is_empty() {
        if let Some(html) = &email.html {
            builder.multipart(MultiPart::alternative_plain_html(text, html.clone()))
        } else {
            builder.singlepart(SinglePart::plain(text))
        }
    } else {
        let mut multipart = MultiPart::mixed().build();
        multipart = if let Some(html) = &email.html {
            multipart.multipart(MultiPart::alternative_plain_html(text, html.clone()))
        } else {
            multipart.singlepart(SinglePart::plain(text))
        };
        for attachment in &email.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .unwrap_or_else(|_| ContentType::parse(FALLBACK_CONTENT_TYPE).unwrap());
            multipart = multipart.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.content.clone(), content_type),
            );
        }
        builder.multipart(multipart)
    };

    message.map_err(|e| MigrationError::Delivery(format!("cannot assemble message: {}", e)))
}

fn mailbox_or(raw: Option<&str>, fallback: &Mailbox) -> Mailbox {
    raw.and_then(parse_mailbox).unwrap_or_else(|| fallback.clone())
}

// First usable address in a header value, display name preserved.
// Handles both bare addresses and RFC5322 groups.
fn parse_mailbox(raw: &str) -> Option<Mailbox> {
    let parsed = addrparse(raw).ok()?;
    parsed.iter().find_map(|addr| match addr {
        MailAddr::Single(info) => {
            let address = info.addr.parse().ok()?;
            Some(Mailbox::new(info.display_name.clone(), address))
        }
        MailAddr::Group(group) => group.addrs.iter().find_map(|info| {
            let address = info.addr.parse().ok()?;
            Some(Mailbox::new(info.display_name.clone(), address))
        }),
    })
}
