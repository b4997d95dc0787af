use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde::Serialize;

use crate::error::MigrationError;
use crate::mail_destination::{MailDestination, SendEmail};
use crate::mail_source::{MailSource, SourceMailbox};
use crate::message::EmailMessage;
use crate::settings::{DestinationConfig, SourceConfig};

// Aggregate outcome of one run. The end time is only stamped when the
// delivery phase ran to completion.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStats {
    pub total_emails: usize,
    pub successful_emails: usize,
    pub failed_emails: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl MigrationStats {
    pub(crate) fn new() -> Self {
        Self {
            total_emails: 0,
            successful_emails: 0,
            failed_emails: 0,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub(crate) fn finish(&mut self) {
        self.end_time = Some(Utc::now());
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds() as f64 / 1000.0)
    }

    // A completed run with any failed delivery still exits nonzero.
    pub fn exit_code(&self) -> u8 {
        if self.failed_emails > 0 {
            1
        } else {
            0
        }
    }
}

pub struct Migrator {
    source: MailSource,
    destination: MailDestination,
}

impl Migrator {
    pub fn new(
        source_config: SourceConfig,
        dest_config: DestinationConfig,
    ) -> Result<Self, MigrationError> {
        Ok(Self {
            source: MailSource::new(source_config),
            destination: MailDestination::new(dest_config)?,
        })
    }

    // Run the whole migration: connect, fetch, deliver one by one.
    pub async fn migrate(self) -> Result<MigrationStats, MigrationError> {
        migrate_between(self.source, self.destination).await
    }
}

// Drives one run over any source/destination pair. Whatever happens
// inside, the source session and the destination transport are released
// exactly once before the result propagates.
pub(crate) async fn migrate_between<S, D>(
    mut source: S,
    destination: D,
) -> Result<MigrationStats, MigrationError>
where
    S: SourceMailbox + Send,
    D: SendEmail + Sync,
{
    let mut stats = MigrationStats::new();
    let outcome = run(&mut source, &destination, &mut stats).await;

    source.disconnect().await;
    destination.close();

    outcome?;
    Ok(stats)
}

async fn run<S, D>(
    source: &mut S,
    destination: &D,
    stats: &mut MigrationStats,
) -> Result<(), MigrationError>
where
    S: SourceMailbox + Send,
    D: SendEmail + Sync,
{
    info!("Connecting to source email account...");
    source.connect().await?;

    info!("Fetching emails from source...");
    let emails = source.fetch_all().await?;
    stats.total_emails = emails.len();

    info!("Starting migration of {} emails...", emails.len());
    deliver_all(destination, &emails, stats).await;

    stats.finish();
    info!("Migration completed");
    if let Ok(dump) = serde_json::to_string(stats) {
        debug!("Migration stats: {}", dump);
    }
    Ok(())
}

// Sequential delivery with per-message accounting. A failed send is
// counted and logged, never fatal to the messages after it.
pub(crate) async fn deliver_all<D: SendEmail + Sync>(
    destination: &D,
    emails: &[EmailMessage],
    stats: &mut MigrationStats,
) {
    for (index, email) in emails.iter().enumerate() {
        let subject = email.subject_or_placeholder();
        match destination.send_email(email).await {
            Ok(()) => {
                stats.successful_emails += 1;
                info!(
                    "Email migrated ({}/{}): {}",
                    index + 1,
                    emails.len(),
                    subject
                );
            }
            Err(e) => {
                stats.failed_emails += 1;
                error!(
                    "Failed to migrate email ({}/{}): {}: {}",
                    index + 1,
                    emails.len(),
                    subject,
                    e
                );
            }
        }
    }
}
