//! Notification port and the log-only reference notifier.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use hsearch_core::{DeliveryKind, DeliveryRecord, Listing, Subscriber};
use thiserror::Error;
use tracing::info;

/// Transport replies meaning the chat will never accept messages again.
const UNREACHABLE_MARKERS: &[&str] = &[
    "blocked by the user",
    "bot was kicked",
    "user is deactivated",
    "chat not found",
];

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("recipient unreachable: {0}")]
    RecipientUnreachable(String),
    #[error("delivery failed: {0}")]
    Transport(String),
}

impl DeliveryError {
    /// Maps a raw transport error message onto the delivery error kinds.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if UNREACHABLE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            DeliveryError::RecipientUnreachable(message)
        } else {
            DeliveryError::Transport(message)
        }
    }

    pub fn is_recipient_unreachable(&self) -> bool {
        matches!(self, DeliveryError::RecipientUnreachable(_))
    }
}

/// Delivers one listing to one subscriber and returns the records of what was sent.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(
        &self,
        listing: &Listing,
        subscriber: &Subscriber,
    ) -> Result<Vec<DeliveryRecord>, DeliveryError>;
}

/// Writes deliveries to the log instead of a chat transport.
#[derive(Debug, Default)]
pub struct LogNotifier {
    next_message_id: AtomicI64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, listing: &Listing, subscriber: &Subscriber, kind: DeliveryKind) -> DeliveryRecord {
        DeliveryRecord {
            message_id: self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1,
            chat_id: subscriber.chat_id,
            listing: listing.key(),
            kind,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(
        &self,
        listing: &Listing,
        subscriber: &Subscriber,
    ) -> Result<Vec<DeliveryRecord>, DeliveryError> {
        info!(
            chat_id = subscriber.chat_id,
            chat = subscriber.display_name(),
            listing = %listing.key(),
            price = %listing.price,
            rooms = %listing.rooms,
            url = %listing.url,
            "{}",
            listing.topic
        );

        let mut records = vec![self.record(listing, subscriber, DeliveryKind::Apartment)];
        if subscriber.photo && listing.images_count > 0 {
            records.push(self.record(listing, subscriber, DeliveryKind::Photo));
        }
        Ok(records)
    }
}
