//! Delivery cycle: offer each enabled subscriber the oldest listing they have not seen.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use hsearch_core::{ListingKey, Subscriber};
use hsearch_storage::ListingStore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::notify::Notifier;
use crate::report::{report, Cycle, Reporter};
use crate::scheduler::Dispatch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberOutcome {
    Delivered(ListingKey),
    NothingNew,
    /// The chat is unreachable and was switched off.
    Disabled,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatcherSummary {
    pub subscribers: usize,
    pub delivered: usize,
    pub idle: usize,
    pub disabled: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl MatcherSummary {
    fn record(&mut self, outcome: &SubscriberOutcome) {
        match outcome {
            SubscriberOutcome::Delivered(_) => self.delivered += 1,
            SubscriberOutcome::NothingNew => self.idle += 1,
            SubscriberOutcome::Disabled => self.disabled += 1,
            SubscriberOutcome::Failed(_) => self.failed += 1,
        }
    }
}

pub struct Matcher {
    store: Arc<dyn ListingStore>,
    notifier: Arc<dyn Notifier>,
    reporter: Arc<dyn Reporter>,
    /// Chats with a delivery task still running.
    busy: Mutex<BTreeSet<i64>>,
    /// Chats this matcher disabled -> last dispatch whose snapshot may still show them enabled.
    disabled: Mutex<BTreeMap<i64, u64>>,
    dispatches: AtomicU64,
}

/// Frees a chat for later ticks once its delivery task ends or is aborted.
struct BusyChat {
    matcher: Arc<Matcher>,
    chat_id: i64,
}

impl Drop for BusyChat {
    fn drop(&mut self) {
        self.matcher
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.chat_id);
    }
}

impl Matcher {
    pub fn new(
        store: Arc<dyn ListingStore>,
        notifier: Arc<dyn Notifier>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            store,
            notifier,
            reporter,
            busy: Mutex::new(BTreeSet::new()),
            disabled: Mutex::new(BTreeMap::new()),
            dispatches: AtomicU64::new(0),
        }
    }

    /// Keeps the subscribers no earlier tick is still serving, dropping chats this
    /// matcher disabled after the `epoch` snapshot was read.
    fn claim(&self, subscribers: Vec<Subscriber>, epoch: u64) -> Vec<Subscriber> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        let mut disabled = self.disabled.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers
            .into_iter()
            .filter(|subscriber| {
                let chat_id = subscriber.chat_id;
                if let Some(&last_stale) = disabled.get(&chat_id) {
                    if epoch <= last_stale {
                        debug!(chat_id, "skipping chat disabled after this snapshot");
                        return false;
                    }
                    disabled.remove(&chat_id);
                }
                if !busy.insert(chat_id) {
                    debug!(chat_id, "previous delivery still running");
                    return false;
                }
                true
            })
            .collect()
    }

    /// Starts one delivery task per enabled subscriber and hands back the consumer
    /// that collects their outcomes. The caller may drop it without waiting.
    pub async fn dispatch(self: &Arc<Self>, cancel: CancellationToken) -> Dispatch<MatcherSummary> {
        let epoch = self.dispatches.fetch_add(1, Ordering::SeqCst) + 1;
        let subscribers = match self.store.enabled_subscribers().await {
            Ok(subscribers) => subscribers,
            Err(err) => {
                report(self.reporter.as_ref(), Cycle::Matcher, "subscribers", &err);
                return Dispatch::spawn(async { MatcherSummary::default() });
            }
        };
        let subscribers = self.claim(subscribers, epoch);

        let mut summary = MatcherSummary {
            subscribers: subscribers.len(),
            ..MatcherSummary::default()
        };
        let mut deliveries = JoinSet::new();
        for subscriber in subscribers {
            let this = Arc::clone(self);
            let busy = BusyChat {
                matcher: Arc::clone(self),
                chat_id: subscriber.chat_id,
            };
            deliveries.spawn(
                async move {
                    let _busy = busy;
                    this.serve(subscriber).await
                }
                .in_current_span(),
            );
        }

        Dispatch::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        deliveries.abort_all();
                        summary.cancelled = true;
                        break;
                    }
                    joined = deliveries.join_next() => match joined {
                        None => break,
                        Some(Ok(outcome)) => summary.record(&outcome),
                        Some(Err(err)) => {
                            summary.failed += 1;
                            warn!(error = %err, "delivery task did not complete");
                        }
                    },
                }
            }
            info!(
                subscribers = summary.subscribers,
                delivered = summary.delivered,
                disabled = summary.disabled,
                failed = summary.failed,
                "matcher tick finished"
            );
            summary
        })
    }

    /// Delivers at most one listing to `subscriber`.
    pub async fn serve(&self, mut subscriber: Subscriber) -> SubscriberOutcome {
        let chat_id = subscriber.chat_id;
        let listing = match self.store.next_unseen_listing(&subscriber).await {
            Ok(Some(listing)) => listing,
            Ok(None) => {
                debug!(chat_id, "nothing new for subscriber");
                return SubscriberOutcome::NothingNew;
            }
            Err(err) => {
                report(self.reporter.as_ref(), Cycle::Matcher, chat_id.to_string(), &err);
                return SubscriberOutcome::Failed(err.to_string());
            }
        };

        match self.notifier.deliver(&listing, &subscriber).await {
            Ok(records) => {
                debug!(chat_id, listing = %listing.key(), messages = records.len(), "listing delivered");
                SubscriberOutcome::Delivered(listing.key())
            }
            Err(err) if err.is_recipient_unreachable() => {
                warn!(chat_id, error = %err, "disabling unreachable subscriber");
                subscriber.enable = false;
                if let Err(store_err) = self.store.update_subscriber(&subscriber).await {
                    report(self.reporter.as_ref(), Cycle::Matcher, chat_id.to_string(), &store_err);
                    return SubscriberOutcome::Failed(store_err.to_string());
                }
                self.disabled
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(chat_id, self.dispatches.load(Ordering::SeqCst));
                SubscriberOutcome::Disabled
            }
            Err(err) => {
                report(self.reporter.as_ref(), Cycle::Matcher, chat_id.to_string(), &err);
                SubscriberOutcome::Failed(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{listing, RecordingNotifier, RecordingReporter};
    use hsearch_storage::MemoryStore;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        reporter: Arc<RecordingReporter>,
        matcher: Arc<Matcher>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let reporter = Arc::new(RecordingReporter::default());
        let matcher = Arc::new(Matcher::new(store.clone(), notifier.clone(), reporter.clone()));
        store
            .persist_listings(vec![listing("diesel", 1), listing("diesel", 2)])
            .await
            .unwrap();
        Fixture {
            store,
            notifier,
            reporter,
            matcher,
        }
    }

    #[tokio::test]
    async fn blocked_subscriber_is_disabled_once_and_others_still_served() {
        let fx = fixture().await;
        fx.store.insert_subscriber(Subscriber::new(1, "blocked")).await;
        fx.store.insert_subscriber(Subscriber::new(2, "reader")).await;
        fx.notifier
            .fail_chat(1, "Forbidden: bot was blocked by the user");

        let summary = fx
            .matcher
            .dispatch(CancellationToken::new())
            .await
            .join()
            .await
            .unwrap();

        assert_eq!(summary.subscribers, 2);
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.disabled, 1);
        assert!(!fx.store.subscriber(1).await.unwrap().enable);
        assert!(fx.store.subscriber(2).await.unwrap().enable);
        assert_eq!(fx.notifier.delivered(), vec![(2, ListingKey::new("diesel", 1))]);
        assert!(fx.reporter.events().is_empty());

        fx.matcher
            .dispatch(CancellationToken::new())
            .await
            .join()
            .await
            .unwrap();
        assert_eq!(fx.notifier.attempts_for(1), 1);
        assert_eq!(fx.notifier.attempts_for(2), 2);
    }

    #[tokio::test]
    async fn transport_failure_keeps_the_subscriber_enabled() {
        let fx = fixture().await;
        fx.store.insert_subscriber(Subscriber::new(5, "flaky")).await;
        fx.notifier.fail_chat(5, "Too Many Requests: retry after 3");

        let summary = fx
            .matcher
            .dispatch(CancellationToken::new())
            .await
            .join()
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert!(fx.store.subscriber(5).await.unwrap().enable);
        let events = fx.reporter.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cycle, Cycle::Matcher);
        assert_eq!(events[0].scope, "5");
    }

    #[tokio::test]
    async fn each_tick_delivers_the_next_oldest_listing() {
        let fx = fixture().await;
        fx.store.insert_subscriber(Subscriber::new(9, "reader")).await;

        for _ in 0..3 {
            fx.matcher
                .dispatch(CancellationToken::new())
                .await
                .join()
                .await
                .unwrap();
        }

        assert_eq!(
            fx.notifier.delivered(),
            vec![
                (9, ListingKey::new("diesel", 1)),
                (9, ListingKey::new("diesel", 2)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_delivery_is_not_repeated_by_the_next_tick() {
        let store = Arc::new(MemoryStore::new());
        store
            .persist_listings(vec![listing("diesel", 1), listing("diesel", 2)])
            .await
            .unwrap();
        store.insert_subscriber(Subscriber::new(1, "blocked")).await;
        let notifier = Arc::new(RecordingNotifier::default().with_delay(Duration::from_secs(90)));
        notifier.fail_chat(1, "Forbidden: bot was blocked by the user");
        let matcher = Arc::new(Matcher::new(
            store.clone(),
            notifier.clone(),
            Arc::new(RecordingReporter::default()),
        ));

        let first = matcher.dispatch(CancellationToken::new()).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        let second = matcher.dispatch(CancellationToken::new()).await;
        let first = first.join().await.unwrap();
        let second = second.join().await.unwrap();

        assert_eq!(first.disabled, 1);
        assert_eq!(second.subscribers, 0);
        assert_eq!(notifier.attempts_for(1), 1);
        assert!(!store.subscriber(1).await.unwrap().enable);

        let third = matcher
            .dispatch(CancellationToken::new())
            .await
            .join()
            .await
            .unwrap();
        assert_eq!(third.subscribers, 0);
        assert_eq!(notifier.attempts_for(1), 1);
    }

    #[tokio::test]
    async fn re_enabled_chat_is_served_again() {
        let fx = fixture().await;
        fx.store.insert_subscriber(Subscriber::new(1, "blocked")).await;
        fx.notifier.fail_chat(1, "Forbidden: bot was blocked by the user");
        fx.matcher
            .dispatch(CancellationToken::new())
            .await
            .join()
            .await
            .unwrap();

        let mut chat = fx.store.subscriber(1).await.unwrap();
        assert!(!chat.enable);
        chat.enable = true;
        fx.store.update_subscriber(&chat).await.unwrap();

        let summary = fx
            .matcher
            .dispatch(CancellationToken::new())
            .await
            .join()
            .await
            .unwrap();
        assert_eq!(summary.subscribers, 1);
        assert_eq!(fx.notifier.attempts_for(1), 2);
    }

    #[tokio::test]
    async fn disabled_subscriber_gets_nothing() {
        let fx = fixture().await;
        let mut chat = Subscriber::new(4, "muted");
        chat.enable = false;
        fx.store.insert_subscriber(chat).await;

        let summary = fx
            .matcher
            .dispatch(CancellationToken::new())
            .await
            .join()
            .await
            .unwrap();

        assert_eq!(summary.subscribers, 0);
        assert_eq!(fx.notifier.attempts_for(4), 0);
    }

    #[tokio::test]
    async fn opted_out_site_is_not_offered() {
        let fx = fixture().await;
        let mut chat = Subscriber::new(3, "picky");
        chat.sites.insert("diesel".into(), false);
        fx.store.insert_subscriber(chat).await;

        let outcome = fx
            .matcher
            .serve(fx.store.subscriber(3).await.unwrap())
            .await;
        assert_eq!(outcome, SubscriberOutcome::NothingNew);
    }

    #[test]
    fn classifies_unreachable_transport_messages() {
        use crate::notify::DeliveryError;
        assert!(DeliveryError::classify("Forbidden: bot was blocked by the user").is_recipient_unreachable());
        assert!(DeliveryError::classify("Bad Request: chat not found").is_recipient_unreachable());
        assert!(!DeliveryError::classify("Gateway Timeout").is_recipient_unreachable());
    }
}
