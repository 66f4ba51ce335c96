//! Periodic driver for the three cycles.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::garbage::GarbageCollector;
use crate::grabber::Grabber;
use crate::matcher::Matcher;
use crate::report::Cycle;

/// Delay before the first tick of every cycle.
pub const WARMUP: Duration = Duration::from_secs(2);

/// Work a tick handed off to a background consumer.
#[derive(Debug)]
pub struct Dispatch<S> {
    handle: JoinHandle<S>,
}

impl<S: Send + 'static> Dispatch<S> {
    pub(crate) fn spawn<F>(work: F) -> Self
    where
        F: Future<Output = S> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(work.in_current_span()),
        }
    }

    /// Waits for the consumer. Dropping the dispatch instead leaves it running.
    pub async fn join(self) -> Result<S, JoinError> {
        self.handle.await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub warmup: Duration,
    pub crawl_every: Duration,
    pub match_every: Duration,
    pub garbage_every: Duration,
}

/// Sleeps `warmup`, then runs `tick` and sleeps `every` after each completed tick until cancelled.
pub async fn run_periodic<F, Fut>(
    cycle: Cycle,
    warmup: Duration,
    every: Duration,
    cancel: CancellationToken,
    mut tick: F,
) where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = ()>,
{
    info!(cycle = %cycle, every = ?every, "cycle scheduled");
    let mut pause = warmup;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", cycle = %cycle, run_id = %run_id);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick(cancel.child_token()).instrument(span) => {}
        }
        pause = every;
    }
    info!(cycle = %cycle, "cycle stopped");
}

pub struct Scheduler {
    schedule: Schedule,
    grabber: Option<Arc<Grabber>>,
    matcher: Option<Arc<Matcher>>,
    garbage: Option<Arc<GarbageCollector>>,
}

impl Scheduler {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            grabber: None,
            matcher: None,
            garbage: None,
        }
    }

    pub fn with_grabber(mut self, grabber: Arc<Grabber>) -> Self {
        self.grabber = Some(grabber);
        self
    }

    pub fn with_matcher(mut self, matcher: Arc<Matcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn with_garbage(mut self, garbage: Arc<GarbageCollector>) -> Self {
        self.garbage = Some(garbage);
        self
    }

    pub fn start(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let mut loops = JoinSet::new();
        let Schedule {
            warmup,
            crawl_every,
            match_every,
            garbage_every,
        } = self.schedule;

        if let Some(grabber) = self.grabber {
            loops.spawn(run_periodic(
                Cycle::Grabber,
                warmup,
                crawl_every,
                cancel.child_token(),
                move |token| {
                    let grabber = Arc::clone(&grabber);
                    async move {
                        let summary = grabber.tick(&token).await;
                        info!(
                            persisted = summary.persisted(),
                            failed_sites = summary.failed_sites.len(),
                            "grabber tick finished"
                        );
                    }
                },
            ));
        }

        if let Some(matcher) = self.matcher {
            loops.spawn(run_periodic(
                Cycle::Matcher,
                warmup,
                match_every,
                cancel.child_token(),
                move |token| {
                    let matcher = Arc::clone(&matcher);
                    async move {
                        // Deliveries keep running in the background; the next tick does not wait.
                        drop(matcher.dispatch(token).await);
                    }
                },
            ));
        }

        if let Some(garbage) = self.garbage {
            loops.spawn(run_periodic(
                Cycle::Garbage,
                warmup,
                garbage_every,
                cancel.child_token(),
                move |token| {
                    let garbage = Arc::clone(&garbage);
                    async move {
                        drop(garbage.dispatch(token).await);
                    }
                },
            ));
        }

        SchedulerHandle { cancel, loops }
    }
}

pub struct SchedulerHandle {
    cancel: CancellationToken,
    loops: JoinSet<()>,
}

impl SchedulerHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels every cycle, including in-flight ticks and their consumers, and waits for the loops.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.loops.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "cycle loop did not stop cleanly");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn recorder() -> (Arc<Mutex<Vec<Duration>>>, Instant) {
        (Arc::new(Mutex::new(Vec::new())), Instant::now())
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_after_warmup_then_every_interval() {
        let (ticks, start) = recorder();
        let cancel = CancellationToken::new();
        let seen = Arc::clone(&ticks);
        let task = tokio::spawn(run_periodic(
            Cycle::Matcher,
            WARMUP,
            Duration::from_secs(60),
            cancel.clone(),
            move |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(start.elapsed());
                }
            },
        ));

        tokio::time::sleep(Duration::from_secs(150)).await;
        cancel.cancel();
        task.await.unwrap();

        let ticks = ticks.lock().unwrap().clone();
        assert_eq!(
            ticks,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(62),
                Duration::from_secs(122)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tick_delays_the_next_one() {
        let (ticks, start) = recorder();
        let cancel = CancellationToken::new();
        let seen = Arc::clone(&ticks);
        let task = tokio::spawn(run_periodic(
            Cycle::Grabber,
            WARMUP,
            Duration::from_secs(60),
            cancel.clone(),
            move |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(start.elapsed());
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
            },
        ));

        tokio::time::sleep(Duration::from_secs(100)).await;
        cancel.cancel();
        task.await.unwrap();

        let ticks = ticks.lock().unwrap().clone();
        assert_eq!(ticks, vec![Duration::from_secs(2), Duration::from_secs(92)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_a_running_tick() {
        let cancel = CancellationToken::new();
        let finished = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&finished);
        let task = tokio::spawn(run_periodic(
            Cycle::Garbage,
            Duration::ZERO,
            Duration::from_secs(3600),
            cancel.clone(),
            move |_| {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    *flag.lock().unwrap() = true;
                }
            },
        ));

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        task.await.unwrap();
        assert!(!*finished.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_every_cycle() {
        use crate::testing::{FakeAdapter, FakeFetcher, RecordingNotifier, RecordingReporter};
        use hsearch_storage::MemoryStore;

        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.page("https://fake.test/", "");
        let reporter = Arc::new(RecordingReporter::default());
        let grabber = Arc::new(Grabber::new(
            store.clone(),
            fetcher.clone(),
            reporter.clone(),
            vec![Arc::new(FakeAdapter::new("fake"))],
            4,
        ));
        let matcher = Arc::new(Matcher::new(
            store.clone(),
            Arc::new(RecordingNotifier::default()),
            reporter.clone(),
        ));
        let garbage = Arc::new(GarbageCollector::new(
            store,
            fetcher.clone(),
            reporter,
            Default::default(),
            4,
        ));

        let handle = Scheduler::new(Schedule {
            warmup: WARMUP,
            crawl_every: Duration::from_secs(10),
            match_every: Duration::from_secs(10),
            garbage_every: Duration::from_secs(10),
        })
        .with_grabber(grabber)
        .with_matcher(matcher)
        .with_garbage(garbage)
        .start();

        tokio::time::sleep(Duration::from_secs(25)).await;
        let crawls = fetcher.requests().len();
        assert_eq!(crawls, 3);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fetcher.requests().len(), crawls);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_warmup_never_ticks() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ticks = Arc::new(Mutex::new(0));
        let count = Arc::clone(&ticks);
        run_periodic(Cycle::Matcher, WARMUP, Duration::from_secs(1), cancel, move |_| {
            let count = Arc::clone(&count);
            async move {
                *count.lock().unwrap() += 1;
            }
        })
        .await;
        assert_eq!(*ticks.lock().unwrap(), 0);
    }
}
