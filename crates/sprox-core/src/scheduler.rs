//! Deferred notification delivery
//!
//! Notifications are queued per consumer and per observer and delivered from a
//! task spawned on the runtime, never on the stack of the call that enqueued
//! them. Within one (consumer, observer) pair delivery order is enqueue order;
//! there is no ordering across pairs.

use crate::error::{Error, Result};
use crate::observer::{Notification, ProxyObserver};
use crate::port::{ExceptionReporter, SystemException};
use crate::types::ConsumerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error};

/// Scheduler tuning
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Consumers drained per turn before yielding to the runtime (`None` = all)
    pub consumers_per_turn: Option<usize>,
}

struct ObserverQueue {
    observer: Arc<dyn ProxyObserver>,
    items: VecDeque<Notification>,
}

#[derive(Default)]
struct Queues {
    scheduled: bool,
    /// Queued plus in-flight notifications
    outstanding: usize,
    by_consumer: HashMap<ConsumerId, Vec<ObserverQueue>>,
    /// Consumers with queued work, oldest first
    order: VecDeque<ConsumerId>,
}

struct Inner {
    queues: Mutex<Queues>,
    idle: watch::Sender<bool>,
    reporter: Arc<dyn ExceptionReporter>,
    runtime: Handle,
    config: SchedulerConfig,
}

/// Batches notifications and tracks whether any delivery is outstanding
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler bound to the current tokio runtime
    pub fn new(reporter: Arc<dyn ExceptionReporter>) -> Result<Self> {
        Self::with_config(reporter, SchedulerConfig::default())
    }

    pub fn with_config(
        reporter: Arc<dyn ExceptionReporter>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let (idle, _) = watch::channel(true);

        Ok(Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(Queues::default()),
                idle,
                reporter,
                runtime,
                config,
            }),
        })
    }

    /// Queue a notification for later delivery
    pub fn enqueue(
        &self,
        consumer: &ConsumerId,
        observer: &Arc<dyn ProxyObserver>,
        notification: Notification,
    ) {
        let needs_dispatch = {
            let mut queues = self.inner.queues.lock();
            if !queues.by_consumer.contains_key(consumer) {
                queues.order.push_back(consumer.clone());
            }
            let by_observer = queues.by_consumer.entry(consumer.clone()).or_default();
            match by_observer
                .iter_mut()
                .find(|q| same_observer(&q.observer, observer))
            {
                Some(queue) => queue.items.push_back(notification),
                None => by_observer.push(ObserverQueue {
                    observer: observer.clone(),
                    items: VecDeque::from([notification]),
                }),
            }
            queues.outstanding += 1;
            self.inner.idle.send_replace(false);
            !std::mem::replace(&mut queues.scheduled, true)
        };

        if needs_dispatch {
            let inner = self.inner.clone();
            self.inner.runtime.spawn(inner.dispatch());
        }
    }

    /// Whether any notification is queued or being delivered
    pub fn busy(&self) -> bool {
        self.inner.queues.lock().outstanding > 0
    }

    pub fn outstanding(&self) -> usize {
        self.inner.queues.lock().outstanding
    }

    /// Resolves once every queued notification has been delivered
    pub fn idle(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.inner.idle.subscribe();
        async move {
            let _ = receiver.wait_for(|idle| *idle).await.map(|_| ());
        }
    }
}

impl Inner {
    async fn dispatch(self: Arc<Self>) {
        let per_turn = self.config.consumers_per_turn.map(|n| n.max(1));

        loop {
            let batch: Vec<(ConsumerId, Vec<ObserverQueue>)> = {
                let mut queues = self.queues.lock();
                if queues.by_consumer.is_empty() {
                    queues.scheduled = false;
                    if queues.outstanding == 0 {
                        self.idle.send_replace(true);
                    }
                    return;
                }
                let take = per_turn.unwrap_or(usize::MAX).min(queues.order.len());
                let consumers: Vec<ConsumerId> = queues.order.drain(..take).collect();
                consumers
                    .into_iter()
                    .filter_map(|c| queues.by_consumer.remove_entry(&c))
                    .collect()
            };

            let mut delivered = 0;
            for (consumer, observers) in batch {
                for queue in observers {
                    for notification in queue.items {
                        delivered += 1;
                        self.deliver(&consumer, &queue.observer, notification);
                    }
                }
            }
            debug!(delivered, "Dispatched notifications");

            {
                let mut queues = self.queues.lock();
                queues.outstanding = queues.outstanding.saturating_sub(delivered);
            }

            if per_turn.is_some() {
                tokio::task::yield_now().await;
            }
        }
    }

    fn deliver(
        &self,
        consumer: &ConsumerId,
        observer: &Arc<dyn ProxyObserver>,
        notification: Notification,
    ) {
        let kind = notification.kind();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            observer.on_notification(consumer, notification)
        }));

        let message = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };

        error!(consumer = %consumer, kind, error = %message, "Error dispatching to observer");
        self.reporter.report_exception(SystemException::new(
            message,
            "Scheduler::dispatch",
            Some(consumer.clone()),
        ));
    }
}

fn same_observer(a: &Arc<dyn ProxyObserver>, b: &Arc<dyn ProxyObserver>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "observer panicked".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::observer::{ChannelObserver, HandleOptions, ObserverError, Snapshot};

    #[derive(Default)]
    pub(crate) struct RecordingReporter {
        pub exceptions: Mutex<Vec<SystemException>>,
    }

    impl ExceptionReporter for RecordingReporter {
        fn report_exception(&self, exception: SystemException) {
            self.exceptions.lock().push(exception);
        }
    }

    struct FailingObserver {
        calls: Mutex<usize>,
        panic: bool,
    }

    impl ProxyObserver for FailingObserver {
        fn options(&self) -> HandleOptions {
            HandleOptions::default()
        }

        fn on_notification(&self, _: &ConsumerId, _: Notification) -> std::result::Result<(), ObserverError> {
            *self.calls.lock() += 1;
            if self.panic {
                panic!("observer blew up");
            }
            Err("observer failed".into())
        }
    }

    fn scheduler() -> (Scheduler, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::default());
        (Scheduler::new(reporter.clone()).unwrap(), reporter)
    }

    #[test]
    fn test_requires_runtime() {
        let reporter = Arc::new(RecordingReporter::default());
        assert!(matches!(Scheduler::new(reporter), Err(Error::NoRuntime)));
    }

    #[tokio::test]
    async fn test_delivery_is_deferred() {
        let (scheduler, _) = scheduler();
        let (observer, mut rx) = ChannelObserver::new(HandleOptions::default());
        let observer: Arc<dyn ProxyObserver> = Arc::new(observer);
        let consumer = ConsumerId::from("p1");

        scheduler.enqueue(&consumer, &observer, Notification::Desync);
        assert!(rx.try_recv().is_err());
        assert!(scheduler.busy());

        scheduler.idle().await;
        assert!(!scheduler.busy());
        assert_eq!(rx.try_recv().unwrap(), (consumer, Notification::Desync));
    }

    #[tokio::test]
    async fn test_fifo_per_observer() {
        let (scheduler, _) = scheduler();
        let (observer, mut rx) = ChannelObserver::new(HandleOptions::default());
        let observer: Arc<dyn ProxyObserver> = Arc::new(observer);
        let consumer = ConsumerId::from("p1");

        scheduler.enqueue(&consumer, &observer, Notification::Sync(Snapshot::Empty));
        scheduler.enqueue(&consumer, &observer, Notification::Desync);
        scheduler.enqueue(&consumer, &observer, Notification::Sync(Snapshot::Variable(None)));
        assert_eq!(scheduler.outstanding(), 3);
        scheduler.idle().await;

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|(_, n)| n)
            .collect();
        assert_eq!(
            kinds,
            vec![
                Notification::Sync(Snapshot::Empty),
                Notification::Desync,
                Notification::Sync(Snapshot::Variable(None)),
            ]
        );
    }

    #[tokio::test]
    async fn test_idle_when_nothing_queued() {
        let (scheduler, _) = scheduler();
        assert!(!scheduler.busy());
        scheduler.idle().await;
    }

    #[tokio::test]
    async fn test_callback_errors_are_reported_and_drain_continues() {
        let (scheduler, reporter) = scheduler();
        let failing = Arc::new(FailingObserver { calls: Mutex::new(0), panic: false });
        let failing_dyn: Arc<dyn ProxyObserver> = failing.clone();
        let panicking = Arc::new(FailingObserver { calls: Mutex::new(0), panic: true });
        let panicking_dyn: Arc<dyn ProxyObserver> = panicking.clone();
        let (good, mut rx) = ChannelObserver::new(HandleOptions::default());
        let good: Arc<dyn ProxyObserver> = Arc::new(good);
        let consumer = ConsumerId::from("p1");

        scheduler.enqueue(&consumer, &failing_dyn, Notification::Desync);
        scheduler.enqueue(&consumer, &failing_dyn, Notification::Desync);
        scheduler.enqueue(&consumer, &panicking_dyn, Notification::Desync);
        scheduler.enqueue(&consumer, &good, Notification::Desync);
        scheduler.idle().await;

        assert_eq!(*failing.calls.lock(), 2);
        assert_eq!(*panicking.calls.lock(), 1);
        assert!(rx.try_recv().is_ok());

        let exceptions = reporter.exceptions.lock();
        assert_eq!(exceptions.len(), 3);
        assert!(exceptions.iter().all(|e| e.method == "Scheduler::dispatch"));
        assert!(exceptions.iter().any(|e| e.message == "observer blew up"));
        assert_eq!(exceptions[0].consumer, Some(consumer));
    }

    #[tokio::test]
    async fn test_bounded_turns_drain_every_consumer() {
        let reporter = Arc::new(RecordingReporter::default());
        let scheduler = Scheduler::with_config(
            reporter,
            SchedulerConfig { consumers_per_turn: Some(1) },
        )
        .unwrap();
        let (observer, mut rx) = ChannelObserver::new(HandleOptions::default());
        let observer: Arc<dyn ProxyObserver> = Arc::new(observer);

        for i in 0..5 {
            scheduler.enqueue(&ConsumerId::new(format!("p{}", i)), &observer, Notification::Desync);
        }
        scheduler.idle().await;

        let order: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|(consumer, _)| consumer.to_string())
            .collect();
        assert_eq!(order, vec!["p0", "p1", "p2", "p3", "p4"]);
    }

    /// Queues another notification for its consumer on each of the first `again` deliveries
    struct Requeueing {
        scheduler: Scheduler,
        me: Mutex<Option<Arc<dyn ProxyObserver>>>,
        again: Mutex<usize>,
        seen: Mutex<Vec<ConsumerId>>,
    }

    impl ProxyObserver for Requeueing {
        fn options(&self) -> HandleOptions {
            HandleOptions::default()
        }

        fn on_notification(&self, consumer: &ConsumerId, _: Notification) -> std::result::Result<(), ObserverError> {
            self.seen.lock().push(consumer.clone());
            let mut again = self.again.lock();
            if consumer.as_str() == "busy" && *again > 0 {
                *again -= 1;
                if let Some(me) = self.me.lock().clone() {
                    self.scheduler.enqueue(consumer, &me, Notification::Desync);
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_bounded_turns_do_not_starve_quiet_consumers() {
        let reporter = Arc::new(RecordingReporter::default());
        let scheduler = Scheduler::with_config(
            reporter,
            SchedulerConfig { consumers_per_turn: Some(1) },
        )
        .unwrap();
        let observer = Arc::new(Requeueing {
            scheduler: scheduler.clone(),
            me: Mutex::new(None),
            again: Mutex::new(3),
            seen: Mutex::new(Vec::new()),
        });
        let observer_dyn: Arc<dyn ProxyObserver> = observer.clone();
        *observer.me.lock() = Some(observer_dyn.clone());

        for name in ["busy", "quiet1", "quiet2"] {
            scheduler.enqueue(&ConsumerId::from(name), &observer_dyn, Notification::Desync);
        }
        scheduler.idle().await;
        // break the observer's reference to itself
        observer.me.lock().take();

        let seen: Vec<String> = observer.seen.lock().iter().map(|c| c.to_string()).collect();
        assert_eq!(seen, vec!["busy", "quiet1", "quiet2", "busy", "busy", "busy"]);
    }
}
