//! Single-settlement result holder with success, failure and timeout observers.

use musubi_core::{Value, WorkflowError};
use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

type SuccessObserver = Box<dyn FnOnce(&[Value]) + Send>;
type FailureObserver = Box<dyn FnOnce(&WorkflowError) + Send>;
type TimeoutObserver = Box<dyn FnOnce() + Send>;

/// How a [`Continuation`] settled.
#[derive(Debug, Clone)]
pub enum Settled {
    /// Fulfilled with these values, in order.
    Fulfilled(Vec<Value>),
    /// Failed with this error.
    Failed(WorkflowError),
    /// The armed timer expired first.
    TimedOut,
}

impl Settled {
    /// Returns the fulfillment values, if any.
    pub fn values(&self) -> Option<&[Value]> {
        match self {
            Settled::Fulfilled(values) => Some(values),
            _ => None,
        }
    }

    /// Returns the failure, if any.
    pub fn error(&self) -> Option<&WorkflowError> {
        match self {
            Settled::Failed(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Inner {
    outcome: Option<Settled>,
    on_success: Vec<SuccessObserver>,
    on_failure: Vec<FailureObserver>,
    on_timeout: Vec<TimeoutObserver>,
    timer: Option<JoinHandle<()>>,
}

/// A value that settles exactly once: fulfilled, failed, or timed out.
///
/// Observers registered before settlement are queued and fire in registration
/// order when the matching outcome happens. Observers registered after
/// settlement fire immediately if their outcome is the one that happened.
/// Every settlement attempt after the first is ignored.
///
/// Clones share state.
///
/// # Examples
///
/// ```
/// use musubi::Continuation;
/// use musubi::value;
/// use std::sync::{Arc, Mutex};
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let c = Continuation::new();
///
/// let sink = seen.clone();
/// c.on_success(move |values| {
///     sink.lock().unwrap().push(*values[0].downcast_ref::<i32>().unwrap());
/// });
///
/// assert!(c.fulfill(vec![value(7)]));
/// assert!(!c.fail("too late"));
/// assert_eq!(*seen.lock().unwrap(), vec![7]);
/// ```
#[derive(Clone, Default)]
pub struct Continuation {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Continuation")
            .field("outcome", &inner.outcome)
            .field("armed", &inner.timer.is_some())
            .finish()
    }
}

impl Continuation {
    /// Creates an unsettled continuation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a continuation already fulfilled with `values`.
    pub fn fulfilled(values: Vec<Value>) -> Self {
        let c = Self::new();
        c.fulfill(values);
        c
    }

    /// Creates a continuation already failed with `error`.
    pub fn failed(error: impl Into<WorkflowError>) -> Self {
        let c = Self::new();
        c.fail(error);
        c
    }

    /// Runs `future` on the current tokio runtime and settles with its result.
    ///
    /// Fails immediately when called outside a runtime.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<Vec<Value>, WorkflowError>> + Send + 'static,
    {
        let c = Self::new();
        match Handle::try_current() {
            Ok(handle) => {
                let settle = c.clone();
                handle.spawn(async move {
                    match future.await {
                        Ok(values) => settle.fulfill(values),
                        Err(error) => settle.fail(error),
                    };
                });
            }
            Err(_) => {
                c.fail(WorkflowError::Configuration(
                    "Continuation::spawn requires a tokio runtime".to_string(),
                ));
            }
        }
        c
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a success observer.
    pub fn on_success<F>(&self, observer: F) -> &Self
    where
        F: FnOnce(&[Value]) + Send + 'static,
    {
        let values = {
            let mut inner = self.lock();
            if inner.outcome.is_none() {
                inner.on_success.push(Box::new(observer));
                return self;
            }
            match &inner.outcome {
                Some(Settled::Fulfilled(values)) => values.clone(),
                _ => return self,
            }
        };
        observer(values.as_slice());
        self
    }

    /// Registers a failure observer.
    pub fn on_failure<F>(&self, observer: F) -> &Self
    where
        F: FnOnce(&WorkflowError) + Send + 'static,
    {
        let error = {
            let mut inner = self.lock();
            if inner.outcome.is_none() {
                inner.on_failure.push(Box::new(observer));
                return self;
            }
            match &inner.outcome {
                Some(Settled::Failed(error)) => error.clone(),
                _ => return self,
            }
        };
        observer(&error);
        self
    }

    /// Registers a timeout observer.
    pub fn on_timeout<F>(&self, observer: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.lock();
            if inner.outcome.is_none() {
                inner.on_timeout.push(Box::new(observer));
                return self;
            }
            if !matches!(inner.outcome, Some(Settled::TimedOut)) {
                return self;
            }
        }
        observer();
        self
    }

    /// Fulfills with `values`. Returns `false` if already settled.
    pub fn fulfill(&self, values: Vec<Value>) -> bool {
        self.settle(Settled::Fulfilled(values), true)
    }

    /// Fails with `error`. Returns `false` if already settled.
    pub fn fail(&self, error: impl Into<WorkflowError>) -> bool {
        self.settle(Settled::Failed(error.into()), true)
    }

    fn expire(&self) -> bool {
        self.settle(Settled::TimedOut, false)
    }

    fn settle(&self, outcome: Settled, cancel_timer: bool) -> bool {
        let (on_success, on_failure, on_timeout, timer) = {
            let mut inner = self.lock();
            if inner.outcome.is_some() {
                trace!("ignoring settlement of an already settled continuation");
                return false;
            }
            inner.outcome = Some(outcome.clone());
            (
                mem::take(&mut inner.on_success),
                mem::take(&mut inner.on_failure),
                mem::take(&mut inner.on_timeout),
                inner.timer.take(),
            )
        };
        if let (Some(timer), true) = (timer, cancel_timer) {
            timer.abort();
        }

        match outcome {
            Settled::Fulfilled(values) => on_success
                .into_iter()
                .for_each(|f| f(values.as_slice())),
            Settled::Failed(error) => on_failure.into_iter().for_each(|f| f(&error)),
            Settled::TimedOut => on_timeout.into_iter().for_each(|f| f()),
        }
        true
    }

    /// Starts the timeout timer. `None` means never time out.
    ///
    /// Has no effect once settled, or outside a tokio runtime. Re-arming
    /// replaces the previous timer.
    pub fn arm(&self, timeout: Option<Duration>) -> &Self {
        let Some(after) = timeout else {
            return self;
        };
        if self.is_settled() {
            return self;
        }
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no tokio runtime available, continuation left unarmed");
                return self;
            }
        };

        let expiring = self.clone();
        let timer = handle.spawn(async move {
            tokio::time::sleep(after).await;
            expiring.expire();
        });

        let mut inner = self.lock();
        if inner.outcome.is_some() {
            timer.abort();
        } else if let Some(previous) = inner.timer.replace(timer) {
            previous.abort();
        }
        self
    }

    /// Returns the outcome, if settled.
    pub fn outcome(&self) -> Option<Settled> {
        self.lock().outcome.clone()
    }

    /// Returns `true` once any outcome happened.
    pub fn is_settled(&self) -> bool {
        self.lock().outcome.is_some()
    }

    /// Returns `true` if fulfilled.
    pub fn is_fulfilled(&self) -> bool {
        matches!(self.lock().outcome, Some(Settled::Fulfilled(_)))
    }

    /// Returns `true` if failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.lock().outcome, Some(Settled::Failed(_)))
    }

    /// Returns `true` if timed out.
    pub fn is_timed_out(&self) -> bool {
        matches!(self.lock().outcome, Some(Settled::TimedOut))
    }

    /// Returns a future resolving to the outcome.
    ///
    /// The observers are registered when this is called, not when the future
    /// is first polled.
    pub fn settled(&self) -> impl Future<Output = Settled> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let deliver = move |settled: Settled| {
            let sender = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(sender) = sender {
                let _ = sender.send(settled);
            }
        };

        let on_success = deliver.clone();
        let on_failure = deliver.clone();
        self.on_success(move |values| on_success(Settled::Fulfilled(values.to_vec())))
            .on_failure(move |error| on_failure(Settled::Failed(error.clone())))
            .on_timeout(move || deliver(Settled::TimedOut));

        async move {
            rx.await.unwrap_or_else(|_| {
                Settled::Failed(WorkflowError::Configuration(
                    "continuation dropped before settling".to_string(),
                ))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use musubi_core::value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn bump(c: &Arc<AtomicUsize>) -> impl Fn() + Send + 'static {
        let c = c.clone();
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_exactly_once_settlement() {
        let (ok, err, late) = (counter(), counter(), counter());
        let c = Continuation::new();
        let (f, g, h) = (bump(&ok), bump(&err), bump(&late));
        c.on_success(move |_| f()).on_failure(move |_| g());

        assert!(c.fulfill(vec![value(1)]));
        assert!(!c.fail("ignored"));
        assert!(!c.fulfill(vec![value(2)]));
        c.on_failure(move |_| h());

        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(err.load(Ordering::SeqCst), 0);
        assert_eq!(late.load(Ordering::SeqCst), 0);
        assert!(c.is_fulfilled());
    }

    #[test]
    fn test_failure_first_wins() {
        let ok = counter();
        let c = Continuation::new();
        let f = bump(&ok);
        c.on_success(move |_| f());

        assert!(c.fail("boom"));
        assert!(!c.fulfill(vec![]));
        assert_eq!(ok.load(Ordering::SeqCst), 0);
        assert_eq!(
            c.outcome().and_then(|s| s.error().cloned()),
            Some(WorkflowError::Failed("boom".to_string()))
        );
    }

    #[test]
    fn test_late_subscriber_fires_immediately() {
        let c = Continuation::fulfilled(vec![value("done".to_string())]);
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        c.on_success(move |values| {
            *sink.lock().unwrap() = values[0].downcast_ref::<String>().cloned();
        });
        assert_eq!(seen.lock().unwrap().as_deref(), Some("done"));
    }

    #[test]
    fn test_observers_fire_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let c = Continuation::new();
        for i in 0..3 {
            let order = order.clone();
            c.on_failure(move |_| order.lock().unwrap().push(i));
        }
        c.fail("x");
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_arm_without_runtime_is_a_no_op() {
        let c = Continuation::new();
        c.arm(Some(Duration::from_millis(1)));
        assert!(!c.is_settled());
    }

    #[tokio::test]
    async fn test_timeout_wins_over_late_fulfillment() {
        let (ok, timed_out) = (counter(), counter());
        let c = Continuation::new();
        let (f, g) = (bump(&ok), bump(&timed_out));
        c.on_success(move |_| f()).on_timeout(g);
        c.arm(Some(Duration::from_millis(20)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);

        assert!(!c.fulfill(vec![value(1)]));
        assert_eq!(ok.load(Ordering::SeqCst), 0);
        assert!(c.is_timed_out());
    }

    #[tokio::test]
    async fn test_fulfillment_cancels_timer() {
        let timed_out = counter();
        let c = Continuation::new();
        c.on_timeout(bump(&timed_out));
        c.arm(Some(Duration::from_millis(20)));
        c.fulfill(vec![]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(timed_out.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_never_timeout_is_not_armed() {
        let c = Continuation::new();
        c.arm(None);
        assert!(format!("{c:?}").contains("armed: false"));
    }

    #[tokio::test]
    async fn test_spawn_settles_from_future() {
        let c = Continuation::spawn(async { Ok(vec![value(5u8)]) });
        let settled = c.settled().await;
        let values = settled.values().map(<[Value]>::to_vec).unwrap_or_default();
        assert_eq!(values[0].downcast_ref::<u8>(), Some(&5));

        let c = Continuation::spawn(async { Err(WorkflowError::from("remote down")) });
        assert!(matches!(c.settled().await, Settled::Failed(_)));
    }
}
