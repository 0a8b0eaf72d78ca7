use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use beacon_core::ids::RequestId;

use crate::error::RequestError;

type Reply = Result<Value, RequestError>;

/// Whole milliseconds, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

struct Pending {
    tx: oneshot::Sender<Reply>,
    created_at: Instant,
    timer: AbortHandle,
}

struct Inner {
    pending: Mutex<HashMap<RequestId, Pending>>,
    timeout: Duration,
}

impl Inner {
    /// The only place an entry leaves the map. Whoever gets it settles it.
    fn take(&self, id: &RequestId) -> Option<Pending> {
        self.pending.lock().remove(id)
    }

    fn settle(&self, id: &RequestId, reply: Reply) -> bool {
        let Some(entry) = self.take(id) else {
            tracing::debug!(request_id = %id, "dropping response for unknown or expired request");
            return false;
        };
        entry.timer.abort();
        tracing::trace!(request_id = %id, elapsed_ms = millis(entry.created_at.elapsed()), "request settled");
        let _ = entry.tx.send(reply);
        true
    }
}

/// Outstanding requests keyed by id, each with its own deadline.
///
/// Resolve, reject and timeout all go through one removal point, so the
/// first of them wins and the others become no-ops.
#[derive(Clone)]
pub struct RequestCorrelator {
    inner: Arc<Inner>,
}

/// Awaitable side of one registered request.
#[derive(Debug)]
pub struct ResponseHandle {
    pub request_id: RequestId,
    rx: oneshot::Receiver<Reply>,
}

impl ResponseHandle {
    pub async fn wait(self) -> Reply {
        self.rx.await.unwrap_or(Err(RequestError::Abandoned))
    }
}

impl RequestCorrelator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                timeout,
            }),
        }
    }

    /// Track `id` and arm its timeout. Must be called inside a tokio runtime.
    pub fn register(&self, id: RequestId) -> Result<ResponseHandle, RequestError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.inner.pending.lock();
        if pending.contains_key(&id) {
            return Err(RequestError::Duplicate(id));
        }

        let created_at = Instant::now();
        let deadline = created_at + self.inner.timeout;
        let timer = tokio::spawn(expire(Arc::downgrade(&self.inner), id.clone(), deadline)).abort_handle();
        pending.insert(id.clone(), Pending { tx, created_at, timer });

        Ok(ResponseHandle { request_id: id, rx })
    }

    pub fn resolve(&self, id: &RequestId, value: Value) -> bool {
        self.inner.settle(id, Ok(value))
    }

    pub fn reject(&self, id: &RequestId, error: RequestError) -> bool {
        self.inner.settle(id, Err(error))
    }

    /// Forget a request without settling it; its handle reports `Abandoned`.
    pub fn discard(&self, id: &RequestId) -> bool {
        match self.inner.take(id) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.inner.pending.lock().contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }
}

async fn expire(inner: Weak<Inner>, id: RequestId, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    let Some(inner) = inner.upgrade() else { return };
    let after = inner.timeout;
    if let Some(entry) = inner.take(&id) {
        tracing::warn!(request_id = %id, timeout_ms = millis(after), "request timed out");
        let _ = entry.tx.send(Err(RequestError::Timeout { request_id: id, after }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rid(s: &str) -> RequestId {
        RequestId::from_raw(s)
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn resolve_delivers_value_and_removes_entry() {
        let c = RequestCorrelator::new(Duration::from_secs(30));
        let handle = c.register(rid("r1")).unwrap();
        assert!(c.is_pending(&rid("r1")));

        assert!(c.resolve(&rid("r1"), json!({"ok": 1})));
        assert!(!c.is_pending(&rid("r1")));
        assert_eq!(handle.wait().await, Ok(json!({"ok": 1})));
    }

    #[tokio::test]
    async fn reject_delivers_error() {
        let c = RequestCorrelator::new(Duration::from_secs(30));
        let handle = c.register(rid("r1")).unwrap();
        assert!(c.reject(&rid("r1"), RequestError::Remote("nope".into())));
        assert_eq!(handle.wait().await, Err(RequestError::Remote("nope".into())));
    }

    #[tokio::test]
    async fn only_first_settlement_wins() {
        let c = RequestCorrelator::new(Duration::from_secs(30));
        let handle = c.register(rid("r1")).unwrap();
        assert!(c.resolve(&rid("r1"), json!(1)));
        assert!(!c.resolve(&rid("r1"), json!(2)));
        assert!(!c.reject(&rid("r1"), RequestError::Remote("late".into())));
        assert_eq!(handle.wait().await, Ok(json!(1)));
    }

    #[tokio::test]
    async fn duplicate_outstanding_id_is_refused() {
        let c = RequestCorrelator::new(Duration::from_secs(30));
        let _h = c.register(rid("r1")).unwrap();
        assert_eq!(
            c.register(rid("r1")).unwrap_err(),
            RequestError::Duplicate(rid("r1"))
        );
        assert_eq!(c.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_late_result_is_dropped() {
        let c = RequestCorrelator::new(Duration::from_secs(30));
        let handle = c.register(rid("r2")).unwrap();

        let err = handle.wait().await.unwrap_err();
        assert_eq!(
            err,
            RequestError::Timeout {
                request_id: rid("r2"),
                after: Duration::from_secs(30)
            }
        );
        assert_eq!(c.pending_count(), 0);

        assert!(!c.resolve(&rid("r2"), json!({"success": true})));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_before_deadline_disarms_timer() {
        let c = RequestCorrelator::new(Duration::from_secs(5));
        let handle = c.register(rid("r3")).unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(c.resolve(&rid("r3"), json!("in time")));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(handle.wait().await, Ok(json!("in time")));
    }

    #[tokio::test]
    async fn discard_abandons_handle() {
        let c = RequestCorrelator::new(Duration::from_secs(30));
        let handle = c.register(rid("r4")).unwrap();
        assert!(c.discard(&rid("r4")));
        assert_eq!(handle.wait().await, Err(RequestError::Abandoned));
    }

    #[tokio::test(start_paused = true)]
    async fn many_requests_time_out_independently() {
        let c = RequestCorrelator::new(Duration::from_secs(1));
        let handles: Vec<_> = (0..20).map(|i| c.register(rid(&format!("r{i}"))).unwrap()).collect();
        assert!(c.resolve(&rid("r7"), json!(7)));

        let mut timeouts = 0;
        for h in handles {
            if h.wait().await.is_err() {
                timeouts += 1;
            }
        }
        assert_eq!(timeouts, 19);
        assert_eq!(c.pending_count(), 0);
    }
}
