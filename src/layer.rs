//! Tower integration for the execution guard.
//!
//! `GuardLayer` wraps any cloneable `Service<Req, Error = BoxError>` so that every call
//! runs through [`ExecutionGuard::execute`]. The wrapped service never fails: its
//! response is the [`GuardResult`] and its error type is `Infallible`.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use ai_reliability::{ExecutionGuard, GuardLayer, GuardRequest, ReliabilityConfig};
//! # use tower::{service_fn, BoxError, Layer, ServiceExt};
//! # async fn demo() {
//! let guard = Arc::new(ExecutionGuard::new(&ReliabilityConfig::default()));
//! let ocr = service_fn(|page: u32| async move { Ok::<_, BoxError>(format!("text of page {page}")) });
//! let svc = GuardLayer::new(guard, GuardRequest::new("ocr").concurrency_key("ocr")).layer(ocr);
//! let result = svc.oneshot(1).await.unwrap();
//! assert!(result.is_success());
//! # }
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::{BoxError, Layer, Service, ServiceExt};

use crate::guard::{ExecutionGuard, GuardRequest, GuardResult};

/// Layer applying the execution guard with a fixed request template.
#[derive(Clone)]
pub struct GuardLayer {
    guard: Arc<ExecutionGuard>,
    template: GuardRequest,
}

impl GuardLayer {
    pub fn new(guard: Arc<ExecutionGuard>, template: GuardRequest) -> Self {
        Self { guard, template }
    }
}

impl<S> Layer<S> for GuardLayer {
    type Service = Guarded<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Guarded {
            inner,
            guard: self.guard.clone(),
            template: self.template.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Guarded<S> {
    inner: S,
    guard: Arc<ExecutionGuard>,
    template: GuardRequest,
}

impl<S, Req> Service<Req> for Guarded<S>
where
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    Req: Clone + Send + 'static,
{
    type Response = GuardResult<S::Response>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    // Readiness is awaited per attempt on a clone of the inner service.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let guard = self.guard.clone();
        let template = self.template.clone();
        Box::pin(async move {
            let result = guard
                .execute(template, move |_ctx| {
                    let svc = inner.clone();
                    let req = req.clone();
                    async move { svc.oneshot(req).await }
                })
                .await;
            Ok(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorCode;
    use crate::guard::GuardStatus;
    use crate::config::ReliabilityConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::service_fn;

    #[tokio::test(start_paused = true)]
    async fn wraps_successful_service() {
        let guard = Arc::new(ExecutionGuard::new(&ReliabilityConfig::default()));
        let svc = GuardLayer::new(guard, GuardRequest::new("chat").concurrency_key("chat"))
            .layer(service_fn(|n: u32| async move { Ok::<_, BoxError>(n * 2) }));

        let result = svc.oneshot(21).await.unwrap();
        assert_eq!(result.status, GuardStatus::Success);
        assert_eq!(result.data, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_become_results_and_retry_clones_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let guard = Arc::new(ExecutionGuard::new(&ReliabilityConfig::default()));
        let svc = GuardLayer::new(guard.clone(), GuardRequest::new("ocr").retries(2)).layer(
            service_fn(move |_doc: String| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), BoxError>("503 service unavailable, network blip".into())
                }
            }),
        );

        let result = svc.oneshot("doc-1".to_string()).await.unwrap();
        assert_eq!(result.status, GuardStatus::Error);
        assert_eq!(result.error_code, Some(ErrorCode::NetworkError));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(guard.failure_log_len(), 1);
    }
}
