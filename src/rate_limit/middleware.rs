use crate::config::{AdmissionConfig, PolicyHandle, DEFAULT_EXEMPT_PATHS};
use crate::error::ConfigError;
use crate::key::KeyResolver;
use crate::policy::{ChargeMode, Policy};
use crate::rate_limit::{Decision, RateLimiter};
use http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Body of a rejection response.
pub const REJECTION_BODY: &str = "rate limit exceeded";

const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// A layer that runs admission control in front of an HTTP service.
#[derive(Debug)]
pub struct AdmissionLayer<L> {
    limiter: Arc<L>,
    resolver: Arc<KeyResolver>,
    policies: PolicyHandle,
    exempt: Arc<[String]>,
    mode: ChargeMode,
}

impl<L> Clone for AdmissionLayer<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            resolver: self.resolver.clone(),
            policies: self.policies.clone(),
            exempt: self.exempt.clone(),
            mode: self.mode,
        }
    }
}

impl<L> AdmissionLayer<L>
where
    L: RateLimiter + 'static,
{
    /// Create a layer with the default resolver and exempt paths.
    pub fn new(limiter: Arc<L>, policies: PolicyHandle) -> Self {
        Self {
            limiter,
            resolver: Arc::new(KeyResolver::default()),
            policies,
            exempt: DEFAULT_EXEMPT_PATHS.iter().map(|p| p.to_string()).collect(),
            mode: ChargeMode::default(),
        }
    }

    /// Create a layer from a validated configuration.
    pub fn from_config(limiter: Arc<L>, config: &AdmissionConfig) -> Result<Self, ConfigError> {
        let policies = PolicyHandle::new(config.policies()?)?;
        Ok(Self::new(limiter, policies)
            .resolver(config.resolver())
            .exempt_paths(config.exempt_paths.iter().cloned())
            .charge_mode(config.charge_mode))
    }

    /// Use `resolver` to map requests to keys.
    pub fn resolver(mut self, resolver: KeyResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Replace the exempt path list.
    pub fn exempt_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.exempt = paths.into_iter().map(Into::<String>::into).collect();
        self
    }

    /// How denied requests charge the other windows.
    pub fn charge_mode(mut self, mode: ChargeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Handle for swapping the policy list at runtime.
    pub fn policies(&self) -> &PolicyHandle {
        &self.policies
    }
}

impl<S, L> Layer<S> for AdmissionLayer<L>
where
    L: RateLimiter + 'static,
{
    type Service = AdmissionService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService { inner: service, layer: self.clone() }
    }
}

/// Middleware service that enforces admission control.
#[derive(Debug)]
pub struct AdmissionService<S, L> {
    inner: S,
    layer: AdmissionLayer<L>,
}

impl<S: Clone, L> Clone for AdmissionService<S, L> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S, L, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S, L>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    L: RateLimiter + 'static,
    ReqBody: Send + 'static,
    ResBody: From<&'static str> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // The clone has not been polled ready; keep the ready one for this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if is_exempt(&self.layer.exempt, req.uri().path()) {
            return Box::pin(inner.call(req));
        }
        let policies = self.layer.policies.get();
        if policies.is_empty() {
            return Box::pin(inner.call(req));
        }

        let key = self.layer.resolver.resolve(&req);
        let limiter = self.layer.limiter.clone();
        let mode = self.layer.mode;

        Box::pin(async move {
            let decision = check(&*limiter, &key, &policies, mode).await;
            if !decision.allowed {
                return Ok(reject(&decision));
            }
            let mut response = inner.call(req).await?;
            set_limit_headers(&mut response, &decision);
            Ok(response)
        })
    }
}

async fn check<L: RateLimiter + ?Sized>(limiter: &L, key: &str, policies: &[Policy], mode: ChargeMode) -> Decision {
    let decision = limiter.check_all(key, policies, mode).await;
    limiter.maintain().await;
    decision
}

/// Exact match, or a prefix ending at a path segment boundary.
fn is_exempt(exempt: &[String], path: &str) -> bool {
    exempt.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return path == "/";
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    })
}

fn reject<B: From<&'static str>>(decision: &Decision) -> Response<B> {
    let mut response = Response::new(B::from(REJECTION_BODY));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    set_limit_headers(&mut response, decision);
    let retry_after = decision.retry_after.unwrap_or(1);
    response.headers_mut().insert(http::header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn set_limit_headers<B>(response: &mut Response<B>, decision: &Decision) {
    let headers = response.headers_mut();
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.capacity));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
}
