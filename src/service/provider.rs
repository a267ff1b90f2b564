use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use super::ServiceError;

/// Error type returned by provider methods.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) type AnyValue = Box<dyn Any + Send>;

type InvokeFuture = Pin<Box<dyn Future<Output = Result<AnyValue, ServiceError>> + Send>>;
type EncodedFuture = Pin<Box<dyn Future<Output = Result<Bytes, ServiceError>> + Send>>;

/// Per-call context handed to every provider method.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Instant after which the call is abandoned
    pub deadline: Option<Instant>,
    /// Instance id of the remote caller, when the call came over RPC
    pub caller: Option<String>,
}

impl CallContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            caller: None,
        }
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }
}

/// A value whose methods can be called by name.
///
/// ```ignore
/// impl ServiceProvider for UserService {
///     fn service_name(&self) -> String {
///         "user".to_string()
///     }
///
///     fn register_methods(methods: &mut MethodRegistrar<Self>) {
///         methods.method("GetUser", |svc, ctx, args: GetUserArgs| async move {
///             svc.get_user(ctx, args).await
///         });
///     }
/// }
/// ```
pub trait ServiceProvider: Send + Sync + Sized + 'static {
    /// Name the service is indexed under. Defaults to the type name.
    fn service_name(&self) -> String {
        default_service_name::<Self>()
    }

    /// Declare the callable methods of this provider.
    fn register_methods(methods: &mut MethodRegistrar<Self>);
}

/// A registered method: two adapters built once, at registration.
pub(crate) struct Method {
    invoke: Box<dyn Fn(CallContext, AnyValue) -> InvokeFuture + Send + Sync>,
    invoke_encoded: Box<dyn Fn(CallContext, Bytes) -> EncodedFuture + Send + Sync>,
}

impl Method {
    pub(crate) async fn invoke(
        &self,
        ctx: CallContext,
        args: AnyValue,
    ) -> Result<AnyValue, ServiceError> {
        (self.invoke)(ctx, args).await
    }

    pub(crate) async fn invoke_encoded(
        &self,
        ctx: CallContext,
        args: Bytes,
    ) -> Result<Bytes, ServiceError> {
        (self.invoke_encoded)(ctx, args).await
    }
}

/// Collects the methods of one provider.
pub struct MethodRegistrar<P> {
    provider: Arc<P>,
    service: String,
    methods: HashMap<String, Arc<Method>>,
}

impl<P: ServiceProvider> MethodRegistrar<P> {
    pub(crate) fn new(provider: P) -> Self {
        let service = provider.service_name();
        Self {
            provider: Arc::new(provider),
            service,
            methods: HashMap::new(),
        }
    }

    pub(crate) fn into_parts(self) -> (String, HashMap<String, Arc<Method>>) {
        (self.service, self.methods)
    }

    /// Register `f` under `name`.
    ///
    /// Only exported names (first character uppercase) are callable; anything
    /// else is skipped. Names are matched case-sensitively.
    pub fn method<A, R, F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<P>, CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
    {
        if !is_exported(name) {
            debug!(service = %self.service, method = %name, "Skipping unexported method");
            return self;
        }

        let f = Arc::new(f);

        let invoke = {
            let f = Arc::clone(&f);
            let provider = Arc::clone(&self.provider);
            let method = name.to_string();
            Box::new(move |ctx: CallContext, args: AnyValue| -> InvokeFuture {
                let args = match args.downcast::<A>() {
                    Ok(args) => *args,
                    Err(_) => {
                        let err = ServiceError::InvalidArguments {
                            method: method.clone(),
                            expected: std::any::type_name::<A>(),
                        };
                        return Box::pin(async move { Err::<AnyValue, _>(err) });
                    }
                };
                let fut = (*f)(Arc::clone(&provider), ctx, args);
                Box::pin(async move {
                    let reply = fut.await.map_err(ServiceError::Method)?;
                    Ok::<_, ServiceError>(Box::new(reply) as AnyValue)
                })
            })
        };

        let invoke_encoded = {
            let provider = Arc::clone(&self.provider);
            Box::new(move |ctx: CallContext, args: Bytes| -> EncodedFuture {
                let args: A = match rmp_serde::from_slice(&args) {
                    Ok(args) => args,
                    Err(e) => {
                        return Box::pin(async move { Err::<Bytes, _>(ServiceError::Decode(e)) })
                    }
                };
                let fut = (*f)(Arc::clone(&provider), ctx, args);
                Box::pin(async move {
                    let reply = fut.await.map_err(ServiceError::Method)?;
                    Ok::<_, ServiceError>(Bytes::from(rmp_serde::to_vec_named(&reply)?))
                })
            })
        };

        self.methods.insert(
            name.to_string(),
            Arc::new(Method {
                invoke,
                invoke_encoded,
            }),
        );
        self
    }
}

fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

/// Last path segment of the type name, without generic parameters.
pub(crate) fn default_service_name<T>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    struct Wrapper<T>(T);

    #[test]
    fn test_default_service_name() {
        assert_eq!(default_service_name::<Plain>(), "Plain");
        assert_eq!(default_service_name::<Wrapper<Plain>>(), "Wrapper");
    }

    #[test]
    fn test_is_exported() {
        assert!(is_exported("GetUser"));
        assert!(!is_exported("getUser"));
        assert!(!is_exported("_Get"));
        assert!(!is_exported(""));
    }
}
