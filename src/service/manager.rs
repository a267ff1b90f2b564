use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use tracing::{debug, error, warn};

use super::provider::{AnyValue, Method, MethodRegistrar};
use super::{CallContext, ServiceError, ServiceProvider};

struct Service {
    methods: HashMap<String, Arc<Method>>,
}

/// Name-indexed table of registered services.
///
/// Registration happens before the owning component starts; lookups after
/// that only read the table.
#[derive(Default)]
pub struct ServiceManager {
    services: HashMap<String, Service>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its service name.
    ///
    /// A provider without callable methods is rejected; the failure is logged
    /// and returned so the caller can carry on with other providers.
    pub fn register<P: ServiceProvider>(&mut self, provider: P) -> Result<String, ServiceError> {
        let mut registrar = MethodRegistrar::new(provider);
        P::register_methods(&mut registrar);
        let (name, methods) = registrar.into_parts();

        if methods.is_empty() {
            let err = ServiceError::NoCallableMethods(name);
            warn!(error = %err, "Register service failed");
            return Err(err);
        }

        debug!(service = %name, methods = methods.len(), "Registered service");

        if self
            .services
            .insert(name.clone(), Service { methods })
            .is_some()
        {
            warn!(service = %name, "Service registered twice, previous provider replaced");
        }

        Ok(name)
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// Names of all registered services.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Call a method with in-process arguments.
    pub async fn call(
        &self,
        ctx: CallContext,
        service: &str,
        method: &str,
        args: AnyValue,
    ) -> Result<AnyValue, ServiceError> {
        let m = self.resolve(service, method)?;
        let deadline = ctx.deadline;
        guard(service, method, deadline, async move { m.invoke(ctx, args).await }).await
    }

    /// Call a method and downcast the reply.
    pub async fn call_typed<A, R>(
        &self,
        ctx: CallContext,
        service: &str,
        method: &str,
        args: A,
    ) -> Result<R, ServiceError>
    where
        A: Send + 'static,
        R: Any,
    {
        let reply = self.call(ctx, service, method, Box::new(args)).await?;
        reply
            .downcast::<R>()
            .map(|r| *r)
            .map_err(|_| ServiceError::InvalidReply(std::any::type_name::<R>()))
    }

    /// Call a method with MessagePack-encoded arguments, returning the
    /// encoded reply.
    pub async fn call_encoded(
        &self,
        ctx: CallContext,
        service: &str,
        method: &str,
        args: Bytes,
    ) -> Result<Bytes, ServiceError> {
        let m = self.resolve(service, method)?;
        let deadline = ctx.deadline;
        guard(service, method, deadline, async move {
            m.invoke_encoded(ctx, args).await
        })
        .await
    }

    fn resolve(&self, service: &str, method: &str) -> Result<Arc<Method>, ServiceError> {
        let svc = self
            .services
            .get(service)
            .ok_or_else(|| ServiceError::NotFoundService(service.to_string()))?;

        svc.methods
            .get(method)
            .cloned()
            .ok_or_else(|| ServiceError::NotFoundMethod {
                service: service.to_string(),
                method: method.to_string(),
            })
    }
}

/// Run an invocation with panic recovery and the caller's deadline.
async fn guard<T, F>(
    service: &str,
    method: &str,
    deadline: Option<tokio::time::Instant>,
    fut: F,
) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    let fut = AssertUnwindSafe(fut).catch_unwind();

    let result = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(service, method, "Service call deadline exceeded");
                return Err(ServiceError::DeadlineExceeded);
            }
        },
        None => fut.await,
    };

    result.unwrap_or_else(|panic| {
        let message = panic_message(panic.as_ref());
        error!(service, method, panic = %message, "Service method panicked");
        Err(ServiceError::Panicked(message))
    })
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use tokio::sync::Mutex;

    use super::*;
    use crate::service::BoxError;

    #[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
    struct User {
        age: u32,
        nickname: String,
        uid: i64,
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct AddUserArgs {
        age: u32,
        nickname: String,
        uid: i64,
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct GetUserArgs {
        uid: i64,
    }

    #[derive(Debug, PartialEq, Deserialize, Serialize)]
    struct GetUserReply {
        user: User,
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct ModifyNicknameArgs {
        nickname: String,
        uid: i64,
    }

    #[derive(Default)]
    struct UserService {
        users: Mutex<HashMap<i64, User>>,
    }

    impl UserService {
        async fn add_user(&self, args: AddUserArgs) -> Result<(), BoxError> {
            self.users.lock().await.insert(
                args.uid,
                User {
                    age: args.age,
                    nickname: args.nickname,
                    uid: args.uid,
                },
            );
            Ok(())
        }

        async fn get_user(&self, args: GetUserArgs) -> Result<GetUserReply, BoxError> {
            let users = self.users.lock().await;
            let user = users.get(&args.uid).cloned().ok_or("not found user")?;
            Ok(GetUserReply { user })
        }

        async fn modify_nickname(&self, args: ModifyNicknameArgs) -> Result<GetUserReply, BoxError> {
            let mut users = self.users.lock().await;
            let user = users.get_mut(&args.uid).ok_or("not found user")?;
            user.nickname = args.nickname;
            Ok(GetUserReply { user: user.clone() })
        }
    }

    impl ServiceProvider for UserService {
        fn service_name(&self) -> String {
            "user".to_string()
        }

        fn register_methods(methods: &mut MethodRegistrar<Self>) {
            methods
                .method("AddUser", |svc, _ctx, args: AddUserArgs| async move {
                    svc.add_user(args).await
                })
                .method("GetUser", |svc, _ctx, args: GetUserArgs| async move {
                    svc.get_user(args).await
                })
                .method("ModifyNickname", |svc, _ctx, args: ModifyNicknameArgs| async move {
                    svc.modify_nickname(args).await
                })
                .method("purge", |svc, _ctx, _args: ()| async move {
                    svc.users.lock().await.clear();
                    Ok(())
                });
        }
    }

    struct Faulty;

    impl ServiceProvider for Faulty {
        fn register_methods(methods: &mut MethodRegistrar<Self>) {
            methods
                .method("Explode", |_svc, _ctx, _args: ()| async move {
                    if true {
                        panic!("handler blew up");
                    }
                    Ok(())
                })
                .method("Sleep", |_svc, _ctx, millis: u64| async move {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(millis)
                });
        }
    }

    struct Silent;

    impl ServiceProvider for Silent {
        fn register_methods(methods: &mut MethodRegistrar<Self>) {
            methods.method("hidden", |_svc, _ctx, _args: ()| async move { Ok(()) });
        }
    }

    fn manager() -> ServiceManager {
        let mut m = ServiceManager::new();
        m.register(UserService::default()).unwrap();
        m
    }

    #[tokio::test]
    async fn test_call_round_trip_through_methods() {
        let m = manager();
        let ctx = CallContext::default();

        m.call_typed::<_, ()>(
            ctx.clone(),
            "user",
            "AddUser",
            AddUserArgs {
                age: 31,
                nickname: "fuxiao".to_string(),
                uid: 1,
            },
        )
        .await
        .unwrap();

        let reply: GetUserReply = m
            .call_typed(ctx.clone(), "user", "ModifyNickname", ModifyNicknameArgs {
                nickname: "yuebanfuxiao".to_string(),
                uid: 1,
            })
            .await
            .unwrap();
        assert_eq!(reply.user.nickname, "yuebanfuxiao");

        let reply: GetUserReply = m
            .call_typed(ctx, "user", "GetUser", GetUserArgs { uid: 1 })
            .await
            .unwrap();
        assert_eq!(reply.user.age, 31);
    }

    #[tokio::test]
    async fn test_method_error_is_returned() {
        let m = manager();
        let err = m
            .call_typed::<_, GetUserReply>(CallContext::default(), "user", "GetUser", GetUserArgs {
                uid: 404,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Method(_)));
        assert!(err.to_string().contains("not found user"));
    }

    #[tokio::test]
    async fn test_unexported_and_wrong_case_methods_not_found() {
        let m = manager();

        let err = m
            .call_typed::<_, ()>(CallContext::default(), "user", "purge", ())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFoundMethod { .. }));

        let err = m
            .call_typed::<_, GetUserReply>(CallContext::default(), "user", "getUser", GetUserArgs {
                uid: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFoundMethod { .. }));
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let m = manager();
        let err = m
            .call_typed::<_, ()>(CallContext::default(), "order", "AddUser", ())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFoundService(ref s) if s == "order"));
    }

    #[test]
    fn test_provider_without_callable_methods_rejected() {
        let mut m = ServiceManager::new();
        let err = m.register(Silent).unwrap_err();
        assert!(matches!(err, ServiceError::NoCallableMethods(ref s) if s == "Silent"));
        assert!(!m.has_service("Silent"));

        // Registration of other providers carries on.
        assert_eq!(m.register(Faulty).unwrap(), "Faulty");
        assert_eq!(m.services(), vec!["Faulty".to_string()]);
    }

    #[tokio::test]
    async fn test_wrong_argument_type() {
        let m = manager();
        let err = m
            .call_typed::<_, ()>(CallContext::default(), "user", "AddUser", 7u8)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn test_panic_is_recovered() {
        let mut m = ServiceManager::new();
        m.register(Faulty).unwrap();

        let err = m
            .call_typed::<_, ()>(CallContext::default(), "Faulty", "Explode", ())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Panicked(ref msg) if msg.contains("blew up")));

        // The manager keeps serving after a panic.
        let slept: u64 = m
            .call_typed(CallContext::default(), "Faulty", "Sleep", 1u64)
            .await
            .unwrap();
        assert_eq!(slept, 1);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let mut m = ServiceManager::new();
        m.register(Faulty).unwrap();

        let ctx = CallContext::with_timeout(Duration::from_millis(10));
        let err = m
            .call_typed::<_, u64>(ctx, "Faulty", "Sleep", 5_000u64)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_call_encoded() {
        let m = manager();
        let ctx = CallContext::default();

        let args = rmp_serde::to_vec_named(&AddUserArgs {
            age: 20,
            nickname: "kai".to_string(),
            uid: 9,
        })
        .unwrap();
        m.call_encoded(ctx.clone(), "user", "AddUser", Bytes::from(args))
            .await
            .unwrap();

        let args = rmp_serde::to_vec_named(&GetUserArgs { uid: 9 }).unwrap();
        let reply = m
            .call_encoded(ctx.clone(), "user", "GetUser", Bytes::from(args))
            .await
            .unwrap();
        let reply: GetUserReply = rmp_serde::from_slice(&reply).unwrap();
        assert_eq!(reply.user.nickname, "kai");

        let err = m
            .call_encoded(ctx, "user", "GetUser", Bytes::from_static(&[0xc1]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
    }
}
