//! # ferrous-container
//!
//! Managed components for Rust: instance pooling, per-session instances and
//! singletons, with concurrency control, transactions and interceptor
//! pipelines applied to every business call.
//!
//! ## Features
//!
//! - **Three component kinds**: pooled (bounded, interchangeable instances),
//!   session-affine (one instance per client key, optionally passivated) and
//!   singleton
//! - **Concurrency guard**: exclusive or concurrent modes with read/write
//!   locks, FIFO waiters and bounded access timeouts
//! - **Lifecycle callbacks**: post-construct, pre-destroy, pre-passivate and
//!   post-activate, each isolated from the container by a panic guard
//! - **Interceptor chains**: concurrency, transaction, class and method
//!   interceptors and lifecycle triggers, composed once per method
//! - **Failure classification**: business failures keep the instance; system
//!   failures discard it and roll back the transaction
//!
//! ## Quick Start
//!
//! ```rust
//! use ferrous_container::{AccessTimeout, ComponentDescriptor, Container, PoolConfig};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[derive(Default)]
//! struct Teller {
//!     served: AtomicU64,
//! }
//!
//! let container = Container::builder()
//!     .deploy(
//!         ComponentDescriptor::pooled("Teller", Teller::default)
//!             .pool(PoolConfig::bounded(1, 4))
//!             .access_timeout(AccessTimeout::from_millis(500))
//!             .method("serve", |teller: &Teller, ctx| {
//!                 let customer = ctx.take_args::<String>().unwrap_or_default();
//!                 teller.served.fetch_add(1, Ordering::Relaxed);
//!                 Ok(format!("hello {}", customer))
//!             })
//!             .build(),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let reply = container.dispatch("Teller", "serve", None, "ada".to_string()).unwrap();
//! assert_eq!(reply.downcast_ref::<String>().map(String::as_str), Some("hello ada"));
//! ```
//!
//! ## Sessions
//!
//! ```rust
//! use ferrous_container::{ComponentDescriptor, Container, MethodSpec};
//! use std::sync::Mutex;
//!
//! let container = Container::builder()
//!     .deploy(
//!         ComponentDescriptor::session("Cart", || Mutex::new(Vec::<String>::new()))
//!             .method("add", |cart: &Mutex<Vec<String>>, ctx| {
//!                 let item = ctx.take_args::<String>().unwrap_or_default();
//!                 let mut items = cart.lock().unwrap();
//!                 items.push(item);
//!                 Ok(items.len())
//!             })
//!             .method_spec(MethodSpec::new("checkout").removes_session(false), |cart: &Mutex<Vec<String>>, _ctx| {
//!                 Ok(cart.lock().unwrap().len())
//!             })
//!             .build(),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let key = container.create_session("Cart").unwrap();
//! container.dispatch("Cart", "add", Some(&key), "tea".to_string()).unwrap();
//! let items = container.dispatch("Cart", "checkout", Some(&key), ()).unwrap();
//! assert_eq!(items.downcast_ref::<usize>(), Some(&1));
//! assert!(container.remove_session("Cart", &key).is_err());
//! ```

pub mod cancellation;
pub mod config;
pub mod container;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod guard;
pub mod instance;
pub mod interceptor;
pub mod lifecycle;
pub mod metrics;
pub mod observer;
pub mod timeout;
pub mod transaction;

mod internal;
mod store;

pub use cancellation::{CancelOnDrop, CancellationToken};
pub use config::{ConfigError, ConfigProvider, ConfigSource, ConfigValue, ContainerConfig, EnvironmentConfigSource, MapConfigSource};
#[cfg(feature = "config")]
pub use config::JsonConfigSource;
pub use container::{Container, ContainerBuilder};
pub use context::{Invocation, InvocationContext, Payload};
pub use descriptor::{
    ComponentDescriptor, ComponentKind, ConcurrencyMode, DescriptorBuilder, LifecycleTrigger, MethodSpec, PoolConfig,
    SessionConfig,
};
pub use error::{BusinessError, ContainerError, ContainerResult, ErrorKind, MethodError, TransactionError};
pub use guard::{ConcurrencyGuard, LockPermit, LockType};
pub use instance::{Bean, ComponentInstance, DestroyReason, InstanceId, InstanceState, SessionKey};
pub use interceptor::{FnInterceptor, Interceptor, InterceptorChain, InvocationResult, Next};
pub use lifecycle::{LifecycleManager, PassivatedState};
pub use metrics::{
    ComponentStats, ContainerStats, EvictionReport, InvocationStats, LifecycleStats, ShutdownReport, StoreStats,
    TimingStats,
};
pub use observer::{CallbackKind, ContainerObserver, MetricsObserver, TracingObserver};
pub use timeout::{AccessTimeout, Deadline};
pub use transaction::{LocalTransactionPolicy, TransactionAttribute, TransactionId, TransactionPolicy, TransactionStats};
