//! The `Backend` trait and `RuntimeConfig`, covering SPEC_FULL §10.4: a
//! swappable reactor abstraction and the runtime's only configuration
//! surface.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use effect_rail::backend::{Backend, RuntimeConfig, TokioBackend};
use effect_rail::effect::Effect;
use effect_rail::fiber::Runtime;

#[tokio::test]
async fn tokio_backend_spawn_sleep_and_yield_all_work() {
    let backend = TokioBackend;
    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    backend.spawn(Box::pin(async move {
        r.fetch_add(1, Ordering::SeqCst);
    }));
    backend.yield_now().await;
    backend.yield_now().await;
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    backend.sleep(Duration::from_millis(1)).await;
}

struct CountingBackend {
    spawns: Arc<AtomicUsize>,
}

impl Backend for CountingBackend {
    fn spawn(&self, fut: Pin<Box<dyn std::future::Future<Output = ()> + Send>>) {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(fut);
    }

    fn sleep(&self, d: Duration) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(d))
    }

    fn yield_now(&self) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(tokio::task::yield_now())
    }
}

#[tokio::test]
async fn a_custom_backend_can_be_swapped_into_a_runtime_and_used_directly() {
    let spawns = Arc::new(AtomicUsize::new(0));
    let backend = Arc::new(CountingBackend { spawns: spawns.clone() });
    let rt = Runtime::default().with_backend(backend.clone());

    rt.backend().spawn(Box::pin(async {}));
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert_eq!(spawns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn runtime_config_default_has_no_name_prefix_and_no_default_logger() {
    let config = RuntimeConfig::default();
    assert!(config.name_prefix.is_none());
    assert!(!config.install_default_logger);
    assert_eq!(config.default_queue_capacity, 0);
}

#[tokio::test]
async fn fork_auto_names_fibers_from_the_configured_prefix() {
    let rt = Runtime::default().with_config(RuntimeConfig {
        name_prefix: Some("job".to_string()),
        ..RuntimeConfig::default()
    });
    let fiber = rt.fork(Effect::<String, i32>::succeed(1), None);
    let expected = format!("job-{}", fiber.id());
    assert_eq!(fiber.name(), Some(expected.as_str()));
    let _ = fiber.join().await.unwrap();
}

#[tokio::test]
async fn an_explicit_name_overrides_the_configured_prefix() {
    let rt = Runtime::default().with_config(RuntimeConfig {
        name_prefix: Some("job".to_string()),
        ..RuntimeConfig::default()
    });
    let fiber = rt.fork(Effect::<String, i32>::succeed(1), Some("explicit".to_string()));
    assert_eq!(fiber.name(), Some("explicit"));
}

#[tokio::test]
async fn bootstrap_without_a_default_logger_leaves_the_context_empty_of_one() {
    let rt = Runtime::bootstrap(RuntimeConfig::default()).await;
    assert!(rt
        .context()
        .try_get::<Box<dyn effect_rail::services::logger::Logger>>()
        .is_none());
}

#[tokio::test]
async fn bootstrap_with_a_default_logger_binds_one() {
    let rt = Runtime::bootstrap(RuntimeConfig {
        install_default_logger: true,
        ..RuntimeConfig::default()
    })
    .await;
    assert!(rt
        .context()
        .try_get::<Box<dyn effect_rail::services::logger::Logger>>()
        .is_some());
}
