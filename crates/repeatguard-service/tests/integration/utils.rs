use std::sync::Arc;

use repeatguard_service::backend::Backend;
use repeatguard_service::config::Config;
use repeatguard_service::RepeatGuard;
use repeatguard_test as test;

pub use test::{arguments, BackendCall, FailingBackend, RecordingBackend};

/// Setup tests and create a guard on top of `backend`.
///
/// The guard has the `checkout` and `refund` operations of [`test::guard`] registered.
pub fn setup_guard(backend: Arc<dyn Backend>) -> RepeatGuard {
    test::setup();
    test::guard(backend)
}

/// Setup tests and create a guard from a YAML configuration.
pub async fn setup_configured_guard(yaml: &str) -> RepeatGuard {
    test::setup();

    let (_dir, path) = test::config_file(yaml);
    let config = Config::get(Some(&path)).unwrap();
    RepeatGuard::from_config(&config).await.unwrap()
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Status {
    pub status: String,
}

pub fn ok() -> Status {
    Status {
        status: "ok".into(),
    }
}
