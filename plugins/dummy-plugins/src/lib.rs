//! Example plugin library speaking the current registration protocol.
//!
//! Both classes share the `dummy` alias on purpose, so hosts can exercise
//! ambiguous alias resolution against a real library.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dummy_api::{Counter, TestInterface};
use plugin_annotations::plugin;

plugin_registry::plugin_library!();

#[plugin(implements(dummy_api::TestInterface), aliases("echo", "dummy"))]
#[derive(Default)]
pub struct DummyEcho {
    last: Mutex<String>,
}

impl TestInterface for DummyEcho {
    fn input(&self, value: &str) {
        *self.last.lock().unwrap() = value.to_owned();
    }

    fn output(&self) -> String {
        self.last.lock().unwrap().clone()
    }
}

#[plugin(implements(dummy_api::Counter), aliases("counter", "dummy"))]
#[derive(Default)]
pub struct DummyCounter {
    hits: AtomicU64,
}

impl Counter for DummyCounter {
    fn increment(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn value(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }
}
