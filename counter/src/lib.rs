//! # Summary
//!
//! The increment server: a single shared integer exposed over `get`/`set`.
//! It deliberately performs no locking beyond what a single `Mutex`
//! provides, so that an unsynchronized `get`-then-`set` round trip from
//! two concurrent critical sections race -- exactly the hazard every
//! mutex protocol in this workspace exists to close out.

use std::sync::Mutex;

use async_trait::async_trait;
use transport::{Envelope, Handler, Reply};

pub struct Counter {
    value: Mutex<i64>,
}

impl Default for Counter {
    fn default() -> Self {
        Counter { value: Mutex::new(0) }
    }
}

impl Counter {
    pub fn get(&self) -> i64 {
        *self.value.lock().expect("[INTERNAL ERROR]: counter mutex poisoned")
    }

    pub fn set(&self, value: i64) {
        *self.value.lock().expect("[INTERNAL ERROR]: counter mutex poisoned") = value;
    }
}

#[async_trait]
impl Handler for Counter {
    async fn handle(&self, envelope: Envelope) -> Reply {
        match envelope.method.as_str() {
            "get" => Reply::ok(serde_json::json!({ "value": self.get() })),
            "set" => match envelope.body.get("value").and_then(|v| v.as_i64()) {
                Some(value) => {
                    self.set(value);
                    Reply::ok(serde_json::json!({ "ok": true }))
                }
                None => Reply::bad_request("missing 'value' field"),
            },
            other => Reply::bad_request(format!("unknown method '{}'", other)),
        }
    }
}
