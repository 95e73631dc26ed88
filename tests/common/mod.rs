//! Shared test doubles: a recording client sink and a scripted executor.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};
use parking_lot::Mutex;

use llm_relay::Result;
use llm_relay::account::{Account, AccountStatus};
use llm_relay::fallback::UpstreamExecutor;
use llm_relay::sink::ResponseSink;

/// Client-side sink recording everything the core forwards.
#[derive(Default)]
pub struct RecordingSink {
    pub headers: HeaderMap,
    pub status: Option<StatusCode>,
    pub body: Vec<u8>,
    /// Body length observed at each flush, to assert per-chunk delivery.
    pub flush_marks: Vec<usize>,
}

impl ResponseSink for RecordingSink {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) {
        self.flush_marks.push(self.body.len());
    }
}

impl RecordingSink {
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// One scripted upstream reply.
#[derive(Clone)]
pub struct ScriptedReply {
    pub status: StatusCode,
    pub content_type: &'static str,
    /// Body chunks, each written and (upstream-side) flushed separately.
    pub chunks: Vec<&'static [u8]>,
}

impl ScriptedReply {
    pub fn json(status: StatusCode, body: &'static [u8]) -> Self {
        Self {
            status,
            content_type: "application/json",
            chunks: vec![body],
        }
    }

    pub fn event_stream(chunks: Vec<&'static [u8]>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "text/event-stream",
            chunks,
        }
    }
}

/// Executor double replaying scripted replies per account id.
#[derive(Default)]
pub struct ScriptedExecutor {
    replies: Mutex<HashMap<u64, ScriptedReply>>,
    invocations: Arc<AtomicUsize>,
    invoked_accounts: Mutex<Vec<u64>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, account_id: u64, reply: ScriptedReply) -> Self {
        self.replies.lock().insert(account_id, reply);
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn invoked_accounts(&self) -> Vec<u64> {
        self.invoked_accounts.lock().clone()
    }
}

#[async_trait]
impl UpstreamExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        account: &Account,
        _request_body: &[u8],
        sink: &mut dyn ResponseSink,
    ) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.invoked_accounts.lock().push(account.id);

        let reply = self
            .replies
            .lock()
            .get(&account.id)
            .cloned()
            .unwrap_or_else(|| ScriptedReply::json(StatusCode::INTERNAL_SERVER_ERROR, b"no script"));

        sink.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static(reply.content_type),
        );
        sink.write_header(reply.status);
        for chunk in reply.chunks {
            sink.write(chunk)?;
            sink.flush();
        }
        Ok(())
    }
}

/// Convenience account constructor.
pub fn account(id: u64, priority: i32, usage: i64) -> Account {
    Account {
        id,
        name: format!("acct-{id}"),
        platform: "claude".to_string(),
        priority,
        weight: 10,
        today_usage_count: usage,
        current_status: AccountStatus::Normal,
    }
}
