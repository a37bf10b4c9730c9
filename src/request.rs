//! In-flight request tracking and the callback→waiter handoff.
//!
//! Every blocking operation links one descriptor into the context's
//! request list before sending, and removes it exactly once after the
//! wait ends. Inbound handlers locate the descriptor whose match prefix
//! is echoed at the front of the reply payload and complete it.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::lock;
use crate::proto::{MsgId, WriteResult};

/// One-shot wake-up used in multi-threaded mode, one per request.
pub(crate) struct RequestEvent {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl RequestEvent {
    pub fn new() -> Self {
        RequestEvent {
            fired: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Block until signalled or `timeout` elapses. Consumes the signal.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.fired);
        let (mut fired, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |fired| !*fired)
            .unwrap_or_else(|e| e.into_inner());
        let signalled = *fired;
        *fired = false;
        signalled
    }

    pub fn signal(&self) {
        *lock(&self.fired) = true;
        self.cond.notify_one();
    }
}

/// Descriptor for one outstanding synchronous request.
pub(crate) struct RequestState {
    pub token: u64,
    pub msg_id: MsgId,
    /// Leading payload bytes the reply echoes verbatim.
    pub prefix: Vec<u8>,
    pub pending: bool,
    pub matched: bool,
    /// Set by `READ_BY_INDEX_DONE`: the enumeration is exhausted.
    pub done: bool,
    pub status: WriteResult,
    pub resp_section: Option<String>,
    pub resp_name: Option<String>,
    pub resp_value: Option<String>,
    pub resp_type: Option<String>,
    pub event: Option<Arc<RequestEvent>>,
}

impl RequestState {
    pub fn new(token: u64, msg_id: MsgId, prefix: &[u8], event: Option<Arc<RequestEvent>>) -> Self {
        RequestState {
            token,
            msg_id,
            prefix: prefix.to_vec(),
            pending: true,
            matched: false,
            done: false,
            status: WriteResult::TIMEOUT,
            resp_section: None,
            resp_name: None,
            resp_value: None,
            resp_type: None,
            event,
        }
    }

    /// Whether `payload` answers this request: still pending and the
    /// match prefix leads the payload.
    pub fn matches(&self, payload: &[u8]) -> bool {
        self.pending
            && payload.len() >= self.prefix.len()
            && payload[..self.prefix.len()] == self.prefix[..]
    }

    /// Mark the request answered. Refuses when `msg_id` is not the id the
    /// request was created for, leaving it pending.
    pub fn complete(&mut self, msg_id: MsgId) -> bool {
        if msg_id != self.msg_id {
            return false;
        }
        self.matched = true;
        self.pending = false;
        true
    }
}

/// First pending request of `msg_id` whose prefix leads `payload`.
pub(crate) fn lookup_mut<'a>(
    requests: &'a mut [RequestState],
    payload: &[u8],
    msg_id: MsgId,
) -> Option<&'a mut RequestState> {
    requests
        .iter_mut()
        .find(|r| r.msg_id == msg_id && r.matches(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn request(token: u64, msg_id: MsgId, prefix: &[u8]) -> RequestState {
        RequestState::new(token, msg_id, prefix, None)
    }

    #[test]
    fn new_request_is_pending_and_unmatched() {
        let req = request(1, MsgId::REGISTER, b"sec\0nam\0");
        assert!(req.pending);
        assert!(!req.matched);
        assert_eq!(req.status, WriteResult::TIMEOUT);
    }

    #[test]
    fn prefix_match_requires_full_prefix() {
        let req = request(1, MsgId::REGISTER, b"sec\0nam\0");
        assert!(req.matches(b"sec\0nam\0value\0"));
        assert!(req.matches(b"sec\0nam\0"));
        assert!(!req.matches(b"sec\0nam"));
        assert!(!req.matches(b"sec\0other\0value\0"));
    }

    #[test]
    fn completed_request_no_longer_matches() {
        let mut req = request(1, MsgId::REGISTER, b"sec\0nam\0");
        assert!(req.complete(MsgId::REGISTER));
        assert!(!req.matches(b"sec\0nam\0value\0"));
    }

    #[test]
    fn complete_refuses_wrong_msg_id() {
        let mut req = request(1, MsgId::READ_BY_INDEX_REQ, &[2, 0]);
        assert!(!req.complete(MsgId::READ_REQ));
        assert!(req.pending);
        assert!(req.complete(MsgId::READ_BY_INDEX_REQ));
        assert!(!req.pending);
    }

    #[test]
    fn lookup_skips_other_ids_with_colliding_prefixes() {
        let mut requests = vec![
            request(1, MsgId::WRITE, b"a\0b\0"),
            request(2, MsgId::READ_REQ, b"a\0b\0"),
        ];
        let found = lookup_mut(&mut requests, b"a\0b\0c\0", MsgId::READ_REQ).unwrap();
        assert_eq!(found.token, 2);
    }

    #[test]
    fn event_wait_times_out_without_signal() {
        let event = RequestEvent::new();
        assert!(!event.wait(Duration::from_millis(10)));
    }

    #[test]
    fn event_signal_wakes_waiter() {
        let event = Arc::new(RequestEvent::new());
        let signaller = event.clone();
        let handle = thread::spawn(move || {
            signaller.signal();
        });
        assert!(event.wait(Duration::from_secs(5)));
        handle.join().unwrap();
        // the signal was consumed
        assert!(!event.wait(Duration::from_millis(10)));
    }
}
