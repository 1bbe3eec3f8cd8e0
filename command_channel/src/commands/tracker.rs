// commands/tracker.rs — outstanding command table, one per connection
//
// Entries live here only while CREATED or SENT. Every terminal transition
// removes the entry and fulfils the waiter in the same call, so a waiter can
// never be fulfilled twice.

use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::debug;
use vehicle_protocol::{CommandKind, CommandResponse, ResultCode, UNSOLICITED_TOKEN};

use super::{Completion, FailureReason};

/// How many retired tokens are remembered for classifying late frames.
pub const RETIRED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Created,
    Sent,
    Resolved,
    TimedOut,
    Failed,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Resolved | CommandState::TimedOut | CommandState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandState::Created => "created",
            CommandState::Sent => "sent",
            CommandState::Resolved => "resolved",
            CommandState::TimedOut => "timed_out",
            CommandState::Failed => "failed",
        }
    }
}

/// Record of one terminal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub token: u32,
    pub kind: CommandKind,
    pub code: u16,
    pub state: CommandState,
    pub result: Option<ResultCode>,
    pub latency: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(Outcome),
    /// The frame arrived on or after the deadline; the entry timed out instead.
    Expired(Outcome),
    /// Token belonged to a command that already reached a terminal state.
    Late,
    Unknown,
}

#[derive(Debug)]
struct Entry {
    kind: CommandKind,
    code: u16,
    state: CommandState,
    issued: Instant,
    deadline: Instant,
    waiter: oneshot::Sender<Completion>,
}

impl Entry {
    fn finish(self, token: u32, state: CommandState, completion: Completion, now: Instant) -> Outcome {
        let result = match &completion {
            Completion::Success { response } => Some(response.result),
            _ => None,
        };
        // receiver may be gone (cancelled caller); nothing else to notify
        let _ = self.waiter.send(completion);
        Outcome {
            token,
            kind: self.kind,
            code: self.code,
            state,
            result,
            latency: now.saturating_duration_since(self.issued),
        }
    }
}

#[derive(Debug)]
pub struct CommandTracker {
    entries: HashMap<u32, Entry>,
    next_token: u32,
    retired: VecDeque<u32>,
}

impl CommandTracker {
    pub fn new(seed: u32) -> Self {
        Self {
            entries: HashMap::new(),
            next_token: seed,
            retired: VecDeque::with_capacity(RETIRED_CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, token: u32) -> Option<CommandState> {
        self.entries.get(&token).map(|e| e.state)
    }

    fn allocate(&mut self) -> u32 {
        loop {
            self.next_token = self.next_token.wrapping_add(1);
            let t = self.next_token;
            if t != UNSOLICITED_TOKEN && !self.entries.contains_key(&t) {
                return t;
            }
        }
    }

    fn retire(&mut self, token: u32) {
        if self.retired.len() == RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back(token);
    }

    fn take(&mut self, token: u32) -> Option<Entry> {
        let entry = self.entries.remove(&token)?;
        self.retire(token);
        Some(entry)
    }

    /// Allocate a fresh token and a CREATED entry with `deadline = now + timeout`.
    pub fn register(
        &mut self,
        kind: CommandKind,
        code: u16,
        timeout: Duration,
        now: Instant,
    ) -> (u32, oneshot::Receiver<Completion>) {
        let token = self.allocate();
        let (waiter, rx) = oneshot::channel();
        self.entries.insert(
            token,
            Entry {
                kind,
                code,
                state: CommandState::Created,
                issued: now,
                deadline: now + timeout,
                waiter,
            },
        );
        (token, rx)
    }

    /// CREATED → SENT once the frame is accepted for transmission.
    pub fn mark_sent(&mut self, token: u32) -> bool {
        match self.entries.get_mut(&token) {
            Some(e) if e.state == CommandState::Created => {
                e.state = CommandState::Sent;
                true
            }
            _ => false,
        }
    }

    /// Match an inbound response. The entry's own deadline is the only check point:
    /// the response wins only if `now` is strictly before it.
    pub fn resolve(&mut self, token: u32, response: CommandResponse, now: Instant) -> Resolution {
        let Some(entry) = self.take(token) else {
            return if self.retired.contains(&token) {
                Resolution::Late
            } else {
                Resolution::Unknown
            };
        };
        if now < entry.deadline {
            Resolution::Resolved(entry.finish(
                token,
                CommandState::Resolved,
                Completion::Success { response },
                now,
            ))
        } else {
            Resolution::Expired(entry.finish(token, CommandState::TimedOut, Completion::TimedOut, now))
        }
    }

    /// Time out every entry whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Outcome> {
        let due: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(t, _)| *t)
            .collect();
        let mut out = Vec::with_capacity(due.len());
        for token in due {
            if let Some(entry) = self.take(token) {
                out.push(entry.finish(token, CommandState::TimedOut, Completion::TimedOut, now));
            }
        }
        out
    }

    /// Fail a single entry, e.g. when its frame could not be sealed.
    pub fn fail(&mut self, token: u32, reason: FailureReason, now: Instant) -> Option<Outcome> {
        let entry = self.take(token)?;
        Some(entry.finish(token, CommandState::Failed, Completion::Failed { reason }, now))
    }

    /// Connection-level failure: every live entry fails together.
    pub fn fail_all(&mut self, reason: FailureReason, now: Instant) -> Vec<Outcome> {
        let tokens: Vec<u32> = self.entries.keys().copied().collect();
        tokens
            .into_iter()
            .filter_map(|t| self.fail(t, reason.clone(), now))
            .collect()
    }

    /// Remove the entry and drop its waiter without a completion.
    pub fn cancel(&mut self, token: u32) -> bool {
        match self.take(token) {
            Some(entry) => {
                debug!(token, kind = %entry.kind, "command cancelled by caller");
                true
            }
            None => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::sync::oneshot::error::TryRecvError;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn response(code: u16) -> CommandResponse {
        CommandResponse {
            code,
            result: ResultCode::Ok,
            message: String::new(),
        }
    }

    #[test]
    fn tokens_skip_zero_and_live_entries() {
        let now = Instant::now();
        let mut t = CommandTracker::new(u32::MAX);
        let (first, _rx1) = t.register(CommandKind::Lock, 20, TIMEOUT, now);
        assert_eq!(first, 1);

        // rewind the counter so the next candidate collides with a live token
        t.next_token = 0;
        let (second, _rx2) = t.register(CommandKind::Unlock, 22, TIMEOUT, now);
        assert_eq!(second, 2);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn resolve_before_deadline() {
        let now = Instant::now();
        let mut t = CommandTracker::new(7);
        let (token, mut rx) = t.register(CommandKind::ClimateOn, 26, TIMEOUT, now);
        assert_eq!(t.state(token), Some(CommandState::Created));
        assert!(t.mark_sent(token));
        assert!(!t.mark_sent(token));

        let later = now + Duration::from_secs(2);
        match t.resolve(token, response(26), later) {
            Resolution::Resolved(o) => {
                assert_eq!(o.state, CommandState::Resolved);
                assert_eq!(o.result, Some(ResultCode::Ok));
                assert_eq!(o.latency, Duration::from_secs(2));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rx.try_recv(), Ok(Completion::Success { response: response(26) }));
        assert!(t.is_empty());
    }

    #[test]
    fn response_at_the_deadline_loses() {
        let now = Instant::now();
        let mut t = CommandTracker::new(0);
        let (token, mut rx) = t.register(CommandKind::ChargeStart, 11, TIMEOUT, now);
        t.mark_sent(token);
        let r = t.resolve(token, response(11), now + TIMEOUT);
        assert!(matches!(r, Resolution::Expired(ref o) if o.state == CommandState::TimedOut));
        assert_eq!(rx.try_recv(), Ok(Completion::TimedOut));
    }

    #[test]
    fn expired_token_reports_late_then_unknown() {
        let now = Instant::now();
        let mut t = CommandTracker::new(0);
        let (token, mut rx) = t.register(CommandKind::Wake, 18, TIMEOUT, now);
        t.mark_sent(token);

        assert!(t.expire(now + Duration::from_secs(29)).is_empty());
        let expired = t.expire(now + TIMEOUT);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].token, token);
        assert_eq!(rx.try_recv(), Ok(Completion::TimedOut));

        assert_eq!(t.resolve(token, response(18), now + TIMEOUT), Resolution::Late);
        assert_eq!(t.resolve(9999, response(18), now), Resolution::Unknown);
    }

    #[test]
    fn retired_ring_is_bounded() {
        let now = Instant::now();
        let mut t = CommandTracker::new(0);
        let (oldest, _rx) = t.register(CommandKind::Lock, 20, TIMEOUT, now);
        t.cancel(oldest);
        for _ in 0..RETIRED_CAPACITY {
            let (tok, _rx) = t.register(CommandKind::Lock, 20, TIMEOUT, now);
            t.cancel(tok);
        }
        assert_eq!(t.retired.len(), RETIRED_CAPACITY);
        assert_eq!(t.resolve(oldest, response(20), now), Resolution::Unknown);
    }

    #[test]
    fn fail_all_resolves_every_pending_entry() {
        let now = Instant::now();
        let mut t = CommandTracker::new(100);
        let mut rxs: Vec<_> = [CommandKind::Lock, CommandKind::Unlock, CommandKind::Wake]
            .into_iter()
            .map(|k| {
                let (tok, rx) = t.register(k, 0, TIMEOUT, now);
                t.mark_sent(tok);
                rx
            })
            .collect();

        let failed = t.fail_all(FailureReason::ConnectionLost("reset".into()), now);
        assert_eq!(failed.len(), 3);
        assert!(failed.iter().all(|o| o.state == CommandState::Failed));
        assert!(t.is_empty());
        assert_eq!(t.next_deadline(), None);
        for rx in rxs.iter_mut() {
            assert_eq!(
                rx.try_recv(),
                Ok(Completion::Failed {
                    reason: FailureReason::ConnectionLost("reset".into())
                })
            );
        }
    }

    #[test]
    fn cancel_suppresses_completion() {
        let now = Instant::now();
        let mut t = CommandTracker::new(0);
        let (token, mut rx) = t.register(CommandKind::Cooldown, 25, TIMEOUT, now);
        assert!(t.cancel(token));
        assert!(!t.cancel(token));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
        assert_eq!(t.resolve(token, response(25), now), Resolution::Late);
    }

    #[test]
    fn next_deadline_is_the_earliest() {
        let now = Instant::now();
        let mut t = CommandTracker::new(0);
        let _a = t.register(CommandKind::Lock, 20, Duration::from_secs(30), now);
        let _b = t.register(CommandKind::Unlock, 22, Duration::from_secs(5), now);
        assert_eq!(t.next_deadline(), Some(now + Duration::from_secs(5)));
    }

    proptest! {
        #[test]
        fn exactly_one_completion(
            timeout_ms in 1u64..10_000,
            resolve_at in 0u64..20_000,
            expire_at in 0u64..20_000,
            resolve_first in any::<bool>(),
        ) {
            let base = Instant::now();
            let deadline = base + Duration::from_millis(timeout_ms);
            let mut t = CommandTracker::new(0);
            let (token, mut rx) =
                t.register(CommandKind::Lock, 20, Duration::from_millis(timeout_ms), base);
            t.mark_sent(token);

            let r_at = base + Duration::from_millis(resolve_at);
            let e_at = base + Duration::from_millis(expire_at);
            if resolve_first {
                t.resolve(token, response(20), r_at);
                t.expire(e_at);
            } else {
                t.expire(e_at);
                t.resolve(token, response(20), r_at);
            }

            // whichever event touched the entry first while it was live decides
            let resolved = if resolve_first || e_at < deadline {
                r_at < deadline
            } else {
                false
            };
            let got = rx.try_recv();
            if resolved {
                prop_assert_eq!(got, Ok(Completion::Success { response: response(20) }));
            } else {
                prop_assert_eq!(got, Ok(Completion::TimedOut));
            }
            prop_assert!(t.is_empty());
            prop_assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
        }
    }
}
