// transport/mod.rs — persistent relay connection, single-writer actor
//
// One task owns the cipher session, the command tracker and both halves of
// the framed stream. Callers talk to it only through `RelayHandle`.

use futures::{SinkExt, StreamExt};
use std::future;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};
use vehicle_protocol::{
    encode, CipherError, CipherSession, Command, CommandKind, CommandResponse, Frame,
    RejectedCommand, SessionMaterial, VehicleFamily, KEEPALIVE, KEEPALIVE_REPLY, MAX_PAYLOAD,
    TAG_LEN, UNSOLICITED_TOKEN,
};

use crate::commands::tracker::{CommandTracker, Outcome, Resolution};
use crate::commands::{Completion, FailureReason, PendingCommand};
use crate::errors::ChannelError;
use crate::logging::journal::Journal;
use crate::net::framing::FrameCodec;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(120);
pub const DEFAULT_AUTH_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub family: VehicleFamily,
    pub command_timeout: Duration,
    /// `None` disables the keepalive ping.
    pub keepalive: Option<Duration>,
    /// Consecutive authentication failures that recycle the connection; 0 never recycles.
    pub auth_failure_limit: u32,
    pub journal: Option<Journal>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            family: VehicleFamily::default(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            keepalive: Some(DEFAULT_KEEPALIVE),
            auth_failure_limit: DEFAULT_AUTH_FAILURE_LIMIT,
            journal: None,
        }
    }
}

#[derive(Debug)]
enum Request {
    Issue {
        kind: CommandKind,
        code: u16,
        text: String,
        timeout: Duration,
        reply: oneshot::Sender<(u32, oneshot::Receiver<Completion>)>,
    },
    Pending(oneshot::Sender<usize>),
    Shutdown,
}

// ============================== Handle ======================================

/// Cheap to clone; every clone feeds the same connection.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    requests: mpsc::UnboundedSender<Request>,
    cancels: mpsc::UnboundedSender<u32>,
    family: VehicleFamily,
    default_timeout: Duration,
    ended: watch::Receiver<Option<FailureReason>>,
}

impl RelayHandle {
    pub fn family(&self) -> VehicleFamily {
        self.family
    }

    /// Encode and hand the command to the connection task; returns once the
    /// frame is sealed and queued for write. Out-of-range parameters are
    /// rejected here and never reach the wire.
    pub async fn issue(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<PendingCommand, RejectedCommand> {
        let canonical = encode(command, self.family).inspect_err(|e| {
            warn!(%e, family = %self.family, "command rejected");
        })?;
        if canonical.text.len() + TAG_LEN > MAX_PAYLOAD {
            return Err(RejectedCommand::new(canonical.kind, "command does not fit in one frame"));
        }

        let (reply, registered) = oneshot::channel();
        let req = Request::Issue {
            kind: canonical.kind,
            code: canonical.code,
            text: canonical.text,
            timeout,
            reply,
        };
        if self.requests.send(req).is_ok() {
            if let Ok((token, rx)) = registered.await {
                return Ok(PendingCommand::new(token, canonical.kind, rx, self.cancels.clone()));
            }
        }

        // connection already gone: hand back a handle that completes immediately
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Completion::Failed {
            reason: self.ended.borrow().clone().unwrap_or(FailureReason::Closed),
        });
        Ok(PendingCommand::new(UNSOLICITED_TOKEN, canonical.kind, rx, self.cancels.clone()))
    }

    /// `issue` with the configured timeout, then wait for the outcome.
    pub async fn execute(&self, command: &Command) -> Result<Completion, RejectedCommand> {
        let pending = self.issue(command, self.default_timeout).await?;
        Ok(pending.completion().await)
    }

    /// Live outstanding entries; 0 once the connection has ended.
    pub async fn pending(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Pending(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Fail everything still pending with `Closed` and stop the connection task.
    pub async fn shutdown(&self) -> FailureReason {
        let _ = self.requests.send(Request::Shutdown);
        self.closed().await
    }

    /// Resolves once the connection task has ended, with the reason it ended.
    pub async fn closed(&self) -> FailureReason {
        let mut ended = self.ended.clone();
        match ended.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(FailureReason::Closed),
            Err(_) => FailureReason::Closed,
        }
    }
}

// ============================== Actor =======================================

pub struct RelayTransport<IO> {
    reader: FramedRead<ReadHalf<IO>, FrameCodec>,
    writer: FramedWrite<WriteHalf<IO>, FrameCodec>,
    session: CipherSession,
    tracker: CommandTracker,
    cfg: TransportConfig,
    auth_failures: u32,
}

impl<IO> RelayTransport<IO>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Start the connection task over an established stream. The session
    /// material must be fresh for this connection.
    pub fn spawn(
        io: IO,
        material: &SessionMaterial,
        cfg: TransportConfig,
    ) -> Result<RelayHandle, ChannelError> {
        let session = CipherSession::open(material)?;
        let (read, write) = tokio::io::split(io);
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (cancels, cancels_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended) = watch::channel(None);

        let handle = RelayHandle {
            requests,
            cancels,
            family: cfg.family,
            default_timeout: cfg.command_timeout,
            ended,
        };
        let actor = RelayTransport {
            reader: FramedRead::new(read, FrameCodec),
            writer: FramedWrite::new(write, FrameCodec),
            session,
            tracker: CommandTracker::new(rand::random()),
            cfg,
            auth_failures: 0,
        };

        tokio::spawn(async move {
            let reason = actor.run(requests_rx, cancels_rx).await;
            let _ = ended_tx.send(Some(reason));
        });
        Ok(handle)
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut cancels: mpsc::UnboundedReceiver<u32>,
    ) -> FailureReason {
        let mut keepalive = self.cfg.keepalive.filter(|p| !p.is_zero()).map(|period| {
            let mut i = time::interval_at(Instant::now() + period, period);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        });
        info!(family = %self.cfg.family, "relay transport running");

        let reason = loop {
            let deadline = self.tracker.next_deadline();
            // inbound frames and deadlines ahead of new work, so a busy
            // caller cannot hold back resolution or expiry
            tokio::select! {
                biased;

                Some(token) = cancels.recv() => {
                    self.tracker.cancel(token);
                }
                inbound = self.reader.next() => match inbound {
                    Some(Ok(Ok(frame))) => {
                        if let Err(reason) = self.on_frame(frame).await {
                            break reason;
                        }
                    }
                    Some(Ok(Err(malformed))) => warn!(%malformed, "malformed frame dropped"),
                    Some(Err(e)) => break FailureReason::ConnectionLost(e.to_string()),
                    None => break FailureReason::ConnectionLost("relay closed the connection".into()),
                },
                _ = sleep_until(deadline) => {
                    for outcome in self.tracker.expire(Instant::now()) {
                        warn!(token = outcome.token, kind = %outcome.kind, "command timed out");
                        record(self.cfg.journal.as_ref(), &outcome).await;
                    }
                }
                req = requests.recv() => match req {
                    Some(Request::Issue { kind, code, text, timeout, reply }) => {
                        if let Err(reason) = self.send_command(kind, code, &text, timeout, reply).await {
                            break reason;
                        }
                    }
                    Some(Request::Pending(tx)) => {
                        let _ = tx.send(self.tracker.len());
                    }
                    Some(Request::Shutdown) | None => break FailureReason::Closed,
                },
                _ = tick(&mut keepalive) => {
                    if let Err(reason) = self.send_unsolicited(KEEPALIVE).await {
                        break reason;
                    }
                }
            }
        };

        let failed = self.tracker.fail_all(reason.clone(), Instant::now());
        if !failed.is_empty() {
            warn!(count = failed.len(), %reason, "failing pending commands");
        }
        for outcome in &failed {
            record(self.cfg.journal.as_ref(), outcome).await;
        }
        let _ = self.writer.close().await;
        info!(%reason, "relay transport stopped");
        reason
    }

    async fn send_command(
        &mut self,
        kind: CommandKind,
        code: u16,
        text: &str,
        timeout: Duration,
        reply: oneshot::Sender<(u32, oneshot::Receiver<Completion>)>,
    ) -> Result<(), FailureReason> {
        let (token, rx) = self.tracker.register(kind, code, timeout, Instant::now());
        let queued = match self.seal(token, text) {
            Ok(sealed) => {
                let (sequence, keystream) = (sealed.sequence, sealed.keystream.clone());
                self.writer
                    .feed(sealed.into_frame())
                    .await
                    .map(|()| (sequence, keystream))
                    .map_err(|e| FailureReason::ConnectionLost(e.to_string()))
            }
            Err(reason) => Err(reason),
        };
        // the caller learns its token only once the frame is queued; on failure
        // the entry is failed with the connection and reaches the caller that way
        let caller_gone = reply.send((token, rx)).is_err();
        let (sequence, keystream) = queued?;

        // keystream is spent, so the frame goes out even if nobody waits for it
        self.writer
            .flush()
            .await
            .map_err(|e| FailureReason::ConnectionLost(e.to_string()))?;
        if caller_gone {
            self.tracker.cancel(token);
            return Ok(());
        }
        self.tracker.mark_sent(token);
        debug!(token, sequence, %kind, code, ?keystream, "command sent");
        Ok(())
    }

    async fn send_unsolicited(&mut self, text: &str) -> Result<(), FailureReason> {
        let sealed = self.seal(UNSOLICITED_TOKEN, text)?;
        self.writer
            .send(sealed.into_frame())
            .await
            .map_err(|e| FailureReason::ConnectionLost(e.to_string()))?;
        trace!(text, "unsolicited frame sent");
        Ok(())
    }

    fn seal(&mut self, token: u32, text: &str) -> Result<vehicle_protocol::Sealed, FailureReason> {
        self.session.seal(token, text.as_bytes()).map_err(|e| match e {
            CipherError::SequenceExhausted => FailureReason::SessionExhausted,
            other => FailureReason::ConnectionLost(other.to_string()),
        })
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<(), FailureReason> {
        let (sequence, token) = (frame.sequence, frame.correlation_token);
        let plaintext = match self.session.open_frame(&frame) {
            Ok(p) => {
                self.auth_failures = 0;
                p
            }
            Err(CipherError::AuthenticationFailed) => {
                self.auth_failures += 1;
                warn!(sequence, token, failures = self.auth_failures, "frame failed authentication; dropped");
                let limit = self.cfg.auth_failure_limit;
                if limit > 0 && self.auth_failures >= limit {
                    return Err(FailureReason::AuthenticationFailures(self.auth_failures));
                }
                return Ok(());
            }
            Err(CipherError::ReplayRejected { .. }) => {
                debug!(sequence, token, "replayed frame dropped");
                return Ok(());
            }
            Err(e) => {
                warn!(%e, sequence, token, "frame dropped");
                return Ok(());
            }
        };

        let Ok(text) = String::from_utf8(plaintext) else {
            warn!(sequence, token, "non UTF-8 payload dropped");
            return Ok(());
        };

        if token == UNSOLICITED_TOKEN {
            match text.as_str() {
                KEEPALIVE => self.send_unsolicited(KEEPALIVE_REPLY).await?,
                KEEPALIVE_REPLY => trace!("keepalive acknowledged"),
                other => debug!(message = other, "unsolicited relay message"),
            }
            return Ok(());
        }

        let response = match CommandResponse::parse(&text) {
            Ok(r) => r,
            Err(e) => {
                warn!(%e, token, "undecodable response dropped");
                return Ok(());
            }
        };

        match self.tracker.resolve(token, response, Instant::now()) {
            Resolution::Resolved(outcome) => {
                info!(
                    token,
                    kind = %outcome.kind,
                    result = ?outcome.result,
                    latency_ms = outcome.latency.as_millis() as u64,
                    "command resolved"
                );
                record(self.cfg.journal.as_ref(), &outcome).await;
            }
            Resolution::Expired(outcome) => {
                warn!(token, kind = %outcome.kind, "response arrived at the deadline; timed out");
                record(self.cfg.journal.as_ref(), &outcome).await;
            }
            Resolution::Late => info!(token, "late response for a finished command dropped"),
            Resolution::Unknown => warn!(token, "response for unknown token dropped"),
        }
        Ok(())
    }
}

async fn record(journal: Option<&Journal>, outcome: &Outcome) {
    if let Some(journal) = journal {
        journal.record(outcome).await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => time::sleep_until(d).await,
        None => future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => future::pending().await,
    }
}
