use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use tokio::sync::watch;

use crate::config::{CancelPolicy, StreamConfig};
use crate::error::{CancelReason, StreamAbort, TranscriptError};
use crate::observability::log_stream_complete;
use crate::protocol::canonical::{FinishReason, Message, StreamEvent, StreamOutcome, Usage};
use crate::stream::assembler::{Transcript, TranscriptAssembler, Transition};
use crate::stream::handler::ToolCallHandler;
use crate::stream::snapshot::Snapshot;

/// Caller-side switch for cancelling a running stream.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Counters for one driven stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub events: u64,
    pub snapshots: u64,
    pub messages: usize,
}

enum Pulled {
    Event(StreamEvent),
    Exhausted,
    Cancelled(CancelReason),
}

/// Pulls events from a decoded event source and feeds them to a
/// [`TranscriptAssembler`], one at a time and in arrival order.
pub struct StreamDriver {
    config: StreamConfig,
    handler: Option<Arc<dyn ToolCallHandler>>,
    history: Vec<Message>,
    cancel: Option<watch::Receiver<bool>>,
}

impl StreamDriver {
    #[must_use]
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            handler: None,
            history: Vec::new(),
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn ToolCallHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    #[must_use]
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, handle: &CancelHandle) -> Self {
        self.cancel = Some(handle.subscribe());
        self
    }

    /// Drive `events` to completion.
    ///
    /// `on_snapshot` fires for every state-changing event. `on_complete`
    /// fires exactly once, and only when the source is exhausted without a
    /// fatal error or cancellation. The returned transcript is the final
    /// assembler state.
    ///
    /// # Errors
    ///
    /// Returns [`StreamAbort`] when the assembler raises a fatal error, the
    /// caller cancels, the idle timeout elapses or the source yields an error.
    pub async fn run<S, E, F, C>(
        self,
        events: S,
        mut on_snapshot: F,
        on_complete: C,
    ) -> Result<Transcript, StreamAbort>
    where
        S: Stream<Item = Result<StreamEvent, E>>,
        E: fmt::Display,
        F: FnMut(Snapshot),
        C: FnOnce(StreamOutcome),
    {
        let started = Instant::now();
        let idle_timeout = self.config.idle_timeout_secs.map(Duration::from_secs);
        let cancel_policy = self.config.cancel_policy;
        let mut cancel = self.cancel;
        let mut assembler = TranscriptAssembler::new(&self.config).with_history(self.history);
        if let Some(handler) = self.handler {
            assembler = assembler.with_handler(handler);
        }

        let mut finish_reason = FinishReason::Unknown;
        let mut usage = Usage::default();
        let mut events_seen: u64 = 0;
        let history_len = assembler.archived().len();
        let mut events = std::pin::pin!(events);

        loop {
            let event = match pull(events.as_mut(), cancel.as_mut(), idle_timeout).await {
                Pulled::Event(event) => event,
                Pulled::Exhausted => break,
                Pulled::Cancelled(reason) => {
                    return Err(cancelled(reason, cancel_policy, assembler, events_seen));
                }
            };
            events_seen += 1;

            // A pending tool-call handler must not outlive a cancellation.
            let applied = match cancel.as_mut() {
                Some(rx) => tokio::select! {
                    biased;
                    () = wait_for_cancel(rx) => None,
                    applied = assembler.apply(event, &mut on_snapshot) => Some(applied),
                },
                None => Some(assembler.apply(event, &mut on_snapshot).await),
            };
            let Some(applied) = applied else {
                return Err(cancelled(
                    CancelReason::Aborted,
                    cancel_policy,
                    assembler,
                    events_seen,
                ));
            };

            match applied {
                Ok(Transition::Continue) => {}
                Ok(Transition::MessageFinished {
                    finish_reason: reason,
                    usage: reported,
                }) => {
                    finish_reason = reason;
                    usage = reported;
                }
                Err(error) => {
                    tracing::warn!(error = %error, events = events_seen, "stream aborted");
                    return Err(StreamAbort {
                        error,
                        transcript: Some(assembler.into_transcript()),
                    });
                }
            }
        }

        let stats = StreamStats {
            events: events_seen,
            snapshots: assembler.snapshots_emitted(),
            messages: assembler.archived().len() - history_len
                + usize::from(assembler.current().is_some()),
        };
        let transcript = assembler.into_transcript();
        let outcome = StreamOutcome {
            final_message: transcript.current.clone(),
            finish_reason,
            usage,
        };
        log_stream_complete(&outcome, &stats, started.elapsed());
        on_complete(outcome);
        Ok(transcript)
    }
}

fn cancelled(
    reason: CancelReason,
    policy: CancelPolicy,
    assembler: TranscriptAssembler,
    events_seen: u64,
) -> StreamAbort {
    tracing::warn!(
        reason = %reason,
        events = events_seen,
        policy = %policy,
        "stream cancelled"
    );
    let transcript = match policy {
        CancelPolicy::DeliverPartial => Some(assembler.into_transcript()),
        CancelPolicy::Discard => None,
    };
    StreamAbort {
        error: TranscriptError::Cancelled(reason),
        transcript,
    }
}

async fn pull<S, E>(
    mut events: std::pin::Pin<&mut S>,
    cancel: Option<&mut watch::Receiver<bool>>,
    idle_timeout: Option<Duration>,
) -> Pulled
where
    S: Stream<Item = Result<StreamEvent, E>>,
    E: fmt::Display,
{
    let next = async {
        match idle_timeout {
            Some(limit) => tokio::time::timeout(limit, events.next())
                .await
                .map_err(|_| CancelReason::TimedOut {
                    idle_secs: limit.as_secs(),
                }),
            None => Ok(events.next().await),
        }
    };
    let cancelled = async {
        match cancel {
            Some(rx) => wait_for_cancel(rx).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        () = cancelled => Pulled::Cancelled(CancelReason::Aborted),
        item = next => match item {
            Ok(Some(Ok(event))) => Pulled::Event(event),
            Ok(Some(Err(err))) => Pulled::Cancelled(CancelReason::SourceFailed(err.to_string())),
            Ok(None) => Pulled::Exhausted,
            Err(reason) => Pulled::Cancelled(reason),
        },
    }
}

/// Resolves once the flag is set; never resolves if the handle is dropped unset.
async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
