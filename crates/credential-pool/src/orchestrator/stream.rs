//! Streamed replies
//!
//! The first chunk is awaited before the reply is handed to the caller, so a
//! stream that fails before producing anything is still an ordinary,
//! retryable attempt failure. After that the stream is owned by a detached
//! pump task: chunks go to the caller through a channel, and the outcome is
//! logged by the pump itself once upstream finishes. A caller that hangs up
//! only stops receiving; the pump drains upstream and logs regardless.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use provider::{ByteStream, UpstreamError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::classify::classify_error;
use crate::model::{Credential, ModelGroup};
use crate::now_millis;
use crate::orchestrator::{RequestLog, record_attempt};
use crate::pool::CredentialPool;
use crate::usage::UsageLogger;

const CHANNEL_CAPACITY: usize = 32;

/// A stream whose first chunk has already arrived.
pub struct Primed {
    first: Option<Bytes>,
    rest: ByteStream,
}

/// Wait for the first chunk. An error here means nothing was emitted.
pub async fn prime(mut stream: ByteStream) -> Result<Primed, UpstreamError> {
    let first = stream.next().await.transpose()?;
    Ok(Primed { first, rest: stream })
}

/// Caller side of a pumped stream.
pub struct StreamHandle {
    rx: mpsc::Receiver<Result<Bytes, UpstreamError>>,
}

impl Stream for StreamHandle {
    type Item = Result<Bytes, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamHandle(..)")
    }
}

/// Everything the pump needs to account for the attempt on its own.
pub(crate) struct PumpContext {
    pub pool: Arc<CredentialPool>,
    pub usage: UsageLogger,
    pub credential: Credential,
    pub group: ModelGroup,
    pub log: RequestLog,
}

/// Hand `primed` to a detached task and return the caller's handle.
pub(crate) fn spawn_pump(primed: Primed, ctx: PumpContext) -> StreamHandle {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(pump(primed, tx, ctx));
    StreamHandle { rx }
}

async fn pump(
    primed: Primed,
    tx: mpsc::Sender<Result<Bytes, UpstreamError>>,
    ctx: PumpContext,
) {
    let Primed { first, mut rest } = primed;
    let mut connected = true;
    let mut chunks = 0usize;

    if let Some(chunk) = first {
        chunks += 1;
        connected = tx.send(Ok(chunk)).await.is_ok();
    }

    let mut failure = None;
    while let Some(item) = rest.next().await {
        match item {
            Ok(chunk) => {
                chunks += 1;
                if connected && tx.send(Ok(chunk)).await.is_err() {
                    debug!(credential_id = ctx.credential.id, "client disconnected, draining upstream");
                    connected = false;
                }
            }
            Err(e) => {
                if connected {
                    let _ = tx.send(Err(e.clone())).await;
                }
                failure = Some(e);
                break;
            }
        }
    }

    // Log before the sender drops so end-of-stream implies the entry exists.
    match failure {
        None => {
            debug!(credential_id = ctx.credential.id, chunks, "stream completed");
            record_attempt(None);
            ctx.usage.record(ctx.log.success()).await;
        }
        Some(err) => {
            let classification = classify_error(&err);
            warn!(
                credential_id = ctx.credential.id,
                chunks,
                category = %classification.category,
                error = %err,
                "stream failed after output began"
            );
            ctx.pool
                .report_failure(&ctx.credential, ctx.group, &classification, &err, now_millis())
                .await;
            record_attempt(Some(&classification));
            ctx.usage
                .record(ctx.log.failure(err.status, &classification, &err.to_string()))
                .await;
        }
    }
    drop(tx);
}
