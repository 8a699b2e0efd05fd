//! Line-delimited JSON over stdin/stdout.
//!
//! Each input line is `{"id"?, "action", "params"?}`. Responses and pushed
//! lifecycle events share stdout, one JSON document per line.

use crate::api::handler::PanelHandler;
use crate::error::ErrorBody;
use crate::lifecycle::events::SequencedEvent;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    action: String,
    #[serde(default)]
    params: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outgoing {
    Response { id: Option<Value>, result: Value },
    Failure { id: Option<Value>, error: ErrorBody },
    Event { event: SequencedEvent },
}

fn send(out_tx: &mpsc::UnboundedSender<String>, message: &Outgoing) {
    match serde_json::to_string(message) {
        Ok(line) => {
            let _ = out_tx.send(line);
        }
        Err(e) => error!(error = %e, "Failed to serialize outgoing message"),
    }
}

/// Serves requests read from `reader` until EOF, then closes the modal.
pub async fn serve_lines<R, W>(handler: Arc<PanelHandler>, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        writer.shutdown().await
    });

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let mut events = handler.events().subscribe();
    let event_tx = out_tx.clone();
    let event_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                // Pending events go out before the stop signal is honoured.
                biased;
                received = events.recv() => match received {
                    Ok(event) => send(&event_tx, &Outgoing::Event { event }),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Stdio client fell behind; events dropped (poll read_events to catch up)");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = &mut stop_rx => break,
            }
        }
    });

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Malformed request line");
                send(
                    &out_tx,
                    &Outgoing::Failure {
                        id: None,
                        error: ErrorBody {
                            code: "invalid_params",
                            message: format!("Malformed request: {}", e),
                        },
                    },
                );
                continue;
            }
        };
        let outgoing = match handler
            .dispatch(&request.action, request.params.unwrap_or_default())
            .await
        {
            Ok(result) => Outgoing::Response { id: request.id, result },
            Err(e) => Outgoing::Failure {
                id: request.id,
                error: ErrorBody::from(&e),
            },
        };
        send(&out_tx, &outgoing);
    }

    info!("Stdin closed; shutting down");
    handler.shutdown().await;
    let _ = stop_tx.send(());
    if let Err(e) = event_task.await {
        warn!(error = %e, "Event forwarder ended abnormally");
    }
    drop(out_tx);
    writer_task.await??;
    Ok(())
}

pub async fn serve_stdio(handler: Arc<PanelHandler>) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve_lines(handler, stdin, tokio::io::stdout()).await
}
