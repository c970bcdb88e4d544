use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::application::events::EventBus;
use crate::application::ports::DeploymentRepository;
use crate::db::models::LogStream;
use crate::events::Event;

enum LogMessage {
    Line(LogStream, String),
    Flush(oneshot::Sender<()>),
}

/// Append-only log writer for one deployment.
///
/// `line` never blocks, so it can be fed from process output callbacks. A
/// background task appends lines to the deployment's log columns in arrival
/// order and emits a `log` event for each.
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogMessage>,
    handle: JoinHandle<()>,
}

impl LogSink {
    pub fn spawn<S, EB>(store: Arc<S>, events: EB, repository_id: i64, build_id: String, deployment_id: i64) -> Self
    where
        S: DeploymentRepository + 'static,
        EB: EventBus,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogMessage>();

        let handle = tokio::spawn(async move {
            let mut line_number = 0usize;

            while let Some(first) = rx.recv().await {
                let mut batch = vec![first];
                while let Ok(next) = rx.try_recv() {
                    batch.push(next);
                }

                // Coalesce consecutive lines of one stream into a single append
                let mut pending: Option<(LogStream, String)> = None;
                for message in batch {
                    match message {
                        LogMessage::Line(stream, line) => {
                            line_number += 1;
                            events
                                .emit(Event::log(
                                    repository_id,
                                    &build_id,
                                    deployment_id,
                                    stream,
                                    line.clone(),
                                    line_number,
                                ))
                                .await;

                            match pending.as_mut() {
                                Some((current, text)) if *current == stream => {
                                    text.push_str(&line);
                                    text.push('\n');
                                }
                                _ => {
                                    if let Some((current, text)) = pending.take() {
                                        append(store.as_ref(), deployment_id, current, &text).await;
                                    }
                                    pending = Some((stream, format!("{}\n", line)));
                                }
                            }
                        }
                        LogMessage::Flush(done) => {
                            if let Some((current, text)) = pending.take() {
                                append(store.as_ref(), deployment_id, current, &text).await;
                            }
                            let _ = done.send(());
                        }
                    }
                }

                if let Some((current, text)) = pending.take() {
                    append(store.as_ref(), deployment_id, current, &text).await;
                }
            }
        });

        Self { tx, handle }
    }

    /// Queue `text` (split on newlines) for the given stream.
    pub fn line(&self, stream: LogStream, text: impl AsRef<str>) {
        for line in text.as_ref().lines() {
            let _ = self.tx.send(LogMessage::Line(stream, line.to_string()));
        }
    }

    pub fn build(&self, text: impl AsRef<str>) {
        self.line(LogStream::Build, text);
    }

    pub fn deploy(&self, text: impl AsRef<str>) {
        self.line(LogStream::Deploy, text);
    }

    /// Wait until every line queued so far is persisted.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(LogMessage::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Flush and stop the writer task.
    pub async fn close(self) {
        self.flush().await;
        drop(self.tx);
        if let Err(e) = self.handle.await {
            warn!("Log writer task ended abnormally: {}", e);
        }
    }
}

async fn append<S: DeploymentRepository + ?Sized>(store: &S, deployment_id: i64, stream: LogStream, text: &str) {
    if let Err(e) = store.append_deployment_log(deployment_id, stream, text).await {
        warn!("Failed to append {:?} log for deployment {}: {}", stream, deployment_id, e);
    }
}
