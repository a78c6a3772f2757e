// dbstream/src/pipeline/compose.rs
//! Producer → transform → consumer, supervised together with the external
//! process, settling into exactly one [`PipelineOutcome`].

use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use super::transform::Transform;
use super::{ExitReport, ProcessHandle, RunControl};
use crate::errors::{PipelineError, Stage};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStats {
    /// Bytes yielded by the producer.
    pub bytes_observed: u64,
    /// Bytes accepted by the consumer.
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub duration: Duration,
    pub bytes_observed: u64,
    pub bytes_written: u64,
    pub exit: ExitReport,
}

impl PipelineSummary {
    pub fn duration_ms(&self) -> u128 {
        self.duration.as_millis()
    }
}

pub type PipelineOutcome = std::result::Result<PipelineSummary, PipelineError>;

enum Event {
    Streamed(Result<StreamStats, PipelineError>),
    Exited(std::io::Result<ExitReport>),
    Cancelled(String),
}

/// Owns the process for the duration of one operation.
pub struct StreamComposer<P> {
    process: P,
    control: RunControl,
}

impl<P: ProcessHandle> StreamComposer<P> {
    pub fn new(process: P) -> Self {
        StreamComposer {
            process,
            control: RunControl::default(),
        }
    }

    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = control;
        self
    }

    /// Drives the byte stream and the process to one outcome.
    ///
    /// Success needs both the consumer to have completed and the process to
    /// have exited with code 0, in either order. The first error from any
    /// stage settles the outcome: the process is killed and every stream is
    /// dropped before returning. Later signals are never observed.
    pub async fn run<R, W>(
        self,
        producer: R,
        transform: Option<Box<dyn Transform>>,
        consumer: W,
    ) -> PipelineOutcome
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let StreamComposer {
            mut process,
            control,
        } = self;
        let started = Instant::now();

        let mut pump = Box::pin(pump(producer, transform, consumer));
        let deadline = control.deadline;
        let timer = async move {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timer);

        let mut streamed: Option<StreamStats> = None;
        let mut exited: Option<ExitReport> = None;
        let mut process_live = true;

        let settled = loop {
            if let (Some(stats), Some(exit)) = (streamed, exited) {
                break Ok((stats, exit));
            }

            let event = tokio::select! {
                biased;
                _ = control.cancel.cancelled() => Event::Cancelled("interrupted".to_string()),
                _ = &mut timer => Event::Cancelled(format!(
                    "deadline of {}s elapsed",
                    deadline.unwrap_or_default().as_secs()
                )),
                result = &mut pump, if streamed.is_none() => Event::Streamed(result),
                result = process.wait(), if exited.is_none() => Event::Exited(result),
            };

            match event {
                Event::Streamed(Ok(stats)) => {
                    debug!(
                        bytes_observed = stats.bytes_observed,
                        bytes_written = stats.bytes_written,
                        "Stream completed, waiting for {}",
                        process.program()
                    );
                    streamed = Some(stats);
                }
                Event::Streamed(Err(e)) => break Err(e),
                Event::Exited(Ok(report)) => {
                    process_live = false;
                    if !report.success() {
                        break Err(PipelineError::ProcessExit {
                            program: process.program().to_string(),
                            report,
                            diagnostics: process.diagnostics(),
                        });
                    }
                    debug!("{} exited cleanly, waiting for stream", process.program());
                    exited = Some(report);
                }
                Event::Exited(Err(e)) => {
                    break Err(PipelineError::stream(Stage::ProcessExit, e));
                }
                Event::Cancelled(reason) => break Err(PipelineError::Cancelled(reason)),
            }
        };

        if let Err(e) = &settled {
            warn!("💥 {} stage failed: {}", e.stage(), e);
            if process_live {
                if let Err(kill_err) = process.kill().await {
                    debug!("Kill of {} reported: {}", process.program(), kill_err);
                }
            }
        }
        // Releases producer and consumer whatever state the pump was left in.
        drop(pump);

        settled.map(|(stats, exit)| {
            let summary = PipelineSummary {
                duration: started.elapsed(),
                bytes_observed: stats.bytes_observed,
                bytes_written: stats.bytes_written,
                exit,
            };
            info!(
                duration_ms = summary.duration_ms() as u64,
                bytes_written = summary.bytes_written,
                "✅ {} pipeline completed",
                process.program()
            );
            summary
        })
    }
}

/// Moves bytes one chunk at a time, so a slow consumer stalls the producer.
async fn pump<R, W>(
    mut producer: R,
    mut transform: Option<Box<dyn Transform>>,
    mut consumer: W,
) -> Result<StreamStats, PipelineError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stats = StreamStats::default();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = producer
            .read(&mut buf)
            .await
            .map_err(|e| PipelineError::stream(Stage::ProducerStream, e))?;
        if n == 0 {
            break;
        }
        stats.bytes_observed += n as u64;
        trace!(bytes = stats.bytes_observed, "⌛ In progress...");

        match transform.as_mut() {
            Some(t) => {
                let out = t
                    .push(&buf[..n])
                    .map_err(|e| PipelineError::stream(Stage::TransformStream, e))?;
                deliver(&mut consumer, &out, &mut stats).await?;
            }
            None => deliver(&mut consumer, &buf[..n], &mut stats).await?,
        }
    }

    if let Some(t) = transform.as_mut() {
        let tail = t
            .finish()
            .map_err(|e| PipelineError::stream(Stage::TransformStream, e))?;
        deliver(&mut consumer, &tail, &mut stats).await?;
    }

    consumer
        .flush()
        .await
        .map_err(|e| PipelineError::stream(Stage::ConsumerStream, e))?;
    consumer
        .shutdown()
        .await
        .map_err(|e| PipelineError::stream(Stage::ConsumerStream, e))?;

    Ok(stats)
}

async fn deliver<W>(consumer: &mut W, bytes: &[u8], stats: &mut StreamStats) -> Result<(), PipelineError>
where
    W: AsyncWrite + Unpin,
{
    if bytes.is_empty() {
        return Ok(());
    }
    consumer
        .write_all(bytes)
        .await
        .map_err(|e| PipelineError::stream(Stage::ConsumerStream, e))?;
    stats.bytes_written += bytes.len() as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::transform::{GzipCompress, GzipDecompress, gzip};
    use async_trait::async_trait;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    /// Process double: exits when the test says so, records kills.
    struct FakeProcess {
        exit: Option<oneshot::Receiver<ExitReport>>,
        killed: Arc<AtomicBool>,
    }

    struct FakeControls {
        exit: Option<oneshot::Sender<ExitReport>>,
        killed: Arc<AtomicBool>,
    }

    impl FakeControls {
        fn exit_with(&mut self, code: i32) {
            if let Some(tx) = self.exit.take() {
                let _ = tx.send(ExitReport { code: Some(code), signal: None });
            }
        }

        fn killed(&self) -> bool {
            self.killed.load(Ordering::SeqCst)
        }
    }

    fn fake_process() -> (FakeProcess, FakeControls) {
        let (tx, rx) = oneshot::channel();
        let killed = Arc::new(AtomicBool::new(false));
        (
            FakeProcess {
                exit: Some(rx),
                killed: Arc::clone(&killed),
            },
            FakeControls { exit: Some(tx), killed },
        )
    }

    #[async_trait]
    impl ProcessHandle for FakeProcess {
        fn program(&self) -> &str {
            "fake_dump"
        }

        async fn wait(&mut self) -> io::Result<ExitReport> {
            match self.exit.as_mut() {
                Some(rx) => match rx.await {
                    Ok(report) => Ok(report),
                    Err(_) => std::future::pending().await,
                },
                None => std::future::pending().await,
            }
        }

        async fn kill(&mut self) -> io::Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn diagnostics(&self) -> Vec<String> {
            vec!["fake_dump: something went wrong".to_string()]
        }
    }

    /// Consumer double: collects bytes, optionally fails after a budget,
    /// and records whether it was dropped.
    struct TrackingWriter {
        written: Arc<Mutex<Vec<u8>>>,
        fail_after: Option<usize>,
        closed: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    struct WriterState {
        written: Arc<Mutex<Vec<u8>>>,
        closed: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    fn tracking_writer(fail_after: Option<usize>) -> (TrackingWriter, WriterState) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        (
            TrackingWriter {
                written: Arc::clone(&written),
                fail_after,
                closed: Arc::clone(&closed),
                dropped: Arc::clone(&dropped),
            },
            WriterState { written, closed, dropped },
        )
    }

    impl AsyncWrite for TrackingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let mut written = self.written.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if written.len() + buf.len() > limit {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::StorageFull,
                        "no space left on device",
                    )));
                }
            }
            written.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.closed.store(true, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    impl Drop for TrackingWriter {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    /// Producer double that never ends unless dropped.
    fn endless_producer() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
        tokio::io::duplex(1024)
    }

    #[tokio::test]
    async fn test_success_requires_stream_and_clean_exit() {
        let (process, mut controls) = fake_process();
        let (writer, seen) = tracking_writer(None);
        controls.exit_with(0);

        let payload = b"-- PostgreSQL database dump\n".repeat(50);
        let summary = StreamComposer::new(process)
            .run(payload.as_slice(), Some(Box::new(GzipCompress::new())), writer)
            .await
            .expect("pipeline should succeed");

        assert_eq!(summary.bytes_observed, payload.len() as u64);
        assert!(summary.exit.success());
        let written = seen.written.lock().unwrap().clone();
        assert_eq!(summary.bytes_written, written.len() as u64);
        assert_eq!(written, gzip(&payload));
        assert!(seen.closed.load(Ordering::SeqCst));
        assert!(seen.dropped.load(Ordering::SeqCst));
        assert!(!controls.killed());
    }

    #[tokio::test]
    async fn test_stream_completion_waits_for_exit() {
        let (process, mut controls) = fake_process();
        let (writer, seen) = tracking_writer(None);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            controls.exit_with(0);
            controls
        });

        let result = StreamComposer::new(process)
            .run(&b"SELECT 1;"[..], None, writer)
            .await;
        let controls = handle.await.unwrap();

        assert!(result.is_ok());
        assert_eq!(seen.written.lock().unwrap().as_slice(), b"SELECT 1;");
        assert!(!controls.killed());
    }

    #[tokio::test]
    async fn test_nonzero_exit_after_stream_is_failure() {
        let (process, mut controls) = fake_process();
        let (writer, _seen) = tracking_writer(None);
        controls.exit_with(1);

        let err = StreamComposer::new(process)
            .run(&b"partial"[..], None, writer)
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::ProcessExit);
        assert_eq!(err.diagnostics(), ["fake_dump: something went wrong".to_string()]);
        assert!(!controls.killed(), "an exited process is not killed again");
    }

    #[tokio::test]
    async fn test_exit_failure_first_tears_down_streams() {
        let (process, mut controls) = fake_process();
        let (writer, seen) = tracking_writer(None);
        let (producer, _other_end) = endless_producer();
        controls.exit_with(2);

        let err = StreamComposer::new(process)
            .run(producer, Some(Box::new(GzipCompress::new())), writer)
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::ProcessExit);
        assert!(seen.dropped.load(Ordering::SeqCst));
        assert!(!seen.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_consumer_failure_kills_process_once() {
        let (process, controls) = fake_process();
        let (writer, seen) = tracking_writer(Some(1000));

        let payload = vec![b'x'; 10_000];
        let err = StreamComposer::new(process)
            .run(payload.as_slice(), None, writer)
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::ConsumerStream);
        assert!(controls.killed());
        assert!(seen.dropped.load(Ordering::SeqCst));
        assert!(!seen.closed.load(Ordering::SeqCst));
        assert!(seen.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clean_exit_then_stream_error_is_stream_failure() {
        let (process, mut controls) = fake_process();
        let (writer, _seen) = tracking_writer(Some(10));
        controls.exit_with(0);

        let (producer, mut feed) = endless_producer();
        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = feed.write_all(&[b'y'; 64]).await;
            feed
        });

        let err = StreamComposer::new(process)
            .run(producer, None, writer)
            .await
            .unwrap_err();
        drop(feeder.await);

        assert_eq!(err.stage(), Stage::ConsumerStream);
        assert!(!controls.killed(), "process had already exited");
    }

    #[tokio::test]
    async fn test_producer_error_is_tagged() {
        struct BrokenReader;
        impl AsyncRead for BrokenReader {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::PermissionDenied, "permission denied")))
            }
        }

        let (process, controls) = fake_process();
        let (writer, seen) = tracking_writer(None);
        let err = StreamComposer::new(process)
            .run(BrokenReader, Some(Box::new(GzipDecompress::new())), writer)
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::ProducerStream);
        assert!(controls.killed());
        assert!(seen.dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_corrupt_input_is_transform_failure() {
        let (process, controls) = fake_process();
        let (writer, seen) = tracking_writer(None);

        let err = StreamComposer::new(process)
            .run(&b"definitely not a gzip stream"[..], Some(Box::new(GzipDecompress::new())), writer)
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::TransformStream);
        assert!(controls.killed());
        assert!(seen.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deadline_cancels_like_an_error() {
        let (process, controls) = fake_process();
        let (writer, seen) = tracking_writer(None);
        let (producer, _other_end) = endless_producer();

        let control = RunControl {
            cancel: CancellationToken::new(),
            deadline: Some(Duration::from_millis(50)),
        };
        let err = StreamComposer::new(process)
            .with_control(control)
            .run(producer, None, writer)
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Cancelled);
        assert!(controls.killed());
        assert!(seen.dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancellation_token_interrupts() {
        let (process, controls) = fake_process();
        let (writer, _seen) = tracking_writer(None);
        let (producer, _other_end) = endless_producer();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = StreamComposer::new(process)
            .with_control(RunControl { cancel, deadline: None })
            .run(producer, None, writer)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled(_)));
        assert!(controls.killed());
    }
}
