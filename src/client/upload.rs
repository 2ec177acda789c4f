//! Send-dominant upload phase client.
//!
//! A dedicated writer task owns the sink half of the socket and streams the
//! adaptive buffer; the main loop ingests server measurements, drives the
//! deadline, and emits local progress from the shared sent-byte counter.

use super::{
    connect, finish_phase, terminal_from_error, FinishLatch, PhaseConfig, PhaseEvent, PhaseResult,
    StopHandle, Terminal, WsStream, MAX_MESSAGE_SIZE, MESSAGE_SCALE_FACTOR, MIN_MESSAGE_SIZE,
};
use crate::error::{classify_ws_error, ClientError, TransportErrorKind};
use crate::measurement::{Direction, MeasurementProgress, SpeedTestMeasurement};
use crate::timeouts::{CLOSE_GRACE, MEASUREMENT_REPORT_INTERVAL, WRITER_SHUTDOWN_GRACE};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::{thread_rng, RngCore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

type SinkHalf = SplitSink<WsStream, Message>;

pub struct UploadClient {
    config: PhaseConfig,
    stop: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl UploadClient {
    pub fn new(config: PhaseConfig) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        Self {
            config,
            stop: Arc::new(stop),
            stop_rx,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.stop.clone())
    }

    pub async fn start(
        mut self,
        events: mpsc::UnboundedSender<PhaseEvent>,
    ) -> Result<PhaseResult, ClientError> {
        if *self.stop_rx.borrow() {
            let progress = MeasurementProgress::at_elapsed(Duration::ZERO, 0, Direction::Upload);
            return finish_phase(&events, progress, Terminal::Cancelled);
        }
        let ws = match connect(&self.config).await {
            Ok(ws) => ws,
            Err(err) => {
                warn!(
                    "event=ndt7_upload_connect_error url={} error={}",
                    self.config.url, err
                );
                let progress =
                    MeasurementProgress::at_elapsed(Duration::ZERO, 0, Direction::Upload);
                return finish_phase(&events, progress, terminal_from_error(&err));
            }
        };
        info!(
            "event=ndt7_upload_start url={} duration_ms={}",
            self.config.url,
            self.config.duration.as_millis()
        );

        let start = Instant::now();
        let latch = FinishLatch::new();
        let sent = Arc::new(AtomicU64::new(0));
        let (writer_stop, writer_stop_rx) = watch::channel(false);
        let (sink, mut stream) = ws.split();
        let mut writer = Some(tokio::spawn(send_loop(sink, sent.clone(), writer_stop_rx)));

        let deadline = tokio::time::sleep(self.config.duration);
        tokio::pin!(deadline);
        let mut progress_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + MEASUREMENT_REPORT_INTERVAL,
            MEASUREMENT_REPORT_INTERVAL,
        );
        progress_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while latch.terminal().is_none() {
            tokio::select! {
                biased;
                _ = self.stop_rx.changed() => {
                    latch.resolve(Terminal::Cancelled);
                }
                _ = &mut deadline => {
                    // Deadline reached: stop sending and call it a success; the
                    // writer issues the normal CLOSE on its way out.
                    latch.resolve(Terminal::Timeout);
                }
                writer_end = async { writer.as_mut().expect("writer task present").await },
                        if writer.is_some() => {
                    writer = None;
                    match writer_end {
                        Ok(Err(err)) => {
                            warn!("event=ndt7_upload_send_error error={err}");
                            latch.resolve(terminal_from_error(&err));
                        }
                        Ok(Ok(())) => {}
                        Err(err) => {
                            warn!("event=ndt7_upload_writer_panic error={err}");
                            latch.resolve(Terminal::Transport(TransportErrorKind::Io));
                        }
                    }
                }
                _ = progress_tick.tick() => {
                    let _ = events.send(PhaseEvent::Progress(MeasurementProgress::from_start(
                        start,
                        sent.load(Ordering::Relaxed),
                        Direction::Upload,
                    )));
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SpeedTestMeasurement>(&text) {
                            Ok(measurement) => {
                                let _ = events.send(PhaseEvent::Measurement(measurement));
                            }
                            Err(err) => {
                                warn!("event=ndt7_measurement_decode_error error={err}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(
                            "event=ndt7_upload_server_close code={:?}",
                            frame.as_ref().map(|f| f.code)
                        );
                        latch.resolve(Terminal::NormalClose);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("event=ndt7_upload_stream_error error={err}");
                        latch.resolve(terminal_from_error(&classify_ws_error(&err)));
                    }
                    None => {
                        latch.resolve(Terminal::NormalClose);
                    }
                },
            }
        }

        // Tear down the writer; it owns the sink and sends the CLOSE frame.
        let _ = writer_stop.send(true);
        if let Some(handle) = writer.take() {
            match tokio::time::timeout(WRITER_SHUTDOWN_GRACE, handle).await {
                Ok(Ok(Err(err))) => debug!("event=ndt7_upload_writer_tail_error error={err}"),
                Ok(_) => {}
                Err(_) => debug!("event=ndt7_upload_writer_shutdown_timeout"),
            }
        }

        let total = sent.load(Ordering::Relaxed);
        let terminal = latch.terminal().unwrap_or(Terminal::NormalClose);
        info!(
            "event=ndt7_upload_finish terminal={:?} bytes={}",
            terminal, total
        );
        finish_phase(
            &events,
            MeasurementProgress::from_start(start, total, Direction::Upload),
            terminal,
        )
    }
}

/// Stream the adaptive buffer until stopped or the transport fails. Each
/// send awaits the transport flush, so at most one message is ever queued.
async fn send_loop(
    mut sink: SinkHalf,
    sent: Arc<AtomicU64>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ClientError> {
    let mut buffer = initial_payload();
    loop {
        if *stop.borrow() {
            break;
        }
        let frame = Message::Binary(buffer.clone());
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            result = sink.send(frame) => match result {
                Ok(()) => {
                    let total =
                        sent.fetch_add(buffer.len() as u64, Ordering::Relaxed) + buffer.len() as u64;
                    if grown_buffer_len(buffer.len(), total).is_some() {
                        buffer.extend_from_within(..);
                        debug!("event=ndt7_upload_buffer_grow bytes={}", buffer.len());
                    }
                }
                Err(err) => return Err(classify_ws_error(&err)),
            },
        }
    }
    let close = sink.send(Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    })));
    match tokio::time::timeout(CLOSE_GRACE, close).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!("event=ndt7_upload_close_error error={err}"),
        Err(_) => debug!("event=ndt7_upload_close_timeout"),
    }
    Ok(())
}

fn initial_payload() -> Vec<u8> {
    let mut payload = vec![0u8; MIN_MESSAGE_SIZE];
    thread_rng().fill_bytes(&mut payload);
    payload
}

/// Doubling criterion: grow while under the frame cap once the link has
/// absorbed `MESSAGE_SCALE_FACTOR` buffers of the current size.
fn grown_buffer_len(current: usize, total_sent: u64) -> Option<usize> {
    if current < MAX_MESSAGE_SIZE && total_sent >= MESSAGE_SCALE_FACTOR * current as u64 {
        Some((current * 2).min(MAX_MESSAGE_SIZE))
    } else {
        None
    }
}
