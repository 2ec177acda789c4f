//! Receive-only download phase client.

use super::{
    close_quietly, connect, finish_phase, terminal_from_error, FinishLatch, PhaseConfig,
    PhaseEvent, PhaseResult, StopHandle, Terminal,
};
use crate::error::{classify_ws_error, ClientError, ProtocolErrorKind};
use crate::measurement::{Direction, MeasurementProgress, SpeedTestMeasurement};
use crate::timeouts::MEASUREMENT_REPORT_INTERVAL;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

pub struct DownloadClient {
    config: PhaseConfig,
    stop: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl DownloadClient {
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

    /// Run the attempt to completion. Resolves once the phase is fully torn
    /// down; the terminal event has been emitted by then.
    pub async fn start(
        mut self,
        events: mpsc::UnboundedSender<PhaseEvent>,
    ) -> Result<PhaseResult, ClientError> {
        if *self.stop_rx.borrow() {
            let progress = MeasurementProgress::at_elapsed(Duration::ZERO, 0, Direction::Download);
            return finish_phase(&events, progress, Terminal::Cancelled);
        }
        let mut ws = match connect(&self.config).await {
            Ok(ws) => ws,
            Err(err) => {
                warn!(
                    "event=ndt7_download_connect_error url={} error={}",
                    self.config.url, err
                );
                let progress =
                    MeasurementProgress::at_elapsed(Duration::ZERO, 0, Direction::Download);
                return finish_phase(&events, progress, terminal_from_error(&err));
            }
        };
        info!(
            "event=ndt7_download_start url={} duration_ms={}",
            self.config.url,
            self.config.duration.as_millis()
        );

        let start = Instant::now();
        let latch = FinishLatch::new();
        let mut total_bytes: u64 = 0;
        let mut last_emit = start;
        let deadline = tokio::time::sleep(self.config.duration);
        tokio::pin!(deadline);

        while latch.terminal().is_none() {
            tokio::select! {
                biased;
                _ = self.stop_rx.changed() => {
                    latch.resolve(Terminal::Cancelled);
                    close_quietly(&mut ws).await;
                }
                _ = &mut deadline => {
                    // Deadline reached: close normally and count the phase as a
                    // success even if the transport objects while the server is
                    // still mid-write.
                    latch.resolve(Terminal::Timeout);
                    close_quietly(&mut ws).await;
                }
                frame = ws.next() => match frame {
                    Some(Ok(Message::Binary(payload))) => {
                        total_bytes += payload.len() as u64;
                        if last_emit.elapsed() >= MEASUREMENT_REPORT_INTERVAL {
                            last_emit = Instant::now();
                            let _ = events.send(PhaseEvent::Progress(
                                MeasurementProgress::from_start(start, total_bytes, Direction::Download),
                            ));
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        total_bytes += text.len() as u64;
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
                            "event=ndt7_download_server_close code={:?}",
                            frame.as_ref().map(|f| f.code)
                        );
                        latch.resolve(close_terminal(total_bytes));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("event=ndt7_download_stream_error error={err}");
                        latch.resolve(terminal_from_error(&classify_ws_error(&err)));
                    }
                    None => {
                        latch.resolve(close_terminal(total_bytes));
                    }
                },
            }
        }

        let terminal = latch.terminal().unwrap_or(Terminal::NormalClose);
        info!(
            "event=ndt7_download_finish terminal={:?} bytes={}",
            terminal, total_bytes
        );
        finish_phase(
            &events,
            MeasurementProgress::from_start(start, total_bytes, Direction::Download),
            terminal,
        )
    }
}

/// A server that ends the session without ever sending data refused it;
/// report that as a fast failure instead of an empty success.
fn close_terminal(total_bytes: u64) -> Terminal {
    if total_bytes == 0 {
        Terminal::Protocol(ProtocolErrorKind::NoData)
    } else {
        Terminal::NormalClose
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_byte_close_is_a_fast_failure() {
        assert_eq!(
            close_terminal(0),
            Terminal::Protocol(ProtocolErrorKind::NoData)
        );
        assert_eq!(close_terminal(1), Terminal::NormalClose);
    }
}
