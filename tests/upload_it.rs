#[path = "common/net.rs"]
mod net;

use futures_util::{SinkExt, StreamExt};
use netgauge::{
    ClientError, Direction, PhaseConfig, PhaseEvent, PhaseResult, Terminal, UploadClient,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

async fn run_upload(
    url: &str,
    duration: Duration,
) -> (Result<PhaseResult, ClientError>, Vec<PhaseEvent>) {
    let config = PhaseConfig::new(Url::parse(url).expect("test url")).duration(duration);
    let client = UploadClient::new(config);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let result = client.start(events_tx).await;
    let mut events = Vec::new();
    while let Some(event) = events_rx.recv().await {
        events.push(event);
    }
    (result, events)
}

/// Sink inbound frames, feeding back a measurement every five binary frames.
async fn sink_upload(mut ws: net::ServerWs, max_measurements: usize) {
    let mut frames = 0usize;
    let mut bytes = 0i64;
    let mut measurements = 0usize;
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Binary(payload)) => {
                frames += 1;
                bytes += payload.len() as i64;
                if frames % 5 == 0 && measurements < max_measurements {
                    measurements += 1;
                    let _ = ws
                        .send(Message::Text(net::measurement_json(bytes, 50_000)))
                        .await;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

#[tokio::test]
async fn upload_streams_until_deadline_and_ingests_measurements() {
    let (addr, _server) =
        net::spawn_ws_server(move |ws| async move { sink_upload(ws, 3).await }).await;

    let started = Instant::now();
    let (result, events) =
        run_upload(&net::ws_url(addr, "upload"), Duration::from_millis(600)).await;
    let elapsed = started.elapsed();

    let result = result.expect("upload phase succeeds");
    assert_eq!(result.terminal, Terminal::Timeout);
    assert!(result.bytes_transferred > 0);
    assert!(
        elapsed < Duration::from_millis(2000),
        "upload overran its deadline: {elapsed:?}"
    );

    let measurements = events
        .iter()
        .filter(|event| matches!(event, PhaseEvent::Measurement(_)))
        .count();
    assert_eq!(measurements, 3);

    let progress: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            PhaseEvent::Progress(sample) => Some(*sample),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty(), "expected at least one progress sample");
    for pair in progress.windows(2) {
        assert!(pair[0].num_bytes <= pair[1].num_bytes);
        assert!(pair[0].elapsed_ns <= pair[1].elapsed_ns);
    }
    for sample in &progress {
        assert_eq!(sample.direction, Direction::Upload);
    }

    match events.last().expect("events not empty") {
        PhaseEvent::Finished { progress, error } => {
            assert!(error.is_none());
            assert_eq!(progress.num_bytes, result.bytes_transferred);
        }
        other => panic!("terminal event must be last, got {other:?}"),
    }
}

#[tokio::test]
async fn upload_finishes_when_server_closes_first() {
    let (addr, server) = net::spawn_ws_server(|mut ws| async move {
        let mut received = 0u64;
        while let Some(message) = ws.next().await {
            match message {
                Ok(Message::Binary(payload)) => {
                    received += payload.len() as u64;
                    // End the measurement early from the server side.
                    if received >= 64 * 1024 {
                        let _ = ws
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "".into(),
                            })))
                            .await;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
    .await;

    let (result, _events) = run_upload(&net::ws_url(addr, "upload"), Duration::from_secs(10)).await;
    server.await.expect("server task");

    let result = result.expect("upload phase succeeds");
    assert_eq!(result.terminal, Terminal::NormalClose);
    assert!(result.bytes_transferred > 0);
}

#[tokio::test]
async fn upload_cancel_is_prompt() {
    let (addr, _server) =
        net::spawn_ws_server(move |ws| async move { sink_upload(ws, 0).await }).await;

    let config = PhaseConfig::new(Url::parse(&net::ws_url(addr, "upload")).expect("test url"))
        .duration(Duration::from_secs(10));
    let client = UploadClient::new(config);
    let stop = client.stop_handle();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let phase = tokio::spawn(client.start(events_tx));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let cancel_started = Instant::now();
    stop.stop();
    let result = phase.await.expect("join phase");
    assert!(
        cancel_started.elapsed() < Duration::from_millis(500),
        "cancel took too long"
    );
    assert_eq!(result, Err(ClientError::Cancelled));

    let mut finishes = 0;
    while let Some(event) = events_rx.recv().await {
        if let PhaseEvent::Finished { error, .. } = event {
            finishes += 1;
            assert_eq!(error, Some(ClientError::Cancelled));
        }
    }
    assert_eq!(finishes, 1);
}

#[tokio::test]
async fn upload_classifies_a_reset_connection() {
    let (addr, server) = net::spawn_reset_server().await;
    let (result, _events) = run_upload(&net::ws_url(addr, "upload"), Duration::from_secs(5)).await;
    server.await.expect("server task");
    match result {
        Err(ClientError::Transport(_)) | Err(ClientError::Protocol(_)) => {}
        other => panic!("expected a classified failure, got {other:?}"),
    }
}
