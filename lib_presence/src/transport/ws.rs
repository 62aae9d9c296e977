//! # WebSocket Transport
//!
//! `tokio-tungstenite` implementation of [`Connector`]. Every link runs in its
//! own task: connect, report `Opened`, then pump outbound commands and inbound
//! frames until either side closes.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use url::Url;

use super::{
    Connector, TransportCommand, TransportEvent, TransportHandle, TransportSink, CLOSE_ABNORMAL, CLOSE_NO_STATUS,
};

/// Opens real WebSocket links.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, endpoint: &Url, sink: TransportSink) -> TransportHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(endpoint.to_string(), sink, rx));
        TransportHandle::new(tx)
    }
}

fn abnormal_close(sink: &TransportSink, error: String) {
    sink.emit(TransportEvent::Error(error));
    sink.emit(TransportEvent::Closed {
        code: CLOSE_ABNORMAL,
        reason: String::new(),
    });
}

async fn run_link(url: String, sink: TransportSink, mut commands: mpsc::UnboundedReceiver<TransportCommand>) {
    log::info!("Opening presence link {} to {}", sink.link(), url);

    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            log::warn!("Presence link {} failed to open: {}", sink.link(), e);
            abnormal_close(&sink, e.to_string());
            return;
        }
    };

    log::info!("Presence link {} open", sink.link());
    sink.emit(TransportEvent::Opened);
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(TransportCommand::Send(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        log::error!("Presence link {} write failed: {}", sink.link(), e);
                        abnormal_close(&sink, e.to_string());
                        return;
                    }
                }
                Some(TransportCommand::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        log::debug!("Presence link {} close frame not delivered: {}", sink.link(), e);
                    }
                    sink.emit(TransportEvent::Closed { code, reason });
                    return;
                }
                None => {
                    // Manager dropped the handle without closing.
                    let _ = write.close().await;
                    return;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    sink.emit(TransportEvent::Message(text.as_str().to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    log::info!("Presence link {} closed by server ({} {})", sink.link(), code, reason);
                    sink.emit(TransportEvent::Closed { code, reason });
                    return;
                }
                Some(Ok(Message::Binary(data))) => {
                    log::debug!("Presence link {} ignoring {} byte binary frame", sink.link(), data.len());
                }
                Some(Ok(_)) => {
                    // Ping/Pong are answered by tungstenite itself.
                }
                Some(Err(e)) => {
                    log::error!("Presence link {} read error: {}", sink.link(), e);
                    abnormal_close(&sink, e.to_string());
                    return;
                }
                None => {
                    log::warn!("Presence link {} stream ended without close frame", sink.link());
                    sink.emit(TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: String::new(),
                    });
                    return;
                }
            }
        }
    }
}
