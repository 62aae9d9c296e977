//! In-memory connector for driving the manager in tests.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use url::Url;

use super::{Connector, TransportCommand, TransportEvent, TransportHandle, TransportSink};

/// One link opened through the mock.
pub(crate) struct MockLink {
    pub(crate) url: Url,
    sink: TransportSink,
    commands: Mutex<mpsc::UnboundedReceiver<TransportCommand>>,
}

impl MockLink {
    pub(crate) fn open(&self) {
        self.sink.emit(TransportEvent::Opened);
    }

    pub(crate) fn message(&self, text: impl Into<String>) {
        self.sink.emit(TransportEvent::Message(text.into()));
    }

    pub(crate) fn error(&self, message: &str) {
        self.sink.emit(TransportEvent::Error(message.to_string()));
    }

    pub(crate) fn close(&self, code: u16, reason: &str) {
        self.sink.emit(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    /// Drains every command the manager sent to this link so far.
    pub(crate) fn commands(&self) -> Vec<TransportCommand> {
        let mut rx = self.commands.lock().unwrap();
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    /// Drains sent text frames, parsed as JSON.
    pub(crate) fn sent(&self) -> Vec<serde_json::Value> {
        self.commands()
            .into_iter()
            .filter_map(|cmd| match cmd {
                TransportCommand::Send(text) => serde_json::from_str(&text).ok(),
                TransportCommand::Close { .. } => None,
            })
            .collect()
    }

    /// Drains sent frames and returns their `type` fields.
    pub(crate) fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
            .collect()
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    links: Arc<Mutex<Vec<Arc<MockLink>>>>,
}

impl MockConnector {
    pub(crate) fn opened(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub(crate) fn link(&self, index: usize) -> Arc<MockLink> {
        Arc::clone(&self.links.lock().unwrap()[index])
    }

    pub(crate) fn last(&self) -> Arc<MockLink> {
        let links = self.links.lock().unwrap();
        Arc::clone(links.last().expect("no link opened"))
    }
}

impl Connector for MockConnector {
    fn open(&self, endpoint: &Url, sink: TransportSink) -> TransportHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().unwrap().push(Arc::new(MockLink {
            url: endpoint.clone(),
            sink,
            commands: Mutex::new(rx),
        }));
        TransportHandle::new(tx)
    }
}
