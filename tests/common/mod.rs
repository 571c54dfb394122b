#![allow(dead_code)]

use portal_link::auth::SessionHandle;
use portal_link::domain_model::*;
use portal_link::domain_port::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn session(access: &str, refresh: &str) -> Session {
    Session::new(
        AccessToken(access.to_string()),
        RefreshToken(refresh.to_string()),
        Principal {
            id: "m-1001".to_string(),
            name: "Acme Coffee".to_string(),
            portal: PortalKind::Merchant,
        },
    )
}

pub async fn signed_in(access: &str, refresh: &str) -> SessionHandle {
    let handle = SessionHandle::in_memory();
    handle
        .establish(session(access, refresh))
        .await
        .expect("memory store never fails");
    handle
}

/// The far end of one channel opened through [`ChannelConnector`].
pub struct ServerEnd {
    pub url: String,
    pub to_client: mpsc::Sender<ConnMessage>,
    pub from_client: mpsc::Receiver<ConnMessage>,
}

impl ServerEnd {
    pub async fn push(&self, json: &str) {
        self.to_client
            .send(ConnMessage::Text(json.to_string()))
            .await
            .expect("client end alive");
    }

    /// Next text frame from the client, skipping transport-level frames.
    pub async fn next_text(&mut self) -> Option<String> {
        while let Some(message) = self.from_client.recv().await {
            if let ConnMessage::Text(text) = message {
                return Some(text);
            }
        }
        None
    }
}

/// In-memory transport: every `open` either fails or yields a channel pair
/// whose far end is handed to the test.
pub struct ChannelConnector {
    opens: AtomicUsize,
    refuse: AtomicBool,
    handshake: Mutex<Duration>,
    urls: Mutex<Vec<String>>,
    ends: mpsc::UnboundedSender<ServerEnd>,
}

impl ChannelConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (ends, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            opens: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            handshake: Mutex::new(Duration::ZERO),
            urls: Mutex::new(Vec::new()),
            ends,
        });
        (connector, rx)
    }

    pub fn refusing() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (connector, rx) = Self::new();
        connector.set_refuse(true);
        (connector, rx)
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn set_handshake(&self, delay: Duration) {
        *self.handshake.lock().unwrap() = delay;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Connector for ChannelConnector {
    async fn open(
        &self,
        url: &str,
    ) -> anyhow::Result<(Box<dyn ConnSender>, Box<dyn ConnReceiver>)> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        let handshake = *self.handshake.lock().unwrap();
        if !handshake.is_zero() {
            tokio::time::sleep(handshake).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }

        let (client_tx, from_client) = mpsc::channel(64);
        let (to_client, client_rx) = mpsc::channel(64);
        let _ = self.ends.send(ServerEnd {
            url: url.to_string(),
            to_client,
            from_client,
        });
        Ok((Box::new(client_tx), Box::new(client_rx)))
    }
}
