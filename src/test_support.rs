// In-process stand-in for an exchange streaming endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use crate::upstream::connector::ConnectorStatus;
use crate::upstream::{ConnectionState, UpstreamHandle};

#[derive(Clone, Debug)]
enum Control {
    Push(String),
    DropAll,
}

pub struct FakeExchange {
    url: String,
    attempts: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    control_tx: broadcast::Sender<Control>,
    subscriptions: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl FakeExchange {
    // The first `fail_first` connections are dropped before the handshake.
    pub async fn start(fail_first: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let attempts = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));
        let (control_tx, _) = broadcast::channel(64);
        let (sub_tx, sub_rx) = mpsc::unbounded_channel();

        let accept_attempts = attempts.clone();
        let accept_control = control_tx.clone();
        let accept_open = open.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let attempt = accept_attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < fail_first {
                    drop(stream);
                    continue;
                }

                let mut control_rx = accept_control.subscribe();
                let sub_tx = sub_tx.clone();
                let open = accept_open.clone();
                tokio::spawn(async move {
                    let Ok(ws) = accept_async(stream).await else { return };
                    open.fetch_add(1, Ordering::SeqCst);
                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if is_subscribe_request(&text) {
                                        let _ = sub_tx.send(text);
                                    }
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                            control = control_rx.recv() => match control {
                                Ok(Control::Push(text)) => {
                                    if write.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                // dropping the socket without a close frame
                                Ok(Control::DropAll) | Err(_) => break,
                            },
                        }
                    }
                    open.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            url,
            attempts,
            open,
            control_tx,
            subscriptions: Mutex::new(sub_rx),
        }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    pub fn connection_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    // Sockets past the handshake and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub async fn wait_for_open_connections(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.open_connections() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("open connection count not reached within 5s");
    }

    pub fn push(&self, text: &str) {
        let _ = self.control_tx.send(Control::Push(text.to_string()));
    }

    pub fn drop_connections(&self) {
        let _ = self.control_tx.send(Control::DropAll);
    }

    pub async fn next_subscription(&self) -> String {
        let mut rx = self.subscriptions.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no subscribe request within 5s")
            .expect("fake exchange stopped")
    }
}

// KuCoin sends {"type":"subscribe",..}, MEXC {"method":"SUBSCRIPTION",..}.
fn is_subscribe_request(text: &str) -> bool {
    let Ok(msg) = serde_json::from_str::<serde_json::Value>(text) else {
        return false;
    };
    msg["type"] == "subscribe" || msg["method"] == "SUBSCRIPTION"
}

pub async fn wait_for_status<F>(handle: &UpstreamHandle, predicate: F) -> ConnectorStatus
where
    F: FnMut(&ConnectorStatus) -> bool,
{
    let mut status = handle.watch_status();
    let result = tokio::time::timeout(Duration::from_secs(10), status.wait_for(predicate))
        .await
        .expect("connector status not reached within 10s")
        .expect("connector status channel closed");
    *result
}

pub async fn wait_for_state(handle: &UpstreamHandle, state: ConnectionState) -> ConnectorStatus {
    wait_for_status(handle, |s| s.state == state).await
}
