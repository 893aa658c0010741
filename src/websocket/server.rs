use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use log::{info, error};

use crate::data::TopicRegistry;
use crate::error::Result;
use crate::exchange::Exchange;
use crate::upstream::wait_for_stop;
use crate::websocket::ClientSession;

// Extract the symbol from the query string; bytes that are not UTF-8 after
// decoding become U+FFFD instead of dropping the parameter.
pub fn extract_symbol_from_request(req: &Request) -> Option<String> {
    let query = req.uri().query()?;
    for param in query.split('&') {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        if key == "symbol" {
            let value = value.replace('+', " ");
            let decoded = urlencoding::decode_binary(value.as_bytes());
            return Some(String::from_utf8_lossy(&decoded).into_owned());
        }
    }
    None
}

pub struct RelayServer {
    exchange: Exchange,
    listener: TcpListener,
    registry: Arc<TopicRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl RelayServer {
    pub async fn bind(
        exchange: Exchange,
        addr: &str,
        registry: Arc<TopicRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            exchange,
            listener,
            registry,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(mut self) {
        let session_shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let exchange = self.exchange;
                            let registry = self.registry.clone();
                            let shutdown = session_shutdown.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, addr.to_string(), exchange, registry, shutdown).await;
                            });
                        }
                        Err(e) => {
                            error!("{} listener failed to accept: {}", self.exchange, e);
                        }
                    }
                }
                _ = wait_for_stop(&mut self.shutdown) => {
                    info!("{} WebSocket Server closed", self.exchange.name().to_uppercase());
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: String,
    exchange: Exchange,
    registry: Arc<TopicRegistry>,
    shutdown: watch::Receiver<bool>,
) {
    let mut symbol: Option<String> = None;

    let ws_stream = match accept_hdr_async(stream, |req: &Request, response: Response| {
        symbol = extract_symbol_from_request(req);
        Ok(response)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {:?}", peer_addr, e);
            return;
        }
    };

    let session = ClientSession::new(exchange, registry, peer_addr);
    session.run(ws_stream, symbol, shutdown).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    use crate::data::{IdleTopicPolicy, Topic};
    use crate::exchange::Endpoints;
    use crate::test_support::FakeExchange;
    use crate::upstream::{ConnectionState, UpstreamSettings};
    use crate::websocket::handler::MISSING_SYMBOL_ERROR;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Harness {
        addr: SocketAddr,
        registry: Arc<TopicRegistry>,
        shutdown_tx: watch::Sender<bool>,
    }

    async fn start_relay(exchange: Exchange, upstream_url: String, settings: UpstreamSettings) -> Harness {
        let endpoints = Endpoints {
            kucoin: upstream_url.clone(),
            mexc: upstream_url,
        };
        let registry = Arc::new(TopicRegistry::new(endpoints, settings, IdleTopicPolicy::TearDown));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = RelayServer::bind(exchange, "127.0.0.1:0", registry.clone(), shutdown_rx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        Harness {
            addr,
            registry,
            shutdown_tx,
        }
    }

    fn fast_settings() -> UpstreamSettings {
        UpstreamSettings {
            connect_timeout: Duration::from_secs(2),
            reconnect_base: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(200),
            stable_after: Duration::from_secs(3600),
            ping_interval: Duration::from_secs(60),
        }
    }

    async fn connect(addr: SocketAddr, query: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/{}", addr, query)).await.unwrap();
        ws
    }

    async fn next_text(client: &mut Client) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("no message within 5s")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return text;
            }
        }
    }

    async fn wait_for_subscribers(registry: &TopicRegistry, topic: &Topic, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.subscriber_count(topic) != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriber count not reached");
    }

    async fn wait_for_connector(registry: &TopicRegistry, topic: &Topic, state: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while registry.connector_state(topic) != Some(state) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connector state not reached");
    }

    #[test]
    fn test_extract_symbol_from_request() {
        let req = "ws://localhost:8083/?symbol=btc-usdt&x=1".into_client_request().unwrap();
        assert_eq!(extract_symbol_from_request(&req).as_deref(), Some("btc-usdt"));

        let req = "ws://localhost:8083/ws?foo=bar&symbol=BTC%2DUSDT".into_client_request().unwrap();
        assert_eq!(extract_symbol_from_request(&req).as_deref(), Some("BTC-USDT"));

        let req = "ws://localhost:8083/?symbol=".into_client_request().unwrap();
        assert_eq!(extract_symbol_from_request(&req).as_deref(), Some(""));

        let req = "ws://localhost:8083/?symbol=BTC%FF".into_client_request().unwrap();
        assert_eq!(extract_symbol_from_request(&req).as_deref(), Some("BTC\u{FFFD}"));

        let req = "ws://localhost:8083/?other=1".into_client_request().unwrap();
        assert_eq!(extract_symbol_from_request(&req), None);

        let req = "ws://localhost:8083/".into_client_request().unwrap();
        assert_eq!(extract_symbol_from_request(&req), None);
    }

    #[tokio::test]
    async fn test_missing_symbol_gets_error_and_close() {
        let harness = start_relay(Exchange::KuCoin, "ws://127.0.0.1:9".to_string(), fast_settings()).await;

        for query in ["", "?symbol=", "?symbol=%20%20", "?foo=bar"] {
            let mut client = connect(harness.addr, query).await;
            let text = next_text(&mut client).await;
            let payload: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(payload["error"], MISSING_SYMBOL_ERROR);

            let next = tokio::time::timeout(Duration::from_secs(5), client.next()).await.unwrap();
            assert!(matches!(next, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
        }

        assert!(harness.registry.topics().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_symbol_is_still_subscribed() {
        let harness = start_relay(Exchange::KuCoin, "ws://127.0.0.1:9".to_string(), fast_settings()).await;
        let topic = Topic::new(Exchange::KuCoin, "btc\u{FFFD}");

        let _client = connect(harness.addr, "?symbol=btc%FF").await;
        wait_for_subscribers(&harness.registry, &topic, 1).await;

        let _ = harness.shutdown_tx.send(true);
        harness.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_fanout_to_same_symbol_only() {
        let fake = FakeExchange::start(0).await;
        let harness = start_relay(Exchange::KuCoin, fake.url(), fast_settings()).await;
        let btc = Topic::new(Exchange::KuCoin, "BTC-USDT");
        let eth = Topic::new(Exchange::KuCoin, "ETH-USDT");

        let mut first = connect(harness.addr, "?symbol=btc-usdt").await;
        let mut second = connect(harness.addr, "?symbol=BTC-USDT").await;
        let mut other = connect(harness.addr, "?symbol=eth-usdt").await;

        wait_for_subscribers(&harness.registry, &btc, 2).await;
        wait_for_subscribers(&harness.registry, &eth, 1).await;
        assert_eq!(harness.registry.topics().len(), 2);
        wait_for_connector(&harness.registry, &btc, ConnectionState::Subscribed).await;
        wait_for_connector(&harness.registry, &eth, ConnectionState::Subscribed).await;
        fake.next_subscription().await;
        fake.next_subscription().await;

        // the fake sends every push to every upstream socket; only the BTC one may relay it
        fake.push(r#"{"topic":"/market/ticker:BTC-USDT","data":{"price":"50000"}}"#);
        assert_eq!(next_text(&mut first).await, r#"{"price":"50000"}"#);
        assert_eq!(next_text(&mut second).await, r#"{"price":"50000"}"#);

        fake.push(r#"{"topic":"/market/ticker:ETH-USDT","data":{"price":"3000"}}"#);
        assert_eq!(next_text(&mut other).await, r#"{"price":"3000"}"#);

        // the ETH update never reaches BTC sessions; their next message is the following BTC one
        fake.push(r#"{"topic":"/market/ticker:BTC-USDT","data":{"price":"50001"}}"#);
        assert_eq!(next_text(&mut first).await, r#"{"price":"50001"}"#);
        assert_eq!(next_text(&mut second).await, r#"{"price":"50001"}"#);

        let _ = harness.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_clients_survive_upstream_restarts() {
        let fake = FakeExchange::start(3).await;
        let harness = start_relay(Exchange::KuCoin, fake.url(), fast_settings()).await;
        let topic = Topic::new(Exchange::KuCoin, "BTC-USDT");

        let mut client = connect(harness.addr, "?symbol=BTC-USDT").await;
        wait_for_connector(&harness.registry, &topic, ConnectionState::Subscribed).await;
        assert_eq!(fake.connection_attempts(), 4);
        fake.next_subscription().await;

        fake.push(r#"{"topic":"/market/ticker:BTC-USDT","data":{"price":"1"}}"#);
        assert_eq!(next_text(&mut client).await, r#"{"price":"1"}"#);

        // upstream drops; the relay reconnects while the client stays put
        fake.drop_connections();
        fake.next_subscription().await;
        wait_for_connector(&harness.registry, &topic, ConnectionState::Subscribed).await;
        fake.push(r#"{"topic":"/market/ticker:BTC-USDT","data":{"price":"2"}}"#);
        assert_eq!(next_text(&mut client).await, r#"{"price":"2"}"#);
        assert_eq!(harness.registry.subscriber_count(&topic), 1);

        let _ = harness.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_disconnect_releases_and_tears_down() {
        let fake = FakeExchange::start(0).await;
        let harness = start_relay(Exchange::Mexc, fake.url(), fast_settings()).await;
        let topic = Topic::new(Exchange::Mexc, "BTCUSDT");

        let mut a = connect(harness.addr, "?symbol=btcusdt").await;
        let mut b = connect(harness.addr, "?symbol=btcusdt").await;
        wait_for_subscribers(&harness.registry, &topic, 2).await;
        wait_for_connector(&harness.registry, &topic, ConnectionState::Subscribed).await;
        let subscribe = fake.next_subscription().await;
        assert!(subscribe.contains("spot@ticker.BTCUSDT"));

        a.close(None).await.unwrap();
        wait_for_subscribers(&harness.registry, &topic, 1).await;

        // the remaining session keeps receiving
        fake.push(r#"{"c":"spot@ticker.BTCUSDT","d":{"p":"9"},"s":"BTCUSDT"}"#);
        assert_eq!(next_text(&mut b).await, r#"{"p":"9"}"#);

        b.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !harness.registry.topics().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("topic not torn down");

        let _ = harness.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let harness = start_relay(Exchange::KuCoin, "ws://127.0.0.1:9".to_string(), fast_settings()).await;
        let topic = Topic::new(Exchange::KuCoin, "BTC-USDT");

        let mut client = connect(harness.addr, "?symbol=BTC-USDT").await;
        wait_for_subscribers(&harness.registry, &topic, 1).await;

        harness.shutdown_tx.send(true).unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        wait_for_subscribers(&harness.registry, &topic, 0).await;

        // the listener is gone too
        let _ = client.send(Message::Close(None)).await;
        harness.registry.shutdown().await;
    }
}
