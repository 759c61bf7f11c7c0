#![allow(dead_code)]

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use crickstox::config::EngineConfig;
use crickstox::data_paths::DataPaths;
use crickstox::sync::SyncEngine;

/// Minimal feed server: accepts connections, answers pings, and forwards
/// every text frame it receives to the returned channel
pub async fn spawn_feed_server() -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Text(text) => {
                            let _ = tx.send(text.as_str().to_string());
                        }
                        Message::Ping(payload) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    (format!("ws://{addr}"), rx)
}

pub fn engine_config(rest_base_url: &str, ws_url: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.rest_base_url = rest_base_url.to_string();
    config.ws_url = ws_url.to_string();
    config.reconnect.base_interval_ms = 50;
    config.reconnect.max_interval_ms = 200;
    config
}

pub fn engine(config: EngineConfig, data_dir: &std::path::Path) -> SyncEngine {
    let paths = DataPaths::new(data_dir);
    SyncEngine::new(config, &paths, "test-token", "user-1").unwrap()
}

/// Block until the engine reports `Connected`
pub async fn wait_for_connected(engine: &SyncEngine) {
    let mut state = engine.state_watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !state.borrow_and_update().is_connected() {
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("engine did not connect in time");
}
