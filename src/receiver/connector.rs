use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::config::{DataSourceConfig, ReceiverConfig};
use crate::models::Tick;

use super::parse;
use super::parse::parse_message;
use super::ring::RingSender;
use super::Receiver;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

impl SourceStatus {
    fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Streaming => 1,
            Self::Reconnecting => 2,
            Self::Stopped => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Streaming,
            2 => Self::Reconnecting,
            _ => Self::Stopped,
        }
    }
}

pub struct SourceConnector {
    config: DataSourceConfig,
    connection_timeout: Duration,
    heartbeat_timeout: Duration,
    status: AtomicU8,
    last_received: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone)]
pub struct ReceiverStats {
    pub received: u64,
    pub errors: u64,
    pub buffer_full_count: u64,
    pub parse_errors: u64,
    pub active_sources: usize,
    pub configured_sources: usize,
    pub last_received: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
}

impl SourceConnector {
    pub fn new(config: DataSourceConfig, receiver_cfg: &ReceiverConfig) -> Self {
        Self {
            config,
            connection_timeout: receiver_cfg.connection_timeout,
            heartbeat_timeout: receiver_cfg.heartbeat_interval * 2,
            status: AtomicU8::new(SourceStatus::Connecting.as_u8()),
            last_received: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SourceStatus {
        SourceStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    pub fn set_status(&self, status: SourceStatus) {
        self.status.store(status.as_u8(), Ordering::Relaxed);
    }

    pub fn last_received(&self) -> Option<DateTime<Utc>> {
        *self.last_received.lock()
    }

    fn mark_received(&self) {
        *self.last_received.lock() = Some(Utc::now());
    }

    /// Connect, subscribe, read-loop with heartbeat staleness detection.
    /// Returns `Ok(())` on a clean shutdown request, `Err(message)` on any
    /// connection failure so the caller can apply backoff and retry.
    pub async fn run_websocket(
        &self,
        symbols: &[String],
        tx: &RingSender<Tick>,
        receiver: &Receiver,
    ) -> Result<(), String> {
        let url = self.config.url.clone();
        debug!(source = %self.config.name, %url, "connecting websocket");

        let connect_result = tokio::time::timeout(self.connection_timeout, connect_async(&url))
            .await
            .map_err(|_| "connect timeout".to_string())?;
        let (ws_stream, _response) = connect_result.map_err(|e| e.to_string())?;
        let (mut write, mut read) = ws_stream.split();

        for symbol in symbols {
            let subscribe = parse::subscribe_payload(symbol);
            if let Some(payload) = subscribe {
                write
                    .send(Message::Text(payload))
                    .await
                    .map_err(|e| format!("subscribe failed: {e}"))?;
            }
        }

        self.set_status(SourceStatus::Streaming);
        self.mark_received();

        let mut stale_check = tokio::time::interval(self.heartbeat_timeout / 2);
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.mark_received();
                            match parse_message(&text, &self.config.name) {
                                Ok(ticks) => {
                                    receiver.record_parse_result(&self.config.name, true);
                                    for tick in ticks {
                                        receiver.record_received();
                                        if tx.push(tick) {
                                            receiver.record_buffer_full();
                                        }
                                    }
                                }
                                Err(_) => {
                                    receiver.record_parse_result(&self.config.name, false);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.mark_received();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(format!("server closed connection: {frame:?}"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.to_string()),
                        None => return Err("stream ended".to_string()),
                    }
                }
                _ = stale_check.tick() => {
                    let stale = match self.last_received() {
                        Some(last) => Utc::now().signed_duration_since(last).to_std().unwrap_or_default() > self.heartbeat_timeout,
                        None => false,
                    };
                    if stale {
                        return Err("no inbound message within heartbeatTimeout * 2".to_string());
                    }
                    if let Err(e) = write.send(Message::Ping(vec![])).await {
                        warn!(source = %self.config.name, error = %e, "heartbeat ping failed");
                    }
                }
            }
        }
    }

    /// REST polling connector: fetches on `connectionTimeout`-bounded
    /// requests at the configured flush cadence.
    pub async fn run_rest_poll(
        &self,
        symbols: &[String],
        tx: &RingSender<Tick>,
        receiver: &Receiver,
    ) -> Result<(), String> {
        let client = reqwest::Client::builder()
            .timeout(self.connection_timeout)
            .build()
            .map_err(|e| e.to_string())?;

        self.set_status(SourceStatus::Streaming);
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            for symbol in symbols {
                let url = format!("{}?symbol={}", self.config.url, symbol);
                let body = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?
                    .text()
                    .await
                    .map_err(|e| e.to_string())?;
                self.mark_received();
                match parse_message(&body, &self.config.name) {
                    Ok(ticks) => {
                        receiver.record_parse_result(&self.config.name, true);
                        for tick in ticks {
                            receiver.record_received();
                            if tx.push(tick) {
                                receiver.record_buffer_full();
                            }
                        }
                    }
                    Err(_) => receiver.record_parse_result(&self.config.name, false),
                }
            }
        }
    }

    /// File connector, primarily for fixture replay in tests/demos: reads
    /// newline-delimited JSON ticks once and exits.
    pub async fn run_file(
        &self,
        _symbols: &[String],
        tx: &RingSender<Tick>,
        receiver: &Receiver,
    ) -> Result<(), String> {
        self.set_status(SourceStatus::Streaming);
        let contents = tokio::fs::read_to_string(&self.config.url)
            .await
            .map_err(|e| e.to_string())?;
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_message(line, &self.config.name) {
                Ok(ticks) => {
                    receiver.record_parse_result(&self.config.name, true);
                    for tick in ticks {
                        receiver.record_received();
                        if tx.push(tick) {
                            receiver.record_buffer_full();
                        }
                    }
                }
                Err(_) => receiver.record_parse_result(&self.config.name, false),
            }
        }
        self.mark_received();
        Ok(())
    }
}
