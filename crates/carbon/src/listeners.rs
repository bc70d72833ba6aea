//! The daemon's three TCP surfaces: plain-text line ingest, length-
//! prefixed batch ingest, and the cache-query protocol the query daemon's
//! CacheLink client speaks.
//!
//! Invalid input never tears down a connection; it is logged and dropped.
//! NaN values are filtered here, at the ingest boundary.

use std::{
    net::SocketAddr,
    sync::Arc,
};

use common::{
    types::Datapoint,
    wire::{
        read_frame,
        write_frame,
        FrameError,
    },
};
use tokio::{
    io::{
        AsyncBufReadExt,
        BufReader,
    },
    net::{
        TcpListener,
        TcpStream,
    },
};

use crate::{
    cache::MetricCache,
    metrics::{
        CACHE_QUERIES_TOTAL,
        METRICS_RECEIVED_TOTAL,
    },
};

fn metric_received(cache: &MetricCache, metric: &str, datapoint: Datapoint) {
    if datapoint.value.is_nan() {
        return;
    }
    METRICS_RECEIVED_TOTAL.inc();
    cache.store(metric, datapoint);
}

/// Parse one line of `<metric> <value> <timestamp>`. Exactly three
/// whitespace-delimited fields, or nothing.
pub fn parse_line(line: &str) -> Option<(&str, Datapoint)> {
    let mut parts = line.split_whitespace();
    let metric = parts.next()?;
    let value: f64 = parts.next()?.parse().ok()?;
    let timestamp: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((metric, Datapoint::new(timestamp, value)))
}

pub async fn run_line_receiver(
    listener: TcpListener,
    cache: Arc<MetricCache>,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let cache = cache.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_line_connection(socket, peer, cache).await {
                tracing::info!("line connection with {peer} lost: {e:#}");
            }
        });
    }
}

async fn handle_line_connection(
    socket: TcpStream,
    peer: SocketAddr,
    cache: Arc<MetricCache>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(socket).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Some((metric, datapoint)) => metric_received(&cache, metric, datapoint),
            None => tracing::info!("invalid line received from client {peer}, ignoring"),
        }
    }
    Ok(())
}

/// Coerce one batch entry. The wire allows numbers or numeric strings for
/// either field; anything else drops the entry, not the frame.
fn coerce_entry(entry: &serde_json::Value) -> Option<(String, Datapoint)> {
    let coerce = |v: &serde_json::Value| -> Option<f64> {
        match v {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    };
    let metric = entry.get(0)?.as_str()?;
    let pair = entry.get(1)?;
    let timestamp = coerce(pair.get(0)?)?;
    let value = coerce(pair.get(1)?)?;
    Some((metric.to_owned(), Datapoint::new(timestamp, value)))
}

pub async fn run_batch_receiver(
    listener: TcpListener,
    cache: Arc<MetricCache>,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let cache = cache.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_batch_connection(socket, peer, cache).await {
                tracing::info!("batch connection with {peer} lost: {e:#}");
            }
        });
    }
}

async fn handle_batch_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    cache: Arc<MetricCache>,
) -> Result<(), FrameError> {
    while let Some(body) = read_frame(&mut socket).await? {
        let entries: Vec<serde_json::Value> = match serde_json::from_slice(&body) {
            Ok(entries) => entries,
            Err(_) => {
                tracing::info!("invalid batch received from client {peer}, ignoring");
                continue;
            },
        };
        for entry in &entries {
            if let Some((metric, datapoint)) = coerce_entry(entry) {
                metric_received(&cache, &metric, datapoint);
            }
        }
    }
    Ok(())
}

pub async fn run_cache_query_listener(
    listener: TcpListener,
    cache: Arc<MetricCache>,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let cache = cache.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_cache_query_connection(socket, cache).await {
                tracing::info!("cache query connection with {peer} lost: {e:#}");
            }
        });
    }
}

async fn handle_cache_query_connection(
    mut socket: TcpStream,
    cache: Arc<MetricCache>,
) -> anyhow::Result<()> {
    while let Some(body) = read_frame(&mut socket).await? {
        let metric = std::str::from_utf8(&body)?;
        let values = cache.get(metric);
        tracing::debug!("cache query for {metric} returned {} values", values.len());
        CACHE_QUERIES_TOTAL.inc();
        write_frame(&mut socket, &serde_json::to_vec(&values)?).await?;
    }
    Ok(())
}
