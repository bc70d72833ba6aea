//! CacheLink: the pooled request/response client that asks an ingest
//! daemon's MetricCache for a metric's unflushed datapoints.
//!
//! One connection pool per ring token. Pooled sockets are validated with a
//! non-blocking probe before reuse: a readable-but-empty socket means the
//! peer closed it and is discarded; readable-with-data or would-block
//! means the peer is healthy and the socket is reused. I/O failures close
//! the socket and propagate; callers treat that as "no cached points".

use std::{
    collections::HashMap,
    io,
    time::Duration,
};

use anyhow::Context;
use common::{
    hashing::{
        Destination,
        DestinationRing,
        Token,
    },
    types::Datapoint,
    wire::{
        read_frame,
        write_frame,
    },
};
use parking_lot::Mutex;
use tokio::net::{
    lookup_host,
    TcpSocket,
    TcpStream,
};

pub struct CarbonLinkPool {
    ring: DestinationRing,
    timeout: Duration,
    connections: Mutex<HashMap<Token, Vec<TcpStream>>>,
}

impl CarbonLinkPool {
    /// Build a pool over `host:port[:instance]` destination specs.
    pub fn from_hosts(hosts: &[String], timeout: Duration) -> anyhow::Result<Self> {
        let destinations = hosts
            .iter()
            .map(|spec| Destination::parse(spec))
            .collect::<anyhow::Result<Vec<_>>>()?;
        anyhow::ensure!(!destinations.is_empty(), "CacheLink needs at least one host");
        // Cache queries go to the single authoritative token per metric.
        let ring = DestinationRing::new(destinations, 1)?;
        Ok(Self {
            ring,
            timeout,
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch the datapoints currently buffered for `metric` on the daemon
    /// that owns it.
    pub async fn query(&self, metric: &str) -> anyhow::Result<Vec<Datapoint>> {
        let token = self
            .ring
            .node_for(metric)
            .context("CacheLink ring is empty")?
            .clone();
        let port = self
            .ring
            .port(&token)
            .with_context(|| format!("No port for CacheLink host {token}"))?;
        let mut connection = self.checkout(&token, port).await?;
        match self.request(&mut connection, metric).await {
            Ok(datapoints) => {
                tracing::debug!(
                    "CacheLink query for {metric} returned {} datapoints",
                    datapoints.len(),
                );
                self.checkin(token, connection);
                Ok(datapoints)
            },
            // The connection is in an unknown state; drop it.
            Err(e) => Err(e),
        }
    }

    async fn checkout(&self, token: &Token, port: u16) -> anyhow::Result<TcpStream> {
        loop {
            let Some(pooled) = self.connections.lock().entry(token.clone()).or_default().pop()
            else {
                break;
            };
            if still_connected(&pooled) {
                return Ok(pooled);
            }
        }
        tracing::debug!("CacheLink creating a new socket for {token}");
        self.connect(token, port).await
    }

    fn checkin(&self, token: Token, connection: TcpStream) {
        self.connections
            .lock()
            .entry(token)
            .or_default()
            .push(connection);
    }

    async fn connect(&self, token: &Token, port: u16) -> anyhow::Result<TcpStream> {
        let address = tokio::time::timeout(
            self.timeout,
            lookup_host((token.host.as_str(), port)),
        )
        .await
        .context("CacheLink address lookup timed out")??
        .next()
        .with_context(|| format!("No addresses for {token}:{port}"))?;
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        let stream = tokio::time::timeout(self.timeout, socket.connect(address))
            .await
            .context("CacheLink connect timed out")??;
        Ok(stream)
    }

    async fn request(
        &self,
        connection: &mut TcpStream,
        metric: &str,
    ) -> anyhow::Result<Vec<Datapoint>> {
        tokio::time::timeout(self.timeout, write_frame(connection, metric.as_bytes()))
            .await
            .context("CacheLink send timed out")??;
        let body = tokio::time::timeout(self.timeout, read_frame(connection))
            .await
            .context("CacheLink receive timed out")??
            .context("CacheLink peer closed the connection mid-request")?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Non-blocking connection probe. Readable but empty (`Ok(0)`) is an
/// orderly shutdown, so discard; readable with data or a clean
/// would-block means the peer is alive and the socket is safe to reuse.
fn still_connected(connection: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match connection.try_read(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) => e.kind() == io::ErrorKind::WouldBlock,
    }
}
