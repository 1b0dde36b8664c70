use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::data::parse_feature_row;
use crate::ml::RegimeDetector;

/// Largest request read from one connection
pub const MAX_REQUEST_BYTES: usize = 4096;

/// Fit a parsed request to the detector's input width. A one-feature model
/// reads only the first value; wider models get zero padding or truncation.
pub fn reshape_features(parsed: &[f64], expected: usize) -> Vec<f64> {
    if expected <= 1 {
        return parsed.iter().take(1).copied().collect();
    }
    let mut features: Vec<f64> = parsed.iter().take(expected).copied().collect();
    features.resize(expected, 0.0);
    features
}

/// Serves regime labels for single observations over plain TCP, one
/// connection at a time
#[derive(Debug, Clone)]
pub struct RegimeServer {
    detector: RegimeDetector,
}

impl RegimeServer {
    pub fn new(detector: RegimeDetector) -> Self {
        Self { detector }
    }

    pub fn expected_features(&self) -> usize {
        self.detector.n_features().max(1)
    }

    /// Loopback-only listener
    pub async fn bind(port: u16) -> Result<TcpListener> {
        TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("Failed to bind 127.0.0.1:{}", port))
    }

    /// Accept and answer connections until the process ends
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(
                "Listening on {} ({} regimes, {} features per request)",
                addr,
                self.detector.n_states(),
                self.expected_features()
            );
        }
        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            debug!("Connection from {}", peer);
            self.handle_connection(&mut stream).await;
        }
    }

    /// One read is one request; the stream is shut down afterwards
    pub async fn handle_connection<S>(&self, stream: &mut S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; MAX_REQUEST_BYTES];
        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to read request: {}", e);
                return;
            }
        };

        let response = match std::str::from_utf8(&buf[..n]) {
            Ok(text) if text.trim().is_empty() => None,
            Ok(text) => Some(self.respond(text.trim())),
            Err(e) => Some(Err(anyhow::Error::new(e))),
        };

        if let Some(result) = response {
            let body = match result {
                Ok(label) => label,
                Err(e) => {
                    warn!("Request failed: {}", e);
                    format!("ERROR: Error processing request: {}", e)
                }
            };
            if let Err(e) = stream.write_all(body.as_bytes()).await {
                warn!("Failed to send response: {}", e);
            }
        }

        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown failed: {}", e);
        }
    }

    /// Label for one whitespace-separated observation
    pub fn respond(&self, payload: &str) -> Result<String> {
        let parsed = parse_feature_row(payload)?;
        let features = reshape_features(&parsed, self.expected_features());
        let regime = self.detector.detect(&features)?;
        Ok(regime.to_string())
    }
}

/// Load the detector and serve until the process is stopped
pub async fn run_server(
    config: &PipelineConfig,
    model: Option<PathBuf>,
    port: Option<u16>,
) -> Result<()> {
    let model_path = model.unwrap_or_else(|| config.regime_model_path());
    let detector = RegimeDetector::from_json(&model_path)?;
    let listener = RegimeServer::bind(port.unwrap_or(config.server.port)).await?;
    RegimeServer::new(detector).serve(listener).await
}
