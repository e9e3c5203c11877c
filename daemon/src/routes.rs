//! Static route source

use ipnet::Ipv4Net;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum RouteFileError {
    #[error("Failed to read route file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid route on line {line}: {content:?} ({reason})")]
    Parse {
        line: usize,
        content: String,
        reason: String,
    },
}

/// Parse `address/prefix` lines. Blank lines and `#` comments are skipped.
pub fn parse_routes(text: &str) -> Result<Vec<Ipv4Net>, RouteFileError> {
    let mut routes = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }

        let net: Ipv4Net = line.parse().map_err(|e: ipnet::AddrParseError| {
            RouteFileError::Parse {
                line: index + 1,
                content: raw.to_string(),
                reason: e.to_string(),
            }
        })?;
        routes.push(net);
    }

    Ok(routes)
}

/// Read the static route file
pub async fn load_routes(path: impl AsRef<Path>) -> Result<Vec<Ipv4Net>, RouteFileError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| RouteFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let routes = parse_routes(&text)?;
    info!("Loaded {} static routes from {}", routes.len(), path.display());

    Ok(routes)
}
