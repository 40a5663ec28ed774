//! Ident responder (4.I, §6): an optional RFC 1413 server on port 113,
//! answering queries from IRC servers that require ident before accepting a
//! connection.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration};

lazy_static! {
    static ref QUERY_RE: Regex = Regex::new(r"^\s*(\d+)\s*,\s*(\d+)\s*$").unwrap();
}

/// A small, deliberate delay before looking up the answer: real ident
/// servers are rarely instant, and some client-side ident checkers
/// misbehave on a reply that arrives suspiciously fast.
const LOOKUP_DELAY: Duration = Duration::from_millis(100);

/// Looks up the ident reply for one `(local_port, remote_port)` query: scans
/// every live NetworkRoom connection for one whose local/remote TCP ports
/// match, and returns its configured ident username if found.
#[async_trait::async_trait]
pub trait IdentLookup: Send + Sync {
    async fn lookup(&self, local_port: u16, remote_port: u16) -> Option<String>;
}

pub async fn listen(lookup: std::sync::Arc<dyn IdentLookup>) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", 113)).await.context("binding ident port 113")?;
    log::info!("ident responder listening on :113");
    loop {
        let (socket, addr) = listener.accept().await?;
        let lookup = lookup.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_query(socket, lookup).await {
                debug!("ident query from {addr} failed: {e}");
            }
        });
    }
}

async fn handle_query(socket: TcpStream, lookup: std::sync::Arc<dyn IdentLookup>) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let Some(caps) = QUERY_RE.captures(line.trim()) else {
        writer.write_all(format!("{}: ERROR : INVALID-PORT\r\n", line.trim()).as_bytes()).await?;
        return Ok(());
    };
    let local_port: u16 = caps[1].parse().unwrap_or(0);
    let remote_port: u16 = caps[2].parse().unwrap_or(0);

    sleep(LOOKUP_DELAY).await;

    let reply = match lookup.lookup(local_port, remote_port).await {
        Some(ident) => format!("{local_port}, {remote_port} : USERID : UNIX : {ident}\r\n"),
        None => {
            warn!("ident query for {local_port},{remote_port} matched no connection");
            format!("{local_port}, {remote_port} : ERROR : NO-USER\r\n")
        }
    };
    writer.write_all(reply.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_regex_accepts_the_standard_format() {
        let caps = QUERY_RE.captures("6667, 54321").unwrap();
        assert_eq!(&caps[1], "6667");
        assert_eq!(&caps[2], "54321");
    }

    #[test]
    fn query_regex_rejects_garbage() {
        assert!(QUERY_RE.captures("not a query").is_none());
    }
}
