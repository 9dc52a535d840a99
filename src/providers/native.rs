//! # Native Cache Protocols
//!
//! Minimal clients for the two cache wire protocols the broker speaks directly:
//!
//! - Memcached text protocol: `flush_all` and `stats`
//! - Redis RESP: `INFO`, whose bulk reply is a list of `key:value` lines with `#` section
//!   headers
//!
//! Stats keep the order the server reports them in.

use crate::error::{ProviderError, ProviderResult};
use crate::models::Stat;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

async fn connect(endpoint: &str) -> ProviderResult<TcpStream> {
    let stream = timeout(IO_TIMEOUT, TcpStream::connect(endpoint))
        .await
        .map_err(|_| ProviderError::Timeout(format!("connection to {endpoint}")))??;
    debug!(endpoint = endpoint, "Connected to cache node");
    Ok(stream)
}

/// Send `flush_all` to a memcached node
pub async fn memcached_flush(endpoint: &str) -> ProviderResult<()> {
    let stream = connect(endpoint).await?;
    let mut reader = BufReader::new(stream);
    reader.get_mut().write_all(b"flush_all\r\n").await?;

    let mut line = String::new();
    timeout(IO_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| ProviderError::Timeout(format!("flush_all on {endpoint}")))??;

    match line.trim_end() {
        "OK" => Ok(()),
        other => Err(ProviderError::Backend(format!(
            "unexpected flush_all reply from {endpoint}: {other}"
        ))),
    }
}

/// Run `stats` against a memcached node
pub async fn memcached_stats(endpoint: &str) -> ProviderResult<Vec<Stat>> {
    let stream = connect(endpoint).await?;
    let mut reader = BufReader::new(stream);
    reader.get_mut().write_all(b"stats\r\n").await?;

    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let read = timeout(IO_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| ProviderError::Timeout(format!("stats on {endpoint}")))??;
        if read == 0 {
            return Err(ProviderError::Io(format!(
                "connection to {endpoint} closed before END"
            )));
        }
        let line = line.trim_end().to_string();
        if line == "END" {
            break;
        }
        if line.starts_with("ERROR") || line.starts_with("SERVER_ERROR") {
            return Err(ProviderError::Backend(line));
        }
        lines.push(line);
    }
    Ok(parse_memcached_stats(lines.iter().map(String::as_str)))
}

/// Parse `STAT <key> <value>` lines
pub fn parse_memcached_stats<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<Stat> {
    lines
        .filter_map(|line| {
            let rest = line.strip_prefix("STAT ")?;
            let (key, value) = rest.split_once(' ')?;
            Some(Stat::new(key, value))
        })
        .collect()
}

/// Encode a command as a RESP array of bulk strings
fn resp_command(parts: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend_from_slice(format!("${}\r\n{}\r\n", part.len(), part).as_bytes());
    }
    out
}

/// Run `INFO` against a redis node, authenticating first when a password is set
pub async fn redis_info(endpoint: &str, password: &str) -> ProviderResult<Vec<Stat>> {
    let stream = connect(endpoint).await?;
    let mut reader = BufReader::new(stream);

    if !password.is_empty() {
        reader
            .get_mut()
            .write_all(&resp_command(&["AUTH", password]))
            .await?;
        let mut reply = String::new();
        timeout(IO_TIMEOUT, reader.read_line(&mut reply))
            .await
            .map_err(|_| ProviderError::Timeout(format!("AUTH on {endpoint}")))??;
        if !reply.starts_with("+OK") {
            return Err(ProviderError::Backend(format!(
                "authentication to {endpoint} failed: {}",
                reply.trim_end()
            )));
        }
    }

    reader
        .get_mut()
        .write_all(&resp_command(&["INFO"]))
        .await?;

    let mut header = String::new();
    timeout(IO_TIMEOUT, reader.read_line(&mut header))
        .await
        .map_err(|_| ProviderError::Timeout(format!("INFO on {endpoint}")))??;
    let header = header.trim_end();

    if let Some(message) = header.strip_prefix('-') {
        return Err(ProviderError::Backend(message.to_string()));
    }
    let length: usize = header
        .strip_prefix('$')
        .and_then(|len| len.parse().ok())
        .ok_or_else(|| ProviderError::Backend(format!("unexpected INFO reply: {header}")))?;

    // bulk payload plus trailing CRLF
    let mut body = vec![0u8; length + 2];
    timeout(IO_TIMEOUT, reader.read_exact(&mut body))
        .await
        .map_err(|_| ProviderError::Timeout(format!("INFO on {endpoint}")))??;
    body.truncate(length);

    let text = String::from_utf8_lossy(&body);
    Ok(parse_redis_info(&text))
}

/// Parse the `INFO` bulk string, skipping section headers and blank lines
pub fn parse_redis_info(text: &str) -> Vec<Stat> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| Stat::new(key, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_redis_info_skips_headers() {
        let info = "# Server\r\nredis_version:7.0.12\r\nuptime_in_seconds:42\r\n\r\n# Memory\r\nused_memory:1024\r\n";
        let stats = parse_redis_info(info);
        assert_eq!(
            stats,
            vec![
                Stat::new("redis_version", "7.0.12"),
                Stat::new("uptime_in_seconds", "42"),
                Stat::new("used_memory", "1024"),
            ]
        );
    }

    #[test]
    fn test_resp_command_encoding() {
        assert_eq!(resp_command(&["INFO"]), b"*1\r\n$4\r\nINFO\r\n".to_vec());
        assert_eq!(
            resp_command(&["AUTH", "pw"]),
            b"*2\r\n$4\r\nAUTH\r\n$2\r\npw\r\n".to_vec()
        );
    }

    #[test]
    fn test_parse_memcached_stats_keeps_order() {
        let lines = ["STAT pid 1", "STAT version 1.6.21", "STAT curr_items 0"];
        let stats = parse_memcached_stats(lines.into_iter());
        let keys: Vec<_> = stats.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["pid", "version", "curr_items"]);
        assert_eq!(stats[1].value, "1.6.21");
    }

    async fn serve_once(reply: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(reply).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_memcached_stats_over_tcp() {
        let addr = serve_once(b"STAT pid 7\r\nSTAT uptime 99\r\nEND\r\n").await;
        let stats = memcached_stats(&addr).await.unwrap();
        assert_eq!(stats, vec![Stat::new("pid", "7"), Stat::new("uptime", "99")]);
    }

    #[tokio::test]
    async fn test_memcached_flush_over_tcp() {
        let addr = serve_once(b"OK\r\n").await;
        memcached_flush(&addr).await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_info_over_tcp() {
        let addr = serve_once(b"$31\r\n# Server\r\nredis_version:7.2.4\r\n\r\n").await;
        let stats = redis_info(&addr, "").await.unwrap();
        assert_eq!(stats, vec![Stat::new("redis_version", "7.2.4")]);
    }
}
