//! HTTP request head parsing for tunnel requests

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::server::ForwardProxyError;

/// Largest request head accepted before a tunnel is refused
pub const MAX_REQUEST_HEAD: usize = 8192;

const MAX_HEADERS: usize = 64;

/// The parts of a request head the proxy acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub method: String,
    /// Request target; `host:port` for `CONNECT`
    pub target: String,
    /// Length of the head including the blank line
    pub head_len: usize,
}

impl ConnectRequest {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Parse a request head, `None` while it is incomplete
    pub fn parse(data: &[u8]) -> Result<Option<Self>, ForwardProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(data) {
            Ok(httparse::Status::Complete(head_len)) => Ok(Some(Self {
                method: req.method.unwrap_or_default().to_string(),
                target: req.path.unwrap_or_default().to_string(),
                head_len,
            })),
            Ok(httparse::Status::Partial) => Ok(None),
            Err(e) => Err(ForwardProxyError::InvalidRequest(format!(
                "Invalid HTTP request: {}",
                e
            ))),
        }
    }

    /// Read from `reader` until a full request head is buffered
    ///
    /// Bytes following the head stay in `buf` after `head_len`.
    pub async fn read<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Self, ForwardProxyError>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(request) = Self::parse(buf)? {
                return Ok(request);
            }
            if buf.len() >= MAX_REQUEST_HEAD {
                return Err(ForwardProxyError::InvalidRequest(format!(
                    "Request head exceeds {} bytes",
                    MAX_REQUEST_HEAD
                )));
            }

            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(ForwardProxyError::InvalidRequest(
                    "Connection closed before request head was complete".to_string(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Minimal response head with no body
pub(crate) fn response_head(status: u16, reason: &str, extra: &[(&str, &str)]) -> String {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in extra {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        let data = b"CONNECT 70726f64.clusterA:443 HTTP/1.1\r\nHost: 70726f64.clusterA:443\r\n\r\nextra";
        let request = ConnectRequest::parse(data).unwrap().unwrap();

        assert!(request.is_connect());
        assert_eq!(request.target, "70726f64.clusterA:443");
        assert_eq!(&data[request.head_len..], b"extra");
    }

    #[test]
    fn test_parse_partial_and_invalid() {
        assert!(ConnectRequest::parse(b"CONNECT host:443 HTTP/1.1\r\nHost:")
            .unwrap()
            .is_none());
        assert!(ConnectRequest::parse(b"\x00\x01 nonsense\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_read_across_chunks() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
            client.write_all(b"Host: example.com\r\n\r\n").await.unwrap();
        });

        let mut buf = Vec::new();
        let request = ConnectRequest::read(&mut server, &mut buf).await.unwrap();
        assert!(!request.is_connect());
        assert_eq!(request.method, "GET");
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_head() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = client.write_all(b"CONNECT host:443 HTTP/1.1\r\n").await;
            let filler = format!("X-Filler: {}\r\n", "a".repeat(100));
            for _ in 0..200 {
                if client.write_all(filler.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut buf = Vec::new();
        let err = ConnectRequest::read(&mut server, &mut buf).await.unwrap_err();
        assert!(matches!(err, ForwardProxyError::InvalidRequest(_)));
    }

    #[test]
    fn test_response_head() {
        assert_eq!(
            response_head(405, "Method Not Allowed", &[("Allow", "CONNECT")]),
            "HTTP/1.1 405 Method Not Allowed\r\nAllow: CONNECT\r\n\r\n"
        );
    }
}
