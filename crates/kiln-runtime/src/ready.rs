//! Dev-server readiness detection for host processes.
//!
//! A server is considered ready once its output names a local port and a
//! TCP connection to that port succeeds.

use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Common dev-server banners, most specific first.
const PORT_PATTERNS: &[&str] = &[
    r"Local:\s+https?://[^\s/:]+:(\d+)",
    r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d+)",
    r"ready - started server on [^\s]*:(\d+)",
    r"(?i)server (?:running|listening) on port (\d+)",
];

fn port_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        PORT_PATTERNS
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect()
    })
}

fn strip_ansi(line: &str) -> Cow<'_, str> {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    match ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").ok()) {
        Some(regex) => regex.replace_all(line, ""),
        None => Cow::Borrowed(line),
    }
}

/// Extract a listening port from one line of server output.
///
/// Terminal color codes are stripped first; Vite prints the port in bold.
pub fn extract_port(line: &str) -> Option<u16> {
    let plain = strip_ansi(line);
    port_patterns().iter().find_map(|regex| {
        regex
            .captures(&plain)
            .and_then(|captures| captures.get(1))
            .and_then(|port| port.as_str().parse::<u16>().ok())
            .filter(|port| *port != 0)
    })
}

/// Accumulates output chunks and yields complete lines.
///
/// Bytes are buffered until a newline arrives, so a character split across
/// two chunks is decoded whole.
#[derive(Debug, Default)]
pub struct LineScanner {
    partial: Vec<u8>,
}

impl LineScanner {
    /// Feed a chunk, returning every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            lines.push(
                String::from_utf8_lossy(&line)
                    .trim_end_matches(['\n', '\r'])
                    .to_string(),
            );
        }
        lines
    }

    /// Flush whatever is left without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            let rest = std::mem::take(&mut self.partial);
            Some(String::from_utf8_lossy(&rest).into_owned())
        }
    }
}

/// Poll `host:port` until it accepts a connection.
///
/// Returns `false` if `budget` elapses or `cancel` fires first.
pub async fn probe_port(
    host: &str,
    port: u16,
    interval: Duration,
    budget: Duration,
    cancel: &CancellationToken,
) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        let attempt = timeout(interval, TcpStream::connect((host, port)));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            result = attempt => {
                if let Ok(Ok(_)) = result {
                    return true;
                }
            }
        }
        if Instant::now() >= deadline {
            tracing::debug!(port, "Port probe budget exhausted");
            return false;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_vite_banner() {
        assert_eq!(
            extract_port("  ➜  Local:   http://localhost:5173/"),
            Some(5173)
        );
        assert_eq!(
            extract_port("  \x1b[32m➜\x1b[39m  \x1b[1mLocal\x1b[22m:   \x1b[36mhttp://localhost:\x1b[1m3000\x1b[22m/\x1b[39m"),
            Some(3000)
        );
    }

    #[test]
    fn test_extract_other_banners() {
        assert_eq!(extract_port("Express server running on port 8476"), Some(8476));
        assert_eq!(
            extract_port("ready - started server on 0.0.0.0:3000, url: http://localhost:3000"),
            Some(3000)
        );
        assert_eq!(extract_port("listening at http://127.0.0.1:8080"), Some(8080));
    }

    #[test]
    fn test_extract_no_port() {
        assert_eq!(extract_port("added 120 packages in 3s"), None);
        assert_eq!(extract_port("http://localhost:0"), None);
        assert_eq!(extract_port("http://localhost:99999"), None);
    }

    #[test]
    fn test_line_scanner_carries_partial() {
        let mut scanner = LineScanner::default();
        assert!(scanner.push(b"hel").is_empty());
        assert_eq!(scanner.push(b"lo\nwor"), vec!["hello"]);
        assert_eq!(scanner.push(b"ld\r\n\n"), vec!["world", ""]);
        assert_eq!(scanner.finish(), None);
        scanner.push(b"tail");
        assert_eq!(scanner.finish(), Some("tail".to_string()));
    }

    #[test]
    fn test_line_scanner_keeps_split_characters() {
        let banner = "  \u{279c}  Local:   http://localhost:5173/\n".as_bytes();
        // Split inside the three-byte arrow.
        let mut scanner = LineScanner::default();
        assert!(scanner.push(&banner[..3]).is_empty());
        let lines = scanner.push(&banner[3..]);
        assert_eq!(lines, vec!["  \u{279c}  Local:   http://localhost:5173/"]);
        assert_eq!(extract_port(&lines[0]), Some(5173));
    }

    #[test]
    fn test_line_scanner_finish_yields_unterminated_banner() {
        let mut scanner = LineScanner::default();
        assert!(scanner.push(b"  Local:   http://localhost:4173/").is_empty());
        let rest = scanner.finish().unwrap();
        assert_eq!(extract_port(&rest), Some(4173));
    }

    #[tokio::test]
    async fn test_probe_open_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let ok = probe_port(
            "127.0.0.1",
            port,
            Duration::from_millis(50),
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_probe_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ok = probe_port(
            "127.0.0.1",
            1,
            Duration::from_millis(10),
            Duration::from_secs(5),
            &cancel,
        )
        .await;
        assert!(!ok);
    }
}
