use crate::snapshot::Snapshot;

#[cfg(feature = "collector-http")]
use std::time::Duration;

const DETAIL_LIMIT: usize = 200;

/// Result of one submission attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub delivered: bool,
    pub detail: String,
}

impl SubmitOutcome {
    pub fn delivered(detail: impl Into<String>) -> Self {
        Self {
            delivered: true,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            delivered: false,
            detail: detail.into(),
        }
    }
}

/// Remote collector endpoint.
///
/// Transport errors, non-success statuses and missing configuration are all
/// reported as `delivered = false`; submission never panics or returns an
/// error the caller has to unwrap.
pub trait Collector: Send {
    fn name(&self) -> &str;

    fn submit(&mut self, snapshot: &Snapshot) -> SubmitOutcome;
}

/// JSON-over-HTTP collector with an optional API key header.
#[cfg(feature = "collector-http")]
pub struct HttpCollector {
    endpoint: Option<String>,
    api_key: Option<String>,
    agent: ureq::Agent,
}

#[cfg(feature = "collector-http")]
impl HttpCollector {
    pub fn new(endpoint: Option<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            endpoint: endpoint.filter(|url| !url.trim().is_empty()),
            api_key: api_key.filter(|key| !key.is_empty()),
            agent,
        }
    }
}

#[cfg(feature = "collector-http")]
impl Collector for HttpCollector {
    fn name(&self) -> &str {
        self.endpoint.as_deref().unwrap_or("unconfigured")
    }

    fn submit(&mut self, snapshot: &Snapshot) -> SubmitOutcome {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return SubmitOutcome::failed("no collector endpoint configured");
        };
        let body = match snapshot.to_json() {
            Ok(body) => body,
            Err(e) => return SubmitOutcome::failed(format!("{:#}", e)),
        };

        let mut request = self
            .agent
            .post(endpoint)
            .set("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.set("X-API-Key", key);
        }

        match request.send_string(&body) {
            Ok(response) => {
                let status = response.status();
                if (200..300).contains(&status) {
                    SubmitOutcome::delivered(status.to_string())
                } else {
                    let text = response.into_string().unwrap_or_default();
                    SubmitOutcome::failed(format!("{} {}", status, truncate(&text)))
                }
            }
            Err(ureq::Error::Status(status, response)) => {
                let text = response.into_string().unwrap_or_default();
                SubmitOutcome::failed(format!("{} {}", status, truncate(&text)))
            }
            Err(other) => SubmitOutcome::failed(other.to_string()),
        }
    }
}

#[cfg_attr(not(feature = "collector-http"), allow(dead_code))]
fn truncate(text: &str) -> &str {
    match text.char_indices().nth(DETAIL_LIMIT) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(300);
        assert_eq!(truncate(&long).chars().count(), DETAIL_LIMIT);
        assert_eq!(truncate("short"), "short");
    }

    #[cfg(feature = "collector-http")]
    #[test]
    fn missing_endpoint_is_a_failed_delivery() {
        use crate::congestion::CongestionLevel;

        let mut collector = HttpCollector::new(Some("  ".into()), None, Duration::from_secs(1));
        let snapshot = Snapshot {
            id: 1,
            kind: "congestion".into(),
            emitted_at: 60,
            avg_count_short_window: 0.0,
            avg_count_long_window: 0.0,
            unique_count_long_window: 0,
            congestion_level: CongestionLevel::Low,
            device_id: "cam".into(),
            lat: 0.0,
            lng: 0.0,
        };
        let outcome = collector.submit(&snapshot);
        assert!(!outcome.delivered);
        assert_eq!(outcome.detail, "no collector endpoint configured");
        assert_eq!(collector.name(), "unconfigured");
    }

    #[cfg(feature = "collector-http")]
    #[test]
    fn posts_json_to_local_collector() {
        use crate::congestion::CongestionLevel;
        use std::io::{BufRead, BufReader, Read, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut headers = Vec::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                let lower = line.to_ascii_lowercase();
                if let Some(value) = lower.strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
                headers.push(lower);
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();
            let mut stream = stream;
            stream
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .unwrap();
            (headers, String::from_utf8(body).unwrap())
        });

        let mut collector = HttpCollector::new(
            Some(format!("http://{}/ingest", addr)),
            Some("secret".into()),
            Duration::from_secs(5),
        );
        let snapshot = Snapshot {
            id: 3,
            kind: "congestion".into(),
            emitted_at: 120,
            avg_count_short_window: 1.5,
            avg_count_long_window: 1.0,
            unique_count_long_window: 4,
            congestion_level: CongestionLevel::Medium,
            device_id: "cam".into(),
            lat: 1.0,
            lng: 2.0,
        };
        let outcome = collector.submit(&snapshot);
        assert!(outcome.delivered, "{}", outcome.detail);
        assert_eq!(outcome.detail, "201");

        let (headers, body) = server.join().unwrap();
        assert!(headers.iter().any(|h| h.starts_with("content-type: application/json")));
        assert!(headers.iter().any(|h| h.starts_with("x-api-key: secret")));
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["congestion_level"], "med");
        assert_eq!(value["id"], 3);
    }
}
