//! The append-only JSON Lines query log.
//!
//! One line per query, written after the response is sent. The log is safe
//! for concurrent use; writes append to the configured path and never touch
//! the query's latency budget (callers await the write after responding).

use std::path::PathBuf;

use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::Error;

/// How filtering affected a query, for the `ResultCode` field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ResultCode {
    /// Nothing matched.
    NotFiltered = 0,
    /// An exception rule explicitly allowed the query.
    Allowed = 1,
    /// A block rule matched; the response was synthesized.
    Blocked = 2,
    /// The answer was rewritten (safe search, safe browsing).
    Modified = 3,
}

impl Serialize for ResultCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// One query-log line. Field names are part of the on-disk format.
#[derive(Clone, Debug, Serialize)]
pub struct Entry {
    #[serde(rename = "RequestID")]
    pub request_id: String,
    #[serde(rename = "ProfileID")]
    pub profile_id: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "ClientCountry")]
    pub client_country: String,
    #[serde(rename = "ResponseCountry")]
    pub response_country: String,
    #[serde(rename = "DomainFQDN")]
    pub domain_fqdn: String,
    #[serde(rename = "FilterListID")]
    pub filter_list_id: String,
    #[serde(rename = "FilterRule")]
    pub filter_rule: String,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "ClientASN")]
    pub client_asn: u32,
    /// Milliseconds spent handling the query.
    #[serde(rename = "Elapsed")]
    pub elapsed: u64,
    #[serde(rename = "RequestType")]
    pub request_type: String,
    #[serde(rename = "DNSSEC")]
    pub dnssec: u8,
    #[serde(rename = "Protocol")]
    pub protocol: String,
    #[serde(rename = "ResultCode")]
    pub result_code: ResultCode,
    #[serde(rename = "ResponseCode")]
    pub response_code: u16,
}

/// The query log interface. The filesystem implementation is below; an
/// empty one stands in when the log is disabled.
#[async_trait::async_trait]
pub trait QueryLog: Send + Sync {
    async fn write(&self, entry: &Entry) -> Result<(), Error>;
}

/// The file system implementation of the query log.
pub struct FileSystemQueryLog {
    path: PathBuf,
    // One writer at a time keeps lines whole; the file itself is opened in
    // append mode on every write so external rotation works.
    lock: tokio::sync::Mutex<()>,
}

impl FileSystemQueryLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait::async_trait]
impl QueryLog for FileSystemQueryLog {
    async fn write(&self, entry: &Entry) -> Result<(), Error> {
        let mut line = serde_json::to_vec(entry)
            .map_err(|err| Error::Internal(format!("encoding query log entry: {err}")))?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        f.write_all(&line).await?;

        Ok(())
    }
}

/// Discards every entry; used when `query_log.enabled` is false.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyQueryLog;

#[async_trait::async_trait]
impl QueryLog for EmptyQueryLog {
    async fn write(&self, _entry: &Entry) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_entry() -> Entry {
        Entry {
            request_id: "9f3d8e2a".to_string(),
            profile_id: "prof1".to_string(),
            device_id: "dev".to_string(),
            client_country: "NL".to_string(),
            response_country: "US".to_string(),
            domain_fqdn: "example.org.".to_string(),
            filter_list_id: String::new(),
            filter_rule: String::new(),
            timestamp: 1_700_000_000_000,
            client_asn: 1221,
            elapsed: 3,
            request_type: "A".to_string(),
            dnssec: 1,
            protocol: "dns-udp".to_string(),
            result_code: ResultCode::NotFiltered,
            response_code: 0,
        }
    }

    #[test]
    fn entry_shape() {
        let text = serde_json::to_string(&test_entry()).unwrap();
        for key in [
            "RequestID",
            "ProfileID",
            "DeviceID",
            "ClientCountry",
            "ResponseCountry",
            "DomainFQDN",
            "Timestamp",
            "ClientASN",
            "Elapsed",
            "RequestType",
            "DNSSEC",
            "Protocol",
            "ResultCode",
            "ResponseCode",
        ] {
            assert!(text.contains(&format!("\"{key}\"")), "missing {key}: {text}");
        }
        assert!(text.contains("\"DNSSEC\":1"), "got: {text}");
    }

    #[tokio::test]
    async fn writes_json_lines() {
        let dir = std::env::temp_dir().join("dnsedge-querylog-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join(format!("log-{}.jsonl", std::process::id()));
        let _ = tokio::fs::remove_file(&path).await;

        let log = FileSystemQueryLog::new(path.clone());
        log.write(&test_entry()).await.unwrap();
        log.write(&test_entry()).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        for line in contents.lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["DomainFQDN"], "example.org.");
        }

        let _ = tokio::fs::remove_file(&path).await;
    }
}
