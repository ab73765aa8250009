//! Local ingress: the named pipe and the Unix-socket endpoint.
//!
//! Both exist so host-local programs can send SMS without speaking AT:
//!
//! - **FIFO** — line protocol `<phone>\t<message>\n`, one send per line.
//!   The reader thread re-opens the pipe every time the writer side closes.
//! - **Socket** — a fixed 256-byte record (`phone[64]`, `message[192]`,
//!   both NUL-terminated) answered with a single native-endian `i32`
//!   status, `0` = accepted. Acceptance means enqueued, not delivered.

use std::fs::File;
use std::io::{BufRead, BufReader};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::gateway::Gateway;

pub const PHONE_LEN: usize = 64;
pub const MESSAGE_LEN: usize = 192;
pub const RECORD_LEN: usize = PHONE_LEN + MESSAGE_LEN;

/// FIFO reader thread body. Posts the shutdown sentinel when the pipe
/// becomes unopenable (e.g. it was removed).
pub fn fifo_loop(path: String, gateway: Gateway) {
    debug!("fifo reader started ({path})");
    loop {
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("fifo {path}: {e}");
                break;
            }
        };
        debug!("fifo opened");

        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let Some((phone, message)) = parse_fifo_line(&line) else {
                continue;
            };
            if let Err(e) = gateway.send_sms(phone, message) {
                warn!("fifo send to {phone} failed: {e}");
            }
        }
        // Writer side closed; reopen and wait for the next one
        debug!("fifo closed");
    }

    info!("fifo reader stopping");
    gateway.shutdown();
}

/// `<phone>\t<message>` — any whitespace separates the phone from the
/// message; leading message whitespace is stripped.
fn parse_fifo_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    let split = line.find(char::is_whitespace)?;
    let phone = &line[..split];
    let message = line[split..].trim();
    if message.is_empty() {
        return None;
    }
    Some((phone, message))
}

/// Unix-socket endpoint task. Each connection carries one fixed-size
/// request and gets one status int back.
pub async fn socket_loop(path: String, gateway: Gateway) {
    // A stale socket file from a previous run would make bind fail
    let _ = std::fs::remove_file(&path);

    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(e) => {
            error!("socket {path}: {e}");
            return;
        }
    };
    info!("socket endpoint listening on {path}");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let gateway = gateway.clone();
                drop(tokio::spawn(handle_request(stream, gateway)));
            }
            Err(e) => {
                warn!("socket accept: {e}");
            }
        }
    }
}

async fn handle_request(mut stream: UnixStream, gateway: Gateway) {
    let mut record = [0u8; RECORD_LEN];
    if let Err(e) = stream.read_exact(&mut record).await {
        debug!("short socket request: {e}");
        return;
    }

    let status: i32 = match parse_record(&record) {
        Some((phone, message)) => match gateway.send_sms(&phone, &message) {
            Ok(()) => 0,
            Err(e) => {
                warn!("socket send to {phone} failed: {e}");
                -1
            }
        },
        None => -2,
    };

    let _ = stream.write_all(&status.to_ne_bytes()).await;
}

/// Decode the fixed request record. The phone must be non-empty.
fn parse_record(record: &[u8; RECORD_LEN]) -> Option<(String, String)> {
    let phone = cstr_field(&record[..PHONE_LEN]);
    let message = cstr_field(&record[PHONE_LEN..]);
    if phone.is_empty() {
        return None;
    }
    Some((phone, message))
}

/// Bytes up to the first NUL, lossily decoded.
fn cstr_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{TxItem, TxReceiver};
    use crate::users::UserDb;
    use std::sync::Arc;

    fn gateway() -> (Gateway, TxReceiver) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Gateway::new(tx, Arc::new(UserDb::new(None))), rx)
    }

    fn record(phone: &str, message: &str) -> [u8; RECORD_LEN] {
        let mut rec = [0u8; RECORD_LEN];
        rec[..phone.len()].copy_from_slice(phone.as_bytes());
        rec[PHONE_LEN..PHONE_LEN + message.len()].copy_from_slice(message.as_bytes());
        rec
    }

    #[test]
    fn test_parse_fifo_line() {
        assert_eq!(
            parse_fifo_line("+46700000002\thi there"),
            Some(("+46700000002", "hi there"))
        );
        assert_eq!(
            parse_fifo_line("+4670 spaced  message"),
            Some(("+4670", "spaced  message"))
        );
        assert_eq!(parse_fifo_line("+4670"), None);
        assert_eq!(parse_fifo_line("+4670\t  "), None);
        assert_eq!(parse_fifo_line(""), None);
    }

    #[test]
    fn test_parse_record() {
        let rec = record("+46700000001", "hello");
        let (phone, message) = parse_record(&rec).unwrap();
        assert_eq!(phone, "+46700000001");
        assert_eq!(message, "hello");
    }

    #[test]
    fn test_parse_record_empty_phone_rejected() {
        let rec = record("", "hello");
        assert!(parse_record(&rec).is_none());
    }

    #[test]
    fn test_parse_record_unterminated_fields() {
        // Fields that fill their buffer completely have no NUL
        let phone = "4".repeat(PHONE_LEN);
        let message = "m".repeat(MESSAGE_LEN);
        let rec = record(&phone, &message);
        let (p, m) = parse_record(&rec).unwrap();
        assert_eq!(p, phone);
        assert_eq!(m, message);
    }

    #[tokio::test]
    async fn test_handle_request_roundtrip() {
        let (gw, mut rx) = gateway();
        let (client, server) = UnixStream::pair().unwrap();
        let task = tokio::spawn(handle_request(server, gw));

        let mut client = client;
        client
            .write_all(&record("+46700000002", "hi there"))
            .await
            .unwrap();
        let mut status = [0u8; 4];
        client.read_exact(&mut status).await.unwrap();
        task.await.unwrap();

        assert_eq!(i32::from_ne_bytes(status), 0);
        match rx.try_recv().unwrap() {
            TxItem::Msg(msg) => {
                assert_eq!(msg.cmd, "+CMGS=\"+46700000002\"");
                assert!(msg.data.unwrap().starts_with("6869207468657265"));
            }
            TxItem::Shutdown => panic!("unexpected sentinel"),
        }
    }

    #[tokio::test]
    async fn test_handle_request_bad_phone_status() {
        let (gw, _rx) = gateway();
        let (client, server) = UnixStream::pair().unwrap();
        let task = tokio::spawn(handle_request(server, gw));

        let mut client = client;
        client.write_all(&record("", "hello")).await.unwrap();
        let mut status = [0u8; 4];
        client.read_exact(&mut status).await.unwrap();
        task.await.unwrap();
        assert_eq!(i32::from_ne_bytes(status), -2);
    }
}
