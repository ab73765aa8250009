//! The modem channel: transmit queue, response coordination, and the two
//! serial I/O threads.
//!
//! ## Design
//!
//! - **One request in flight.** Every AT command is an [`Xmsg`] pulled off
//!   the transmit queue by the transmitter thread, which parks it in the
//!   [`ResponseSlot`] before touching the wire. The receiver thread releases
//!   the slot when the modem answers `OK`/`ERROR`. The slot holds at most
//!   one message, so commands hit the modem strictly one at a time, in
//!   queue order.
//! - **Queue.** A tokio unbounded channel: producers (dispatch replies, the
//!   FIFO thread, the socket endpoint) send without blocking from sync or
//!   async context; the single consumer uses `blocking_recv` on its own
//!   thread. [`TxItem::Shutdown`] terminates the consumer cleanly.
//! - **Payload prompt.** For commands with a payload (`+CMGS`), the
//!   transmitter arms the [`PromptGate`], writes the command, and waits —
//!   bounded — for the receiver to see the modem's `>` prompt before
//!   sending the payload and Ctrl-Z.
//!
//! Unsolicited input (`+CMTI`, `+CMGR`, `+CMGL`) is parsed here and handed
//! to the inbound dispatcher; everything else the modem volunteers is
//! ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::gateway::Gateway;
use crate::gsm;
use crate::serial::{SerialEvent, SerialReader, SerialWriter};

/// Result code of a completed AT command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtStatus {
    Ok,
    Error,
}

/// Acknowledgement continuation, invoked once with the final result code.
pub type AckFn = Box<dyn FnOnce(AtStatus) + Send + 'static>;

/// An enqueued AT command: the command tail (written as `AT<cmd>\r`), an
/// optional payload (written after the `>` prompt, terminated by Ctrl-Z),
/// and an optional acknowledgement continuation.
pub struct Xmsg {
    pub cmd: String,
    pub data: Option<String>,
    pub ack: Option<AckFn>,
}

impl Xmsg {
    pub fn command(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            data: None,
            ack: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_ack(mut self, ack: impl FnOnce(AtStatus) + Send + 'static) -> Self {
        self.ack = Some(Box::new(ack));
        self
    }
}

impl std::fmt::Debug for Xmsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Xmsg")
            .field("cmd", &self.cmd)
            .field("data", &self.data)
            .field("ack", &self.ack.is_some())
            .finish()
    }
}

/// Transmit queue element.
pub enum TxItem {
    Msg(Xmsg),
    /// Sentinel: the transmitter finishes its current message and exits.
    Shutdown,
}

pub type TxSender = mpsc::UnboundedSender<TxItem>;
pub type TxReceiver = mpsc::UnboundedReceiver<TxItem>;

/// Channel for reporting fatal modem-channel failures to the main task.
pub type FatalSender = mpsc::UnboundedSender<String>;

struct SlotState {
    current: Option<Xmsg>,
    closed: bool,
}

/// The single in-flight request slot shared by the two I/O threads.
///
/// The transmitter installs each message before writing it; the receiver
/// releases it on `OK`/`ERROR`, running the ack continuation exactly once.
pub struct ResponseSlot {
    state: Mutex<SlotState>,
    cv: Condvar,
}

impl Default for ResponseSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                current: None,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Park `msg` as the in-flight request, blocking while the slot is
    /// occupied. Returns the message back when the slot has been shut down.
    pub fn install(&self, msg: Xmsg) -> Result<(), Xmsg> {
        let mut state = self.state.lock().unwrap();
        while state.current.is_some() && !state.closed {
            state = self.cv.wait(state).unwrap();
        }
        if state.closed {
            return Err(msg);
        }
        state.current = Some(msg);
        drop(state);
        self.cv.notify_all();
        Ok(())
    }

    /// Release the in-flight request with the modem's result code, running
    /// its ack continuation. Blocks until a request is installed (an
    /// acknowledgement can race ahead of `install`). Returns `false` after
    /// shutdown.
    pub fn complete(&self, status: AtStatus) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.current.is_none() && !state.closed {
            state = self.cv.wait(state).unwrap();
        }
        let Some(msg) = state.current.take() else {
            return false;
        };
        drop(state);
        self.cv.notify_all();

        if let Some(ack) = msg.ack {
            ack(status);
        }
        true
    }

    /// Wake and fail both sides; used during shutdown so neither thread is
    /// left parked on the condvar.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.cv.notify_all();
    }

    #[cfg(test)]
    fn is_busy(&self) -> bool {
        self.state.lock().unwrap().current.is_some()
    }
}

/// Latch the receiver sets when the modem emits its `>` payload prompt.
#[derive(Default)]
pub struct PromptGate {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl PromptGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear a stale prompt before writing a payload-carrying command.
    pub fn arm(&self) {
        *self.flag.lock().unwrap() = false;
    }

    /// Record a prompt sighting.
    pub fn signal(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        drop(flag);
        self.cv.notify_all();
    }

    /// Wait up to `timeout` for the prompt. Returns whether it was seen;
    /// the latch is consumed either way.
    pub fn wait(&self, timeout: Duration) -> bool {
        let flag = self.flag.lock().unwrap();
        let (mut flag, _) = self
            .cv
            .wait_timeout_while(flag, timeout, |seen| !*seen)
            .unwrap();
        std::mem::take(&mut *flag)
    }
}

/// Transmitter thread body: drain the queue one message at a time.
///
/// Exits on the shutdown sentinel, when the queue or slot is closed, or
/// after a serial write failure (reported as fatal).
pub fn transmit_loop(
    mut queue: TxReceiver,
    slot: Arc<ResponseSlot>,
    prompt: Arc<PromptGate>,
    mut writer: SerialWriter,
    prompt_timeout: Duration,
    fatal: FatalSender,
) {
    debug!("transmitter started");
    while let Some(item) = queue.blocking_recv() {
        let TxItem::Msg(msg) = item else {
            break;
        };

        let cmd = msg.cmd.clone();
        let data = msg.data.clone();
        if slot.install(msg).is_err() {
            break;
        }
        debug!("xmit: AT{cmd} (payload: {})", data.is_some());

        let result = (|| -> std::io::Result<()> {
            if let Some(payload) = data {
                prompt.arm();
                writer.write_all(format!("AT{cmd}\r").as_bytes())?;
                writer.flush()?;
                if !prompt.wait(prompt_timeout) {
                    debug!("no payload prompt within {prompt_timeout:?}, sending anyway");
                }
                writer.write_all(payload.as_bytes())?;
                writer.write_all(&[0x1A])?;
                writer.flush()?;
            } else {
                writer.write_all(format!("AT{cmd}\r").as_bytes())?;
                writer.flush()?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fatal.send(format!("serial write failed: {e}"));
            break;
        }
    }
    debug!("transmitter stopped");
}

/// Receiver thread body: parse modem output line by line.
///
/// `on_message` is invoked synchronously for every inbound SMS with
/// `(decoded_text, phone, date)`; replies it enqueues re-enter the transmit
/// pipeline asynchronously.
pub fn receive_loop(
    mut reader: SerialReader,
    slot: Arc<ResponseSlot>,
    prompt: Arc<PromptGate>,
    gateway: Gateway,
    abort: Arc<AtomicBool>,
    fatal: FatalSender,
    mut on_message: impl FnMut(&str, &str, &str),
) {
    debug!("receiver started");
    let mut delete_read_pending = false;

    loop {
        if abort.load(Ordering::SeqCst) {
            break;
        }
        let line = match reader.next_event() {
            Ok(SerialEvent::Line(line)) => line,
            Ok(SerialEvent::Prompt) => {
                prompt.signal();
                continue;
            }
            Ok(SerialEvent::Wake) => continue,
            Err(e) => {
                if !abort.load(Ordering::SeqCst) {
                    let _ = fatal.send(format!("serial read failed: {e}"));
                }
                break;
            }
        };
        if line.is_empty() {
            continue;
        }

        if let Some(index) = parse_cmti(&line) {
            info!("new stored SMS at index {index}");
            let _ = gateway.read_stored(index);
        } else if let Some((index, status, phone, date)) = parse_cmgl(&line) {
            debug!("stored SMS #{index} from {phone} at {date} ({status})");
            if let Some(payload) = read_payload(&mut reader, &abort) {
                let text = gsm::gsm_to_latin1(&payload);
                on_message(&text, &phone, &date);
                delete_read_pending = true;
            }
        } else if let Some((status, phone, date)) = parse_cmgr(&line) {
            debug!("SMS from {phone} at {date} ({status})");
            if let Some(payload) = read_payload(&mut reader, &abort) {
                let text = gsm::gsm_to_latin1(&payload);
                on_message(&text, &phone, &date);
                delete_read_pending = true;
            }
        } else if line == "OK" || line == "ERROR" {
            let status = if line == "OK" {
                AtStatus::Ok
            } else {
                AtStatus::Error
            };
            if delete_read_pending {
                debug!("deleting read messages");
                let _ = gateway.delete_read();
                delete_read_pending = false;
            }
            if !slot.complete(status) {
                break;
            }
        } else {
            debug!("ignoring modem line: {line}");
        }
    }
    debug!("receiver stopped");
}

/// The payload is the next line after a `+CMGR`/`+CMGL` header, empty or
/// not. `None` when the channel goes away first.
fn read_payload(reader: &mut SerialReader, abort: &AtomicBool) -> Option<String> {
    loop {
        if abort.load(Ordering::SeqCst) {
            return None;
        }
        match reader.next_event() {
            Ok(SerialEvent::Line(line)) => return Some(line),
            Ok(SerialEvent::Prompt) => continue,
            Ok(SerialEvent::Wake) => continue,
            Err(e) => {
                warn!("serial read failed while expecting SMS payload: {e}");
                return None;
            }
        }
    }
}

/// `+CMTI: "SM",<index>` — a new message was stored.
fn parse_cmti(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("+CMTI: \"SM\",")?;
    rest.trim().parse().ok()
}

/// `+CMGR: "<status>","<phone>",,"<date>"`.
fn parse_cmgr(line: &str) -> Option<(String, String, String)> {
    let rest = line.strip_prefix("+CMGR: ")?;
    let fields = split_quoted_fields(rest);
    if fields.len() < 4 || !fields[2].is_empty() {
        return None;
    }
    Some((fields[0].clone(), fields[1].clone(), fields[3].clone()))
}

/// `+CMGL: <index>,"<status>","<phone>",,"<date>"`.
fn parse_cmgl(line: &str) -> Option<(u32, String, String, String)> {
    let rest = line.strip_prefix("+CMGL: ")?;
    let fields = split_quoted_fields(rest);
    if fields.len() < 5 || !fields[3].is_empty() {
        return None;
    }
    let index = fields[0].trim().parse().ok()?;
    Some((
        index,
        fields[1].clone(),
        fields[2].clone(),
        fields[4].clone(),
    ))
}

/// Split a comma-separated AT parameter list, respecting double quotes
/// (which are stripped).
fn split_quoted_fields(input: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in input.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cmti() {
        assert_eq!(parse_cmti("+CMTI: \"SM\",4"), Some(4));
        assert_eq!(parse_cmti("+CMTI: \"ME\",4"), None);
        assert_eq!(parse_cmti("+CMT: whatever"), None);
    }

    #[test]
    fn test_parse_cmgr() {
        let (status, phone, date) =
            parse_cmgr("+CMGR: \"REC UNREAD\",\"+46700000001\",,\"24/02/06,13:37:00+04\"")
                .unwrap();
        assert_eq!(status, "REC UNREAD");
        assert_eq!(phone, "+46700000001");
        assert_eq!(date, "24/02/06,13:37:00+04");
    }

    #[test]
    fn test_parse_cmgr_rejects_extra_alpha_field() {
        assert!(parse_cmgr("+CMGR: \"REC READ\",\"+4670\",\"Alice\",\"date\"").is_none());
    }

    #[test]
    fn test_parse_cmgl() {
        let (index, status, phone, date) =
            parse_cmgl("+CMGL: 7,\"REC READ\",\"+46700000002\",,\"24/02/06,13:37:00+04\"")
                .unwrap();
        assert_eq!(index, 7);
        assert_eq!(status, "REC READ");
        assert_eq!(phone, "+46700000002");
        assert_eq!(date, "24/02/06,13:37:00+04");
    }

    #[test]
    fn test_parse_cmgl_rejects_malformed() {
        assert!(parse_cmgl("+CMGL: x,\"a\",\"b\",,\"c\"").is_none());
        assert!(parse_cmgl("+CMGL: 1,\"a\",\"b\"").is_none());
    }

    #[test]
    fn test_split_quoted_fields_keeps_commas_in_quotes() {
        let fields = split_quoted_fields("1,\"a,b\",,\"c\"");
        assert_eq!(fields, ["1", "a,b", "", "c"]);
    }

    #[test]
    fn test_slot_install_then_complete() {
        let slot = ResponseSlot::new();
        let acked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&acked);
        slot.install(
            Xmsg::command("+CSCS=\"HEX\"").with_ack(move |status| {
                assert_eq!(status, AtStatus::Ok);
                flag.store(true, Ordering::SeqCst);
            }),
        )
        .unwrap();
        assert!(slot.is_busy());
        assert!(slot.complete(AtStatus::Ok));
        assert!(acked.load(Ordering::SeqCst));
        assert!(!slot.is_busy());
    }

    #[test]
    fn test_slot_blocks_second_install_until_release() {
        let slot = Arc::new(ResponseSlot::new());
        slot.install(Xmsg::command("first")).unwrap();

        let slot2 = Arc::clone(&slot);
        let second = std::thread::spawn(move || {
            slot2.install(Xmsg::command("second")).unwrap();
        });

        // The second install must still be parked
        std::thread::sleep(Duration::from_millis(50));
        assert!(!second.is_finished());

        assert!(slot.complete(AtStatus::Error));
        second.join().unwrap();
        assert!(slot.is_busy());
        assert!(slot.complete(AtStatus::Ok));
    }

    #[test]
    fn test_slot_shutdown_unblocks_both_sides() {
        let slot = Arc::new(ResponseSlot::new());

        let waiter = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || slot.complete(AtStatus::Ok))
        };
        std::thread::sleep(Duration::from_millis(20));
        slot.shutdown();
        assert!(!waiter.join().unwrap());
        assert!(slot.install(Xmsg::command("late")).is_err());
    }

    #[test]
    fn test_prompt_gate_signal_and_timeout() {
        let gate = Arc::new(PromptGate::new());
        gate.arm();
        assert!(!gate.wait(Duration::from_millis(20)));

        let gate2 = Arc::clone(&gate);
        let signaller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            gate2.signal();
        });
        assert!(gate.wait(Duration::from_secs(2)));
        signaller.join().unwrap();

        // The latch is consumed
        assert!(!gate.wait(Duration::from_millis(10)));
    }
}
