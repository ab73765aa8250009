//! The outbound send path.
//!
//! A [`Gateway`] is a cloneable handle over the transmit queue — every
//! producer (inbound replies, the FIFO thread, the socket endpoint, the
//! autologout sweeper) goes through it. Recipient resolution mirrors the
//! user table: `*` broadcasts to every user, a leading `+` or digit is a
//! literal phone number, anything else is a user name.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::{AtStatus, TxItem, TxSender, Xmsg};
use crate::gsm;
use crate::users::UserDb;

/// Why a send request was not enqueued.
#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// The recipient is neither a phone number nor a known user name.
    UnknownRecipient(String),
    /// The transmit queue is gone (daemon shutting down).
    QueueClosed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::UnknownRecipient(to) => write!(f, "unknown recipient {to:?}"),
            SendError::QueueClosed => write!(f, "transmit queue closed"),
        }
    }
}

/// Cloneable producer handle for the modem channel.
#[derive(Clone)]
pub struct Gateway {
    tx: TxSender,
    users: Arc<UserDb>,
}

impl Gateway {
    pub fn new(tx: TxSender, users: Arc<UserDb>) -> Self {
        Self { tx, users }
    }

    /// Send `msg` to a phone number, a user name, or `*` for every user
    /// (each at their logged-in phone if any, home phone otherwise).
    pub fn send_sms(&self, to: &str, msg: &str) -> Result<(), SendError> {
        if to == "*" {
            for phone in self.users.broadcast_targets() {
                self.send_to_phone(&phone, msg)?;
            }
            return Ok(());
        }

        if to.starts_with('+') || to.starts_with(|c: char| c.is_ascii_digit()) {
            return self.send_to_phone(to, msg);
        }

        match self.users.phone_for_name(to) {
            Some(phone) => self.send_to_phone(&phone, msg),
            None => Err(SendError::UnknownRecipient(to.to_string())),
        }
    }

    fn send_to_phone(&self, phone: &str, msg: &str) -> Result<(), SendError> {
        debug!("send_sms: phone={phone} msg={msg:?}");
        let payload = gsm::truncate_payload(gsm::latin1_to_gsm(msg));
        let to = phone.to_string();
        let msg = Xmsg::command(format!("+CMGS=\"{phone}\""))
            .with_data(payload)
            .with_ack(move |status| {
                if status == AtStatus::Error {
                    warn!("modem rejected SMS to {to}");
                }
            });
        self.enqueue(msg)
    }

    /// Enqueue `+CMGR=<index>` to fetch a stored message.
    pub fn read_stored(&self, index: u32) -> Result<(), SendError> {
        self.enqueue(Xmsg::command(format!("+CMGR={index}")))
    }

    /// Enqueue `+CMGL="<kind>"` to list stored messages (`ALL` at startup).
    pub fn list_stored(&self, kind: &str) -> Result<(), SendError> {
        self.enqueue(Xmsg::command(format!("+CMGL=\"{kind}\"")))
    }

    /// Enqueue `+CMGD=1,2` — delete all read messages.
    pub fn delete_read(&self) -> Result<(), SendError> {
        self.enqueue(Xmsg::command("+CMGD=1,2"))
    }

    /// Enqueue `+CSCS="<charset>"`.
    pub fn select_charset(&self, charset: &str) -> Result<(), SendError> {
        self.enqueue(Xmsg::command(format!("+CSCS=\"{charset}\"")))
    }

    /// Enqueue `+CPIN=<pin>`.
    pub fn send_pin(&self, pin: &str) -> Result<(), SendError> {
        self.enqueue(Xmsg::command(format!("+CPIN={pin}")))
    }

    /// Post the shutdown sentinel; the transmitter exits after its current
    /// message.
    pub fn shutdown(&self) {
        let _ = self.tx.send(TxItem::Shutdown);
    }

    fn enqueue(&self, msg: Xmsg) -> Result<(), SendError> {
        self.tx
            .send(TxItem::Msg(msg))
            .map_err(|_| SendError::QueueClosed)
    }
}
