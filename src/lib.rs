#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

//! smsgwd library — the building blocks of the SMS gateway daemon:
//!
//! - `serial` — raw termios access to the modem with a wakeable reader
//! - `channel` — transmit queue, response slot, and the two I/O threads
//! - `gsm` — GSM 03.38 ⇔ Latin-1 hex conversion
//! - `gateway` — the outbound send path and AT enqueue helpers
//! - `users` — auth table, per-phone credentials, autologout
//! - `commands` — external command table and privileged execution
//! - `dispatch` — inbound message execution (built-ins + externals)
//! - `argv` — shell-like word splitting with `%`-escape expansion
//! - `ingress` — local FIFO and Unix-socket send endpoints
//! - `config` — configuration loading

pub mod argv;
pub mod channel;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod gsm;
pub mod ingress;
pub mod serial;
pub mod users;

// Re-export key types at crate root for convenience.
pub use channel::{AtStatus, PromptGate, ResponseSlot, TxItem, Xmsg};
pub use commands::CommandTable;
pub use config::Config;
pub use dispatch::Dispatcher;
pub use gateway::Gateway;
pub use users::{Credential, Level, UserDb};
