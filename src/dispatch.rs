//! Inbound message execution.
//!
//! Every decoded SMS runs through [`Dispatcher::run_message`]: derive a
//! credential for the sender, tokenize the first line, honor a leading
//! `[password]` silent-login token, then try the built-in verbs and the
//! external command table. Unknown senders get no reply at all; known ones
//! get `What?` with their message echoed back.
//!
//! All replies leave through the gateway and re-enter the transmit pipeline
//! asynchronously — nothing here ever waits on the modem.

use std::sync::Arc;

use tracing::{info, warn};

use crate::argv;
use crate::commands::CommandTable;
use crate::gateway::Gateway;
use crate::users::{Credential, Level, UserDb};

/// Routes inbound messages to built-ins and external commands.
pub struct Dispatcher {
    users: Arc<UserDb>,
    commands: Arc<CommandTable>,
    gateway: Gateway,
}

impl Dispatcher {
    pub fn new(users: Arc<UserDb>, commands: Arc<CommandTable>, gateway: Gateway) -> Self {
        Self {
            users,
            commands,
            gateway,
        }
    }

    /// Execute one inbound SMS and send the reply, if any.
    pub fn run_message(&self, text: &str, phone: &str, date: &str) {
        let mut cred = self.users.credentials(phone);
        let (first_line, body) = split_message(text);

        info!(
            "inbound: date={date} phone={} user={} level={:?}: {first_line}",
            cred.phone,
            cred.name.as_deref().unwrap_or("<unknown>"),
            cred.level
        );

        let mut words = argv::split(first_line);
        if words.is_empty() {
            return;
        }

        let reply = self.execute(&mut cred, &mut words, text, body, date);
        // Senders still unidentified after execution never get a reply —
        // an unknown phone cannot probe the gateway. A successful Login has
        // already upgraded the credential by this point.
        if !reply.is_empty() && cred.level >= Level::Known {
            if let Err(e) = self.gateway.send_sms(&cred.phone, &reply) {
                warn!("dropping reply to {}: {e}", cred.phone);
            }
        }
    }

    fn execute(
        &self,
        cred: &mut Credential,
        words: &mut Vec<String>,
        original: &str,
        body: &str,
        date: &str,
    ) -> String {
        // A leading [password] token is a silent login for the sender's
        // already-known identity; the verb follows it.
        let has_password_token = cred.name.is_some()
            && words.first().is_some_and(|t| {
                t.len() > 2 && t.starts_with('[') && t.ends_with(']')
            });
        if has_password_token {
            let token = words.remove(0);
            let password = &token[1..token.len() - 1];
            if !self.users.login(cred, None, password) {
                return "Invalid password".to_string();
            }
        }

        let Some(verb) = words.first().cloned() else {
            return self.unknown_verb(cred, original);
        };

        if verb.eq_ignore_ascii_case("Help") {
            let mut out = String::from("Help,Whoami,Login");
            if cred.level >= Level::Known {
                out.push_str(",LoadAvg,Users");
            }
            if cred.level >= Level::LoggedIn {
                out.push_str(",Logout");
            }
            out.push_str(&self.commands.list(cred));
            return out;
        }

        if verb.eq_ignore_ascii_case("Whoami") {
            let mut out = cred.phone.clone();
            if cred.level >= Level::Known {
                if let Some(name) = &cred.name {
                    out.push(' ');
                    if cred.level < Level::LoggedIn {
                        out.push('(');
                    }
                    out.push_str(name);
                    if cred.level < Level::LoggedIn {
                        out.push(')');
                    }
                }
            }
            return out;
        }

        if verb.eq_ignore_ascii_case("Login") {
            let ok = match (words.get(1).cloned(), words.get(2).cloned()) {
                (Some(name), Some(password)) => {
                    self.users.login(cred, Some(name.as_str()), password.as_str())
                }
                _ => false,
            };
            return if ok {
                "Login OK".to_string()
            } else if cred.name.is_some() {
                // Denials are only voiced to senders we can identify
                "Login denied!".to_string()
            } else {
                String::new()
            };
        }

        if cred.level >= Level::LoggedIn && verb.eq_ignore_ascii_case("Logout") {
            return if self.users.logout(cred) {
                "Logout OK".to_string()
            } else if cred.name.is_some() {
                "Logout denied!".to_string()
            } else {
                String::new()
            };
        }

        if cred.level >= Level::Known && verb.eq_ignore_ascii_case("LoadAvg") {
            return load_averages();
        }

        if cred.level >= Level::Known && verb.eq_ignore_ascii_case("Users") {
            let mut out = String::new();
            for (name, phone) in self.users.logged_in() {
                out.push_str(&name);
                out.push(' ');
                out.push_str(&phone);
                out.push('\n');
            }
            return out;
        }

        if cred.level >= Level::Known {
            if let Some(out) = self.commands.run(cred, words, date, body) {
                return out;
            }
        }

        self.unknown_verb(cred, original)
    }

    fn unknown_verb(&self, cred: &Credential, original: &str) -> String {
        if cred.level >= Level::Known {
            format!("What?\r({original})")
        } else {
            String::new()
        }
    }
}

/// Split an SMS into its first line (the command) and the remainder (the
/// body handed to external commands on stdin).
fn split_message(text: &str) -> (&str, &str) {
    let end = text.find(['\r', '\n']).unwrap_or(text.len());
    (&text[..end], text[end..].trim_start())
}

/// Host load averages as `1min/5min/15min`.
fn load_averages() -> String {
    let mut lav = [0f64; 3];
    // SAFETY: lav is a valid buffer for three samples
    let rc = unsafe { libc::getloadavg(lav.as_mut_ptr(), 3) };
    if rc < 0 {
        "No load averages".to_string()
    } else {
        format!("{:.2}/{:.2}/{:.2}", lav[0], lav[1], lav[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{TxItem, TxReceiver};
    use crate::gsm;
    use std::io::Write;

    const AUTH: &str = "\
alice +46700000001 s3cret Help|LoadAvg|echo
bob   +46700000002 hunter2 *
";

    const COMMANDS: &str = "echo 0 nobody /bin/echo hello %1\n";

    fn write_tmp(tag: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "smsgwd-disp-{tag}-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn dispatcher() -> (Dispatcher, TxReceiver) {
        let users_path = write_tmp("users", AUTH);
        let users = Arc::new(UserDb::new(None));
        users.load(users_path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&users_path).ok();

        let commands_path = write_tmp("cmds", COMMANDS);
        let commands = Arc::new(CommandTable::new());
        commands.load(commands_path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&commands_path).ok();

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let gateway = Gateway::new(tx, Arc::clone(&users));
        (Dispatcher::new(users, commands, gateway), rx)
    }

    /// Decode the reply SMS sitting in the transmit queue.
    fn reply(rx: &mut TxReceiver) -> (String, String) {
        match rx.try_recv().expect("expected a reply") {
            TxItem::Msg(msg) => {
                let phone = msg
                    .cmd
                    .strip_prefix("+CMGS=\"")
                    .and_then(|s| s.strip_suffix('"'))
                    .unwrap()
                    .to_string();
                (phone, gsm::gsm_to_latin1(&msg.data.unwrap()))
            }
            TxItem::Shutdown => panic!("unexpected shutdown sentinel"),
        }
    }

    #[test]
    fn test_whoami_known_phone() {
        let (d, mut rx) = dispatcher();
        d.run_message("Whoami", "+46700000001", "now");
        let (phone, text) = reply(&mut rx);
        assert_eq!(phone, "+46700000001");
        assert_eq!(text, "+46700000001 (alice)");
    }

    #[test]
    fn test_whoami_unknown_phone_is_silent() {
        let (d, mut rx) = dispatcher();
        d.run_message("Whoami", "+46700009999", "now");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_whoami_logged_in_drops_parens() {
        let (d, mut rx) = dispatcher();
        d.run_message("Login alice s3cret", "+46700555555", "now");
        assert_eq!(reply(&mut rx).1, "Login OK");
        d.run_message("Whoami", "+46700555555", "now");
        assert_eq!(reply(&mut rx).1, "+46700555555 alice");
    }

    #[test]
    fn test_password_token_logout() {
        let (d, mut rx) = dispatcher();
        d.run_message("Login alice s3cret", "+46700000001", "now");
        assert_eq!(reply(&mut rx).1, "Login OK");
        d.run_message("[s3cret] Logout", "+46700000001", "now");
        assert_eq!(reply(&mut rx).1, "Logout OK");
    }

    #[test]
    fn test_password_token_wrong() {
        let (d, mut rx) = dispatcher();
        d.run_message("[nope] Whoami", "+46700000001", "now");
        assert_eq!(reply(&mut rx).1, "Invalid password");
    }

    #[test]
    fn test_login_denied_only_when_identified() {
        let (d, mut rx) = dispatcher();
        d.run_message("Login alice wrong", "+46700000001", "now");
        assert_eq!(reply(&mut rx).1, "Login denied!");

        d.run_message("Login alice wrong", "+46700009999", "now");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_logout_without_session_falls_through() {
        let (d, mut rx) = dispatcher();
        // Level 1: Logout is not admissible, so it reads as an unknown verb
        d.run_message("Logout", "+46700000001", "now");
        assert_eq!(reply(&mut rx).1, "What?\r(Logout)");
    }

    #[test]
    fn test_help_lists_by_level() {
        let (d, mut rx) = dispatcher();
        d.run_message("Help", "+46700000001", "now");
        assert_eq!(reply(&mut rx).1, "Help,Whoami,Login,LoadAvg,Users,echo");

        d.run_message("Login bob hunter2", "+46700000002", "now");
        assert_eq!(reply(&mut rx).1, "Login OK");
        d.run_message("Help", "+46700000002", "now");
        assert_eq!(reply(&mut rx).1, "Help,Whoami,Login,LoadAvg,Users,Logout,echo");
    }

    #[test]
    fn test_help_from_unknown_phone_is_silent() {
        let (d, mut rx) = dispatcher();
        d.run_message("Help", "+46700009999", "now");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_login_from_unknown_phone_replies_on_success() {
        let (d, mut rx) = dispatcher();
        d.run_message("Login alice s3cret", "+46700009999", "now");
        assert_eq!(reply(&mut rx).1, "Login OK");
    }

    #[test]
    fn test_arbitrary_text_from_unknown_phone_is_silent() {
        let (d, mut rx) = dispatcher();
        d.run_message("make me a sandwich", "+46700009999", "now");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_external_command_reply() {
        let (d, mut rx) = dispatcher();
        d.run_message("echo world", "+46700000001", "now");
        assert_eq!(reply(&mut rx).1, "hello world\n");
    }

    #[test]
    fn test_unknown_verb_echoes_message() {
        let (d, mut rx) = dispatcher();
        d.run_message("frobnicate the widget", "+46700000001", "now");
        assert_eq!(reply(&mut rx).1, "What?\r(frobnicate the widget)");
    }

    #[test]
    fn test_users_lists_sessions() {
        let (d, mut rx) = dispatcher();
        d.run_message("Login bob hunter2", "+46700555555", "now");
        assert_eq!(reply(&mut rx).1, "Login OK");
        d.run_message("Users", "+46700000001", "now");
        assert_eq!(reply(&mut rx).1, "bob +46700555555\n");
    }

    #[test]
    fn test_loadavg_formats_three_samples() {
        let (d, mut rx) = dispatcher();
        d.run_message("LoadAvg", "+46700000001", "now");
        let (_, text) = reply(&mut rx);
        if text != "No load averages" {
            let parts: Vec<&str> = text.split('/').collect();
            assert_eq!(parts.len(), 3);
            for part in parts {
                part.parse::<f64>().unwrap();
            }
        }
    }

    #[test]
    fn test_empty_message_is_ignored() {
        let (d, mut rx) = dispatcher();
        d.run_message("", "+46700000001", "now");
        d.run_message("   ", "+46700000001", "now");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_body_reaches_external_stdin() {
        let users_path = write_tmp("users2", AUTH);
        let users = Arc::new(UserDb::new(None));
        users.load(users_path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&users_path).ok();

        let commands_path = write_tmp("cmds2", "cat * nobody /bin/sh -c cat\n");
        let commands = Arc::new(CommandTable::new());
        commands.load(commands_path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&commands_path).ok();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let gateway = Gateway::new(tx, Arc::clone(&users));
        let d = Dispatcher::new(users, commands, gateway);

        d.run_message("cat\nbody line", "+46700000002", "now");
        assert_eq!(reply(&mut rx).1, "body line");
    }
}
