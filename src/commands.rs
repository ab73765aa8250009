//! External command table and privileged execution.
//!
//! The table file is `name level as_user path argv_template...` per line,
//! `#` comments. `level` is the minimum credential level: decimal, or one
//! of the aliases `*`/`all` (0), `phone` (1), `login` (2); any other word
//! means admin-only (3), which no SMS credential can reach.
//!
//! `ecmd_run` copies the matched definition out under the lock and does all
//! expansion and spawning outside it, so a slow child never blocks reloads
//! or other dispatches.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::argv;
use crate::config::ConfigError;
use crate::users::Credential;

/// uid/gid used when the target account cannot be resolved.
const FALLBACK_ID: u32 = 60001;

/// Keep at most this much of a child's stdout. The SMS reply is truncated
/// to one message later anyway.
const MAX_OUTPUT: usize = 64 * 1024;

/// One line of the commands file.
#[derive(Debug, Clone)]
struct ExternalCommand {
    name: String,
    min_level: u8,
    run_as: String,
    path: String,
    argv_template: String,
}

/// The shared external-command table.
#[derive(Default)]
pub struct CommandTable {
    inner: Mutex<Vec<ExternalCommand>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or reload) the commands file, replacing the whole table. On a
    /// read error the previous table is kept and the error returned.
    pub fn load(&self, path: &str) -> Result<usize, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_string(), e))?;

        let mut table = Vec::new();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let Some(name) = fields.next() else { continue };
            if name.starts_with('#') {
                continue;
            }
            let Some(level) = fields.next() else { continue };
            let Some(run_as) = fields.next() else { continue };
            let Some(cmd_path) = fields.next() else { continue };
            let Some(template) = argv::rest_after(line, 4) else {
                continue;
            };

            table.push(ExternalCommand {
                name: name.to_string(),
                min_level: parse_level(level),
                run_as: run_as.to_string(),
                path: cmd_path.to_string(),
                argv_template: template.to_string(),
            });
        }

        let count = table.len();
        *self.inner.lock().unwrap() = table;
        info!("Loaded {count} external commands from {path}");
        Ok(count)
    }

    /// Comma-prefixed list of commands the credential may run, for `Help`.
    pub fn list(&self, cred: &Credential) -> String {
        let table = self.inner.lock().unwrap();
        let mut out = String::new();
        for def in table.iter() {
            if cred.allows(&def.name) && def.min_level <= cred.level as u8 {
                out.push(',');
                out.push_str(&def.name);
            }
        }
        out
    }

    /// Execute the command named by `words[0]` and return its stdout.
    ///
    /// `None` when there is no such command, the credential fails the
    /// ACL/level gate, or the child could not be spawned — the caller falls
    /// through to its unknown-verb reply. A child that runs but exits
    /// non-zero still yields its (possibly empty) stdout.
    pub fn run(
        &self,
        cred: &Credential,
        words: &[String],
        date: &str,
        body: &str,
    ) -> Option<String> {
        let verb = words.first()?;

        let (run_as, path, template) = {
            let table = self.inner.lock().unwrap();
            let def = table
                .iter()
                .find(|d| d.name.eq_ignore_ascii_case(verb))?;
            if !cred.allows(&def.name) || def.min_level > cred.level as u8 {
                return None;
            }
            (
                def.run_as.clone(),
                def.path.clone(),
                def.argv_template.clone(),
            )
        };

        let cmd_argv = argv::expand(&template, |esc| expand_escape(esc, words, cred, date));
        let (uid, gid) = resolve_account(&run_as, cred);

        debug!("ecmd: spawn {path} as {uid}:{gid}, argv={cmd_argv:?}");
        match spawn_command(&path, &cmd_argv, uid, gid, body) {
            Ok(output) => Some(output),
            Err(e) => {
                warn!("ecmd: {verb} failed: {e}");
                None
            }
        }
    }
}

/// Parse the level column: decimal, alias, or admin-only for anything else.
fn parse_level(token: &str) -> u8 {
    if let Ok(level) = token.parse::<u8>() {
        return level;
    }
    match token {
        "*" | "all" => 0,
        "phone" => 1,
        "login" => 2,
        _ => 3,
    }
}

/// `%`-escape expansion for argv templates.
fn expand_escape(
    name: &str,
    words: &[String],
    cred: &Credential,
    date: &str,
) -> Option<String> {
    match name {
        "P" | "phone" => Some(cred.phone.clone()),
        "D" | "date" => Some(date.to_string()),
        "U" | "user" => cred.name.clone(),
        "*" => argv::join_words(words, 1, None),
        _ => expand_word_range(name, words),
    }
}

/// `%N`, `%N-M`, `%N-`, `%-M` — 1-indexed words of the original message
/// (the verb is word 0).
fn expand_word_range(name: &str, words: &[String]) -> Option<String> {
    if let Some(rest) = name.strip_prefix('-') {
        let stop: usize = rest.parse().ok()?;
        return argv::join_words(words, 1, Some(stop));
    }
    if let Some((start, stop)) = name.split_once('-') {
        let start: usize = start.parse().ok()?;
        if stop.is_empty() {
            return argv::join_words(words, start, None);
        }
        let stop: usize = stop.parse().ok()?;
        return argv::join_words(words, start, Some(stop));
    }
    let index: usize = name.parse().ok()?;
    words.get(index).cloned()
}

/// Resolve the target account: `=` means the invoking user when one is
/// known; a lookup failure falls back to the nobody-equivalent ids.
fn resolve_account(run_as: &str, cred: &Credential) -> (u32, u32) {
    let account = match (run_as, cred.name.as_deref()) {
        ("=", Some(name)) => name,
        _ => run_as,
    };
    match nix::unistd::User::from_name(account) {
        Ok(Some(user)) => (user.uid.as_raw(), user.gid.as_raw()),
        _ => (FALLBACK_ID, FALLBACK_ID),
    }
}

/// Spawn the child with the message body on stdin and capture its stdout.
///
/// The privilege drop runs between fork and exec; it is best-effort so the
/// daemon also works unprivileged (where setuid cannot succeed). Stderr
/// goes to the void — SMS replies carry stdout only.
fn spawn_command(
    path: &str,
    cmd_argv: &[String],
    uid: u32,
    gid: u32,
    body: &str,
) -> std::io::Result<String> {
    use std::os::unix::process::CommandExt;

    let mut cmd = Command::new(path);
    cmd.args(cmd_argv);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    // SAFETY: only async-signal-safe raw syscalls between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            libc::setgroups(0, std::ptr::null());
            libc::setgid(gid);
            libc::setuid(uid);
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;

    // The body is at most one SMS — far below the pipe buffer, so writing
    // it before draining stdout cannot deadlock.
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(body.as_bytes());
    }

    let output = match child.stdout.take() {
        Some(mut stdout) => read_capped(&mut stdout, MAX_OUTPUT),
        None => String::new(),
    };

    let status = child.wait()?;
    if !status.success() {
        debug!("ecmd: {path} exited with {status}");
    }
    Ok(output)
}

/// Read to EOF, keeping the first `max` bytes and discarding the rest so
/// the child never blocks on a full pipe.
fn read_capped(reader: &mut impl Read, max: usize) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < max {
                    let take = n.min(max - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                }
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::Level;

    fn table_with(content: &str) -> CommandTable {
        let path = std::env::temp_dir().join(format!(
            "smsgwd-cmds-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();

        let table = CommandTable::new();
        table.load(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();
        table
    }

    fn cred(level: Level, acl: Option<&str>) -> Credential {
        Credential {
            phone: "+46700000001".to_string(),
            name: Some("alice".to_string()),
            acl: acl.map(str::to_string),
            level,
        }
    }

    fn words(text: &str) -> Vec<String> {
        argv::split(text)
    }

    #[test]
    fn test_load_skips_comments_and_short_lines() {
        let table = table_with(
            "# comment\n\
             echo 0 nobody /bin/echo hello %1\n\
             broken 1 nobody\n",
        );
        assert_eq!(table.inner.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_load_missing_file_keeps_table() {
        let table = table_with("echo 0 nobody /bin/echo x\n");
        assert!(table.load("/nonexistent/commands").is_err());
        assert_eq!(table.inner.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_level_aliases() {
        assert_eq!(parse_level("0"), 0);
        assert_eq!(parse_level("2"), 2);
        assert_eq!(parse_level("*"), 0);
        assert_eq!(parse_level("all"), 0);
        assert_eq!(parse_level("phone"), 1);
        assert_eq!(parse_level("login"), 2);
        assert_eq!(parse_level("root"), 3);
    }

    #[test]
    fn test_list_filters_by_acl_and_level() {
        let table = table_with(
            "echo 0 nobody /bin/echo x\n\
             reboot login root /sbin/reboot now\n",
        );
        assert_eq!(table.list(&cred(Level::Known, Some("*"))), ",echo");
        assert_eq!(table.list(&cred(Level::LoggedIn, Some("*"))), ",echo,reboot");
        assert_eq!(table.list(&cred(Level::LoggedIn, Some("echo"))), ",echo");
        assert_eq!(table.list(&cred(Level::LoggedIn, None)), "");
    }

    #[test]
    fn test_expand_escapes() {
        let c = cred(Level::Known, Some("*"));
        let w = words("echo one two three");
        assert_eq!(expand_escape("P", &w, &c, "d").as_deref(), Some("+46700000001"));
        assert_eq!(expand_escape("date", &w, &c, "2024-01-01").as_deref(), Some("2024-01-01"));
        assert_eq!(expand_escape("U", &w, &c, "d").as_deref(), Some("alice"));
        assert_eq!(expand_escape("*", &w, &c, "d").as_deref(), Some("one two three"));
        assert_eq!(expand_escape("2", &w, &c, "d").as_deref(), Some("two"));
        assert_eq!(expand_escape("2-3", &w, &c, "d").as_deref(), Some("two three"));
        assert_eq!(expand_escape("2-", &w, &c, "d").as_deref(), Some("two three"));
        assert_eq!(expand_escape("-2", &w, &c, "d").as_deref(), Some("one two"));
        assert_eq!(expand_escape("9", &w, &c, "d"), None);
        assert_eq!(expand_escape("bogus", &w, &c, "d"), None);
    }

    #[test]
    fn test_run_expands_and_captures_stdout() {
        let table = table_with("echo 0 nobody /bin/echo hello %1\n");
        let out = table
            .run(&cred(Level::Known, Some("*")), &words("echo world"), "", "")
            .unwrap();
        assert_eq!(out, "hello world\n");
    }

    #[test]
    fn test_run_verb_is_case_insensitive() {
        let table = table_with("echo 0 nobody /bin/echo ok\n");
        let out = table
            .run(&cred(Level::Known, Some("*")), &words("ECHO"), "", "")
            .unwrap();
        assert_eq!(out, "ok\n");
    }

    #[test]
    fn test_run_feeds_body_to_stdin() {
        let table = table_with("cat 0 nobody /bin/sh -c cat\n");
        let out = table
            .run(
                &cred(Level::Known, Some("*")),
                &words("cat"),
                "",
                "line two\nline three",
            )
            .unwrap();
        assert_eq!(out, "line two\nline three");
    }

    #[test]
    fn test_run_denied_below_level() {
        let table = table_with("reboot login nobody /bin/echo rebooting\n");
        assert!(table
            .run(&cred(Level::Known, Some("*")), &words("reboot"), "", "")
            .is_none());
        assert!(table
            .run(&cred(Level::LoggedIn, Some("*")), &words("reboot"), "", "")
            .is_some());
    }

    #[test]
    fn test_run_denied_without_acl_entry() {
        let table = table_with("echo 0 nobody /bin/echo x\n");
        assert!(table
            .run(&cred(Level::LoggedIn, Some("other|cmds")), &words("echo"), "", "")
            .is_none());
        assert!(table
            .run(&cred(Level::LoggedIn, None), &words("echo"), "", "")
            .is_none());
    }

    #[test]
    fn test_run_unknown_verb() {
        let table = table_with("echo 0 nobody /bin/echo x\n");
        assert!(table
            .run(&cred(Level::LoggedIn, Some("*")), &words("frobnicate"), "", "")
            .is_none());
    }

    #[test]
    fn test_run_nonzero_exit_still_returns_stdout() {
        let table = table_with("fail 0 nobody /bin/sh -c 'echo partial; exit 3'\n");
        let out = table
            .run(&cred(Level::Known, Some("*")), &words("fail"), "", "")
            .unwrap();
        assert_eq!(out, "partial\n");
    }

    #[test]
    fn test_run_spawn_failure_is_none() {
        let table = table_with("ghost 0 nobody /nonexistent/bin run\n");
        assert!(table
            .run(&cred(Level::Known, Some("*")), &words("ghost"), "", "")
            .is_none());
    }
}
