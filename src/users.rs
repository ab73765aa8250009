//! User table, per-phone credentials, and session expiry.
//!
//! The table is loaded wholesale from the auth file (whitespace-separated
//! `name home_phone password [acl]`, `#` comments) and guards all session
//! state behind a single mutex. Callers never hold that lock: every inbound
//! message gets an owned [`Credential`] snapshot so command execution can
//! take as long as it likes without blocking logins.
//!
//! ## Levels
//!
//! - `Unknown` — the phone matches nothing
//! - `Known` — the phone is some user's home number
//! - `LoggedIn` — the phone is bound to a user by a successful login
//!
//! ## Autologout
//!
//! A dedicated sweeper thread sleeps until the earliest session expiry and
//! ends idle sessions, notifying the former phone through a caller-supplied
//! hook. It is woken through a condvar on login (the deadline may change)
//! and on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::ConfigError;

/// Trust tier of an inbound phone number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Unknown = 0,
    Known = 1,
    LoggedIn = 2,
}

/// One record from the auth file plus its mutable session state.
#[derive(Debug, Clone)]
struct User {
    name: String,
    password: String,
    acl: Option<String>,
    home_phone: String,
    current_phone: Option<String>,
    expires_at: Option<Instant>,
}

/// Immutable per-message snapshot of who a phone number is.
///
/// Owns its strings; valid to use (and pass to a subprocess) without any
/// lock held. `login` upgrades the snapshot in place on success.
#[derive(Debug, Clone)]
pub struct Credential {
    pub phone: String,
    pub name: Option<String>,
    pub acl: Option<String>,
    pub level: Level,
}

impl Credential {
    /// ACL admission check: wildcard, or a case-insensitive match against
    /// the pipe-separated command list. No ACL means no external commands.
    pub fn allows(&self, command: &str) -> bool {
        match self.acl.as_deref() {
            None => false,
            Some("*") => true,
            Some(acl) => acl
                .split('|')
                .any(|entry| entry.eq_ignore_ascii_case(command)),
        }
    }
}

/// The shared user table.
pub struct UserDb {
    inner: Mutex<Vec<User>>,
    sweep_cv: Condvar,
    sweep_stop: AtomicBool,
    autologout: Option<Duration>,
}

impl UserDb {
    pub fn new(autologout: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            sweep_cv: Condvar::new(),
            sweep_stop: AtomicBool::new(false),
            autologout: autologout.filter(|d| !d.is_zero()),
        }
    }

    /// Load (or reload) the auth file, replacing the whole table. All
    /// sessions are reset to logged-out. On a read error the previous table
    /// is kept and the error returned.
    pub fn load(&self, path: &str) -> Result<usize, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_string(), e))?;

        let mut users = Vec::new();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let Some(name) = fields.next() else { continue };
            if name.starts_with('#') {
                continue;
            }
            let Some(phone) = fields.next() else { continue };
            let Some(password) = fields.next() else { continue };
            // The ACL is the rest of the line, spaces and all
            let acl = crate::argv::rest_after(line, 3).map(str::to_string);

            users.push(User {
                name: name.to_string(),
                password: password.to_string(),
                acl,
                home_phone: phone.to_string(),
                current_phone: None,
                expires_at: None,
            });
        }

        let count = users.len();
        *self.inner.lock().unwrap() = users;
        info!("Loaded {count} users from {path}");
        Ok(count)
    }

    /// Derive the credential for an inbound phone number.
    ///
    /// A logged-in match wins over a home-number match; either match
    /// refreshes the user's idle deadline. Total: every phone yields a
    /// credential, unknown ones at [`Level::Unknown`].
    pub fn credentials(&self, phone: &str) -> Credential {
        let mut users = self.inner.lock().unwrap();
        let deadline = self.next_deadline();

        let mut cred = Credential {
            phone: phone.to_string(),
            name: None,
            acl: None,
            level: Level::Unknown,
        };

        if let Some(user) = users
            .iter_mut()
            .find(|u| u.current_phone.as_deref() == Some(phone))
        {
            cred.name = Some(user.name.clone());
            cred.acl = user.acl.clone();
            cred.level = Level::LoggedIn;
            user.expires_at = deadline;
        } else if let Some(user) = users.iter_mut().find(|u| u.home_phone == phone) {
            cred.name = Some(user.name.clone());
            cred.acl = user.acl.clone();
            cred.level = Level::Known;
            user.expires_at = deadline;
        }

        debug!(
            "credentials: phone={phone} name={:?} level={:?}",
            cred.name, cred.level
        );
        cred
    }

    /// Attempt a login, binding `cred.phone` to the named user.
    ///
    /// `name` defaults to the credential's own name (the `[password]`
    /// prefix path). On success the credential is upgraded to
    /// [`Level::LoggedIn`] in place. Any session previously bound to this
    /// phone — even someone else's — is cleared first, so no two users
    /// ever share a current phone.
    pub fn login(&self, cred: &mut Credential, name: Option<&str>, password: &str) -> bool {
        let name = match name.or(cred.name.as_deref()) {
            Some(n) => n.to_string(),
            None => return false,
        };

        let deadline = self.next_deadline();
        let mut users = self.inner.lock().unwrap();

        let stolen = users
            .iter()
            .position(|u| u.current_phone.as_deref() == Some(cred.phone.as_str()));
        let Some(target) = users
            .iter()
            .position(|u| u.name.eq_ignore_ascii_case(&name))
        else {
            return false;
        };

        if !users[target].password.eq_ignore_ascii_case(password) {
            return false;
        }

        // This phone may be bound to a session (possibly someone else's);
        // release it before binding so no two users share a current phone.
        if let Some(i) = stolen {
            users[i].current_phone = None;
            users[i].expires_at = None;
        }

        users[target].current_phone = Some(cred.phone.clone());
        users[target].expires_at = deadline;

        cred.name = Some(name.clone());
        cred.acl = users[target].acl.clone();
        cred.level = Level::LoggedIn;
        drop(users);

        info!("login: {name} bound to {}", cred.phone);
        self.sweep_cv.notify_one();
        true
    }

    /// End the session bound to the credential's phone, if any.
    pub fn logout(&self, cred: &Credential) -> bool {
        let mut users = self.inner.lock().unwrap();
        let Some(user) = users
            .iter_mut()
            .find(|u| u.current_phone.as_deref() == Some(cred.phone.as_str()))
        else {
            return false;
        };

        user.current_phone = None;
        user.expires_at = None;
        info!("logout: {} released {}", user.name, cred.phone);
        true
    }

    /// Resolve a user name to their reachable phone: the logged-in phone
    /// when a session exists, the home phone otherwise.
    pub fn phone_for_name(&self, name: &str) -> Option<String> {
        let users = self.inner.lock().unwrap();
        users
            .iter()
            .find(|u| u.name.eq_ignore_ascii_case(name))
            .map(|u| u.current_phone.clone().unwrap_or_else(|| u.home_phone.clone()))
    }

    /// One reachable phone per user, for broadcast sends.
    pub fn broadcast_targets(&self) -> Vec<String> {
        let users = self.inner.lock().unwrap();
        users
            .iter()
            .map(|u| u.current_phone.clone().unwrap_or_else(|| u.home_phone.clone()))
            .collect()
    }

    /// `(name, current_phone)` for every active session.
    pub fn logged_in(&self) -> Vec<(String, String)> {
        let users = self.inner.lock().unwrap();
        users
            .iter()
            .filter_map(|u| {
                u.current_phone
                    .as_ref()
                    .map(|p| (u.name.clone(), p.clone()))
            })
            .collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.autologout.map(|d| Instant::now() + d)
    }

    /// Start the autologout sweeper. `notify` receives the phone of every
    /// session ended by inactivity. Returns `None` when no interval is
    /// configured.
    pub fn start_autologout<F>(self: &Arc<Self>, notify: F) -> Option<JoinHandle<()>>
    where
        F: Fn(&str) + Send + 'static,
    {
        let interval = self.autologout?;
        let db = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("autologout".into())
            .spawn(move || db.sweep_loop(interval, notify))
            .expect("spawn autologout thread");
        Some(handle)
    }

    /// Ask the sweeper to exit. The caller joins the handle returned by
    /// [`Self::start_autologout`].
    pub fn stop_autologout(&self) {
        // Taken under the lock so the sweeper is either before its stop
        // check or already parked in wait_timeout when we notify.
        let _guard = self.inner.lock().unwrap();
        self.sweep_stop.store(true, Ordering::SeqCst);
        self.sweep_cv.notify_all();
    }

    fn sweep_loop<F>(&self, interval: Duration, notify: F)
    where
        F: Fn(&str),
    {
        debug!("autologout sweeper started (interval {interval:?})");
        while !self.sweep_stop.load(Ordering::SeqCst) {
            let (expired, timeout) = self.sweep(interval);
            for phone in &expired {
                info!("autologout: ending idle session on {phone}");
                notify(phone);
            }

            let guard = self.inner.lock().unwrap();
            if self.sweep_stop.load(Ordering::SeqCst) {
                break;
            }
            let _unused = self.sweep_cv.wait_timeout(guard, timeout).unwrap();
        }
        debug!("autologout sweeper stopped");
    }

    /// Clear expired sessions. Returns their phones and how long to sleep
    /// until the next deadline (the full interval when nothing is pending).
    fn sweep(&self, interval: Duration) -> (Vec<String>, Duration) {
        let now = Instant::now();
        let mut users = self.inner.lock().unwrap();

        let mut expired = Vec::new();
        let mut next: Option<Instant> = None;
        for user in users.iter_mut() {
            match user.expires_at {
                Some(at) if at <= now => {
                    if let Some(phone) = user.current_phone.take() {
                        expired.push(phone);
                    }
                    user.expires_at = None;
                }
                Some(at) => {
                    if next.is_none_or(|n| at < n) {
                        next = Some(at);
                    }
                }
                None => {}
            }
        }

        let timeout = next
            .map(|at| at.saturating_duration_since(now))
            .filter(|d| !d.is_zero())
            .unwrap_or(interval);
        (expired, timeout)
    }
}
