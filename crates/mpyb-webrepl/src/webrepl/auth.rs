//! WebREPL password handshake tracking.
//!
//! The device prints `Password: ` and waits for the secret followed by
//! `\r`. Success is announced with `WebREPL connected`. A prompt that comes
//! back after a password was submitted (or an explicit `Access denied`)
//! means the password was wrong.

pub const PASSWORD_PROMPT: &str = "Password:";
pub const CONNECTED_MARKER: &str = "WebREPL connected";
pub const DENIED_MARKER: &str = "Access denied";

/// Longest marker minus one; kept between chunks so split markers match.
const CARRY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    /// Send this password (already known for the session).
    SubmitPassword(String),
    /// Prompt is up, no password known: the user must type one.
    AwaitUser,
    Authenticated,
    /// The submitted password was refused.
    Rejected,
}

#[derive(Debug, Default)]
pub struct AuthTracker {
    window: String,
    password: Option<String>,
    submitted: bool,
    authenticated: bool,
}

impl AuthTracker {
    pub fn new(password: Option<String>) -> Self {
        Self {
            password: password.filter(|p| !p.is_empty()),
            ..Default::default()
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The session password, cleared after a rejection.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Record a password typed by the user and sent by the caller.
    pub fn user_submitted(&mut self, password: &str) {
        self.password = Some(password.to_string());
        self.submitted = true;
    }

    /// Scan new (sanitized) device output.
    pub fn observe(&mut self, text: &str) -> Vec<AuthAction> {
        let mut actions = Vec::new();
        if self.authenticated {
            return actions;
        }
        self.window.push_str(text);

        loop {
            let next = [PASSWORD_PROMPT, CONNECTED_MARKER, DENIED_MARKER]
                .iter()
                .filter_map(|m| self.window.find(m).map(|idx| (idx, *m)))
                .min_by_key(|(idx, _)| *idx);
            let (idx, marker) = match next {
                Some(found) => found,
                None => break,
            };
            self.window.drain(..idx + marker.len());

            match marker {
                CONNECTED_MARKER => {
                    self.authenticated = true;
                    self.submitted = false;
                    self.window.clear();
                    actions.push(AuthAction::Authenticated);
                    return actions;
                }
                DENIED_MARKER => {
                    if self.submitted {
                        self.reject();
                        actions.push(AuthAction::Rejected);
                    }
                }
                _ => {
                    if self.submitted {
                        self.reject();
                        actions.push(AuthAction::Rejected);
                        actions.push(AuthAction::AwaitUser);
                    } else if let Some(pw) = self.password.clone() {
                        self.submitted = true;
                        actions.push(AuthAction::SubmitPassword(pw));
                    } else {
                        actions.push(AuthAction::AwaitUser);
                    }
                }
            }
        }

        if self.window.len() > CARRY {
            let mut cut = self.window.len() - CARRY;
            while !self.window.is_char_boundary(cut) {
                cut += 1;
            }
            self.window.drain(..cut);
        }
        actions
    }

    fn reject(&mut self) {
        self.submitted = false;
        self.password = None;
    }
}
