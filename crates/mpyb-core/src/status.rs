//! Connection state machine shared by the serial and WebREPL transports.

use crate::error::{ReplError, ReplErrorKind, ReplResult};
use crate::types::{ConnectionStatus, TransportKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Observable console event, broadcast to every subscriber of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConsoleEvent {
    StatusChanged {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    /// Sanitized device output (no timestamp).
    Output { text: String },
    SystemLine { text: String },
    Cleared,
}

/// Result of an accepted transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
    /// Line to append to the console, if the new state announces itself.
    pub system_line: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatusMachine {
    kind: TransportKind,
    target: String,
    current: ConnectionStatus,
}

impl StatusMachine {
    pub fn new(kind: TransportKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            current: ConnectionStatus::Disconnected,
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        self.current
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        self.target = target.into();
    }

    pub fn can_transition(&self, to: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self.current, to) {
            (_, Disconnected) | (_, Error) => true,
            (Disconnected, Connecting) | (Error, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting, Password) | (Password, Connected) | (Password, Password) => {
                self.kind == TransportKind::Socket
            }
            _ => false,
        }
    }

    /// Move to `to`. `reason` feeds the DISCONNECTED / ERROR system lines.
    pub fn transition(&mut self, to: ConnectionStatus, reason: &str) -> ReplResult<Transition> {
        if !self.can_transition(to) {
            return Err(ReplError::new(
                ReplErrorKind::InvalidTransition,
                format!(
                    "{} connection cannot go from {} to {}",
                    self.kind.label(),
                    self.current,
                    to
                ),
            ));
        }
        let from = self.current;
        self.current = to;
        Ok(Transition {
            from,
            to,
            system_line: Some(self.entry_line(from, to, reason)),
        })
    }

    fn entry_line(&self, from: ConnectionStatus, to: ConnectionStatus, reason: &str) -> String {
        match to {
            ConnectionStatus::Connecting => format!("Conectando a {}...", self.target),
            ConnectionStatus::Password if from == ConnectionStatus::Password => {
                "Senha incorreta. Digite a senha.".to_string()
            }
            ConnectionStatus::Password => "Aguardando senha...".to_string(),
            ConnectionStatus::Connected => format!("Conectado a {}", self.target),
            ConnectionStatus::Disconnected => format!("Desconectado: {}", reason),
            ConnectionStatus::Error => format!("Erro: {}", reason),
        }
    }
}

/// `Tentativa 1/3 em 1s...`
pub fn retry_line(attempt: u32, max_attempts: u32, delay: Duration) -> String {
    format!(
        "Tentativa {}/{} em {}s...",
        attempt,
        max_attempts,
        format_secs(delay)
    )
}

pub fn give_up_line(max_attempts: u32) -> String {
    format!(
        "Reconexão automática falhou após {} tentativas. Reconecte manualmente.",
        max_attempts
    )
}

fn format_secs(delay: Duration) -> String {
    let ms = delay.as_millis();
    if ms % 1000 == 0 {
        (ms / 1000).to_string()
    } else {
        format!("{:.1}", delay.as_secs_f64())
    }
}
