//! Per-room chat fan-out with the inline `/rename` command.

use std::sync::Arc;
use tracing::info;

use crate::models::Fingerprint;
use crate::store::MemoryStore;
use crate::{Error, Result};

/// Messages are truncated to this many characters.
pub const MAX_MESSAGE_CHARS: usize = 500;
/// Display names accepted by `/rename`.
pub const MAX_NAME_CHARS: usize = 32;

/// What the dispatcher should do with a processed chat input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    /// Broadcast an escaped chat message to the room.
    Broadcast { sender: String, message: String },
    /// The sender renamed themselves: confirm to them, broadcast the system
    /// notice, never relay the raw command.
    Rename {
        new_name: String,
        system_message: String,
    },
}

pub struct ChatService {
    memory: Arc<MemoryStore>,
}

impl ChatService {
    #[must_use]
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }

    /// Process one inbound chat message.
    pub fn process(
        &self,
        sender: &str,
        message: &str,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<ChatOutcome> {
        if let Some(rest) = message.strip_prefix("/rename ") {
            return self.rename(sender, rest, fingerprint);
        }
        if message.trim() == "/rename" {
            return Err(Error::Validation("Usage: /rename NEWNAME".to_string()));
        }

        let escaped_sender = escape_html(sender);
        let truncated: String = message.chars().take(MAX_MESSAGE_CHARS).collect();
        Ok(ChatOutcome::Broadcast {
            sender: escaped_sender,
            message: escape_html(&truncated),
        })
    }

    fn rename(
        &self,
        sender: &str,
        raw_name: &str,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<ChatOutcome> {
        let trimmed = raw_name.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("New name must not be empty".to_string()));
        }
        if trimmed.chars().count() > MAX_NAME_CHARS {
            return Err(Error::Validation(format!(
                "Names are limited to {MAX_NAME_CHARS} characters"
            )));
        }

        let new_name = escape_html(trimmed);
        if let Some(fp) = fingerprint {
            self.memory.set_client_name(fp, &new_name)?;
        }
        info!(old = sender, new = %new_name, "Viewer renamed");

        Ok(ChatOutcome::Rename {
            system_message: format!("{} is now known as {}", escape_html(sender), new_name),
            new_name,
        })
    }

    /// Remembered display name for a returning device.
    #[must_use]
    pub fn remembered_name(&self, fingerprint: &Fingerprint) -> Option<String> {
        self.memory.client_name(fingerprint)
    }

    /// Admin rename of an arbitrary client.
    pub fn set_display_name(&self, fingerprint: &Fingerprint, name: &str) -> Result<String> {
        let trimmed = name.trim();
        if trimmed.is_empty() || trimmed.chars().count() > MAX_NAME_CHARS {
            return Err(Error::Validation(format!(
                "Names must be 1-{MAX_NAME_CHARS} characters"
            )));
        }
        let escaped = escape_html(trimmed);
        self.memory.set_client_name(fingerprint, &escaped)?;
        Ok(escaped)
    }
}

/// Minimal HTML entity escaping for chat-visible strings.
#[must_use]
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> ChatService {
        let key: [u8; 32] = sha2::Sha256::digest(b"chat-test").into();
        let memory =
            Arc::new(MemoryStore::open(dir.path().join("memory.json"), &key).expect("open"));
        ChatService::new(memory)
    }

    #[test]
    fn escapes_and_truncates() {
        let dir = TempDir::new().expect("tempdir");
        let svc = service(&dir);
        let long_message = format!("<b>{}</b>", "x".repeat(600));
        let outcome = svc
            .process("Eve <script>", &long_message, None)
            .expect("process");
        match outcome {
            ChatOutcome::Broadcast { sender, message } => {
                assert_eq!(sender, "Eve &lt;script&gt;");
                assert!(message.starts_with("&lt;b&gt;"));
                assert!(!message.contains('<'));
            }
            ChatOutcome::Rename { .. } => panic!("expected broadcast"),
        }
    }

    #[test]
    fn rename_persists_and_makes_system_notice() {
        let dir = TempDir::new().expect("tempdir");
        let svc = service(&dir);
        let fp = Fingerprint::from("dev-1");

        let outcome = svc
            .process("OldName", "/rename  NewName ", Some(&fp))
            .expect("rename");
        match outcome {
            ChatOutcome::Rename {
                new_name,
                system_message,
            } => {
                assert_eq!(new_name, "NewName");
                assert_eq!(system_message, "OldName is now known as NewName");
            }
            ChatOutcome::Broadcast { .. } => panic!("expected rename"),
        }
        assert_eq!(svc.remembered_name(&fp), Some("NewName".to_string()));
    }

    #[test]
    fn rename_rejects_empty_and_oversized() {
        let dir = TempDir::new().expect("tempdir");
        let svc = service(&dir);
        assert!(svc.process("A", "/rename   ", None).is_err());
        assert!(svc.process("A", "/rename", None).is_err());
        let long = format!("/rename {}", "n".repeat(33));
        assert!(svc.process("A", &long, None).is_err());
    }

    #[test]
    fn escape_html_covers_entities() {
        assert_eq!(escape_html(r#"<a href="x">&'</a>"#), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;&lt;/a&gt;");
    }
}
