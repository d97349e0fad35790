//! Enqueuing-mode service.
//!
//! Holds the global media-enqueuing mode and its password behind a dedicated
//! lock with a change event, rather than daemon-wide mutable state.

use std::sync::{Arc, Mutex};

use marquee_core::event::Event;
use serde::{Deserialize, Serialize};

/// Whether, and for whom, media enqueuing is currently allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaEnqueuingMode {
    #[default]
    Enabled,
    Disabled,
    StaffOnly,
    PasswordRequired,
}

/// Snapshot of the current enqueuing permission state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuingPermissionStatus {
    pub mode: MediaEnqueuingMode,
    pub password_edition: String,
    pub password_is_numeric: bool,
}

struct GateState {
    mode: MediaEnqueuingMode,
    password: String,
    password_edition: String,
}

/// The enqueuing-mode service.
pub struct Gatekeeper {
    state: Mutex<GateState>,
    on_changed: Event<EnqueuingPermissionStatus>,
}

impl Gatekeeper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState {
                mode: MediaEnqueuingMode::Enabled,
                password: String::new(),
                password_edition: String::new(),
            }),
            on_changed: Event::new(),
        })
    }

    pub fn on_changed(&self) -> &Event<EnqueuingPermissionStatus> {
        &self.on_changed
    }

    pub fn mode(&self) -> MediaEnqueuingMode {
        self.state.lock().expect("gatekeeper lock poisoned").mode
    }

    pub fn status(&self) -> EnqueuingPermissionStatus {
        let state = self.state.lock().expect("gatekeeper lock poisoned");
        status_of(&state)
    }

    pub fn set_mode(&self, mode: MediaEnqueuingMode) {
        let status = {
            let mut state = self.state.lock().expect("gatekeeper lock poisoned");
            state.mode = mode;
            status_of(&state)
        };
        self.on_changed.notify(status);
    }

    /// Switch to password-required mode with the given password. The edition
    /// string lets clients distinguish rotations without seeing the password.
    pub fn require_password(&self, password: impl Into<String>, edition: impl Into<String>) {
        let status = {
            let mut state = self.state.lock().expect("gatekeeper lock poisoned");
            state.mode = MediaEnqueuingMode::PasswordRequired;
            state.password = password.into();
            state.password_edition = edition.into();
            status_of(&state)
        };
        self.on_changed.notify(status);
    }

    pub fn check_password(&self, candidate: &str) -> bool {
        let state = self.state.lock().expect("gatekeeper lock poisoned");
        state.mode == MediaEnqueuingMode::PasswordRequired
            && !state.password.is_empty()
            && state.password == candidate
    }

    pub fn password_edition(&self) -> String {
        self.state
            .lock()
            .expect("gatekeeper lock poisoned")
            .password_edition
            .clone()
    }
}

fn status_of(state: &GateState) -> EnqueuingPermissionStatus {
    EnqueuingPermissionStatus {
        mode: state.mode,
        password_edition: state.password_edition.clone(),
        password_is_numeric: !state.password.is_empty()
            && state.password.chars().all(|c| c.is_ascii_digit()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marquee_core::event::BufferingGuarantee;

    #[tokio::test]
    async fn mode_changes_fire_events() {
        let gate = Gatekeeper::new();
        let mut changes = gate.on_changed().subscribe(BufferingGuarantee::BufferAll);

        gate.set_mode(MediaEnqueuingMode::StaffOnly);
        let status = changes.recv().await.unwrap();
        assert_eq!(status.mode, MediaEnqueuingMode::StaffOnly);
    }

    #[tokio::test]
    async fn password_checks() {
        let gate = Gatekeeper::new();
        // outside password mode no password matches
        assert!(!gate.check_password("1234"));

        gate.require_password("1234", "ed1");
        assert!(gate.check_password("1234"));
        assert!(!gate.check_password("4321"));
        assert_eq!(gate.password_edition(), "ed1");
        assert!(gate.status().password_is_numeric);

        gate.require_password("open sesame", "ed2");
        assert!(!gate.status().password_is_numeric);
    }
}
