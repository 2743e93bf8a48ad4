/// Session state service
///
/// Shared identity of the local user. Owned by the composition root and handed
/// to every component that needs to know who "me" is; observers subscribe and
/// get notified on sign-in, sign-out and guest entry.
use crate::messenger_types::{Participant, Role};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// The signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub role: Role,
}

impl LocalUser {
    pub fn new(id: impl Into<String>, email: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            display_name: None,
            role,
        }
    }

    pub fn is_advisor(&self) -> bool {
        self.role == Role::Advisor
    }

    /// Display info attached to messages this user sends
    pub fn as_participant(&self) -> Participant {
        Participant {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            email: Some(self.email.clone()),
            role: Some(self.role),
        }
    }
}

/// Point-in-time view of the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub user: Option<LocalUser>,
    pub guest: bool,
}

/// Injectable session service with an explicit subscribe/notify contract
#[derive(Clone)]
pub struct SessionState {
    tx: Arc<watch::Sender<SessionSnapshot>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    /// Create a signed-out session
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Create a session already signed in as `user`
    pub fn signed_in(user: LocalUser) -> Self {
        let session = Self::new();
        session.sign_in(user);
        session
    }

    pub fn sign_in(&self, user: LocalUser) {
        info!("Session signed in as {}", user.id);
        self.tx.send_replace(SessionSnapshot {
            user: Some(user),
            guest: false,
        });
    }

    pub fn sign_out(&self) {
        info!("Session signed out");
        self.tx.send_replace(SessionSnapshot::default());
    }

    /// Browse without an account
    pub fn enter_guest(&self) {
        info!("Session entered guest mode");
        self.tx.send_replace(SessionSnapshot {
            user: None,
            guest: true,
        });
    }

    pub fn current_user(&self) -> Option<LocalUser> {
        self.tx.borrow().user.clone()
    }

    pub fn is_guest(&self) -> bool {
        self.tx.borrow().guest
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.tx.borrow().clone()
    }

    /// Observe session changes; dropping the receiver ends the observation
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_observers_see_sign_in_and_out() {
        let session = SessionState::new();
        let mut rx = session.subscribe();

        session.sign_in(LocalUser::new("u1", "u1@example.com", Role::Customer));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().user.as_ref().unwrap().id, "u1");

        session.sign_out();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().user.is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let a = SessionState::new();
        let b = a.clone();
        a.enter_guest();
        assert!(b.is_guest());
        assert!(b.current_user().is_none());

        b.sign_in(LocalUser::new("adv", "adv@example.com", Role::Advisor));
        assert!(!a.is_guest());
        assert!(a.current_user().unwrap().is_advisor());
    }
}
