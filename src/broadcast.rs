//! Explicit auth-state channel for windows that mirror the login state.
//!
//! Every live subscriber receives every published snapshot in publish order.
//! A new subscriber is first sent the latest snapshot. Subscribers whose
//! receiver was dropped are pruned on the next publish.

use crate::models::AuthState;
use std::sync::mpsc::{self, Receiver, Sender};

#[derive(Clone, Debug, PartialEq)]
pub struct AuthSnapshot {
    pub state: AuthState,
    pub database_id: Option<String>,
}

pub struct AuthBroadcast {
    latest: AuthSnapshot,
    subscribers: Vec<Sender<AuthSnapshot>>,
}

impl AuthBroadcast {
    pub fn new(initial: AuthSnapshot) -> Self {
        Self {
            latest: initial,
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> Receiver<AuthSnapshot> {
        let (sender, receiver) = mpsc::channel();
        if sender.send(self.latest.clone()).is_ok() {
            self.subscribers.push(sender);
        }
        receiver
    }

    pub fn publish(&mut self, snapshot: AuthSnapshot) {
        if snapshot == self.latest {
            return;
        }
        self.latest = snapshot;
        let latest = &self.latest;
        self.subscribers
            .retain(|subscriber| subscriber.send(latest.clone()).is_ok());
    }

    pub fn latest(&self) -> &AuthSnapshot {
        &self.latest
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
