//! Client-facing chat operations.
//!
//! Every call except [`ReplicaNode::get_leader`] and [`ReplicaNode::get_state`]
//! is served by the leader only; followers answer with
//! [`ChatError::NotLeader`] naming the leader they know of. Mutations go
//! through the quorum replicator, reads come straight from the leader's store.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    error::{ChatError, PasswordError},
    msg::{ChatMessage, ChatReply, LoginReply, MessageId, DEFAULT_READ_LIMIT},
    op::Operation,
    store::{Snapshot, StoredMessage},
    subscriptions::Subscription,
    ReplicaNode,
};

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

impl ReplicaNode {
    /// bcrypt is slow on purpose; keep it off the async workers.
    async fn hash_password(&self, password: &str) -> Result<Vec<u8>, ChatError> {
        let hasher = Arc::clone(&self.hasher);
        let password = password.to_string();
        let digest = tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(PasswordError::from)??;
        Ok(digest)
    }

    async fn verify_password(&self, digest: Vec<u8>, password: &str) -> Result<bool, ChatError> {
        let hasher = Arc::clone(&self.hasher);
        let password = password.to_string();
        Ok(
            tokio::task::spawn_blocking(move || hasher.verify(&digest, &password))
                .await
                .map_err(PasswordError::from)?,
        )
    }

    pub async fn create_account(
        &self,
        username: &str,
        password: &str,
    ) -> Result<ChatReply, ChatError> {
        self.ensure_leader()?;
        if username.is_empty() || password.is_empty() {
            return Err(ChatError::Validation(
                "Username and password required".to_string(),
            ));
        }
        if self.store().has_account(username)? {
            return Err(ChatError::AlreadyExists);
        }
        let password_digest = self.hash_password(password).await?;

        let _writes = self.write_gate.lock().await;
        // Re-check now that concurrent registrations are serialized.
        if self.store().has_account(username)? {
            return Err(ChatError::AlreadyExists);
        }
        self.commit(&Operation::CreateAccount {
            username: username.to_string(),
            password_digest,
        })
        .await?;
        tracing::info!("{} registered {username}", self.config.id);
        Ok(ChatReply::ok("Registration successful"))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginReply, ChatError> {
        self.ensure_leader()?;
        if username.is_empty() || password.is_empty() {
            return Err(ChatError::Validation(
                "Username and password required".to_string(),
            ));
        }
        let digest = self.store().password_digest(username)?;
        let verified = match digest {
            Some(digest) => self.verify_password(digest, password).await?,
            None => false,
        };
        if !verified {
            return Err(ChatError::InvalidCredentials);
        }
        // Live delivery only starts once the client subscribes.
        Ok(LoginReply {
            message: "Login successful".to_string(),
            unread_count: self.store().unread_count(username)?,
        })
    }

    pub async fn logout(&self, username: &str) -> Result<ChatReply, ChatError> {
        self.ensure_leader()?;
        if !self.subscriptions.remove(username) {
            return Err(ChatError::NotSubscribed);
        }
        tracing::info!("{} logged out {username}", self.config.id);
        Ok(ChatReply::ok("Logged out successfully"))
    }

    /// Assigns the next message id, replicates, and pushes the message to the
    /// recipient's live stream if there is one. Pushes happen under the write
    /// gate, so a subscriber sees messages in id order.
    pub async fn send_message(
        &self,
        sender: &str,
        recipient: &str,
        body: &str,
    ) -> Result<ChatReply, ChatError> {
        self.ensure_leader()?;
        if sender.is_empty() || recipient.is_empty() || body.is_empty() {
            return Err(ChatError::Validation(
                "Missing sender, recipient, or message".to_string(),
            ));
        }

        let _writes = self.write_gate.lock().await;
        // Leadership may have moved while this call waited for the gate.
        self.ensure_leader()?;
        let id = self.store().next_message_id()?;
        let message = ChatMessage {
            id,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            body: body.to_string(),
            timestamp: unix_now(),
        };
        self.commit(&Operation::SendMessage {
            id,
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            body: message.body.clone(),
            timestamp: message.timestamp,
        })
        .await?;

        if self.subscriptions.deliver(&message) {
            tracing::debug!(
                "{} pushed message {} to {recipient}",
                self.config.id,
                message.id
            );
        } else {
            tracing::debug!("{} has no live subscription for {recipient}", self.config.id);
        }
        Ok(ChatReply::ok("Message sent"))
    }

    /// Returns up to `limit` undelivered messages (10 when `limit` is 0) and
    /// marks them delivered. The flag is local to this leader.
    pub async fn read_messages(
        &self,
        username: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        self.ensure_leader()?;
        if username.is_empty() {
            return Ok(Vec::new());
        }
        let limit = if limit == 0 { DEFAULT_READ_LIMIT } else { limit };
        let mut store = self.store();
        let unread = store.undelivered_for(username, limit)?;
        let ids: Vec<MessageId> = unread.iter().map(|m| m.id).collect();
        store.mark_delivered(&ids)?;
        Ok(unread.iter().map(StoredMessage::to_chat).collect())
    }

    pub async fn list_messages(&self, username: &str) -> Result<Vec<ChatMessage>, ChatError> {
        self.ensure_leader()?;
        if username.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .store()
            .messages_for(username)?
            .iter()
            .map(StoredMessage::to_chat)
            .collect())
    }

    pub async fn list_accounts(&self, pattern: &str) -> Result<Vec<String>, ChatError> {
        self.ensure_leader()?;
        Ok(self.store().usernames_matching(pattern)?)
    }

    /// Deletes the listed messages addressed to `username`. Ids belonging to
    /// other recipients are ignored on every replica.
    pub async fn delete_messages(
        &self,
        username: &str,
        ids: &[MessageId],
    ) -> Result<ChatReply, ChatError> {
        self.ensure_leader()?;
        if username.is_empty() || ids.is_empty() {
            return Err(ChatError::Validation(
                "Username and message ids required".to_string(),
            ));
        }
        let _writes = self.write_gate.lock().await;
        self.commit(&Operation::DeleteMessages {
            recipient: username.to_string(),
            ids: ids.to_vec(),
        })
        .await?;
        Ok(ChatReply::ok("Messages deleted"))
    }

    /// Removes the account and every message it sent or received. Deleting
    /// a missing account still succeeds.
    pub async fn delete_account(&self, username: &str) -> Result<ChatReply, ChatError> {
        self.ensure_leader()?;
        if username.is_empty() {
            return Err(ChatError::Validation("Username required".to_string()));
        }
        {
            let _writes = self.write_gate.lock().await;
            self.commit(&Operation::DeleteAccount {
                username: username.to_string(),
            })
            .await?;
        }
        self.subscriptions.remove(username);
        tracing::info!("{} deleted account {username}", self.config.id);
        Ok(ChatReply::ok("Account deleted"))
    }

    /// Opens the live stream for `username`, replacing any earlier one.
    pub fn subscribe(&self, username: &str) -> Result<Subscription, ChatError> {
        self.ensure_leader()?;
        if username.is_empty() {
            return Err(ChatError::Validation("Username required".to_string()));
        }
        Ok(self
            .subscriptions
            .subscribe(username, self.config.timing.subscription_poll()))
    }

    /// The leader this node knows of, or its own address if it knows none.
    pub fn get_leader(&self) -> String {
        self.leader_address()
            .unwrap_or_else(|| self.config.address.clone())
    }

    pub fn get_state(&self) -> Result<Snapshot, ChatError> {
        Ok(self.receive_get_state()?)
    }
}
