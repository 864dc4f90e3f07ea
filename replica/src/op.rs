use serde::{Deserialize, Serialize};

use crate::{
    error::StoreError,
    msg::MessageId,
    store::{Store, StoredMessage},
};

/// One replicated state mutation.
///
/// Every variant is idempotent under replay, so a peer may receive the same
/// record from successive leaders without diverging.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    CreateAccount {
        username: String,
        password_digest: Vec<u8>,
    },
    SendMessage {
        id: MessageId,
        sender: String,
        recipient: String,
        body: String,
        timestamp: i64,
    },
    DeleteMessages {
        recipient: String,
        ids: Vec<MessageId>,
    },
    DeleteAccount {
        username: String,
    },
}

impl Operation {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::CreateAccount { .. } => "create-account",
            Operation::SendMessage { .. } => "send-message",
            Operation::DeleteMessages { .. } => "delete-messages",
            Operation::DeleteAccount { .. } => "delete-account",
        }
    }

    pub fn apply(&self, store: &mut Store) -> Result<(), StoreError> {
        use Operation::*;
        match self {
            CreateAccount {
                username,
                password_digest,
            } => {
                if !store.insert_account(username, password_digest)? {
                    tracing::trace!("Account {username} already exists, skipping");
                }
            }
            SendMessage {
                id,
                sender,
                recipient,
                body,
                timestamp,
            } => {
                let inserted = store.insert_message(&StoredMessage {
                    id: *id,
                    sender: sender.clone(),
                    recipient: recipient.clone(),
                    body: body.clone(),
                    timestamp: *timestamp,
                    delivered: false,
                })?;
                if !inserted {
                    tracing::trace!("Message {id} already stored, skipping");
                }
            }
            DeleteMessages { recipient, ids } => {
                store.delete_messages(recipient, ids)?;
            }
            DeleteAccount { username } => {
                store.delete_account(username)?;
            }
        }
        Ok(())
    }
}
