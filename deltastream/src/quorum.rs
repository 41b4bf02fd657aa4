//! Replicated membership quorum.
//!
//! The quorum is derived deterministically from the sequenced stream: only
//! sequencer-originated `ClientJoin` / `ClientLeave` messages change
//! membership. The sequencer keeps the authoritative copy and every client can
//! rebuild its own from a summary plus the messages after it.
//!
//! Proposals are key/value pairs tagged with the sequence number that carried
//! them; once the minimum sequence number reaches that point every client has
//! seen the proposal and it is committed into `values`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{
    Client, ClientRecord, MessageType, ProtocolError, SequencedClient, SequencedMessage,
};

/// A proposal still waiting for the minimum sequence number to pass it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuorumProposal {
    pub key: String,
    pub value: serde_json::Value,
    pub sequence_number: u64,
    pub client_id: Option<Uuid>,
}

/// A committed quorum value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedProposal {
    pub key: String,
    pub value: serde_json::Value,
    /// Sequence number of the proposal
    pub sequence_number: u64,
    /// Minimum sequence number at which it was committed
    pub commit_sequence_number: u64,
}

/// Serializable image of the quorum, embedded in document summaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuorumSnapshot {
    pub members: Vec<(Uuid, SequencedClient)>,
    pub proposals: Vec<(u64, QuorumProposal)>,
    pub values: Vec<(String, CommittedProposal)>,
}

/// Membership change applied by [`Quorum::process`].
#[derive(Debug, Clone, PartialEq)]
pub enum QuorumChange {
    Joined(ClientRecord),
    Left(ClientRecord),
}

#[derive(Debug, Default, Clone)]
pub struct Quorum {
    members: HashMap<Uuid, SequencedClient>,
    proposals: BTreeMap<u64, QuorumProposal>,
    values: HashMap<String, CommittedProposal>,
    minimum_sequence_number: u64,
}

impl Quorum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a quorum from a summary snapshot.
    pub fn from_snapshot(snapshot: QuorumSnapshot, minimum_sequence_number: u64) -> Self {
        Self {
            members: snapshot.members.into_iter().collect(),
            proposals: snapshot.proposals.into_iter().collect(),
            values: snapshot.values.into_iter().collect(),
            minimum_sequence_number,
        }
    }

    /// Snapshot for embedding in a summary. Members are ordered by join
    /// sequence number and values by key so the output is stable.
    pub fn snapshot(&self) -> QuorumSnapshot {
        let mut members: Vec<(Uuid, SequencedClient)> = self
            .members
            .iter()
            .map(|(id, client)| (*id, client.clone()))
            .collect();
        members.sort_by_key(|(_, client)| client.sequence_number);

        let mut values: Vec<(String, CommittedProposal)> = self
            .values
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));

        QuorumSnapshot {
            members,
            proposals: self
                .proposals
                .iter()
                .map(|(seq, proposal)| (*seq, proposal.clone()))
                .collect(),
            values,
        }
    }

    pub fn add_member(
        &mut self,
        client_id: Uuid,
        client: Client,
        sequence_number: u64,
    ) -> Result<ClientRecord, QuorumError> {
        if self.members.contains_key(&client_id) {
            return Err(QuorumError::DuplicateMember {
                client_id,
                sequence_number,
            });
        }
        let member = SequencedClient {
            client,
            sequence_number,
        };
        self.members.insert(client_id, member.clone());
        log::debug!("Quorum: {client_id} joined at {sequence_number}");
        Ok(ClientRecord {
            client_id,
            client: member.client,
            sequence_number,
        })
    }

    pub fn remove_member(
        &mut self,
        client_id: Uuid,
        sequence_number: u64,
    ) -> Result<ClientRecord, QuorumError> {
        let member = self
            .members
            .remove(&client_id)
            .ok_or(QuorumError::UnknownMember {
                client_id,
                sequence_number,
            })?;
        log::debug!("Quorum: {client_id} left at {sequence_number}");
        Ok(ClientRecord {
            client_id,
            client: member.client,
            sequence_number: member.sequence_number,
        })
    }

    /// All joined clients, ordered by join sequence number.
    pub fn members(&self) -> Vec<ClientRecord> {
        let mut members: Vec<ClientRecord> = self
            .members
            .iter()
            .map(|(id, member)| ClientRecord {
                client_id: *id,
                client: member.client.clone(),
                sequence_number: member.sequence_number,
            })
            .collect();
        members.sort_by_key(|m| m.sequence_number);
        members
    }

    pub fn member(&self, client_id: &Uuid) -> Option<ClientRecord> {
        self.members.get(client_id).map(|member| ClientRecord {
            client_id: *client_id,
            client: member.client.clone(),
            sequence_number: member.sequence_number,
        })
    }

    pub fn has_member(&self, client_id: &Uuid) -> bool {
        self.members.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Record a proposal carried by the message at `sequence_number`.
    pub fn propose(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
        sequence_number: u64,
        client_id: Option<Uuid>,
    ) -> Result<(), QuorumError> {
        if self.proposals.contains_key(&sequence_number) {
            return Err(QuorumError::DuplicateProposal(sequence_number));
        }
        self.proposals.insert(
            sequence_number,
            QuorumProposal {
                key: key.into(),
                value,
                sequence_number,
                client_id,
            },
        );
        Ok(())
    }

    pub fn pending_proposals(&self) -> impl Iterator<Item = &QuorumProposal> {
        self.proposals.values()
    }

    /// Committed value for `key`.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key).map(|v| &v.value)
    }

    pub fn minimum_sequence_number(&self) -> u64 {
        self.minimum_sequence_number
    }

    /// Advance the minimum sequence number and commit every proposal it has
    /// passed. Returns the committed keys in proposal order.
    pub fn update_minimum_sequence_number(&mut self, msn: u64) -> Vec<String> {
        if msn < self.minimum_sequence_number {
            return Vec::new();
        }
        self.minimum_sequence_number = msn;

        let pending = self.proposals.split_off(&(msn + 1));
        let ready = std::mem::replace(&mut self.proposals, pending);

        let mut committed = Vec::with_capacity(ready.len());
        for (sequence_number, proposal) in ready {
            log::debug!("Quorum: committed {} (proposed at {sequence_number})", proposal.key);
            committed.push(proposal.key.clone());
            self.values.insert(
                proposal.key.clone(),
                CommittedProposal {
                    key: proposal.key,
                    value: proposal.value,
                    sequence_number,
                    commit_sequence_number: msn,
                },
            );
        }
        committed
    }

    /// Apply a message from the sequenced stream.
    ///
    /// Only sequencer-originated `ClientJoin` / `ClientLeave` messages change
    /// membership; anything else (including client messages that claim a
    /// membership kind) only advances the minimum sequence number.
    pub fn process(
        &mut self,
        message: &SequencedMessage,
    ) -> Result<Option<QuorumChange>, QuorumError> {
        let change = match (message.is_system(), message.msg_type) {
            (true, MessageType::ClientJoin) => {
                let join = message.client_join().map_err(|source| QuorumError::Malformed {
                    sequence_number: message.sequence_number,
                    source,
                })?;
                let record =
                    self.add_member(join.client_id, join.detail, message.sequence_number)?;
                Some(QuorumChange::Joined(record))
            }
            (true, MessageType::ClientLeave) => {
                let client_id =
                    message.client_leave().map_err(|source| QuorumError::Malformed {
                        sequence_number: message.sequence_number,
                        source,
                    })?;
                let record = self.remove_member(client_id, message.sequence_number)?;
                Some(QuorumChange::Left(record))
            }
            (false, MessageType::ClientJoin | MessageType::ClientLeave) => {
                log::warn!(
                    "Quorum: ignoring client-originated {} at {}",
                    message.msg_type,
                    message.sequence_number
                );
                None
            }
            _ => None,
        };
        self.update_minimum_sequence_number(message.minimum_sequence_number);
        Ok(change)
    }
}

/// Membership inconsistencies. These mean system messages were lost or
/// duplicated and are fatal to the quorum.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuorumError {
    #[error("client {client_id} joined at {sequence_number} but is already a member")]
    DuplicateMember {
        client_id: Uuid,
        sequence_number: u64,
    },
    #[error("client {client_id} left at {sequence_number} but is not a member")]
    UnknownMember {
        client_id: Uuid,
        sequence_number: u64,
    },
    #[error("duplicate proposal at sequence number {0}")]
    DuplicateProposal(u64),
    #[error("malformed membership message at {sequence_number}: {source}")]
    Malformed {
        sequence_number: u64,
        #[source]
        source: ProtocolError,
    },
}
