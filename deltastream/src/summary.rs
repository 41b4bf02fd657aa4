//! Document summary trees.
//!
//! A summary lets a fresh client load a document without replaying the
//! stream from sequence 0. Only the protocol half is interpreted here:
//! ```text
//! (root)
//! ├── .app          application subtree (opaque)
//! └── .protocol
//!     ├── attributes       {branch, minimumSequenceNumber, sequenceNumber}
//!     ├── quorumMembers    [[clientId, {client, sequenceNumber}], …]
//!     ├── quorumProposals  [[sequenceNumber, proposal], …]
//!     └── quorumValues     [[key, committed], …]
//! ```
//! Blob contents are JSON strings.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::quorum::{Quorum, QuorumSnapshot};

pub const APP_TREE: &str = ".app";
pub const PROTOCOL_TREE: &str = ".protocol";
pub const ATTRIBUTES_BLOB: &str = "attributes";
pub const QUORUM_MEMBERS_BLOB: &str = "quorumMembers";
pub const QUORUM_PROPOSALS_BLOB: &str = "quorumProposals";
pub const QUORUM_VALUES_BLOB: &str = "quorumValues";

/// A node in a summary tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SummaryObject {
    Tree(SummaryTree),
    Blob(SummaryBlob),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryTree {
    pub tree: BTreeMap<String, SummaryObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryBlob {
    pub content: String,
}

/// Stream position recorded in the protocol subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolAttributes {
    pub branch: String,
    pub minimum_sequence_number: u64,
    pub sequence_number: u64,
}

/// Everything the protocol subtree describes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolState {
    pub attributes: ProtocolAttributes,
    pub quorum: QuorumSnapshot,
}

impl ProtocolState {
    /// Build a quorum positioned at this state.
    pub fn quorum(&self) -> Quorum {
        Quorum::from_snapshot(self.quorum.clone(), self.attributes.minimum_sequence_number)
    }

    /// Read the protocol subtree of a document summary.
    pub fn from_summary(summary: &SummaryTree) -> Result<Self, SummaryError> {
        let protocol = summary.subtree(PROTOCOL_TREE)?;
        Ok(Self {
            attributes: protocol.json_blob(ATTRIBUTES_BLOB)?,
            quorum: QuorumSnapshot {
                members: protocol.json_blob(QUORUM_MEMBERS_BLOB)?,
                proposals: protocol.json_blob(QUORUM_PROPOSALS_BLOB)?,
                values: protocol.json_blob(QUORUM_VALUES_BLOB)?,
            },
        })
    }

    /// Write the protocol subtree.
    pub fn to_tree(&self) -> Result<SummaryTree, SummaryError> {
        let mut tree = SummaryTree::default();
        tree.insert_json(ATTRIBUTES_BLOB, &self.attributes)?;
        tree.insert_json(QUORUM_MEMBERS_BLOB, &self.quorum.members)?;
        tree.insert_json(QUORUM_PROPOSALS_BLOB, &self.quorum.proposals)?;
        tree.insert_json(QUORUM_VALUES_BLOB, &self.quorum.values)?;
        Ok(tree)
    }
}

impl SummaryTree {
    /// Minimum bootstrap state for a new document: empty application
    /// subtree, sequence number 0 and an empty quorum.
    pub fn virgin() -> Self {
        Self::document(SummaryTree::default(), &ProtocolState::default())
            .unwrap_or_default()
    }

    /// Assemble a full document summary.
    pub fn document(app: SummaryTree, protocol: &ProtocolState) -> Result<Self, SummaryError> {
        let mut root = SummaryTree::default();
        root.tree.insert(APP_TREE.to_string(), SummaryObject::Tree(app));
        root.tree
            .insert(PROTOCOL_TREE.to_string(), SummaryObject::Tree(protocol.to_tree()?));
        Ok(root)
    }

    pub fn subtree(&self, name: &str) -> Result<&SummaryTree, SummaryError> {
        match self.tree.get(name) {
            Some(SummaryObject::Tree(tree)) => Ok(tree),
            Some(SummaryObject::Blob(_)) => Err(SummaryError::NotATree(name.to_string())),
            None => Err(SummaryError::MissingEntry(name.to_string())),
        }
    }

    pub fn blob(&self, name: &str) -> Result<&str, SummaryError> {
        match self.tree.get(name) {
            Some(SummaryObject::Blob(blob)) => Ok(&blob.content),
            Some(SummaryObject::Tree(_)) => Err(SummaryError::NotABlob(name.to_string())),
            None => Err(SummaryError::MissingEntry(name.to_string())),
        }
    }

    pub fn insert_blob(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.tree.insert(
            name.into(),
            SummaryObject::Blob(SummaryBlob {
                content: content.into(),
            }),
        );
    }

    fn insert_json<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), SummaryError> {
        let content = serde_json::to_string(value).map_err(|source| SummaryError::Json {
            entry: name.to_string(),
            source,
        })?;
        self.insert_blob(name, content);
        Ok(())
    }

    fn json_blob<T: DeserializeOwned>(&self, name: &str) -> Result<T, SummaryError> {
        serde_json::from_str(self.blob(name)?).map_err(|source| SummaryError::Json {
            entry: name.to_string(),
            source,
        })
    }

    /// Encode the whole tree as JSON.
    pub fn to_json(&self) -> Result<String, SummaryError> {
        serde_json::to_string(self).map_err(|source| SummaryError::Json {
            entry: String::new(),
            source,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, SummaryError> {
        serde_json::from_str(json).map_err(|source| SummaryError::Json {
            entry: String::new(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("summary entry not found: {0}")]
    MissingEntry(String),
    #[error("summary entry is not a tree: {0}")]
    NotATree(String),
    #[error("summary entry is not a blob: {0}")]
    NotABlob(String),
    #[error("invalid JSON in summary entry '{entry}': {source}")]
    Json {
        entry: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Client;
    use uuid::Uuid;

    #[test]
    fn test_virgin_summary_shape() {
        let summary = SummaryTree::virgin();
        assert!(summary.subtree(APP_TREE).unwrap().tree.is_empty());

        let protocol = summary.subtree(PROTOCOL_TREE).unwrap();
        assert_eq!(protocol.tree.len(), 4);
        assert_eq!(protocol.blob(QUORUM_MEMBERS_BLOB).unwrap(), "[]");
        assert_eq!(protocol.blob(QUORUM_PROPOSALS_BLOB).unwrap(), "[]");
        assert_eq!(protocol.blob(QUORUM_VALUES_BLOB).unwrap(), "[]");

        let attributes: serde_json::Value =
            serde_json::from_str(protocol.blob(ATTRIBUTES_BLOB).unwrap()).unwrap();
        assert_eq!(
            attributes,
            serde_json::json!({ "branch": "", "minimumSequenceNumber": 0, "sequenceNumber": 0 })
        );
    }

    #[test]
    fn test_virgin_state_reads_back() {
        let state = ProtocolState::from_summary(&SummaryTree::virgin()).unwrap();
        assert_eq!(state, ProtocolState::default());
        assert!(state.quorum().is_empty());
    }

    #[test]
    fn test_tree_json_tags() {
        let json: serde_json::Value =
            serde_json::from_str(&SummaryTree::virgin().to_json().unwrap()).unwrap();
        assert_eq!(json["tree"][".app"]["type"], "Tree");
        assert_eq!(json["tree"][".protocol"]["tree"]["attributes"]["type"], "Blob");
    }

    #[test]
    fn test_protocol_state_with_members() {
        let mut quorum = Quorum::new();
        let id = Uuid::new_v4();
        quorum.add_member(id, Client::new("fake"), 0).unwrap();

        let state = ProtocolState {
            attributes: ProtocolAttributes {
                branch: String::new(),
                minimum_sequence_number: 3,
                sequence_number: 12,
            },
            quorum: quorum.snapshot(),
        };
        let summary = SummaryTree::document(SummaryTree::default(), &state).unwrap();
        let restored =
            ProtocolState::from_summary(&SummaryTree::from_json(&summary.to_json().unwrap()).unwrap())
                .unwrap();

        assert_eq!(restored, state);
        assert!(restored.quorum().has_member(&id));
        assert_eq!(restored.quorum().minimum_sequence_number(), 3);
    }

    #[test]
    fn test_missing_protocol_tree() {
        let err = ProtocolState::from_summary(&SummaryTree::default()).unwrap_err();
        assert!(matches!(err, SummaryError::MissingEntry(ref name) if name == PROTOCOL_TREE));
    }

    #[test]
    fn test_blob_where_tree_expected() {
        let mut tree = SummaryTree::default();
        tree.insert_blob(PROTOCOL_TREE, "{}");
        assert!(matches!(
            ProtocolState::from_summary(&tree),
            Err(SummaryError::NotATree(_))
        ));
    }

    #[test]
    fn test_corrupt_attributes_blob() {
        let mut summary = SummaryTree::virgin();
        if let Some(SummaryObject::Tree(protocol)) = summary.tree.get_mut(PROTOCOL_TREE) {
            protocol.insert_blob(ATTRIBUTES_BLOB, "not json");
        }
        assert!(matches!(
            ProtocolState::from_summary(&summary),
            Err(SummaryError::Json { ref entry, .. }) if entry == ATTRIBUTES_BLOB
        ));
    }
}
