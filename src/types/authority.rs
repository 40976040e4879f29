/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Permission structures consulted by the authorization checker.
//!
//! An [`Authority`] is a weighted threshold over [`Authorizer`]s. An authorizer is
//! either a single key, a reference to a group stored in the token database, or the
//! special `Owner` reference that resolves to the owner key set of the token targeted by
//! the action being authorized. Groups are trees of weighted nodes, so authority
//! evaluation is recursive.

use borsh::{BorshDeserialize, BorshSerialize};

use super::basic::{Name, PublicKey};

/// A weighted threshold permission. Satisfied when the weights of satisfied authorizers
/// sum to at least `threshold`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Authority {
    pub threshold: u32,
    pub authorizers: Vec<Authorizer>,
}

impl Authority {
    /// An authority satisfied by a single signature of the given key.
    pub fn single_key(key: PublicKey) -> Authority {
        Authority {
            threshold: 1,
            authorizers: vec![Authorizer { reference: AuthorizerRef::Key(key), weight: 1 }],
        }
    }

    /// An authority requiring the full owner key set of the target token, each key
    /// counting equally.
    pub fn owner() -> Authority {
        Authority {
            threshold: 1,
            authorizers: vec![Authorizer { reference: AuthorizerRef::Owner, weight: 1 }],
        }
    }
}

/// One entry of an [`Authority`]: a reference and the weight it contributes when
/// satisfied.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Authorizer {
    pub reference: AuthorizerRef,
    pub weight: u32,
}

/// What an [`Authorizer`] points at.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum AuthorizerRef {
    /// A single public key.
    Key(PublicKey),
    /// A group stored in the token database, referenced by name and resolved at
    /// evaluation time.
    Group(Name),
    /// The owner key set of the token or account the action targets.
    Owner,
}

/// A named group: a weighted-threshold tree of keys and subgroup references, managed by
/// `key`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Group {
    pub name: Name,
    /// The key allowed to update the group's definition.
    pub key: PublicKey,
    pub root: GroupNode,
}

/// A node of a group tree.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum GroupNode {
    /// A leaf key carrying `weight` towards its parent's threshold.
    Leaf { key: PublicKey, weight: u32 },
    /// An inner node: satisfied when its children's weights sum to at least `threshold`,
    /// in which case it carries `weight` towards its parent.
    Node { threshold: u32, weight: u32, nodes: Vec<GroupNode> },
    /// A reference to another group stored in the token database, carrying `weight` when
    /// the referenced group's root node is satisfied.
    Subgroup { name: Name, weight: u32 },
}

impl GroupNode {
    /// The weight this node contributes to its parent when satisfied.
    pub fn weight(&self) -> u32 {
        match self {
            GroupNode::Leaf { weight, .. } => *weight,
            GroupNode::Node { weight, .. } => *weight,
            GroupNode::Subgroup { weight, .. } => *weight,
        }
    }
}
