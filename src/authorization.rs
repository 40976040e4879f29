/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The authorization checker: decides whether an action's required authority is
//! satisfied by a set of candidate signer keys, consulting the token database.
//!
//! Which authority an action requires depends on its name and domain:
//! - `issuetoken` requires the domain's issue authority.
//! - `transfer` requires the owner keys of the target token, or of the target account
//!   when made on the `account` domain.
//! - `updatedomain` requires the domain's manage authority.
//! - `updategroup` requires the group's managing key.
//! - The creation actions (`newdomain`, `newgroup`, `newaccount`) are authorized by the
//!   keys their payloads designate, since the records they create do not exist yet.
//! - Every other action requires the owner keys of the account or token it targets,
//!   depending on its domain.
//!
//! Authorities reference groups by name; groups are resolved recursively from the token
//! database, with a depth bound against reference cycles. The checker accumulates the
//! keys it actually used, so callers can strip a transaction's signatures down to the
//! required subset via [`AuthorizationChecker::used_keys`].

use std::collections::BTreeSet;

use crate::contracts;
use crate::contracts::token::{NewAccount, NewDomain, NewGroup};
use crate::token_db::TokenDb;
use crate::types::authority::{Authority, AuthorizerRef, GroupNode};
use crate::types::basic::{DomainName, Name, PublicKey};
use crate::types::transaction::Action;

/// Bound on transitive group references, against definition cycles.
const MAX_GROUP_DEPTH: usize = 16;

pub struct AuthorizationChecker<'a> {
    token_db: &'a TokenDb,
    candidate_keys: &'a BTreeSet<PublicKey>,
    used_keys: BTreeSet<PublicKey>,
}

impl<'a> AuthorizationChecker<'a> {
    pub fn new(
        token_db: &'a TokenDb,
        candidate_keys: &'a BTreeSet<PublicKey>,
    ) -> AuthorizationChecker<'a> {
        AuthorizationChecker { token_db, candidate_keys, used_keys: BTreeSet::new() }
    }

    /// Whether the action's required authority is satisfied by the candidate keys. Keys
    /// used towards a satisfied action are added to the used set; an unsatisfied action
    /// contributes nothing.
    pub fn satisfied(&mut self, action: &Action) -> bool {
        let mut used = BTreeSet::new();
        let satisfied = self.satisfy_action(action, &mut used);
        if satisfied {
            self.used_keys.extend(used);
        }
        satisfied
    }

    /// The minimal-ish subset of candidate keys that satisfied the checked actions.
    pub fn used_keys(self) -> BTreeSet<PublicKey> {
        self.used_keys
    }

    fn satisfy_action(&self, action: &Action, used: &mut BTreeSet<PublicKey>) -> bool {
        if action.name == contracts::NEWDOMAIN {
            return match contracts::decode::<NewDomain>(&action.data) {
                Ok(payload) => self.use_key(&payload.creator, used),
                Err(_) => false,
            };
        }
        if action.name == contracts::NEWGROUP {
            return match contracts::decode::<NewGroup>(&action.data) {
                Ok(payload) => self.use_key(&payload.group.key, used),
                Err(_) => false,
            };
        }
        if action.name == contracts::NEWACCOUNT {
            return match contracts::decode::<NewAccount>(&action.data) {
                Ok(payload) => self.satisfy_owner(&payload.owner, used),
                Err(_) => false,
            };
        }
        if action.name == contracts::UPDATEGROUP {
            return self
                .token_db
                .read_group(&action.key, |group| group.key)
                .map(|key| self.use_key(&key, used))
                .unwrap_or(false);
        }
        if action.name == contracts::ISSUETOKEN {
            return self
                .token_db
                .read_domain(&action.domain, |domain| domain.issue.clone())
                .map(|authority| self.satisfy_authority(&authority, &action.domain, &action.key, used))
                .unwrap_or(false);
        }
        if action.name == contracts::UPDATEDOMAIN {
            return self
                .token_db
                .read_domain(&action.domain, |domain| domain.manage.clone())
                .map(|authority| self.satisfy_authority(&authority, &action.domain, &action.key, used))
                .unwrap_or(false);
        }

        // `transfer` and every remaining action fall through to the owner of the target:
        // the account's owner on the account domain, the token's owner elsewhere.
        self.target_owner(&action.domain, &action.key)
            .map(|owner| self.satisfy_owner(&owner, used))
            .unwrap_or(false)
    }

    fn target_owner(&self, domain: &DomainName, key: &Name) -> Option<Vec<PublicKey>> {
        if domain.is_account() {
            self.token_db.read_account(key, |account| account.owner.clone()).ok()
        } else {
            self.token_db.read_token(domain, key, |token| token.owner.clone()).ok()
        }
    }

    fn satisfy_authority(
        &self,
        authority: &Authority,
        domain: &DomainName,
        key: &Name,
        used: &mut BTreeSet<PublicKey>,
    ) -> bool {
        let mut total: u64 = 0;
        for authorizer in &authority.authorizers {
            let satisfied = match &authorizer.reference {
                AuthorizerRef::Key(candidate) => self.use_key(candidate, used),
                AuthorizerRef::Owner => self
                    .target_owner(domain, key)
                    .map(|owner| self.satisfy_owner(&owner, used))
                    .unwrap_or(false),
                AuthorizerRef::Group(name) => self.satisfy_group(name, used, 0),
            };
            if satisfied {
                total += authorizer.weight as u64;
                if total >= authority.threshold as u64 {
                    return true;
                }
            }
        }
        false
    }

    /// An owner key set demands every one of its keys.
    fn satisfy_owner(&self, owner: &[PublicKey], used: &mut BTreeSet<PublicKey>) -> bool {
        if owner.is_empty() {
            return false;
        }
        let mut scratch = BTreeSet::new();
        for key in owner {
            if !self.use_key(key, &mut scratch) {
                return false;
            }
        }
        used.extend(scratch);
        true
    }

    fn satisfy_group(&self, name: &Name, used: &mut BTreeSet<PublicKey>, depth: usize) -> bool {
        if depth >= MAX_GROUP_DEPTH {
            return false;
        }
        self.token_db
            .read_group(name, |group| group.root.clone())
            .map(|root| self.satisfy_node(&root, used, depth))
            .unwrap_or(false)
    }

    fn satisfy_node(&self, node: &GroupNode, used: &mut BTreeSet<PublicKey>, depth: usize) -> bool {
        match node {
            GroupNode::Leaf { key, .. } => self.use_key(key, used),
            GroupNode::Subgroup { name, .. } => self.satisfy_group(name, used, depth + 1),
            GroupNode::Node { threshold, nodes, .. } => {
                let mut total: u64 = 0;
                for child in nodes {
                    let mut scratch = BTreeSet::new();
                    if self.satisfy_node(child, &mut scratch, depth) {
                        used.extend(scratch);
                        total += child.weight() as u64;
                        if total >= *threshold as u64 {
                            return true;
                        }
                    }
                }
                false
            }
        }
    }

    fn use_key(&self, key: &PublicKey, used: &mut BTreeSet<PublicKey>) -> bool {
        if self.candidate_keys.contains(key) {
            used.insert(*key);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts;
    use crate::token_db::{Domain, Token};
    use crate::types::authority::{Authorizer, Group};
    use tempfile::TempDir;

    fn key(seed: u8) -> PublicKey {
        PublicKey::new([seed; 32])
    }

    fn keys(seeds: &[u8]) -> BTreeSet<PublicKey> {
        seeds.iter().map(|s| key(*s)).collect()
    }

    /// A token db with the domain "art": issuing requires either the direct key 1 or
    /// the two-of-two "curators" group (keys 2 and 3); the token "mona" is owned by
    /// keys 4 and 5.
    fn art_token_db(dir: &TempDir) -> TokenDb {
        let token_db = TokenDb::open(dir.path()).unwrap();
        token_db
            .add_domain(Domain {
                name: DomainName::new("art"),
                creator: key(1),
                issue: Authority {
                    threshold: 2,
                    authorizers: vec![
                        Authorizer { reference: AuthorizerRef::Key(key(1)), weight: 2 },
                        Authorizer {
                            reference: AuthorizerRef::Group(Name::new("curators")),
                            weight: 2,
                        },
                    ],
                },
                transfer: Authority::owner(),
                manage: Authority::single_key(key(1)),
            })
            .unwrap();
        token_db
            .add_group(Group {
                name: Name::new("curators"),
                key: key(1),
                root: GroupNode::Node {
                    threshold: 2,
                    weight: 2,
                    nodes: vec![
                        GroupNode::Leaf { key: key(2), weight: 1 },
                        GroupNode::Leaf { key: key(3), weight: 1 },
                    ],
                },
            })
            .unwrap();
        token_db
            .add_token(Token {
                domain: DomainName::new("art"),
                name: Name::new("mona"),
                owner: vec![key(4), key(5)],
            })
            .unwrap();
        token_db
    }

    fn action(name: crate::types::basic::ActionName, key_name: &str) -> Action {
        Action {
            name,
            domain: DomainName::new("art"),
            key: Name::new(key_name),
            data: Vec::new(),
        }
    }

    #[test]
    fn issue_authority_is_satisfied_through_a_group() {
        let dir = TempDir::new().unwrap();
        let token_db = art_token_db(&dir);

        let candidates = keys(&[2, 3, 9]);
        let mut checker = AuthorizationChecker::new(&token_db, &candidates);
        assert!(checker.satisfied(&action(contracts::ISSUETOKEN, "issue")));
        // Key 9 was available but never needed.
        assert_eq!(checker.used_keys(), keys(&[2, 3]));
    }

    #[test]
    fn a_partial_group_does_not_reach_the_threshold() {
        let dir = TempDir::new().unwrap();
        let token_db = art_token_db(&dir);

        let candidates = keys(&[2]);
        let mut checker = AuthorizationChecker::new(&token_db, &candidates);
        assert!(!checker.satisfied(&action(contracts::ISSUETOKEN, "issue")));
        assert!(checker.used_keys().is_empty());
    }

    #[test]
    fn transfer_requires_the_full_owner_key_set() {
        let dir = TempDir::new().unwrap();
        let token_db = art_token_db(&dir);

        let partial = keys(&[4]);
        let mut checker = AuthorizationChecker::new(&token_db, &partial);
        assert!(!checker.satisfied(&action(contracts::TRANSFER, "mona")));

        let full = keys(&[4, 5]);
        let mut checker = AuthorizationChecker::new(&token_db, &full);
        assert!(checker.satisfied(&action(contracts::TRANSFER, "mona")));
        assert_eq!(checker.used_keys(), keys(&[4, 5]));
    }

    #[test]
    fn missing_records_fail_authorization_instead_of_panicking() {
        let dir = TempDir::new().unwrap();
        let token_db = art_token_db(&dir);

        let candidates = keys(&[1, 2, 3]);
        let mut checker = AuthorizationChecker::new(&token_db, &candidates);
        assert!(!checker.satisfied(&action(contracts::TRANSFER, "missing-token")));
        assert!(!checker.satisfied(&Action {
            name: contracts::ISSUETOKEN,
            domain: DomainName::new("void"),
            key: Name::new("issue"),
            data: Vec::new(),
        }));
    }
}
