/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Apply handlers for the domain-management and token-lifecycle actions, with their
//! payload types.
//!
//! Every handler first checks that the payload agrees with the action's routing fields
//! (`domain`, `key`), so that an action receipt's digest binds the full effect of the
//! action. Token-database failures surface as [`ChainError::TokenDb`] and are objective.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::errors::ChainError;
use crate::token_db::{Account, Domain, Token};
use crate::types::authority::{Authority, Group};
use crate::types::basic::{Balance, DomainName, Name, PublicKey};

use super::ApplyContext;

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct NewDomain {
    pub name: DomainName,
    pub creator: PublicKey,
    pub issue: Authority,
    pub transfer: Authority,
    pub manage: Authority,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct IssueToken {
    pub domain: DomainName,
    pub names: Vec<Name>,
    pub owner: Vec<PublicKey>,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct Transfer {
    pub domain: DomainName,
    pub name: Name,
    pub to: Vec<PublicKey>,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct NewGroup {
    pub name: Name,
    pub group: Group,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct UpdateGroup {
    pub name: Name,
    pub group: Group,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct UpdateDomain {
    pub name: DomainName,
    pub issue: Option<Authority>,
    pub transfer: Option<Authority>,
    pub manage: Option<Authority>,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct NewAccount {
    pub name: Name,
    pub owner: Vec<PublicKey>,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct UpdateOwner {
    pub name: Name,
    pub owner: Vec<PublicKey>,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct TransferEvt {
    pub from: Name,
    pub to: Name,
    pub amount: Balance,
}

fn ensure(condition: bool, message: &str) -> Result<(), ChainError> {
    if condition {
        Ok(())
    } else {
        Err(ChainError::InvalidActionData(message.to_string()))
    }
}

pub fn apply_newdomain(ctx: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: NewDomain = ctx.data()?;
    ensure(ctx.action.domain == payload.name, "newdomain routed to a different domain")?;
    ensure(ctx.action.key.as_str() == payload.name.as_str(), "newdomain key must name the domain")?;

    ctx.token_db.add_domain(Domain {
        name: payload.name,
        creator: payload.creator,
        issue: payload.issue,
        transfer: payload.transfer,
        manage: payload.manage,
    })?;
    Ok(())
}

pub fn apply_issuetoken(ctx: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: IssueToken = ctx.data()?;
    ensure(ctx.action.domain == payload.domain, "issuetoken routed to a different domain")?;
    ensure(!payload.owner.is_empty(), "issued tokens must have at least one owner")?;
    ensure(!payload.names.is_empty(), "issuetoken must name at least one token")?;

    for name in payload.names {
        ctx.token_db.add_token(Token {
            domain: payload.domain.clone(),
            name,
            owner: payload.owner.clone(),
        })?;
    }
    Ok(())
}

pub fn apply_transfer(ctx: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: Transfer = ctx.data()?;
    ensure(ctx.action.domain == payload.domain, "transfer routed to a different domain")?;
    ensure(ctx.action.key == payload.name, "transfer key must name the token")?;
    ensure(!payload.to.is_empty(), "a token cannot be transferred to nobody")?;

    ctx.token_db.update_token(&payload.domain, &payload.name, |token| {
        token.owner = payload.to.clone();
    })?;
    Ok(())
}

pub fn apply_newgroup(ctx: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: NewGroup = ctx.data()?;
    ensure(ctx.action.domain.as_str() == DomainName::GROUP, "newgroup outside the group domain")?;
    ensure(ctx.action.key == payload.name, "newgroup key must name the group")?;
    ensure(payload.group.name == payload.name, "group definition must carry its own name")?;

    ctx.token_db.add_group(payload.group)?;
    Ok(())
}

pub fn apply_updategroup(ctx: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: UpdateGroup = ctx.data()?;
    ensure(ctx.action.domain.as_str() == DomainName::GROUP, "updategroup outside the group domain")?;
    ensure(ctx.action.key == payload.name, "updategroup key must name the group")?;
    ensure(payload.group.name == payload.name, "group definition must carry its own name")?;

    let managing_key = ctx.token_db.read_group(&payload.name, |group| group.key)?;
    ensure(payload.group.key == managing_key, "the managing key of a group cannot change")?;

    ctx.token_db.update_group(&payload.name, |group| {
        group.root = payload.group.root.clone();
    })?;
    Ok(())
}

pub fn apply_updatedomain(ctx: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: UpdateDomain = ctx.data()?;
    ensure(ctx.action.domain == payload.name, "updatedomain routed to a different domain")?;

    ctx.token_db.update_domain(&payload.name, |domain| {
        if let Some(issue) = payload.issue.clone() {
            domain.issue = issue;
        }
        if let Some(transfer) = payload.transfer.clone() {
            domain.transfer = transfer;
        }
        if let Some(manage) = payload.manage.clone() {
            domain.manage = manage;
        }
    })?;
    Ok(())
}

pub fn apply_newaccount(ctx: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: NewAccount = ctx.data()?;
    ensure(ctx.action.domain.is_account(), "newaccount outside the account domain")?;
    ensure(ctx.action.key == payload.name, "newaccount key must name the account")?;
    ensure(!payload.owner.is_empty(), "an account must have at least one owner")?;

    ctx.token_db.add_account(Account {
        name: payload.name,
        owner: payload.owner,
        balance: Balance::new(0),
    })?;
    Ok(())
}

pub fn apply_updateowner(ctx: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: UpdateOwner = ctx.data()?;
    ensure(ctx.action.domain.is_account(), "updateowner outside the account domain")?;
    ensure(ctx.action.key == payload.name, "updateowner key must name the account")?;
    ensure(!payload.owner.is_empty(), "an account must have at least one owner")?;

    ctx.token_db.update_account(&payload.name, |account| {
        account.owner = payload.owner.clone();
    })?;
    Ok(())
}

pub fn apply_transferevt(ctx: &mut ApplyContext) -> Result<(), ChainError> {
    let payload: TransferEvt = ctx.data()?;
    ensure(ctx.action.domain.is_account(), "transferevt outside the account domain")?;
    ensure(ctx.action.key == payload.from, "transferevt key must name the paying account")?;
    ensure(payload.from != payload.to, "transferevt between an account and itself")?;

    ctx.token_db.transfer_balance(&payload.from, &payload.to, payload.amount)?;
    Ok(())
}
