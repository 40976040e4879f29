/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The append-only durable log of irreversible blocks.
//!
//! The log is the source of truth for the irreversible prefix of the chain: it contains
//! exactly the blocks at heights `1..=head` along the historical chain, starting at
//! genesis. Each entry is a length-prefixed borsh-serialized [`SignedBlock`]; entry
//! offsets are rebuilt by a sequential scan at open.
//!
//! [`BlockLog::append`] requires the appended block to link onto the current log head.
//! I/O failures while appending are fatal: an irreversible block that cannot be made
//! durable leaves the node unable to make progress, so the process stops rather than
//! diverge from its own log.

use borsh::BorshDeserialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::ChainError;
use crate::types::basic::{BlockId, BlockNum};
use crate::types::block::SignedBlock;

const LOG_FILE: &str = "blocks.log";

pub struct BlockLog {
    path: PathBuf,
    writer: File,
    /// Byte offset of each entry; index `n` holds the block at height `n + 1`.
    offsets: Vec<u64>,
    head: Option<SignedBlock>,
    head_id: Option<BlockId>,
}

impl BlockLog {
    /// Opens (or creates) the block log in `dir`, scanning existing entries to rebuild
    /// the offset table and the cached head.
    pub fn open(dir: &Path) -> Result<BlockLog, ChainError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);

        let mut offsets = Vec::new();
        let mut head = None;
        if path.is_file() {
            let bytes = fs::read(&path)?;
            let mut position = 0usize;
            while position < bytes.len() {
                if position + 4 > bytes.len() {
                    return Err(ChainError::Io("truncated block log entry header".to_string()));
                }
                let len = u32::from_le_bytes(
                    bytes[position..position + 4].try_into().expect("slice is 4 bytes"),
                ) as usize;
                let start = position + 4;
                let end = start + len;
                if end > bytes.len() {
                    return Err(ChainError::Io("truncated block log entry".to_string()));
                }
                let block = SignedBlock::try_from_slice(&bytes[start..end])
                    .map_err(|err| ChainError::Io(format!("corrupt block log entry: {}", err)))?;
                let expected = BlockNum::new(offsets.len() as u32 + 1);
                if block.header.block_num() != expected {
                    return Err(ChainError::Io(format!(
                        "block log entry at height {} found where {} was expected",
                        block.header.block_num(),
                        expected
                    )));
                }
                offsets.push(position as u64);
                head = Some(block);
                position = end;
            }
        }

        let writer = OpenOptions::new().create(true).append(true).open(&path)?;
        let head_id = head.as_ref().map(|b| b.id());
        Ok(BlockLog { path, writer, offsets, head, head_id })
    }

    /// The most recently appended block, if any.
    pub fn head(&self) -> Option<&SignedBlock> {
        self.head.as_ref()
    }

    pub fn head_id(&self) -> Option<BlockId> {
        self.head_id
    }

    pub fn head_block_num(&self) -> Option<BlockNum> {
        self.head.as_ref().map(|b| b.header.block_num())
    }

    /// Appends a block that links onto the current head. Linkage violations and I/O
    /// failures are fatal.
    pub fn append(&mut self, block: &SignedBlock) {
        if let Some(head_id) = self.head_id {
            assert!(
                block.header.previous == head_id,
                "appended block does not link to the block log head"
            );
        }

        let bytes = borsh::to_vec(&block).expect("borsh serialization cannot fail");
        let offset = self
            .writer
            .seek(SeekFrom::End(0))
            .expect("block log append failed: cannot seek to end");
        self.writer
            .write_all(&(bytes.len() as u32).to_le_bytes())
            .and_then(|_| self.writer.write_all(&bytes))
            .and_then(|_| self.writer.flush())
            .expect("block log append failed");

        self.offsets.push(offset);
        self.head_id = Some(block.id());
        self.head = Some(block.clone());
    }

    /// Reads the block at height `block_num`, or `None` if the log does not reach it.
    pub fn read_block_by_num(&self, block_num: BlockNum) -> Result<Option<SignedBlock>, ChainError> {
        if block_num.int() == 0 {
            return Ok(None);
        }
        let index = (block_num.int() - 1) as usize;
        let offset = match self.offsets.get(index) {
            Some(offset) => *offset,
            None => return Ok(None),
        };

        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start(offset))?;
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let mut bytes = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
        reader.read_exact(&mut bytes)?;
        let block = SignedBlock::try_from_slice(&bytes)
            .map_err(|err| ChainError::Io(format!("corrupt block log entry: {}", err)))?;
        Ok(Some(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::{CryptoHash, Name, SignatureBytes, Timestamp};
    use crate::types::block::BlockHeader;
    use tempfile::TempDir;

    fn test_block(previous: BlockId, timestamp: u64) -> SignedBlock {
        SignedBlock {
            header: BlockHeader {
                timestamp: Timestamp::from_millis(timestamp),
                producer: Name::new("genesis"),
                confirmed: 0,
                previous,
                transaction_mroot: CryptoHash::zero(),
                action_mroot: CryptoHash::zero(),
                schedule_version: 0,
                new_producers: None,
            },
            producer_signature: SignatureBytes::zero(),
            transactions: Vec::new(),
        }
    }

    #[test]
    fn appended_blocks_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let genesis = test_block(BlockId::zero(), 0);
        let second = test_block(genesis.id(), 500);

        {
            let mut log = BlockLog::open(dir.path()).unwrap();
            log.append(&genesis);
            log.append(&second);
        }

        let log = BlockLog::open(dir.path()).unwrap();
        assert_eq!(log.head_block_num(), Some(BlockNum::new(2)));
        assert_eq!(log.read_block_by_num(BlockNum::new(1)).unwrap().unwrap().id(), genesis.id());
        assert_eq!(log.read_block_by_num(BlockNum::new(2)).unwrap().unwrap().id(), second.id());
        assert_eq!(log.read_block_by_num(BlockNum::new(3)).unwrap(), None);
    }

    #[test]
    #[should_panic(expected = "does not link")]
    fn append_requires_linkage() {
        let dir = TempDir::new().unwrap();
        let mut log = BlockLog::open(dir.path()).unwrap();
        log.append(&test_block(BlockId::zero(), 0));
        log.append(&test_block(BlockId::zero(), 500));
    }
}
