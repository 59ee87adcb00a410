/// Reassembly of size-limited NOTIFY payloads.
///
/// PostgreSQL caps a NOTIFY payload at 8000 bytes, so the trigger function
/// splits each change notice into parts shaped as
///
/// ```text
/// <msgId>:<partCount>:<partIndex>:<chunk>
/// ```
///
/// with `partIndex` counting from 1. Only the first three colons delimit the
/// header; the chunk is everything after them, colons included. Parts of one
/// message may arrive in any order and parts of different messages may
/// interleave.
///
/// # Examples
///
/// ```
/// use livepg::reassembler::{split_payload, Reassembler};
///
/// let parts = split_payload("m1", r#"{"table":"users"}"#, 5);
/// let mut reassembler = Reassembler::new(None);
///
/// let mut done = None;
/// for part in parts.iter().rev() {
///     done = reassembler.push(part).unwrap();
/// }
/// assert_eq!(done.as_deref(), Some(r#"{"table":"users"}"#));
/// assert_eq!(reassembler.pending_count(), 0);
/// ```

use crate::error::{LiveError, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Parts received so far for one message id.
#[derive(Debug)]
struct PendingReassembly {
    parts: Vec<Option<String>>,
    filled: usize,
    started: Instant,
}

impl PendingReassembly {
    fn new(expected_parts: usize) -> Self {
        PendingReassembly {
            parts: vec![None; expected_parts],
            filled: 0,
            started: Instant::now(),
        }
    }

    fn store(&mut self, index: usize, chunk: &str) {
        let slot = &mut self.parts[index];
        if slot.is_none() {
            self.filled += 1;
        }
        *slot = Some(chunk.to_string());
    }

    fn is_complete(&self) -> bool {
        self.filled == self.parts.len()
    }

    fn concat(self) -> String {
        self.parts.into_iter().flatten().collect()
    }
}

/// Header fields of one raw part.
#[derive(Debug, PartialEq)]
struct PartHeader<'a> {
    msg_id: &'a str,
    part_count: usize,
    part_index: usize,
    chunk: &'a str,
}

fn parse_part(raw: &str) -> Result<PartHeader<'_>> {
    let malformed = |why: &str| LiveError::MalformedNotice(format!("{why}: {raw}"));

    let mut fields = raw.splitn(4, ':');
    let (Some(msg_id), Some(count), Some(index), Some(chunk)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(malformed("expected three header delimiters"));
    };

    let part_count: usize = count.parse().map_err(|_| malformed("part count is not a number"))?;
    let part_index: usize = index.parse().map_err(|_| malformed("part index is not a number"))?;

    if part_count == 0 {
        return Err(malformed("part count is zero"));
    }
    if part_index == 0 || part_index > part_count {
        return Err(malformed("part index out of range"));
    }

    Ok(PartHeader {
        msg_id,
        part_count,
        part_index,
        chunk,
    })
}

/// Collects notice parts keyed by message id.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: HashMap<String, PendingReassembly>,
    timeout: Option<Duration>,
}

impl Reassembler {
    /// `timeout` bounds how long an incomplete message is retained, checked
    /// by [`Reassembler::prune_stale`]. `None` retains it indefinitely.
    pub fn new(timeout: Option<Duration>) -> Self {
        Reassembler {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Consume one raw part. Returns the full payload once every part of its
    /// message has arrived, and `None` while parts are missing.
    pub fn push(&mut self, raw: &str) -> Result<Option<String>> {
        let part = parse_part(raw)?;

        if part.part_count == 1 {
            return Ok(Some(part.chunk.to_string()));
        }

        let entry = self
            .pending
            .entry(part.msg_id.to_string())
            .or_insert_with(|| PendingReassembly::new(part.part_count));

        if entry.parts.len() != part.part_count {
            return Err(LiveError::MalformedNotice(format!(
                "message {} announced {} parts, part claims {}",
                part.msg_id,
                entry.parts.len(),
                part.part_count
            )));
        }

        entry.store(part.part_index - 1, part.chunk);
        if !entry.is_complete() {
            return Ok(None);
        }

        Ok(self.pending.remove(part.msg_id).map(PendingReassembly::concat))
    }

    /// Number of messages still waiting for parts.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop incomplete messages older than the configured timeout and
    /// return their ids.
    pub fn prune_stale(&mut self) -> Vec<String> {
        let Some(timeout) = self.timeout else {
            return Vec::new();
        };
        let now = Instant::now();
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.started) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.pending.remove(id);
        }
        stale
    }
}

/// Split a payload into wire parts of at most `chunk_chars` characters each.
/// This is the encoder the trigger function implements in PL/pgSQL.
pub fn split_payload(msg_id: &str, payload: &str, chunk_chars: usize) -> Vec<String> {
    let chars: Vec<char> = payload.chars().collect();
    let chunks: Vec<String> = if chars.is_empty() {
        vec![String::new()]
    } else {
        chars
            .chunks(chunk_chars.max(1))
            .map(|c| c.iter().collect())
            .collect()
    };
    let count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("{msg_id}:{count}:{}:{chunk}", i + 1))
        .collect()
}
