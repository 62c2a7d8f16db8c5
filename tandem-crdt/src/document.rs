//! Per-client document replica.
//!
//! `CrdtDocument` turns local edits into well-formed operations and
//! folds remote operations into a converged state, independent of
//! delivery order within causal constraints and independent of
//! duplicate delivery. It owns the Lamport clock, the applied-id set
//! that makes every operation idempotent, and a causal buffer for
//! remote operations whose anchors have not arrived yet.
//!
//! The replica does no networking and no retry — shipping operations
//! is the session layer's job.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::block::{Block, Defer};
use crate::error::EngineError;
use crate::op::{BlockId, ClientId, GenId, InsertOrigin, Operation, OperationKind, OpId};
use crate::snapshot::Snapshot;

/// Materialized content: block id → visible text.
pub type DocumentContent = BTreeMap<BlockId, String>;

/// One replica of a collaboratively edited document.
#[derive(Debug, Clone)]
pub struct CrdtDocument {
    client: ClientId,
    clock: u64,
    next_seq: u64,
    blocks: HashMap<BlockId, Block>,
    /// Ids of every operation folded in, local and remote.
    applied: HashSet<OpId>,
    /// Applied operations in application order.
    log: Vec<Operation>,
    /// Remote operations waiting for their causal anchors.
    pending: Vec<Operation>,
}

impl CrdtDocument {
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            clock: 0,
            next_seq: 1,
            blocks: HashMap::new(),
            applied: HashSet::new(),
            log: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Rebuild a replica from a bootstrap snapshot.
    ///
    /// The snapshot's operations may arrive in any order; they are fed
    /// through the normal apply path so buffering resolves them. If the
    /// local client already appears in the log (a rejoin under the same
    /// replica id), the sequence counter resumes past its old ops so
    /// fresh operation ids stay globally unique.
    pub fn from_snapshot(client: ClientId, snapshot: &Snapshot) -> Self {
        let mut doc = Self::new(client);
        for op in &snapshot.operations {
            doc.apply_operation(op);
        }
        if !doc.pending.is_empty() {
            log::warn!(
                "snapshot left {} operation(s) unresolved; upstream log is incomplete",
                doc.pending.len()
            );
        }
        if doc.clock < snapshot.clock {
            doc.clock = snapshot.clock;
        }
        let max_seq = snapshot
            .operations
            .iter()
            .filter(|op| op.client() == &doc.client)
            .map(|op| op.id.seq)
            .max()
            .unwrap_or(0);
        doc.next_seq = max_seq + 1;
        if doc.content() != snapshot.content {
            log::warn!("snapshot materialized content disagrees with replayed log");
        }
        doc
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Number of remote operations still waiting on causal anchors.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // ── Local edits ──────────────────────────────────────────────

    /// Insert `content` at a visible `position` of `block`.
    ///
    /// Resolves the position to an identity anchor, records the
    /// operation in the log, and returns it for transmission.
    pub fn insert(
        &mut self,
        block: &BlockId,
        position: usize,
        content: &str,
    ) -> Result<Operation, EngineError> {
        if content.is_empty() {
            return Err(EngineError::MalformedOperation(
                "insert with empty content".into(),
            ));
        }
        if !self.blocks.contains_key(block) && position > 0 {
            return Err(EngineError::UnknownBlock(block.clone()));
        }
        let entry = self.blocks.entry(block.clone()).or_default();
        let origin = entry.resolve_origin(block, position)?;

        let op = Operation {
            id: OpId::new(self.client.clone(), self.take_seq()),
            block: block.clone(),
            clock: self.tick(),
            kind: OperationKind::Insert {
                origin,
                content: content.to_string(),
            },
        };
        self.apply_local(op.clone());
        Ok(op)
    }

    /// Tombstone `length` visible characters starting at `position`.
    pub fn delete(
        &mut self,
        block: &BlockId,
        position: usize,
        length: usize,
    ) -> Result<Operation, EngineError> {
        if length == 0 {
            return Err(EngineError::MalformedOperation("zero-length delete".into()));
        }
        let entry = self
            .blocks
            .get(block)
            .ok_or_else(|| EngineError::UnknownBlock(block.clone()))?;
        let targets = entry.resolve_targets(block, position, length)?;

        let op = Operation {
            id: OpId::new(self.client.clone(), self.take_seq()),
            block: block.clone(),
            clock: self.tick(),
            kind: OperationKind::Delete { targets },
        };
        self.apply_local(op.clone());
        Ok(op)
    }

    /// Replace the whole content of `block`; last writer wins.
    pub fn update(&mut self, block: &BlockId, content: &str) -> Result<Operation, EngineError> {
        let op = Operation {
            id: OpId::new(self.client.clone(), self.take_seq()),
            block: block.clone(),
            clock: self.tick(),
            kind: OperationKind::Update {
                content: content.to_string(),
            },
        };
        self.apply_local(op.clone());
        Ok(op)
    }

    // ── Remote merge ─────────────────────────────────────────────

    /// Fold one operation into the replica.
    ///
    /// Returns `false` without side effects when the operation has been
    /// seen before (idempotence). Otherwise the clock advances past the
    /// operation's clock and the operation either applies now or is
    /// buffered until its causal anchors arrive — both count as
    /// accepted and return `true`.
    pub fn apply_operation(&mut self, op: &Operation) -> bool {
        if self.applied.contains(&op.id) || self.pending.iter().any(|p| p.id == op.id) {
            log::trace!("dropping duplicate operation {}", op.id);
            return false;
        }
        self.observe(op.clock);

        match self.integrate(op) {
            Ok(()) => {
                self.record(op.clone());
                self.drain_pending();
            }
            Err(defer) => {
                log::debug!("buffering operation {} ({defer:?})", op.id);
                self.pending.push(op.clone());
            }
        }
        true
    }

    /// The causal suffix of the log: every applied operation with a
    /// clock beyond `clock`, in a deterministic order. Used for
    /// targeted resync when the gap is small.
    pub fn operations_since(&self, clock: u64) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .log
            .iter()
            .filter(|op| op.clock > clock)
            .cloned()
            .collect();
        ops.sort_by(|a, b| {
            (a.clock, &a.id.client, a.id.seq).cmp(&(b.clock, &b.id.client, b.id.seq))
        });
        ops
    }

    /// Materialize a checkpoint for bootstrap or full resync.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            clock: self.clock,
            operations: self.operations_since(0),
            content: self.content(),
        }
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn content(&self) -> DocumentContent {
        self.blocks
            .iter()
            .map(|(id, block)| (id.clone(), block.content()))
            .collect()
    }

    pub fn block_content(&self, block: &BlockId) -> Option<String> {
        self.blocks.get(block).map(|b| b.content())
    }

    // ── Internals ────────────────────────────────────────────────

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn observe(&mut self, remote: u64) {
        if remote > self.clock {
            self.clock = remote + 1;
        }
    }

    /// Locally produced operations resolved their anchors against live
    /// state, so integration cannot defer.
    fn apply_local(&mut self, op: Operation) {
        if let Err(defer) = self.integrate(&op) {
            // Unreachable by construction; keep the log honest if a
            // future edit breaks that.
            log::warn!("local operation {} deferred ({defer:?})", op.id);
            self.pending.push(op);
            return;
        }
        self.record(op);
    }

    fn record(&mut self, op: Operation) {
        self.applied.insert(op.id.clone());
        self.log.push(op);
    }

    fn integrate(&mut self, op: &Operation) -> Result<(), Defer> {
        match &op.kind {
            OperationKind::Insert { origin, content } => {
                if let Some(block) = self.blocks.get_mut(&op.block) {
                    return block.integrate_insert(&op.id, origin, content, op.clock);
                }
                // First sight of this block: only an insert at the head
                // of the initial generation can create it; anything
                // else is anchored on state that has not arrived.
                match origin {
                    InsertOrigin::Start {
                        generation: GenId::Initial,
                    } => {
                        let block = self.blocks.entry(op.block.clone()).or_default();
                        block.integrate_insert(&op.id, origin, content, op.clock)
                    }
                    _ => Err(Defer::MissingOrigin),
                }
            }
            OperationKind::Delete { targets } => match self.blocks.get_mut(&op.block) {
                Some(block) => block.integrate_delete(targets),
                None => Err(Defer::MissingTarget),
            },
            OperationKind::Update { content } => {
                let block = self.blocks.entry(op.block.clone()).or_default();
                block.integrate_update(&op.id, content, op.clock);
                Ok(())
            }
        }
    }

    /// Retry buffered operations until a full pass applies nothing.
    fn drain_pending(&mut self) {
        loop {
            let mut progressed = false;
            let waiting = std::mem::take(&mut self.pending);
            for op in waiting {
                match self.integrate(&op) {
                    Ok(()) => {
                        self.record(op);
                        progressed = true;
                    }
                    Err(_) => self.pending.push(op),
                }
            }
            if !progressed || self.pending.is_empty() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(client: &str) -> CrdtDocument {
        CrdtDocument::new(ClientId::new(client))
    }

    fn b1() -> BlockId {
        BlockId::new("b1")
    }

    // ── Local edits ──────────────────────────────────────────────

    #[test]
    fn test_insert_materializes_and_returns_op() {
        let mut d = doc("c1");
        let op = d.insert(&b1(), 0, "hello").unwrap();
        assert_eq!(op.clock, 1);
        assert_eq!(op.client(), &ClientId::new("c1"));
        assert_eq!(d.block_content(&b1()).unwrap(), "hello");

        d.insert(&b1(), 5, "!").unwrap();
        assert_eq!(d.block_content(&b1()).unwrap(), "hello!");
    }

    #[test]
    fn test_insert_invalid_position_fails_fast() {
        let mut d = doc("c1");
        d.insert(&b1(), 0, "ab").unwrap();
        let err = d.insert(&b1(), 3, "x").unwrap_err();
        assert!(matches!(err, EngineError::InvalidPosition { .. }));
        // Nothing was recorded.
        assert_eq!(d.block_content(&b1()).unwrap(), "ab");
        assert_eq!(d.clock(), 1);
    }

    #[test]
    fn test_insert_empty_content_is_malformed() {
        let mut d = doc("c1");
        assert!(matches!(
            d.insert(&b1(), 0, ""),
            Err(EngineError::MalformedOperation(_))
        ));
    }

    #[test]
    fn test_insert_unknown_block_nonzero_position() {
        let mut d = doc("c1");
        assert!(matches!(
            d.insert(&b1(), 2, "x"),
            Err(EngineError::UnknownBlock(_))
        ));
    }

    #[test]
    fn test_delete_range() {
        let mut d = doc("c1");
        d.insert(&b1(), 0, "abcdef").unwrap();
        d.delete(&b1(), 1, 3).unwrap();
        assert_eq!(d.block_content(&b1()).unwrap(), "aef");
    }

    #[test]
    fn test_delete_errors() {
        let mut d = doc("c1");
        assert!(matches!(
            d.delete(&b1(), 0, 1),
            Err(EngineError::UnknownBlock(_))
        ));
        d.insert(&b1(), 0, "ab").unwrap();
        assert!(matches!(
            d.delete(&b1(), 0, 0),
            Err(EngineError::MalformedOperation(_))
        ));
        assert!(matches!(
            d.delete(&b1(), 1, 5),
            Err(EngineError::InvalidPosition { .. })
        ));
    }

    #[test]
    fn test_update_replaces_block() {
        let mut d = doc("c1");
        d.insert(&b1(), 0, "draft").unwrap();
        d.update(&b1(), "final").unwrap();
        assert_eq!(d.block_content(&b1()).unwrap(), "final");
    }

    // ── Idempotence & clocks ─────────────────────────────────────

    #[test]
    fn test_apply_operation_idempotent() {
        let mut d1 = doc("c1");
        let op = d1.insert(&b1(), 0, "hi").unwrap();

        let mut d2 = doc("c2");
        assert!(d2.apply_operation(&op));
        let content_after_first = d2.content();
        let clock_after_first = d2.clock();

        assert!(!d2.apply_operation(&op));
        assert_eq!(d2.content(), content_after_first);
        assert_eq!(d2.clock(), clock_after_first);
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let mut d = doc("c1");
        let op = d.insert(&b1(), 0, "hi").unwrap();
        // The broadcast channel echoed our own operation back.
        assert!(!d.apply_operation(&op));
        assert_eq!(d.block_content(&b1()).unwrap(), "hi");
    }

    #[test]
    fn test_clock_monotonic_over_remote_ops() {
        let mut producer = doc("c1");
        let op1 = producer.insert(&b1(), 0, "aaaa").unwrap();
        let op2 = producer.insert(&b1(), 4, "bbbb").unwrap();

        let mut d = doc("c2");
        let mut prev = d.clock();
        for op in [&op2, &op1] {
            d.apply_operation(op);
            assert!(d.clock() >= prev.max(op.clock));
            prev = d.clock();
        }
    }

    #[test]
    fn test_clock_advances_past_remote() {
        let mut producer = doc("c1");
        for _ in 0..5 {
            producer.insert(&b1(), 0, "x").unwrap();
        }
        let op = producer.insert(&b1(), 0, "y").unwrap();
        assert_eq!(op.clock, 6);

        let mut d = doc("c2");
        d.apply_operation(&op);
        assert_eq!(d.clock(), 7);
    }

    // ── Causal buffering ─────────────────────────────────────────

    #[test]
    fn test_out_of_order_delivery_buffers_then_applies() {
        let mut producer = doc("c1");
        let op1 = producer.insert(&b1(), 0, "ab").unwrap();
        let op2 = producer.insert(&b1(), 1, "X").unwrap(); // anchored inside op1

        let mut d = doc("c2");
        assert!(d.apply_operation(&op2));
        assert_eq!(d.pending_len(), 1);
        assert_eq!(d.block_content(&b1()), None);

        assert!(d.apply_operation(&op1));
        assert_eq!(d.pending_len(), 0);
        assert_eq!(d.block_content(&b1()).unwrap(), "aXb");
    }

    #[test]
    fn test_buffered_duplicate_still_rejected() {
        let mut producer = doc("c1");
        producer.insert(&b1(), 0, "ab").unwrap();
        let op2 = producer.insert(&b1(), 1, "X").unwrap();

        let mut d = doc("c2");
        assert!(d.apply_operation(&op2));
        assert!(!d.apply_operation(&op2));
        assert_eq!(d.pending_len(), 1);
    }

    #[test]
    fn test_chained_buffering_drains_transitively() {
        let mut producer = doc("c1");
        let op1 = producer.insert(&b1(), 0, "a").unwrap();
        let op2 = producer.insert(&b1(), 1, "b").unwrap();
        let op3 = producer.insert(&b1(), 2, "c").unwrap();

        let mut d = doc("c2");
        d.apply_operation(&op3);
        d.apply_operation(&op2);
        assert_eq!(d.pending_len(), 2);
        d.apply_operation(&op1);
        assert_eq!(d.pending_len(), 0);
        assert_eq!(d.block_content(&b1()).unwrap(), "abc");
    }

    // ── Resync & snapshots ───────────────────────────────────────

    #[test]
    fn test_operations_since_returns_causal_suffix() {
        let mut d = doc("c1");
        d.insert(&b1(), 0, "a").unwrap(); // clock 1
        d.insert(&b1(), 1, "b").unwrap(); // clock 2
        d.insert(&b1(), 2, "c").unwrap(); // clock 3

        let suffix = d.operations_since(1);
        assert_eq!(suffix.len(), 2);
        assert!(suffix.iter().all(|op| op.clock > 1));
        assert!(suffix.windows(2).all(|w| w[0].clock <= w[1].clock));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut d = doc("c1");
        d.insert(&b1(), 0, "hello").unwrap();
        d.delete(&b1(), 0, 1).unwrap();
        d.update(&BlockId::new("b2"), "title").unwrap();

        let snap = d.snapshot();
        assert_eq!(snap.clock, d.clock());
        assert_eq!(snap.content, d.content());

        let restored = CrdtDocument::from_snapshot(ClientId::new("c9"), &snap);
        assert_eq!(restored.content(), d.content());
        assert!(restored.clock() >= snap.clock);
        assert_eq!(restored.pending_len(), 0);
    }

    #[test]
    fn test_from_snapshot_resumes_own_sequence() {
        let mut d = doc("c1");
        d.insert(&b1(), 0, "ab").unwrap();
        d.insert(&b1(), 2, "cd").unwrap();
        let snap = d.snapshot();

        // Same replica id rejoins from the snapshot; new ops must not
        // collide with the ids already in the log.
        let mut rejoined = CrdtDocument::from_snapshot(ClientId::new("c1"), &snap);
        let op = rejoined.insert(&b1(), 0, "x").unwrap();
        assert_eq!(op.id.seq, 3);
    }
}
