//! Per-block replicated text run.
//!
//! Each block is a small sequence CRDT: a forest of character elements
//! ordered by insertion identity, with deletions kept as tombstones.
//! Concurrent inserts at the same anchor are ordered by `(clock, client)`
//! descending, which gives every replica the same total order without
//! coordination. Whole-block updates are modeled as generations — each
//! update starts a fresh element list keyed by `(clock, client)`, and
//! only the maximum generation materializes (last writer wins).

use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::op::{BlockId, ClientId, ElementId, GenId, InsertOrigin, OpId};

/// Why an operation could not be folded in yet. The document buffers
/// the operation and retries once more of the log has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Defer {
    MissingOrigin,
    MissingTarget,
    MissingGeneration,
}

/// One inserted character with its tombstone flag.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Element {
    id: ElementId,
    ch: char,
    /// Clock of the inserting operation; orders concurrent siblings.
    clock: u64,
    /// Anchor this element was inserted after (`None` = generation head).
    origin: Option<ElementId>,
    deleted: bool,
}

impl Element {
    fn client(&self) -> &ClientId {
        &self.id.op.client
    }
}

/// One content generation: a flat element list in converged order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Generation {
    elements: Vec<Element>,
}

impl Generation {
    fn index_of(&self, id: &ElementId) -> Option<usize> {
        self.elements.iter().position(|e| &e.id == id)
    }

    fn visible_len(&self) -> usize {
        self.elements.iter().filter(|e| !e.deleted).count()
    }

    fn content(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.ch)
            .collect()
    }

    /// Id of the `position`-th visible element.
    fn visible_element(&self, position: usize) -> Option<&Element> {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .nth(position)
    }

    /// Splice a run of elements in after `origin`, skipping past any
    /// concurrent sibling subtrees that outrank the run.
    ///
    /// The scan is the RGA integration rule: starting right after the
    /// origin, an element anchored before our origin ends the scan, a
    /// sibling (same origin) ends it only if we outrank it, and
    /// anything anchored deeper is part of a winning sibling's subtree
    /// and gets skipped along with it.
    fn integrate(&mut self, run: Vec<Element>, origin: Option<&ElementId>) -> Result<(), Defer> {
        let origin_idx: isize = match origin {
            None => -1,
            Some(id) => self.index_of(id).ok_or(Defer::MissingOrigin)? as isize,
        };

        let head = match run.first() {
            Some(h) => h,
            None => return Ok(()),
        };

        let mut i = (origin_idx + 1) as usize;
        while i < self.elements.len() {
            let x = &self.elements[i];
            let x_origin_idx: isize = match &x.origin {
                None => -1,
                // Origins are never removed (tombstones persist), so a
                // missing index here would mean a corrupted list.
                Some(id) => match self.index_of(id) {
                    Some(idx) => idx as isize,
                    None => return Err(Defer::MissingOrigin),
                },
            };

            if x_origin_idx < origin_idx {
                break;
            }
            if x_origin_idx == origin_idx {
                if (x.clock, x.client()) > (head.clock, head.client()) {
                    i += 1;
                } else {
                    break;
                }
            } else {
                i += 1;
            }
        }

        self.elements.splice(i..i, run);
        Ok(())
    }
}

/// A block's full replicated state across all generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    generations: BTreeMap<GenId, Generation>,
}

impl Block {
    pub fn new() -> Self {
        let mut generations = BTreeMap::new();
        generations.insert(GenId::Initial, Generation::default());
        Self { generations }
    }

    /// The generation that materializes: maximum `(clock, client)`.
    pub fn winning_generation(&self) -> &GenId {
        // `new()` always seeds `Initial`, so the map is never empty.
        self.generations
            .keys()
            .next_back()
            .unwrap_or(&GenId::Initial)
    }

    pub fn visible_len(&self) -> usize {
        self.winning().visible_len()
    }

    pub fn content(&self) -> String {
        self.winning().content()
    }

    fn winning(&self) -> &Generation {
        let key = self.winning_generation().clone();
        &self.generations[&key]
    }

    /// Resolve a visible position in the winning generation to an
    /// identity anchor for a new insert.
    pub fn resolve_origin(&self, block: &BlockId, position: usize) -> Result<InsertOrigin, EngineError> {
        let generation = self.winning_generation().clone();
        let current = &self.generations[&generation];
        let len = current.visible_len();
        if position > len {
            return Err(EngineError::InvalidPosition {
                block: block.clone(),
                position,
                len,
            });
        }
        if position == 0 {
            return Ok(InsertOrigin::Start { generation });
        }
        // `position <= len` and `position > 0`, so the element exists.
        let anchor = current
            .visible_element(position - 1)
            .map(|e| e.id.clone())
            .ok_or(EngineError::InvalidPosition {
                block: block.clone(),
                position,
                len,
            })?;
        Ok(InsertOrigin::After { element: anchor })
    }

    /// Resolve a visible range in the winning generation to the element
    /// identities a delete will tombstone.
    pub fn resolve_targets(
        &self,
        block: &BlockId,
        position: usize,
        length: usize,
    ) -> Result<Vec<ElementId>, EngineError> {
        let current = self.winning();
        let len = current.visible_len();
        if position + length > len {
            return Err(EngineError::InvalidPosition {
                block: block.clone(),
                position,
                len,
            });
        }
        Ok(current
            .elements
            .iter()
            .filter(|e| !e.deleted)
            .skip(position)
            .take(length)
            .map(|e| e.id.clone())
            .collect())
    }

    /// Fold a remote (or freshly created local) insert into the block.
    pub(crate) fn integrate_insert(
        &mut self,
        op: &OpId,
        origin: &InsertOrigin,
        content: &str,
        clock: u64,
    ) -> Result<(), Defer> {
        let (gen_key, anchor) = match origin {
            InsertOrigin::Start { generation } => (generation.clone(), None),
            InsertOrigin::After { element } => {
                let gen_key = self
                    .generation_of(element)
                    .ok_or(Defer::MissingOrigin)?
                    .clone();
                (gen_key, Some(element.clone()))
            }
        };

        let generation = self
            .generations
            .get_mut(&gen_key)
            .ok_or(Defer::MissingGeneration)?;

        // Elements after the first chain off their left neighbor so the
        // run stays contiguous under any later concurrent insert.
        let mut run = Vec::with_capacity(content.chars().count());
        let mut prev: Option<ElementId> = anchor.clone();
        for (offset, ch) in content.chars().enumerate() {
            let id = ElementId::new(op.clone(), offset as u32);
            run.push(Element {
                id: id.clone(),
                ch,
                clock,
                origin: prev,
                deleted: false,
            });
            prev = Some(id);
        }

        generation.integrate(run, anchor.as_ref())
    }

    /// Tombstone the named elements. All targets must be present before
    /// any of them is marked, so a causally early delete defers as a
    /// whole instead of half-applying.
    pub(crate) fn integrate_delete(&mut self, targets: &[ElementId]) -> Result<(), Defer> {
        let mut found: Vec<(GenId, usize)> = Vec::with_capacity(targets.len());
        for target in targets {
            let gen_key = self.generation_of(target).ok_or(Defer::MissingTarget)?.clone();
            let idx = self.generations[&gen_key]
                .index_of(target)
                .ok_or(Defer::MissingTarget)?;
            found.push((gen_key, idx));
        }
        for (gen_key, idx) in found {
            if let Some(generation) = self.generations.get_mut(&gen_key) {
                generation.elements[idx].deleted = true;
            }
        }
        Ok(())
    }

    /// Start a new generation for a whole-block update. Losing
    /// generations stay in the map so inserts anchored inside them can
    /// still integrate (and win again if a newer update loses later).
    pub(crate) fn integrate_update(&mut self, op: &OpId, content: &str, clock: u64) {
        let gen_key = GenId::Update {
            clock,
            client: op.client.clone(),
        };
        let mut generation = Generation::default();
        let mut prev: Option<ElementId> = None;
        for (offset, ch) in content.chars().enumerate() {
            let id = ElementId::new(op.clone(), offset as u32);
            generation.elements.push(Element {
                id: id.clone(),
                ch,
                clock,
                origin: prev,
                deleted: false,
            });
            prev = Some(id);
        }
        self.generations.insert(gen_key, generation);
    }

    fn generation_of(&self, element: &ElementId) -> Option<&GenId> {
        self.generations
            .iter()
            .find(|(_, g)| g.index_of(element).is_some())
            .map(|(k, _)| k)
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}
