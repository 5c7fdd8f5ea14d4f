//! Slab storage for in-flight messages.
//!
//! Queues and pending tables hold small copyable [`MessageHandle`]s instead
//! of owning the messages, so one message can sit in an outgoing queue, the
//! pending-by-msg-id table and the check list at once. Handles carry a
//! generation: a handle to a removed (or recycled) slot simply resolves to
//! `None`, so stale entries in any queue are harmless.

use std::collections::VecDeque;

use crate::message::OutgoingMessage;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MessageHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    message: Option<OutgoingMessage>,
}

#[derive(Default)]
pub struct MessageArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl MessageArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, message: OutgoingMessage) -> MessageHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.message = Some(message);
            MessageHandle { index, generation: slot.generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, message: Some(message) });
            MessageHandle { index, generation: 0 }
        }
    }

    pub fn get(&self, handle: MessageHandle) -> Option<&OutgoingMessage> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.message.as_ref())
    }

    pub fn get_mut(&mut self, handle: MessageHandle) -> Option<&mut OutgoingMessage> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.message.as_mut())
    }

    pub fn remove(&mut self, handle: MessageHandle) -> Option<OutgoingMessage> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)?;
        let message = slot.message.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(message)
    }

    /// Iterate live messages.
    pub fn iter(&self) -> impl Iterator<Item = (MessageHandle, &OutgoingMessage)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.message
                .as_ref()
                .map(|m| (MessageHandle { index: i as u32, generation: s.generation }, m))
        })
    }

    /// Remove every message satisfying `predicate` and return them.
    pub fn drain_where(
        &mut self,
        mut predicate: impl FnMut(&OutgoingMessage) -> bool,
    ) -> Vec<OutgoingMessage> {
        let mut out = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.message.as_ref().is_some_and(&mut predicate) {
                if let Some(message) = slot.message.take() {
                    slot.generation = slot.generation.wrapping_add(1);
                    self.free.push(index as u32);
                    self.len -= 1;
                    out.push(message);
                }
            }
        }
        out
    }
}

/// FIFO queue of handles. Stale handles are skipped on pop, never an error.
#[derive(Default)]
pub struct OutQueue {
    order: VecDeque<MessageHandle>,
}

impl OutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: MessageHandle) {
        self.order.push_back(handle);
    }

    pub fn push_front(&mut self, handle: MessageHandle) {
        self.order.push_front(handle);
    }

    /// Pop the oldest handle that still resolves to a live message.
    pub fn pop_live(&mut self, arena: &MessageArena) -> Option<MessageHandle> {
        while let Some(handle) = self.order.pop_front() {
            if arena.get(handle).is_some() {
                return Some(handle);
            }
        }
        None
    }

    /// Peek at the oldest live handle without removing it.
    pub fn peek_live(&mut self, arena: &MessageArena) -> Option<MessageHandle> {
        while let Some(&handle) = self.order.front() {
            if arena.get(handle).is_some() {
                return Some(handle);
            }
            self.order.pop_front();
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> OutgoingMessage {
        OutgoingMessage::object("data", vec![0; n], true)
    }

    #[test]
    fn stale_handles_resolve_to_none() {
        let mut arena = MessageArena::new();
        let h = arena.insert(msg(4));
        assert!(arena.get(h).is_some());
        arena.remove(h).unwrap();
        assert!(arena.get(h).is_none());

        // The slot is recycled under a new generation.
        let h2 = arena.insert(msg(8));
        assert!(arena.get(h).is_none());
        assert_eq!(arena.get(h2).unwrap().serialized_len(), 8);
    }

    #[test]
    fn queue_skips_removed_messages() {
        let mut arena = MessageArena::new();
        let mut queue = OutQueue::new();
        let a = arena.insert(msg(1));
        let b = arena.insert(msg(2));
        let c = arena.insert(msg(3));
        queue.push(a);
        queue.push(b);
        queue.push(c);

        arena.remove(b).unwrap();
        assert_eq!(queue.pop_live(&arena), Some(a));
        assert_eq!(queue.pop_live(&arena), Some(c));
        assert_eq!(queue.pop_live(&arena), None);
    }

    #[test]
    fn drain_where_removes_matches() {
        let mut arena = MessageArena::new();
        arena.insert(msg(1));
        arena.insert(msg(100));
        arena.insert(msg(2));
        let big = arena.drain_where(|m| m.serialized_len() > 10);
        assert_eq!(big.len(), 1);
        assert_eq!(arena.len(), 2);
    }
}
