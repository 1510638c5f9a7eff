//! The byte-oriented value stack.
//!
//! One buffer carries expression temporaries, routine arguments and results,
//! and native-call marshalling. The stack itself is kind-agnostic; every
//! call site states the size and kind it transfers, and the engine derives
//! both strictly from register families. Debug builds mirror pushes on a
//! shadow tag stack and assert that pops match.

use crate::error::Fault;
use crate::register::{Kind, Value};

pub const DEFAULT_STACK_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct ValueStack {
    bytes: Vec<u8>,
    sp: usize,
    #[cfg(debug_assertions)]
    tags: Vec<(Kind, usize)>,
}

impl ValueStack {
    pub fn new(capacity: usize) -> Self {
        ValueStack {
            bytes: vec![0; capacity],
            sp: 0,
            #[cfg(debug_assertions)]
            tags: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Current stack pointer (byte offset of the next free slot).
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Push a span. Fails with `StackOverflow` before writing anything, so
    /// the pointer is unchanged on error.
    pub fn push_bytes(&mut self, kind: Kind, span: &[u8]) -> Result<(), Fault> {
        let free = self.bytes.len() - self.sp;
        if span.len() > free {
            return Err(Fault::StackOverflow {
                need: span.len(),
                free,
                capacity: self.bytes.len(),
            });
        }
        self.bytes[self.sp..self.sp + span.len()].copy_from_slice(span);
        self.sp += span.len();
        #[cfg(debug_assertions)]
        self.tags.push((kind, span.len()));
        #[cfg(not(debug_assertions))]
        let _ = kind;
        Ok(())
    }

    /// Pop `size` bytes, returning the span that was on top.
    pub fn pop_bytes(&mut self, kind: Kind, size: usize) -> Result<&[u8], Fault> {
        if size > self.sp {
            return Err(Fault::StackUnderflow {
                need: size,
                have: self.sp,
            });
        }
        #[cfg(debug_assertions)]
        {
            let top = self.tags.pop();
            debug_assert_eq!(
                top,
                Some((kind, size)),
                "stack pop does not mirror the push that produced the span"
            );
        }
        #[cfg(not(debug_assertions))]
        let _ = kind;
        self.sp -= size;
        Ok(&self.bytes[self.sp..self.sp + size])
    }

    pub fn push_value(&mut self, value: Value) -> Result<(), Fault> {
        let (bytes, len) = value.to_le_bytes();
        self.push_bytes(value.kind(), &bytes[..len])
    }

    pub fn pop_value(&mut self, kind: Kind) -> Result<Value, Fault> {
        let bytes = self.pop_bytes(kind, kind.width())?;
        Ok(Value::from_le_bytes(kind, bytes))
    }

    /// Read `size` bytes in place at an absolute byte position below the
    /// stack pointer. Used for frame-relative locals; the shadow tags are
    /// not consulted.
    pub fn peek_at(&self, at: usize, size: usize) -> Result<&[u8], Fault> {
        let end = at.checked_add(size).unwrap_or(usize::MAX);
        if end > self.sp {
            return Err(Fault::StackUnderflow {
                need: end,
                have: self.sp,
            });
        }
        Ok(&self.bytes[at..end])
    }

    /// Overwrite live bytes in place at an absolute position. The slot must
    /// already have been pushed.
    pub fn poke_at(&mut self, at: usize, span: &[u8]) -> Result<(), Fault> {
        let end = at.checked_add(span.len()).unwrap_or(usize::MAX);
        if end > self.sp {
            return Err(Fault::StackUnderflow {
                need: end,
                have: self.sp,
            });
        }
        self.bytes[at..end].copy_from_slice(span);
        Ok(())
    }
}

impl Default for ValueStack {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn push_pop_restores_pointer() {
        let mut stack = ValueStack::default();
        let before = stack.sp();
        stack.push_bytes(Kind::Uint, &7u64.to_le_bytes()).unwrap();
        stack.push_bytes(Kind::Byte, &[3]).unwrap();
        assert_eq!(stack.sp(), before + 9);

        assert_eq!(stack.pop_bytes(Kind::Byte, 1).unwrap(), &[3]);
        assert_eq!(
            stack.pop_bytes(Kind::Uint, 8).unwrap(),
            &7u64.to_le_bytes()
        );
        assert_eq!(stack.sp(), before);
    }

    #[test]
    fn overflow_leaves_pointer_unchanged() {
        let mut stack = ValueStack::new(DEFAULT_STACK_CAPACITY);
        let chunk = [0u8; 8];
        for _ in 0..16 {
            stack.push_bytes(Kind::Uint, &chunk).unwrap();
        }
        let full = stack.sp();
        let err = stack.push_bytes(Kind::Uint, &chunk).unwrap_err();
        assert!(matches!(err, Fault::StackOverflow { .. }));
        assert_eq!(stack.sp(), full);
    }

    #[test]
    fn underflow_reports_need_and_have() {
        let mut stack = ValueStack::default();
        stack.push_bytes(Kind::Byte, &[1]).unwrap();
        let err = stack.pop_bytes(Kind::Uint, 8).unwrap_err();
        assert_eq!(err, Fault::StackUnderflow { need: 8, have: 1 });
    }

    #[test]
    fn peek_and_poke_access_live_bytes_only() {
        let mut stack = ValueStack::default();
        stack.push_bytes(Kind::Uint, &1u64.to_le_bytes()).unwrap();
        stack.push_bytes(Kind::Uint, &2u64.to_le_bytes()).unwrap();

        assert_eq!(stack.peek_at(8, 8).unwrap(), &2u64.to_le_bytes());
        stack.poke_at(0, &9u64.to_le_bytes()).unwrap();
        assert_eq!(stack.peek_at(0, 8).unwrap(), &9u64.to_le_bytes());

        assert!(stack.peek_at(16, 8).is_err());
        assert!(stack.poke_at(12, &[0u8; 8]).is_err());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "stack pop does not mirror")]
    fn mismatched_pop_trips_shadow_tags() {
        let mut stack = ValueStack::default();
        stack.push_bytes(Kind::Uint, &1u64.to_le_bytes()).unwrap();
        stack.push_bytes(Kind::Byte, &[1]).unwrap();
        // Popping 8 bytes over a 1-byte span must trip the shadow check.
        let _ = stack.pop_bytes(Kind::Uint, 8);
    }
}
