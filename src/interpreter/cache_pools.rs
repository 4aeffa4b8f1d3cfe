use super::value_stack::RegisterStack;
use std::cell::RefCell;

/// Pools past this depth just drop their returns.
pub(crate) const RECYCLE_LIMIT: usize = 64;

/// Scratch buffers recycled across calls and coroutine hops, so the hot
/// paths stop reallocating register files and concat buffers. Shared by
/// `&self` behind `RefCell`; borrows never outlive a single pop or push.
#[derive(Default)]
pub(crate) struct CachePools {
    register_stacks: RefCell<Vec<RegisterStack>>,
    byte_buffers: RefCell<Vec<Vec<u8>>>,
}

impl CachePools {
    pub(crate) fn create_register_stack(&self) -> RegisterStack {
        self.register_stacks.borrow_mut().pop().unwrap_or_default()
    }

    pub(crate) fn store_register_stack(&self, mut register_stack: RegisterStack) {
        let mut pool = self.register_stacks.borrow_mut();

        if pool.len() < RECYCLE_LIMIT {
            register_stack.clear();
            pool.push(register_stack);
        }
    }

    pub(crate) fn create_byte_buffer(&self) -> Vec<u8> {
        self.byte_buffers.borrow_mut().pop().unwrap_or_default()
    }

    pub(crate) fn store_byte_buffer(&self, mut buffer: Vec<u8>) {
        let mut pool = self.byte_buffers.borrow_mut();

        if pool.len() < RECYCLE_LIMIT {
            buffer.clear();
            pool.push(buffer);
        }
    }
}
