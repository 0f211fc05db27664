//! In-memory dead-letter queue for testing.

use async_trait::async_trait;
use parking_lot::Mutex;

use sagabox_core::port::{DeadLetter, DeadLetterQueue, StoreError};

#[derive(Default)]
pub struct MemoryDeadLetterQueue {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterQueue for MemoryDeadLetterQueue {
    async fn push(&self, letter: DeadLetter) -> Result<(), StoreError> {
        self.letters.lock().push(letter);
        Ok(())
    }
}
