// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Mutex;

const INITIAL_BUFFER_CAPACITY: usize = 256;

// Keeping more idle buffers than this just holds memory hostage.
const MAX_POOLED_BUFFERS: usize = 1024;

/// Pool of reusable byte buffers shared between the syslog renderer and the
/// sink workers.
///
/// A buffer checked out with [`BufferPool::get`] has exactly one owner until
/// it is handed back with [`BufferPool::put`]; the renderer transfers
/// ownership through the sink channel and the sink returns the buffer after
/// its final write.
#[derive(Debug, Default)]
pub(crate) struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns an empty buffer, reusing a previously returned one when
    /// available.
    pub(crate) fn get(&self) -> Vec<u8> {
        #[allow(clippy::expect_used)]
        let mut buffers = self.buffers.lock().expect("lock poisoned");
        buffers
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(INITIAL_BUFFER_CAPACITY))
    }

    /// Returns a buffer to the pool. The contents are cleared but the
    /// allocation is kept for the next checkout.
    pub(crate) fn put(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        #[allow(clippy::expect_used)]
        let mut buffers = self.buffers.lock().expect("lock poisoned");
        if buffers.len() < MAX_POOLED_BUFFERS {
            buffers.push(buffer);
        }
    }
}
