use crate::gpu::GpuBuffer;

/// Every buffer one probe run has allocated: the read-back buffer first, then
/// the test buffers in allocation order.
///
/// Dropping the set releases all of them (unmap if mapped, then destroy), so
/// early returns and panics inside the run cannot leak device memory.
pub struct BufferSet<B: GpuBuffer> {
    buffers: Vec<B>,
}

impl<B: GpuBuffer> BufferSet<B> {
    pub fn new(read_back: B) -> Self {
        BufferSet {
            buffers: vec![read_back],
        }
    }

    /// Takes ownership of a new test buffer and hands it back for filling.
    pub fn push_test(&mut self, buffer: B) -> &mut B {
        self.buffers.push(buffer);
        let last = self.buffers.len() - 1;
        &mut self.buffers[last]
    }

    pub fn read_back(&self) -> &B {
        &self.buffers[0]
    }

    pub fn read_back_mut(&mut self) -> &mut B {
        &mut self.buffers[0]
    }

    /// Most recently added buffer (the read-back buffer if no test buffer yet).
    pub fn latest(&self) -> &B {
        &self.buffers[self.buffers.len() - 1]
    }
}

impl<B: GpuBuffer> Drop for BufferSet<B> {
    fn drop(&mut self) {
        let count = self.buffers.len();
        while let Some(mut buffer) = self.buffers.pop() {
            if buffer.is_mapped() {
                buffer.unmap();
            }
            tracing::trace!("Releasing buffer {}", buffer.label());
            buffer.destroy();
        }
        tracing::debug!("Released {} probe buffer(s)", count);
    }
}
