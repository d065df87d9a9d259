use heap::HeapSettings;

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub heap: HeapSettings,
    /// Initial slot count of the handle table; rounded up to a power of two.
    pub handle_capacity: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            heap: HeapSettings::default(),
            handle_capacity: 256,
        }
    }
}

impl RuntimeSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        self.heap.validate()?;
        if self.handle_capacity == 0 {
            return Err("handle_capacity must be > 0");
        }
        if self.handle_capacity > 1 << 30 {
            return Err("handle_capacity must be <= 2^30");
        }
        Ok(())
    }
}
