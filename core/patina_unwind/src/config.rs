use alloc::vec::Vec;

/// Default kill switch for runaway or cyclic stacks.
pub const DEFAULT_MAX_FRAMES: usize = 128;

/// Knobs for a single [`Unwinder`](crate::Unwinder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwinderConfig {
    /// Walks stop with `FrameLimitExceeded` after this many frames.
    pub max_frames: usize,

    /// Report a misaligned caller stack pointer as an error instead of a warning.
    pub strict_alignment: bool,

    /// Return addresses that mark the base of the stack. Zero always does.
    pub sentinels: Vec<u64>,
}

impl Default for UnwinderConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAMES, false, Vec::new())
    }
}

impl UnwinderConfig {
    pub fn new(max_frames: usize, strict_alignment: bool, sentinels: Vec<u64>) -> Self {
        Self { max_frames, strict_alignment, sentinels }
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    pub fn with_strict_alignment(mut self, strict_alignment: bool) -> Self {
        self.strict_alignment = strict_alignment;
        self
    }

    pub fn with_sentinel(mut self, address: u64) -> Self {
        self.sentinels.push(address);
        self
    }

    pub fn is_sentinel(&self, address: u64) -> bool {
        address == 0 || self.sentinels.contains(&address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = UnwinderConfig::default();
        assert_eq!(config.max_frames, DEFAULT_MAX_FRAMES);
        assert!(!config.strict_alignment);
        assert!(config.is_sentinel(0));
        assert!(!config.is_sentinel(0x1000));
    }

    #[test]
    fn builder_helpers() {
        let config = UnwinderConfig::default().with_max_frames(4).with_strict_alignment(true).with_sentinel(0xDEAD);
        assert_eq!(config, UnwinderConfig::new(4, true, alloc::vec![0xDEAD]));
        assert!(config.is_sentinel(0xDEAD));
    }
}
