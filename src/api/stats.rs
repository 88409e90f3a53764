//! Allocation statistics.

use crate::util::size::format_bytes;

/// Whether a query reads the running value or the high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatScope {
    /// Value as of now.
    Current,
    /// Highest value ever observed.
    Peak,
}

/// Memory accounted to a class or to the whole context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUse {
    /// Number of live blocks.
    pub blocks: usize,

    /// Bytes of user data.
    pub user_bytes: usize,

    /// Bytes of control overhead (names, headers, guard tags).
    pub control_bytes: usize,
}

impl MemoryUse {
    /// User plus control bytes.
    pub fn total_bytes(&self) -> usize {
        self.user_bytes + self.control_bytes
    }
}

/// Current and peak usage, maintained together.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct UsageStats {
    pub current: MemoryUse,
    pub peak: MemoryUse,
}

impl UsageStats {
    pub(crate) fn on_alloc(&mut self, user_bytes: usize, control_bytes: usize) {
        self.current.blocks += 1;
        self.current.user_bytes += user_bytes;
        self.current.control_bytes += control_bytes;
        self.peak.blocks = self.peak.blocks.max(self.current.blocks);
        self.peak.user_bytes = self.peak.user_bytes.max(self.current.user_bytes);
        self.peak.control_bytes = self.peak.control_bytes.max(self.current.control_bytes);
    }

    pub(crate) fn on_free(&mut self, user_bytes: usize, control_bytes: usize) {
        self.current.blocks = self.current.blocks.saturating_sub(1);
        self.current.user_bytes = self.current.user_bytes.saturating_sub(user_bytes);
        self.current.control_bytes = self.current.control_bytes.saturating_sub(control_bytes);
    }

    pub(crate) fn scoped(&self, scope: StatScope) -> MemoryUse {
        match scope {
            StatScope::Current => self.current,
            StatScope::Peak => self.peak,
        }
    }
}

/// Aggregated statistics for one context.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocStats {
    /// Live memory right now.
    pub current: MemoryUse,

    /// High-water marks.
    pub peak: MemoryUse,

    /// Allocations performed (including zeroed and resize-allocs).
    pub alloc_count: u64,

    /// Frees performed (including resize-frees).
    pub free_count: u64,
}

impl AllocStats {
    /// Blocks currently live.
    pub fn live_blocks(&self) -> usize {
        self.current.blocks
    }
}

impl std::fmt::Display for AllocStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Allocation Statistics:")?;
        writeln!(f, "  Live blocks:     {}", self.current.blocks)?;
        writeln!(
            f,
            "  User bytes:      {}",
            format_bytes(self.current.user_bytes)
        )?;
        writeln!(
            f,
            "  Control bytes:   {}",
            format_bytes(self.current.control_bytes)
        )?;
        writeln!(f, "  Peak blocks:     {}", self.peak.blocks)?;
        writeln!(
            f,
            "  Peak user bytes: {}",
            format_bytes(self.peak.user_bytes)
        )?;
        writeln!(f, "  Allocations:     {}", self.alloc_count)?;
        writeln!(f, "  Frees:           {}", self.free_count)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_tracks_peak() {
        let mut usage = UsageStats::default();
        usage.on_alloc(100, 10);
        usage.on_alloc(50, 10);
        usage.on_free(100, 10);
        assert_eq!(usage.current.blocks, 1);
        assert_eq!(usage.current.user_bytes, 50);
        assert_eq!(usage.peak.blocks, 2);
        assert_eq!(usage.peak.user_bytes, 150);
        assert_eq!(usage.scoped(StatScope::Peak).control_bytes, 20);
    }

    #[test]
    fn test_display_mentions_blocks() {
        let stats = AllocStats::default();
        let text = stats.to_string();
        assert!(text.contains("Live blocks"));
    }
}
