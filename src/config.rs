//! Emulator configuration.

use alloc::{collections::BTreeMap, vec::Vec};

use crate::session::Protocol;

/// Handshakes the emulated chip offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SupportedProtocols {
    BacOnly,
    PaceOnly,
    #[default]
    BacAndPace,
}

impl SupportedProtocols {
    #[must_use]
    pub const fn allows(self, protocol: Protocol) -> bool {
        matches!(
            (self, protocol),
            (Self::BacAndPace, _) | (Self::BacOnly, Protocol::Bac) | (Self::PaceOnly, Protocol::Pace)
        )
    }
}

/// Default largest chunk returned by one READ BINARY.
pub const DEFAULT_MAX_READ_LEN: usize = 256;

/// Configuration of a [`crate::PassportEmulator`].
///
/// # Examples
///
/// ```
/// use emrtd_emulator::config::{EmulatorConfig, SupportedProtocols};
///
/// let config = EmulatorConfig::default()
///     .with_protocols(SupportedProtocols::PaceOnly)
///     .with_file(0x1E, vec![0x60, 0x03, 0x5F, 0x01, 0x00])
///     .with_max_read_len(0xDF);
/// assert_eq!(config.file(0x1E).map(<[u8]>::len), Some(5));
/// assert!(config.file(0x01).is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorConfig {
    pub protocols: SupportedProtocols,
    /// Elementary files served by READ BINARY, keyed by short EF identifier.
    pub files: BTreeMap<u8, Vec<u8>>,
    pub max_read_len: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            protocols: SupportedProtocols::default(),
            files: BTreeMap::new(),
            max_read_len: DEFAULT_MAX_READ_LEN,
        }
    }
}

impl EmulatorConfig {
    #[must_use]
    pub const fn with_protocols(mut self, protocols: SupportedProtocols) -> Self {
        self.protocols = protocols;
        self
    }

    /// Serves `contents` as the file with short EF identifier `sfi`
    /// (`0x01..=0x1F`).
    #[must_use]
    pub fn with_file(mut self, sfi: u8, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(sfi, contents.into());
        self
    }

    /// A value of 0 is treated as 1.
    #[must_use]
    pub fn with_max_read_len(mut self, max_read_len: usize) -> Self {
        self.max_read_len = max_read_len.max(1);
        self
    }

    #[must_use]
    pub fn file(&self, sfi: u8) -> Option<&[u8]> {
        self.files.get(&sfi).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_protocols() {
        assert!(SupportedProtocols::default().allows(Protocol::Bac));
        assert!(SupportedProtocols::default().allows(Protocol::Pace));
        assert!(SupportedProtocols::BacOnly.allows(Protocol::Bac));
        assert!(!SupportedProtocols::BacOnly.allows(Protocol::Pace));
        assert!(!SupportedProtocols::PaceOnly.allows(Protocol::Bac));
    }

    #[test]
    fn test_defaults() {
        let config = EmulatorConfig::default();
        assert_eq!(config.max_read_len, DEFAULT_MAX_READ_LEN);
        assert!(config.files.is_empty());
        assert_eq!(config.with_max_read_len(0).max_read_len, 1);
    }
}
