//! The fixed `.mpy` header and the options that fill it.

use bitflags::bitflags;
use mpyc_bytecode::ByteReader;
use mpyc_bytecode::varint::write_uint;
use mpyc_compiler::CompilerConfig;

use crate::error::ContainerError;

/// First byte of every `.mpy` file.
pub const MAGIC: u8 = b'M';

/// Format version written and accepted.
pub const VERSION: u8 = 5;

pub const DEFAULT_WINDOW_SIZE: usize = 32;

pub const DEFAULT_SMALL_INT_BITS: u8 = 31;

bitflags! {
    /// Feature flags stored in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FeatureFlags: u8 {
        const UNICODE = 0x01;
        /// Name and attribute lookups carry an inline cache byte.
        const CACHE = 0x02;
    }
}

/// Settings recorded in the header of a written file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerOptions {
    pub features: FeatureFlags,
    pub small_int_bits: u8,
    pub window_size: usize,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            features: FeatureFlags::UNICODE,
            small_int_bits: DEFAULT_SMALL_INT_BITS,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl ContainerOptions {
    /// Options matching the instructions produced under `config`.
    pub fn for_compiler(config: &CompilerConfig) -> Self {
        let mut features = FeatureFlags::UNICODE;
        features.set(FeatureFlags::CACHE, config.cache_lookups);
        Self {
            features,
            small_int_bits: config.small_int_bits,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn cache_lookups(&self) -> bool {
        self.features.contains(FeatureFlags::CACHE)
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[MAGIC, VERSION, self.features.bits(), self.small_int_bits]);
        write_uint(out, self.window_size as u64);
    }

    pub(crate) fn decode(reader: &mut ByteReader<'_>) -> Result<Self, ContainerError> {
        let magic = reader.read_u8().map_err(ContainerError::reading("header"))?;
        if magic != MAGIC {
            return Err(ContainerError::BadMagic { found: magic });
        }
        let version = reader.read_u8().map_err(ContainerError::reading("header"))?;
        if version != VERSION {
            return Err(ContainerError::UnsupportedVersion {
                expected: VERSION,
                found: version,
            });
        }
        let flags = reader.read_u8().map_err(ContainerError::reading("header"))?;
        let small_int_bits = reader.read_u8().map_err(ContainerError::reading("header"))?;
        let window_size = reader
            .read_uint()
            .map_err(ContainerError::reading("window size"))?;
        let window_size = usize::try_from(window_size)
            .map_err(|_| ContainerError::Corrupt(format!("window size {}", window_size)))?;
        Ok(Self {
            features: FeatureFlags::from_bits_retain(flags),
            small_int_bits,
            window_size,
        })
    }
}
