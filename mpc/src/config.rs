use std::{fs::File, io::BufReader, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    encoding::{FixedPointEncoder, Ring},
    error::{ConfigError, MpcResult},
};

/// Cryptographic parameters of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Width of the share ring in bits.
    pub ring_bits: u32,
    pub encoder_base: u64,
    pub encoder_precision: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ring_bits: 64,
            encoder_base: 2,
            encoder_precision: 16,
        }
    }
}

impl SessionConfig {
    /// Load configuration from JSON file.
    pub fn load(path: impl AsRef<Path>) -> MpcResult<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: SessionConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the ring can hold the fixed-point scale.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ring = Ring::new(self.ring_bits).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "ring width must be between 2 and {} bits, got {}",
                Ring::MAX_BITS,
                self.ring_bits
            ))
        })?;
        if self.encoder_base < 2 {
            return Err(ConfigError::Invalid(format!(
                "encoder base must be at least 2, got {}",
                self.encoder_base
            )));
        }
        match self.encoder_base.checked_pow(self.encoder_precision) {
            Some(scale) if scale <= ring.max_signed() as u64 => Ok(()),
            _ => Err(ConfigError::Invalid(format!(
                "scale {}^{} does not fit into a {}-bit ring",
                self.encoder_base, self.encoder_precision, self.ring_bits
            ))),
        }
    }

    /// Share ring. Falls back to the 64-bit ring for unvalidated configurations.
    pub fn ring(&self) -> Ring {
        Ring::new(self.ring_bits).unwrap_or_default()
    }

    pub fn encoder(&self) -> FixedPointEncoder {
        FixedPointEncoder::new(self.encoder_base, self.encoder_precision, self.ring())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_validate() {
        assert!(SessionConfig::default().validate().is_ok());
        let small = SessionConfig {
            ring_bits: 16,
            encoder_base: 2,
            encoder_precision: 15,
        };
        assert!(small.validate().is_err());
        let bad_base = SessionConfig {
            encoder_base: 1,
            ..Default::default()
        };
        assert!(bad_base.validate().is_err());
        let bad_ring = SessionConfig {
            ring_bits: 128,
            ..Default::default()
        };
        assert!(bad_ring.validate().is_err());
    }

    #[test]
    fn test_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"ring_bits": 32, "encoder_precision": 8}}"#).unwrap();
        let config = SessionConfig::load(file.path()).unwrap();
        assert_eq!(config.ring_bits, 32);
        assert_eq!(config.encoder_base, 2);
        assert_eq!(config.encoder().scale(), 256);
    }
}
