use crate::utils::errors::CreateError;

/// Size of one output sub-block of PCM.
pub const OUTPUT_BYTES_PER_BLOCK: u32 = 256;

/// Bytes reserved for the output ring, whatever its block count.
pub const OUTPUT_ALLOCATION_SIZE: u32 = 0x2000;

/// Parameters a playback session is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub sample_rate: u32,
    /// Output buffer size in bytes per channel.
    pub output_buffer_size: u32,
    pub channel_count: u32,
    /// Sub-blocks written per consume step.
    pub subframes: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            output_buffer_size: 0x400,
            channel_count: 2,
            subframes: 4,
        }
    }
}

impl SessionConfig {
    /// Output ring size in 256-byte blocks, as the hardware register holds it.
    pub fn output_block_count(&self) -> u32 {
        let bytes = self.channel_count.wrapping_mul(self.output_buffer_size);
        ((bytes << 15) & 0x07C0_0000) >> 22
    }

    /// Sub-blocks that must be free before a decode batch may start.
    pub fn min_decode_blocks(&self) -> u32 {
        (self.subframes * self.channel_count).saturating_sub(1)
    }

    /// Checks the configuration and returns the output block count.
    pub fn validate(&self) -> Result<u32, CreateError> {
        if !(1..=2).contains(&self.channel_count) {
            return Err(CreateError::UnsupportedChannelCount(self.channel_count));
        }

        if self.subframes == 0 {
            return Err(CreateError::InvalidSubframes);
        }

        let blocks = self.output_block_count();
        if blocks == 0 {
            return Err(CreateError::EmptyOutputBuffer {
                size: self.output_buffer_size,
                channels: self.channel_count,
            });
        }

        let required = self.min_decode_blocks();
        if required > blocks {
            return Err(CreateError::OutputTooSmall { blocks, required });
        }

        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() -> anyhow::Result<()> {
        let config = SessionConfig::default();

        assert_eq!(config.validate()?, 16);
        assert_eq!(config.min_decode_blocks(), 7);

        Ok(())
    }

    #[test]
    fn block_count_keeps_five_bits() {
        let config = |channel_count, output_buffer_size| SessionConfig {
            channel_count,
            output_buffer_size,
            ..Default::default()
        };

        assert_eq!(config(1, 0x800).output_block_count(), 16);
        assert_eq!(config(1, 0xF80).output_block_count(), 0x1F);
        // 0x1000 bytes per channel overflows the register field.
        assert_eq!(config(1, 0x1000).output_block_count(), 0);
        assert_eq!(config(2, 0x7F).output_block_count(), 1);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let surround = SessionConfig {
            channel_count: 3,
            ..Default::default()
        };
        assert!(matches!(
            surround.validate(),
            Err(CreateError::UnsupportedChannelCount(3))
        ));

        let tiny = SessionConfig {
            output_buffer_size: 0x100,
            ..Default::default()
        };
        assert!(matches!(
            tiny.validate(),
            Err(CreateError::OutputTooSmall {
                blocks: 4,
                required: 7
            })
        ));

        let empty = SessionConfig {
            output_buffer_size: 0x20,
            ..Default::default()
        };
        assert!(matches!(
            empty.validate(),
            Err(CreateError::EmptyOutputBuffer { .. })
        ));
    }
}
