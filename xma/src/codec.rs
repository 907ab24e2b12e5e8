//! Seam to the frame decoder.
//!
//! The playback engine hands every assembled frame (pad header byte followed
//! by the frame bits) to a [`FrameCodec`] and expects 512 planar float samples
//! per channel back. Any decoder that understands that framing can be plugged
//! in through a [`CodecFactory`].

use crate::utils::errors::CodecError;

pub const SAMPLES_PER_FRAME: usize = 512;

/// One decoded frame, one sample vector per channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedFrame {
    pub channels: Vec<Vec<f32>>,
}

impl DecodedFrame {
    pub fn silence(channels: u32) -> Self {
        Self {
            channels: vec![vec![0.0; SAMPLES_PER_FRAME]; channels as usize],
        }
    }
}

pub trait FrameCodec: Send {
    fn decode(&mut self, frame: &[u8]) -> Result<DecodedFrame, CodecError>;
}

pub trait CodecFactory {
    fn open(&self, sample_rate: u32, channels: u32) -> Result<Box<dyn FrameCodec>, CodecError>;
}

impl<F> CodecFactory for F
where
    F: Fn(u32, u32) -> Result<Box<dyn FrameCodec>, CodecError>,
{
    fn open(&self, sample_rate: u32, channels: u32) -> Result<Box<dyn FrameCodec>, CodecError> {
        self(sample_rate, channels)
    }
}

/// Codec that outputs silence for every frame it is given.
#[derive(Debug, Clone, Copy)]
pub struct SilenceCodec {
    channels: u32,
}

impl SilenceCodec {
    pub fn factory() -> impl CodecFactory {
        |_sample_rate: u32, channels: u32| -> Result<Box<dyn FrameCodec>, CodecError> {
            Ok(Box::new(SilenceCodec { channels }))
        }
    }
}

impl FrameCodec for SilenceCodec {
    fn decode(&mut self, frame: &[u8]) -> Result<DecodedFrame, CodecError> {
        if frame.len() < 2 {
            return Err(CodecError::InvalidFrame(format!(
                "{} bytes is shorter than a frame",
                frame.len()
            )));
        }

        Ok(DecodedFrame::silence(self.channels))
    }
}
