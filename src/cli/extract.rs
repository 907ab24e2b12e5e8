use std::fs::{self, File};
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use indicatif::MultiProgress;
use log::{info, warn};
use serde::Serialize;

use super::command::{Cli, ExtractArgs};
use super::spinner;
use crate::input::InputReader;
use xma::process::extract::{Extractor, Frame};
use xma::utils::errors::ExtractError;

/// One entry of the YAML frame index.
#[derive(Debug, Serialize)]
struct IndexEntry {
    frame: usize,
    packet: usize,
    bit_offset: u32,
    size_bits: u32,
    split: bool,
    /// Offset of the record's length prefix in the output file.
    record_offset: u64,
    record_len: u32,
}

pub fn cmd_extract(args: &ExtractArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    info!(
        "Extracting frames: {} -> {} (strict mode: {})",
        args.input.display(),
        args.output.display(),
        cli.strict
    );

    let mut input_reader = InputReader::new(&args.input)?;
    if input_reader.is_pipe() {
        log::debug!("Reading packets from stdin");
    }
    let mut extractor = Extractor::default();
    extractor.set_fail_level(cli.fail_level());

    let file = File::create(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;
    let mut writer = RecordWriter::new(BufWriter::new(file));
    let mut index = args.index.as_ref().map(|_| Vec::new());
    let mut errors = 0usize;

    let pb = multi.map(|multi| spinner(multi, "Extracting frames...")).transpose()?;

    input_reader.process_chunks(64 * 1024, |chunk| {
        extractor.push_bytes(chunk);

        for frame_result in extractor.by_ref() {
            let frame = match frame_result {
                Ok(frame) => frame,
                Err(ExtractError::InsufficientData) => continue,
                Err(e) if cli.strict => return Err(e.into()),
                Err(e) => {
                    warn!("{e}");
                    errors += 1;
                    continue;
                }
            };

            let entry = writer.write_frame(&frame)?;
            if let Some(index) = index.as_mut() {
                index.push(entry);
            }

            if writer.frames.is_multiple_of(100) {
                if let Some(ref pb) = pb {
                    pb.set_message(format!("Extracting frames...      {}", writer.frames));
                }
            }
        }

        Ok(true)
    })?;

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    let frames = writer.frames;
    let bytes = writer.finish()?;

    if let (Some(path), Some(index)) = (&args.index, index) {
        fs::write(path, serde_yaml_ng::to_string(&index)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Frame index written to {}", path.display());
    }

    if errors > 0 {
        warn!("{errors} stream error(s) were skipped");
    }
    info!("Extracted {frames} frames ({bytes} bytes)");

    Ok(())
}

/// Writes frames as records of a little-endian `u32` byte length followed by
/// the frame bytes.
struct RecordWriter<W: Write> {
    inner: W,
    position: u64,
    frames: usize,
}

impl<W: Write> RecordWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            position: 0,
            frames: 0,
        }
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<IndexEntry> {
        let data = frame.as_ref();
        let record_len = u32::try_from(data.len())?;

        self.inner.write_all(&record_len.to_le_bytes())?;
        self.inner.write_all(data)?;

        let entry = IndexEntry {
            frame: self.frames,
            packet: frame.packet_index,
            bit_offset: frame.bit_offset,
            size_bits: frame.size_bits,
            split: frame.split,
            record_offset: self.position,
            record_len,
        };

        self.position += 4 + record_len as u64;
        self.frames += 1;

        Ok(entry)
    }

    /// Flushes and returns the number of bytes written.
    fn finish(mut self) -> Result<u64> {
        self.inner.flush()?;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xma::process::build::PacketBuilder;

    #[test]
    fn records_are_length_prefixed() -> Result<()> {
        let mut builder = PacketBuilder::new();
        builder.push_frame(100, &[0xAB; 16])?;
        builder.push_frame(60, &[0xCD; 16])?;

        let mut extractor = Extractor::default();
        extractor.push_bytes(&builder.build());

        let mut writer = RecordWriter::new(Vec::new());
        let entries = extractor
            .by_ref()
            .map_while(|frame| frame.ok())
            .map(|frame| writer.write_frame(&frame))
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].record_offset, 4 + entries[0].record_len as u64);

        let bytes = writer.inner.clone();
        assert_eq!(writer.finish()?, bytes.len() as u64);

        let first_len = u32::from_le_bytes(bytes[..4].try_into()?) as usize;
        // 100 bits from bit 0 need 13 bytes behind the pad header.
        assert_eq!(first_len, 1 + 13);
        let second = &bytes[4 + first_len..];
        let second_len = u32::from_le_bytes(second[..4].try_into()?) as usize;
        assert_eq!(second.len(), 4 + second_len);

        let yaml = serde_yaml_ng::to_string(&entries)?;
        assert!(yaml.contains("size_bits: 100"));
        assert!(yaml.contains("split: false"));

        Ok(())
    }
}
