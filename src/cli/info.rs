use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar};
use log::warn;

use super::command::{Cli, InfoArgs};
use super::spinner;
use crate::input::InputReader;
use xma::codec::SAMPLES_PER_FRAME;
use xma::process::extract::{Extractor, Frame};
use xma::structs::packet::{BYTES_PER_PACKET, PacketHeader};
use xma::utils::errors::ExtractError;

pub fn cmd_info(args: &InfoArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    log::info!("Analyzing XMA stream: {}", args.input.display());

    let mut input_reader = InputReader::new(&args.input)?;
    if input_reader.is_pipe() {
        log::debug!("Reading packets from stdin");
    }
    let mut extractor = Extractor::default();
    extractor.set_fail_level(cli.fail_level());

    let mut stats = StreamStats {
        pb: multi.map(|multi| spinner(multi, "Analyzing packets...")).transpose()?,
        ..Default::default()
    };

    input_reader.process_chunks(64 * 1024, |chunk| {
        stats.push_bytes(chunk);
        extractor.push_bytes(chunk);

        for frame_result in extractor.by_ref() {
            match frame_result {
                Ok(frame) => stats.record_frame(&frame),
                Err(ExtractError::InsufficientData) => {}
                Err(e) if cli.strict => return Err(e.into()),
                Err(e) => {
                    warn!("{e}");
                    stats.errors += 1;
                }
            }
        }

        Ok(true)
    })?;

    if let Some(pb) = stats.pb.take() {
        pb.finish_and_clear();
    }

    if stats.frames == 0 {
        println!("No frames found in the file.");
        println!("This doesn't appear to be a valid XMA packet stream.");
        return Ok(());
    }

    stats.display(args);

    Ok(())
}

#[derive(Default)]
struct StreamStats {
    total_bytes: usize,
    /// Bytes of a packet not yet complete.
    carry: Vec<u8>,
    packets: usize,
    packets_without_frame_start: usize,
    declared_frames: usize,
    frames: usize,
    split_frames: usize,
    frame_bits: u64,
    min_frame_bits: u32,
    max_frame_bits: u32,
    errors: usize,
    pb: Option<ProgressBar>,
}

impl StreamStats {
    fn push_bytes(&mut self, chunk: &[u8]) {
        self.total_bytes += chunk.len();
        self.carry.extend_from_slice(chunk);

        let complete = self.carry.len() / BYTES_PER_PACKET * BYTES_PER_PACKET;
        for packet in self.carry[..complete].chunks_exact(BYTES_PER_PACKET) {
            let Ok(header) = PacketHeader::read(packet) else {
                continue;
            };

            self.packets += 1;
            self.declared_frames += header.frame_count as usize;
            if !header.has_frame_start() {
                self.packets_without_frame_start += 1;
            }
        }
        self.carry.drain(..complete);
    }

    fn record_frame(&mut self, frame: &Frame) {
        self.min_frame_bits = if self.frames == 0 {
            frame.size_bits
        } else {
            self.min_frame_bits.min(frame.size_bits)
        };
        self.max_frame_bits = self.max_frame_bits.max(frame.size_bits);
        self.frame_bits += frame.size_bits as u64;
        self.split_frames += frame.split as usize;
        self.frames += 1;

        if self.frames.is_multiple_of(100) {
            if let Some(ref pb) = self.pb {
                pb.set_message(format!("Analyzing packets...      {} frames", self.frames));
            }
        }
    }

    fn display(&self, args: &InfoArgs) {
        println!();
        println!("XMA Stream Information");
        println!("======================");
        println!();

        println!("Packets");
        println!("  Packets                   {}", self.packets);
        println!("  Without frame start       {}", self.packets_without_frame_start);
        if !self.carry.is_empty() {
            println!("  Trailing bytes            {}", self.carry.len());
        }
        println!();

        println!("Frames");
        println!("  Frames                    {}", self.frames);
        if self.declared_frames != self.frames {
            println!("  Declared in headers       {}", self.declared_frames);
        }
        println!("  Split across packets      {}", self.split_frames);
        println!(
            "  Size (bits)               min {} / avg {} / max {}",
            self.min_frame_bits,
            self.frame_bits / self.frames as u64,
            self.max_frame_bits
        );
        if self.errors > 0 {
            println!("  Errors                    {}", self.errors);
        }
        println!();

        let samples = (self.frames * SAMPLES_PER_FRAME) as u64;
        let pcm_bytes = samples * args.channels as u64 * 2;

        println!("Analysis Summary");
        let size_mb = self.total_bytes as f64 / 1_000_000.0;
        println!("  Size                      {size_mb:.2} MB ({} bytes)", self.total_bytes);
        println!("  Samples per channel       {samples}");
        println!("  Decoded PCM size          {pcm_bytes} bytes");

        if args.sample_rate > 0 {
            let duration_secs = samples as f64 / args.sample_rate as f64;
            println!(
                "  Duration                  {} at {} Hz",
                time_str(duration_secs),
                args.sample_rate
            );

            if duration_secs > 0.0 {
                let avg_data_rate_kbps = (self.total_bytes as f64 * 8.0) / (duration_secs * 1000.0);
                println!("  Average data rate         {avg_data_rate_kbps:.1} kbps");
            }
        }

        println!();
    }
}

fn time_str(sec: f64) -> String {
    let ms = (sec * 1000.0) as u64;
    let hours = ms / 3_600_000;

    format!(
        "{hours:0width$}:{:02}:{:02}.{:03}",
        ms % 3_600_000 / 60_000,
        ms % 60_000 / 1000,
        ms % 1000,
        width = if hours >= 100 { 0 } else { 2 }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use xma::process::build::PacketBuilder;

    #[test]
    fn time_str_formats_hours_minutes_seconds() {
        assert_eq!(time_str(0.0), "00:00:00.000");
        assert_eq!(time_str(3_723.5), "01:02:03.500");
        assert_eq!(time_str(360_000.0), "100:00:00.000");
    }

    #[test]
    fn stats_count_packets_across_chunks() -> Result<()> {
        let mut builder = PacketBuilder::new();
        for size in [10_000, 9_000, 500] {
            builder.push_frame(size, &[])?;
        }
        let stream = builder.build();

        let mut stats = StreamStats::default();
        let mut extractor = Extractor::default();
        for chunk in stream.chunks(1500) {
            stats.push_bytes(chunk);
            extractor.push_bytes(chunk);
            for frame in extractor.by_ref().flatten() {
                stats.record_frame(&frame);
            }
        }

        assert_eq!(stats.packets, 2);
        assert!(stats.carry.is_empty());
        assert_eq!(stats.declared_frames, 3);
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.split_frames, 1);
        assert_eq!((stats.min_frame_bits, stats.max_frame_bits), (500, 10_000));

        Ok(())
    }
}
