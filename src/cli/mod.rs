use std::time::Duration;

use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

pub mod command;
pub mod extract;
pub mod info;

/// Adds a ticking spinner to `multi`.
fn spinner(multi: &MultiProgress, message: &'static str) -> Result<ProgressBar> {
    let pb = multi.add(ProgressBar::new_spinner());
    pb.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message);

    Ok(pb)
}
