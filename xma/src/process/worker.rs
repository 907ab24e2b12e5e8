use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use log::{debug, error, trace};

use crate::codec::FrameCodec;
use crate::process::playback::{DecodeStep, PlaybackState};
use crate::utils::errors::DecodeError;

/// Error bits recorded for failures that are not stream errors.
const INTERNAL_ERROR_BITS: u32 = 0x10;

pub(crate) struct Shared {
    pub state: Mutex<PlaybackState>,
    pub wake: Condvar,
}

impl Shared {
    pub fn new(state: PlaybackState) -> Self {
        Self {
            state: Mutex::new(state),
            wake: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn spawn(
    shared: Arc<Shared>,
    codec: Box<dyn FrameCodec>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("xma-decode".into())
        .spawn(move || run(&shared, codec))
}

fn run(shared: &Shared, mut codec: Box<dyn FrameCodec>) {
    debug!("Decode worker started");

    let mut state = shared.lock();
    loop {
        state = shared
            .wake
            .wait_while(state, |s| s.running && !s.can_decode())
            .unwrap_or_else(PoisonError::into_inner);

        if !state.running {
            break;
        }

        if !state.begin_batch() {
            trace!("Not enough free output blocks to start a batch");
            state.decode_allowed = false;
            continue;
        }

        loop {
            match step(&mut state, codec.as_mut()) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    let bits = e
                        .downcast_ref::<DecodeError>()
                        .map_or(INTERNAL_ERROR_BITS, DecodeError::error_bits);
                    state.record_error(bits);
                    error!("Decode step failed: {e:#}");
                    break;
                }
            }

            // Let callers in between steps.
            drop(state);
            state = shared.lock();

            if !state.running || state.locked || !state.has_room() {
                break;
            }
        }

        state.finish_batch();
        shared.wake.notify_all();
    }

    drop(state);
    drop(codec);
    debug!("Decode worker stopped");
}

/// One decode plus one consume; false when neither made progress.
fn step(state: &mut PlaybackState, codec: &mut dyn FrameCodec) -> Result<bool> {
    let decoded = state.decode_frame(codec)?;
    let written = state.consume_step()?;

    Ok(decoded != DecodeStep::Idle || written > 0)
}
