use std::sync::{Arc, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use log::{error, info};

use crate::codec::CodecFactory;
use crate::config::{OUTPUT_ALLOCATION_SIZE, SessionConfig};
use crate::memory::GuestMemory;
use crate::process::playback::{DecodedData, LoopParams, PlaybackState};
use crate::process::worker::{self, Shared};
use crate::utils::errors::{CreateError, PlaybackError};

/// A playback context: one input stream decoded into one output ring by a
/// dedicated worker thread.
///
/// Callers pause the worker with [`request_modify_lock`] and
/// [`wait_until_modify_lock_obtained`], mutate or drain the session, then
/// hand control back with [`resume_playback`].
///
/// [`request_modify_lock`]: PlaybackSession::request_modify_lock
/// [`wait_until_modify_lock_obtained`]: PlaybackSession::wait_until_modify_lock_obtained
/// [`resume_playback`]: PlaybackSession::resume_playback
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use xma::codec::SilenceCodec;
/// use xma::config::SessionConfig;
/// use xma::memory::{GuestMemory, HeapMemory};
/// use xma::process::build::PacketBuilder;
/// use xma::process::session::PlaybackSession;
///
/// let memory = Arc::new(HeapMemory::new(0x10_0000));
/// let session = PlaybackSession::create(
///     SessionConfig::default(),
///     memory.clone(),
///     &SilenceCodec::factory(),
/// )?;
///
/// let mut builder = PacketBuilder::new();
/// builder.push_frame(4000, &[])?;
/// let stream = builder.build();
/// let handle = memory.store(&stream)?;
///
/// session.request_modify_lock();
/// session.wait_until_modify_lock_obtained();
/// session.submit_data(handle, stream.len() as u32)?;
/// session.resume_playback();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct PlaybackSession {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    memory: Arc<dyn GuestMemory>,
    output_handle: u32,
}

impl PlaybackSession {
    pub fn create(
        config: SessionConfig,
        memory: Arc<dyn GuestMemory>,
        codecs: &dyn CodecFactory,
    ) -> Result<Self, CreateError> {
        config.validate()?;

        let output_handle = memory.alloc(OUTPUT_ALLOCATION_SIZE)?;
        let release = |e: CreateError| {
            memory.free(output_handle);
            e
        };

        let codec = codecs
            .open(config.sample_rate, config.channel_count)
            .map_err(|e| release(e.into()))?;
        let state =
            PlaybackState::new(&config, output_handle, memory.clone()).map_err(release)?;

        let shared = Arc::new(Shared::new(state));
        let worker = worker::spawn(shared.clone(), codec).map_err(|e| release(e.into()))?;

        info!(
            "Created playback session: {} Hz, {} channel(s), {} output blocks at {output_handle:#010X}",
            config.sample_rate,
            config.channel_count,
            config.output_block_count()
        );

        Ok(Self {
            shared,
            worker: Some(worker),
            memory,
            output_handle,
        })
    }

    fn state(&self) -> MutexGuard<'_, PlaybackState> {
        self.shared.lock()
    }

    /// Runs `f` under the session mutex and wakes the worker afterwards.
    fn modify<T>(&self, f: impl FnOnce(&mut PlaybackState) -> T) -> T {
        let result = f(&mut *self.state());
        self.shared.wake.notify_all();
        result
    }

    pub fn request_modify_lock(&self) {
        self.modify(|state| state.locked = true);
    }

    pub fn wait_until_modify_lock_obtained(&self) {
        let state = self.state();
        let _state = self
            .shared
            .wake
            .wait_while(state, |s| !s.locked)
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub fn resume_playback(&self) {
        self.modify(|state| {
            state.locked = false;
            state.decode_allowed = true;
        });
    }

    pub fn submit_data(&self, handle: u32, size: u32) -> Result<(), PlaybackError> {
        self.modify(|state| state.submit(handle, size))
    }

    pub fn query_ready_for_more_data(&self) -> bool {
        self.state().ready_for_more_data()
    }

    pub fn query_is_idle(&self) -> bool {
        self.state().is_idle()
    }

    pub fn query_input_data_pending(&self, handle: u32) -> bool {
        self.state().input_data_pending(handle)
    }

    /// Samples readable in one contiguous run from the read cursor.
    pub fn query_available_data(&self) -> u32 {
        self.state().available_samples()
    }

    pub fn query_contexts_allocated(&self) -> bool {
        self.worker.is_some()
    }

    pub fn query_modify_lock_obtained(&self) -> bool {
        self.state().locked
    }

    pub fn error_bits(&self) -> u32 {
        self.state().error_bits()
    }

    pub fn remaining_loop_count(&self) -> u8 {
        self.state().loop_params().loop_count
    }

    /// Input read offset in bits.
    pub fn query_current_position(&self) -> u32 {
        self.state().input_read_offset()
    }

    pub fn access_decoded_data(&self) -> Result<DecodedData, PlaybackError> {
        self.state().access_decoded_data()
    }

    pub fn consume_decoded_data(&self, max_samples: u32) -> Result<DecodedData, PlaybackError> {
        self.state().consume_decoded_data(max_samples)
    }

    pub fn set_loop(&self, params: LoopParams) -> Result<(), PlaybackError> {
        self.modify(|state| state.set_loop(params))
    }

    pub fn set_decode_position(&self, bit_offset: u32, subframe: u32) -> Result<(), PlaybackError> {
        self.modify(|state| state.set_decode_position(bit_offset, subframe))
    }

    pub fn rewind_decode_position(&self, samples: u32) -> Result<bool, PlaybackError> {
        self.modify(|state| state.rewind_decode_position(samples))
    }

    pub fn stream_position(&self) -> u32 {
        self.state().stream_position()
    }

    pub fn flush_data(&self) -> Result<(), PlaybackError> {
        self.modify(|state| state.flush())
    }

    /// Stops the worker and releases the output buffer.
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.modify(|state| state.running = false);

        if worker.join().is_err() {
            error!("Decode worker panicked");
        }

        self.memory.free(self.output_handle);
        info!("Destroyed playback session at {:#010X}", self.output_handle);
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
