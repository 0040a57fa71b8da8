/*!
# Stack Recorder

Thread-safe sample store with a dual-slot double buffer, so a profile can be serialized while
sampling keeps going.

## Slots

The recorder owns two profiles, each behind its own mutex. At any time:
- one slot is **active**: its mutex is unlocked and samplers lock it briefly to add a sample
- the other slot is **inactive**: the serializer keeps its mutex locked for the whole window

Samplers do not need to know which slot is active. They try to lock slot one, then slot two, and
use whichever they get. Only the serializer ever holds a slot for long, so a sampler can fail
to get either slot only if the protocol itself is broken, which is reported as an invariant error.

## Serialization

`serialize` swaps the roles of the two slots:
1. Reset the inactive profile with the new window start (we still own it)
2. Release the inactive slot, so samplers can start using it
3. Lock the previously active slot; this waits for any in-flight sample
4. Encode the frozen profile and keep holding its slot until the next call

Every sample lands in exactly one serialized window, and no sample is lost during a swap.

## Fork safety

A forked child inherits locked mutexes without the threads that held them.
`reset_after_fork` force-unlocks both slots, clears them and restores the initial state.
*/

pub mod error;
pub mod profile;
pub mod sample;

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use lock_api::ArcMutexGuard;
use metrics::{counter, histogram};
use parking_lot::{Mutex, MutexGuard, RawMutex};
use tracing::{debug, warn};

use crate::config::RecorderConfig;

pub use error::RecorderError;
pub use profile::{EncodedProfile, Profile, ProfileSnapshot, SerializedSample};
pub use sample::{Label, LabelValue, Location, SampleTypes, SampleValues, ValueType};

type SlotGuard = ArcMutexGuard<RawMutex, Profile>;

/// Attempts per slot before a sampler gives up
const LOCK_ATTEMPTS: usize = 2;

struct SerializerState {
    /// 1 or 2: the slot samplers currently write to
    active_slot: u8,
    /// Guard of the inactive slot
    inactive: Option<SlotGuard>,
}

pub struct StackRecorder {
    slot_one: Arc<Mutex<Profile>>,
    slot_two: Arc<Mutex<Profile>>,
    serializer: Mutex<SerializerState>,
    sample_types: SampleTypes,
}

impl StackRecorder {
    pub fn new(config: &RecorderConfig) -> Self {
        let sample_types = SampleTypes::new(config);
        let slot_one = Arc::new(Mutex::new(Profile::new(
            sample_types.enabled().to_vec(),
            None,
        )));
        let slot_two = Arc::new(Mutex::new(Profile::new(
            sample_types.enabled().to_vec(),
            None,
        )));

        let inactive = slot_two.lock_arc();

        Self {
            slot_one,
            slot_two,
            serializer: Mutex::new(SerializerState {
                active_slot: 1,
                inactive: Some(inactive),
            }),
            sample_types,
        }
    }

    pub fn sample_types(&self) -> &SampleTypes {
        &self.sample_types
    }

    /// Add a sample to the active profile
    pub fn record_sample(
        &self,
        locations: &[Location],
        values: SampleValues,
        labels: &[Label],
        end_timestamp_ns: Option<i64>,
    ) -> Result<(), RecorderError> {
        let metric_values = self.sample_types.layout(&values);
        let mut profile = self.lock_active_profile()?;
        profile.add(locations, &metric_values, labels, end_timestamp_ns)
    }

    /// Associate an endpoint name with a root span id in the active profile
    pub fn record_endpoint(
        &self,
        local_root_span_id: u64,
        endpoint: &str,
    ) -> Result<(), RecorderError> {
        let mut profile = self.lock_active_profile()?;
        profile.set_endpoint(local_root_span_id, endpoint);
        Ok(())
    }

    fn lock_active_profile(&self) -> Result<MutexGuard<'_, Profile>, RecorderError> {
        for _ in 0..LOCK_ATTEMPTS {
            if let Some(profile) = self.slot_one.try_lock() {
                return Ok(profile);
            }
            if let Some(profile) = self.slot_two.try_lock() {
                return Ok(profile);
            }
        }
        warn!("Neither recorder slot could be locked");
        Err(RecorderError::BothSlotsLocked)
    }

    /// Swap slots and encode everything recorded since the previous call
    pub fn serialize(&self) -> Result<EncodedProfile, RecorderError> {
        let started = Instant::now();
        let result = self.flip_and_serialize();

        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!("profiler.recorder.serialize", 1, "result" => outcome);
        histogram!(
            "profiler.recorder.serialize.duration",
            started.elapsed().as_secs_f64() * 1000.0
        );
        result
    }

    fn flip_and_serialize(&self) -> Result<EncodedProfile, RecorderError> {
        let mut serializer = self.serializer.lock();
        let finish = SystemTime::now();

        let previously_active = match serializer.active_slot {
            1 => &self.slot_one,
            2 => &self.slot_two,
            other => return Err(RecorderError::UnexpectedActiveSlot(other)),
        };

        if let Some(next_active) = serializer.inactive.as_mut() {
            next_active.reset(Some(finish));
        }
        drop(serializer.inactive.take());

        let mut frozen = previously_active.lock_arc();
        serializer.active_slot = if serializer.active_slot == 1 { 2 } else { 1 };

        let result = frozen.serialize(finish);
        serializer.inactive = Some(frozen);

        if let Ok(encoded) = &result {
            debug!(
                bytes = encoded.buffer.len(),
                active_slot = serializer.active_slot,
                "Serialized profile"
            );
        }
        result
    }

    /// Restore the initial slot state in a forked child, discarding all samples
    pub fn reset_after_fork(&self) {
        if self.serializer.is_locked() {
            // SAFETY: the thread holding it did not survive the fork
            unsafe { self.serializer.force_unlock() };
        }
        let mut serializer = self.serializer.lock();
        drop(serializer.inactive.take());

        for slot in [&self.slot_one, &self.slot_two] {
            if slot.is_locked() {
                // SAFETY: as above; nothing samples while the child resets
                unsafe { slot.force_unlock() };
            }
            slot.lock().reset(None);
        }

        serializer.inactive = Some(self.slot_two.lock_arc());
        serializer.active_slot = 1;
        debug!("Stack recorder reset after fork");
    }

    pub fn active_slot(&self) -> u8 {
        self.serializer.lock().active_slot
    }

    pub fn is_slot_one_mutex_locked(&self) -> bool {
        self.slot_one.is_locked()
    }

    pub fn is_slot_two_mutex_locked(&self) -> bool {
        self.slot_two.is_locked()
    }
}

impl std::fmt::Debug for StackRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackRecorder")
            .field("sample_types", &self.sample_types)
            .field("slot_one_locked", &self.is_slot_one_mutex_locked())
            .field("slot_two_locked", &self.is_slot_two_mutex_locked())
            .finish()
    }
}
