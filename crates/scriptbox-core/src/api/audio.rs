//! Audio channels for `process_audio(inputs, outputs)`.

use rhai::{Array, Dynamic, Engine, EvalAltResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// One channel of samples shared between the host and a script.
///
/// Scripts see samples as floats; storage is `f32` like the host buffers.
#[derive(Debug, Clone, Default)]
pub struct AudioChannel {
    samples: Arc<Mutex<Vec<f32>>>,
}

impl AudioChannel {
    /// Share `samples` with scripts.
    pub fn from_samples(samples: Vec<f32>) -> Self {
        Self {
            samples: Arc::new(Mutex::new(samples)),
        }
    }

    fn samples_mut(&self) -> MutexGuard<'_, Vec<f32>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.samples_mut().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples_mut().is_empty()
    }

    /// Copy of the current samples.
    pub fn to_vec(&self) -> Vec<f32> {
        self.samples_mut().clone()
    }

    /// Write the samples into `dest`, up to the shorter of the two lengths.
    pub fn copy_into(&self, dest: &mut [f32]) {
        let samples = self.samples_mut();
        let n = samples.len().min(dest.len());
        dest[..n].copy_from_slice(&samples[..n]);
    }

    fn index(&self, index: i64) -> ScriptResult<usize> {
        let len = self.len();
        usize::try_from(index)
            .ok()
            .filter(|i| *i < len)
            .ok_or_else(|| format!("sample index {} out of range (length {})", index, len).into())
    }

    fn get(&mut self, index: i64) -> ScriptResult<f64> {
        let i = self.index(index)?;
        Ok(self.samples_mut()[i] as f64)
    }

    fn set(&mut self, index: i64, value: f64) -> ScriptResult<()> {
        let i = self.index(index)?;
        self.samples_mut()[i] = value as f32;
        Ok(())
    }

    fn fill(&mut self, value: f64) {
        self.samples_mut().fill(value as f32);
    }

    fn copy_from(&mut self, other: AudioChannel) {
        if Arc::ptr_eq(&self.samples, &other.samples) {
            return;
        }
        let source = other.to_vec();
        let mut samples = self.samples_mut();
        let n = samples.len().min(source.len());
        samples[..n].copy_from_slice(&source[..n]);
    }

    fn to_array(&mut self) -> Array {
        self.samples_mut()
            .iter()
            .map(|s| Dynamic::from_float(*s as f64))
            .collect()
    }
}

/// Register [`AudioChannel`] with its indexers and helpers.
pub fn register(engine: &mut Engine) {
    engine
        .register_type_with_name::<AudioChannel>("AudioChannel")
        .register_indexer_get(AudioChannel::get)
        .register_indexer_set(AudioChannel::set)
        .register_indexer_set(|ch: &mut AudioChannel, index: i64, value: i64| {
            ch.set(index, value as f64)
        })
        .register_fn("len", |ch: &mut AudioChannel| ch.len() as i64)
        .register_fn("fill", AudioChannel::fill)
        .register_fn("copy_from", AudioChannel::copy_from)
        .register_fn("to_array", AudioChannel::to_array)
        .register_fn("to_debug", |ch: &mut AudioChannel| {
            format!("AudioChannel({} samples)", ch.len())
        });
}
