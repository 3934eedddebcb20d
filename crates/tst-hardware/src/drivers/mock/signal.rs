//! In-memory signals and signal trees for mock devices.

use super::common::ErrorConfig;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tst_core::capabilities::{ChannelHandle, Signal, SignalTree, SignalValue, CAPTURE_SUFFIX};

/// A leaf signal holding its value in memory.
///
/// `get_value`/`set_value` go through the owning device's [`ErrorConfig`]
/// under the keys `get:<path>` and `set:<path>`. The synchronous
/// [`MockSignal::peek`] and [`MockSignal::poke`] bypass injection so that a
/// mock device can update its own read-backs.
pub struct MockSignal {
    name: String,
    path: String,
    driver_type: &'static str,
    value: RwLock<SignalValue>,
    errors: ErrorConfig,
}

impl MockSignal {
    /// Create a signal.
    pub fn new(
        device: &str,
        path: &str,
        driver_type: &'static str,
        initial: SignalValue,
        errors: ErrorConfig,
    ) -> Self {
        Self {
            name: format!("{}-{}", device, path.replace('.', "-")),
            path: path.to_string(),
            driver_type,
            value: RwLock::new(initial),
            errors,
        }
    }

    /// Dotted path inside the device.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current value without error injection.
    pub fn peek(&self) -> SignalValue {
        self.value.read().clone()
    }

    /// Overwrite the value without error injection.
    pub fn poke(&self, value: impl Into<SignalValue>) {
        *self.value.write() = value.into();
    }
}

#[async_trait]
impl Signal for MockSignal {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_value(&self) -> Result<SignalValue> {
        self.errors
            .check_operation(self.driver_type, &format!("get:{}", self.path))?;
        Ok(self.peek())
    }

    async fn set_value(&self, value: SignalValue) -> Result<()> {
        self.errors
            .check_operation(self.driver_type, &format!("set:{}", self.path))?;
        tracing::trace!(signal = %self.name, value = %value, "set");
        *self.value.write() = value;
        Ok(())
    }
}

/// The signals of one mock device, by dotted path.
pub struct SignalMap {
    device: String,
    driver_type: &'static str,
    errors: ErrorConfig,
    signals: BTreeMap<String, Arc<MockSignal>>,
}

impl SignalMap {
    /// Empty map for `device`.
    pub fn new(device: &str, driver_type: &'static str, errors: ErrorConfig) -> Self {
        Self {
            device: device.to_string(),
            driver_type,
            errors,
            signals: BTreeMap::new(),
        }
    }

    /// Add a signal, replacing any previous one at `path`.
    pub fn add(&mut self, path: &str, initial: impl Into<SignalValue>) -> Arc<MockSignal> {
        let signal = Arc::new(MockSignal::new(
            &self.device,
            path,
            self.driver_type,
            initial.into(),
            self.errors.clone(),
        ));
        self.signals.insert(path.to_string(), signal.clone());
        signal
    }

    /// Concrete signal at `path`.
    pub fn get(&self, path: &str) -> Option<Arc<MockSignal>> {
        self.signals.get(path).cloned()
    }

    /// Current value at `path` without error injection.
    pub fn peek(&self, path: &str) -> Option<SignalValue> {
        self.signals.get(path).map(|s| s.peek())
    }

    /// Overwrite the value at `path` without error injection.
    pub fn poke(&self, path: &str, value: impl Into<SignalValue>) {
        if let Some(signal) = self.signals.get(path) {
            signal.poke(value);
        }
    }

    /// Signals whose path ends with the capture-selector suffix.
    pub fn capture_channels(&self) -> Vec<ChannelHandle> {
        self.signals
            .iter()
            .filter(|(path, _)| path.ends_with(CAPTURE_SUFFIX))
            .map(|(path, signal)| ChannelHandle {
                name: path.clone(),
                signal: signal.clone() as Arc<dyn Signal>,
            })
            .collect()
    }
}

impl SignalTree for SignalMap {
    fn signal(&self, path: &str) -> Option<Arc<dyn Signal>> {
        self.signals.get(path).map(|s| s.clone() as Arc<dyn Signal>)
    }

    fn signal_paths(&self) -> Vec<String> {
        self.signals.keys().cloned().collect()
    }
}
