use crate::core::correlation::carrier::Carrier;
use crate::core::correlation::labels::{ExecutionUnit, LabelBinder, LabelSet, LabelToken};
use crate::core::profiling::timeline;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Binds carrier labels onto execution units and through them onto the
/// sampler timeline. When the sampler is not running the unit slot is
/// still maintained, samples simply are not attributed
#[derive(Debug, Default)]
pub struct SamplerBinder {
    warned_inactive: AtomicBool,
}

impl SamplerBinder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LabelBinder for SamplerBinder {
    fn bind(&self, unit: &ExecutionUnit, carrier: &Carrier) -> LabelToken {
        if !timeline::is_enabled() && !self.warned_inactive.swap(true, Ordering::Relaxed) {
            debug!("Profiler timeline inactive, span labels will not be attributed to samples");
        }

        let previous = unit.swap_labels(Some(LabelSet::from_carrier(carrier)));

        LabelToken::new(unit, previous)
    }

    fn restore(&self, unit: &ExecutionUnit, token: LabelToken) {
        match token.into_previous(unit) {
            Ok(previous) => {
                unit.swap_labels(previous);
            }
            Err(token) => {
                warn!(
                    token_unit = token.unit_id(),
                    unit = unit.id(),
                    "Label token restored on a foreign execution unit, ignoring"
                );
            }
        }
    }

    fn name(&self) -> &'static str {
        "sampler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::correlation::carrier::TraceSettings;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_bind_while_entered_publishes_to_timeline() {
        let _lock = timeline::TEST_LOCK.lock();
        timeline::enable();

        let binder = SamplerBinder::new();
        let unit = ExecutionUnit::new();
        let carrier = Carrier::root("entered", Vec::new(), &TraceSettings::default());

        let _entered = unit.enter();
        let token = binder.bind(&unit, &carrier);
        std::thread::sleep(Duration::from_millis(2));
        let while_bound = SystemTime::now();
        std::thread::sleep(Duration::from_millis(2));

        binder.restore(&unit, token);
        std::thread::sleep(Duration::from_millis(2));
        let after_restore = SystemTime::now();

        let tid = timeline::current_thread_id();
        assert_eq!(
            timeline::labels_at(tid, while_bound),
            Some(LabelSet::from_carrier(&carrier))
        );
        assert_eq!(timeline::labels_at(tid, after_restore), None);

        timeline::disable();
    }

    #[test]
    fn test_bind_on_unentered_unit_does_not_touch_thread() {
        let _lock = timeline::TEST_LOCK.lock();
        timeline::enable();

        let binder = SamplerBinder::new();
        let unit = ExecutionUnit::new();
        let carrier = Carrier::root("elsewhere", Vec::new(), &TraceSettings::default());

        let token = binder.bind(&unit, &carrier);
        std::thread::sleep(Duration::from_millis(2));

        let seen = timeline::labels_at(timeline::current_thread_id(), SystemTime::now());
        assert_ne!(seen, Some(LabelSet::from_carrier(&carrier)));

        binder.restore(&unit, token);
        timeline::disable();
    }
}
