use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::warn;

use crate::collaborators::{DeviceControl, DeviceError, Power};
use crate::model::ResourceId;
use crate::observability::DEVICE_ERRORS_TOTAL;

type ProbeResult = Result<Power, DeviceError>;
type Probe = Arc<Mutex<mpsc::Receiver<ProbeResult>>>;

/// Last known relay state plus the most recent failure, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub power: Option<Power>,
    pub error: Option<String>,
}

/// Wraps the device collaborator so that slow or failing hardware only ever
/// degrades status reporting. Callers must not hold engine locks here.
pub struct DeviceGateway {
    control: Arc<dyn DeviceControl>,
    timeout: Duration,
    statuses: DashMap<ResourceId, DeviceStatus>,
    /// At most one outstanding status probe per resource.
    probes: DashMap<ResourceId, Probe>,
}

impl DeviceGateway {
    pub fn new(control: Arc<dyn DeviceControl>, timeout: Duration) -> Self {
        Self {
            control,
            timeout,
            statuses: DashMap::new(),
            probes: DashMap::new(),
        }
    }

    /// Cached status without touching the device.
    pub fn cached(&self, resource: ResourceId) -> DeviceStatus {
        self.statuses
            .get(&resource)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    /// Probe the device on a helper thread. On timeout or failure the cached
    /// power state is returned with the error attached. A probe that outlives
    /// its caller is reused by the next call instead of starting another.
    pub fn status(&self, resource: ResourceId) -> DeviceStatus {
        let probe = match self.probe(resource) {
            Ok(probe) => probe,
            Err(e) => {
                self.record_error(resource, &e);
                return self.cached(resource);
            }
        };

        let finished = match probe.try_lock_for(self.timeout) {
            Some(rx) => match rx.recv_timeout(self.timeout) {
                Ok(result) => Some(result),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => Some(Err(DeviceError::Unreachable(
                    "probe thread exited".into(),
                ))),
            },
            None => None,
        };

        let outcome = match finished {
            Some(result) => {
                self.probes.remove_if(&resource, |_, p| Arc::ptr_eq(p, &probe));
                result
            }
            None => Err(DeviceError::TimedOut(self.timeout.as_millis())),
        };
        match outcome {
            Ok(power) => self.record_power(resource, power),
            Err(e) => self.record_error(resource, &e),
        }
        self.cached(resource)
    }

    /// The outstanding probe for `resource`, spawning one if none is running.
    fn probe(&self, resource: ResourceId) -> Result<Probe, DeviceError> {
        match self.probes.entry(resource) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                let (tx, rx) = mpsc::channel();
                let control = self.control.clone();
                std::thread::Builder::new()
                    .name("labsched-device-probe".into())
                    .spawn(move || {
                        let _ = tx.send(control.get_status(resource));
                    })
                    .map_err(|err| DeviceError::Unreachable(err.to_string()))?;
                Ok(e.insert(Arc::new(Mutex::new(rx))).clone())
            }
        }
    }

    pub fn activate(&self, resource: ResourceId) -> Result<(), DeviceError> {
        let result = self.control.activate(resource);
        match &result {
            Ok(()) => self.record_power(resource, Power::On),
            Err(e) => self.record_error(resource, e),
        }
        result
    }

    pub fn deactivate(&self, resource: ResourceId) -> Result<(), DeviceError> {
        let result = self.control.deactivate(resource);
        match &result {
            Ok(()) => self.record_power(resource, Power::Off),
            Err(e) => self.record_error(resource, e),
        }
        result
    }

    fn record_power(&self, resource: ResourceId, power: Power) {
        self.statuses.insert(
            resource,
            DeviceStatus {
                power: Some(power),
                error: None,
            },
        );
    }

    fn record_error(&self, resource: ResourceId, error: &DeviceError) {
        warn!(%resource, %error, "device call failed");
        metrics::counter!(DEVICE_ERRORS_TOTAL).increment(1);
        self.statuses.entry(resource).or_default().error = Some(error.to_string());
    }
}


#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::fakes::FakeDevice;
    use super::*;

    #[test]
    fn activate_updates_cache() {
        let gw = DeviceGateway::new(Arc::new(FakeDevice::default()), Duration::from_secs(1));
        let rid = Ulid::new();
        assert_eq!(gw.cached(rid), DeviceStatus::default());
        gw.activate(rid).unwrap();
        assert_eq!(gw.cached(rid).power, Some(Power::On));
        gw.deactivate(rid).unwrap();
        assert_eq!(gw.cached(rid).power, Some(Power::Off));
    }

    #[test]
    fn failure_keeps_last_power_and_attaches_error() {
        let device = Arc::new(FakeDevice::default());
        let gw = DeviceGateway::new(device.clone(), Duration::from_secs(1));
        let rid = Ulid::new();
        gw.activate(rid).unwrap();

        *device.fail_commands.lock() = true;
        assert!(gw.deactivate(rid).is_err());
        let status = gw.cached(rid);
        assert_eq!(status.power, Some(Power::On));
        assert!(status.error.unwrap().contains("relay offline"));
    }

    #[test]
    fn status_probe_clears_error() {
        let gw = DeviceGateway::new(Arc::new(FakeDevice::failing()), Duration::from_secs(1));
        let rid = Ulid::new();
        assert!(gw.activate(rid).is_err());
        let status = gw.status(rid);
        assert_eq!(status.power, Some(Power::On));
        assert_eq!(status.error, None);
    }

    #[test]
    fn slow_probe_returns_cached_with_timeout() {
        let device = Arc::new(FakeDevice::default());
        let gw = DeviceGateway::new(device.clone(), Duration::from_millis(20));
        let rid = Ulid::new();
        gw.deactivate(rid).unwrap();

        *device.status_delay.lock() = Some(Duration::from_millis(500));
        let status = gw.status(rid);
        assert_eq!(status.power, Some(Power::Off));
        assert!(status.error.unwrap().contains("timed out"));
    }

    #[test]
    fn hung_device_sees_one_status_call() {
        let device = Arc::new(FakeDevice::default());
        let gw = DeviceGateway::new(device.clone(), Duration::from_millis(50));
        let rid = Ulid::new();
        gw.activate(rid).unwrap();

        *device.status_delay.lock() = Some(Duration::from_secs(2));
        for _ in 0..20 {
            let status = gw.status(rid);
            assert_eq!(status.power, Some(Power::On));
            assert!(status.error.unwrap().contains("timed out"));
        }
        assert_eq!(device.count("status"), 1);

        // Once the stuck probe answers, its reading is picked up and the
        // next call starts a fresh probe.
        *device.status_delay.lock() = None;
        std::thread::sleep(Duration::from_millis(1200));
        assert_eq!(gw.status(rid).error, None);
        assert_eq!(gw.status(rid).error, None);
        assert_eq!(device.count("status"), 2);
    }
}
