//! Periodic CPU and load sampling.

use std::time::Duration;

use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How often the default monitor samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// One resource sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// Global CPU usage, percent.
    pub cpu_usage: f32,
    /// One-minute load average.
    pub load_average: f64,
    /// Logical cores.
    pub cores: usize,
}

impl ResourceSample {
    /// A sample describing an idle machine.
    pub fn idle() -> Self {
        Self {
            cpu_usage: 0.0,
            load_average: 0.0,
            cores: num_cpus::get(),
        }
    }
}

/// Source of resource samples.
pub trait CpuProbe: Send + 'static {
    fn sample(&mut self) -> ResourceSample;
}

/// [`CpuProbe`] backed by `sysinfo`.
pub struct SysinfoProbe {
    sys: System,
    cores: usize,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        Self {
            sys,
            cores: num_cpus::get(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProbe for SysinfoProbe {
    fn sample(&mut self) -> ResourceSample {
        self.sys.refresh_cpu();
        ResourceSample {
            cpu_usage: self.sys.global_cpu_info().cpu_usage(),
            load_average: System::load_average().one,
            cores: self.cores,
        }
    }
}

/// Background task publishing the latest [`ResourceSample`].
pub struct ResourceMonitor {
    rx: watch::Receiver<ResourceSample>,
    fixed_tx: Option<watch::Sender<ResourceSample>>,
    handle: Option<JoinHandle<()>>,
}

impl ResourceMonitor {
    /// Sample `probe` every `interval` on a background task.
    pub fn spawn<P: CpuProbe>(mut probe: P, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(ResourceSample::idle());
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let sample = probe.sample();
                tracing::trace!(cpu = sample.cpu_usage, load = sample.load_average, "Resource sample");
                if tx.send(sample).is_err() {
                    break;
                }
            }
        });
        Self {
            rx,
            fixed_tx: None,
            handle: Some(handle),
        }
    }

    /// A monitor that always reports `sample`.
    pub fn fixed(sample: ResourceSample) -> Self {
        let (tx, rx) = watch::channel(sample);
        Self {
            rx,
            fixed_tx: Some(tx),
            handle: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceSample> {
        self.rx.clone()
    }

    pub fn latest(&self) -> ResourceSample {
        *self.rx.borrow()
    }

    /// Replace the sample reported by a fixed monitor.
    pub fn set(&self, sample: ResourceSample) {
        if let Some(tx) = &self.fixed_tx {
            tx.send_replace(sample);
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
