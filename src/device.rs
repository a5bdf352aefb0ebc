//! Device selection for model inference.

use clap::ValueEnum;
use tch::Device;

/// Where to run the diffusion models. The request is resolved once at
/// startup; accelerated variants fall back to the CPU without an error
/// when the corresponding backend is not present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceRequest {
    /// Run everything on the CPU.
    Cpu,
    /// Use a CUDA device when one is available.
    Cuda,
    /// Use the Apple Metal backend when available.
    Mps,
    /// Pick the best available device.
    Auto,
}

impl DeviceRequest {
    pub fn resolve(self) -> Device {
        match self {
            Self::Cpu => Device::Cpu,
            Self::Cuda => Device::cuda_if_available(),
            Self::Mps => {
                if tch::utils::has_mps() {
                    Device::Mps
                } else {
                    Device::Cpu
                }
            }
            Self::Auto => {
                if tch::utils::has_mps() {
                    Device::Mps
                } else {
                    Device::cuda_if_available()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_request_resolves_to_cpu() {
        assert_eq!(DeviceRequest::Cpu.resolve(), Device::Cpu);
    }

    #[test]
    fn accelerated_requests_resolve_to_some_device() {
        // The outcome depends on the machine, the call just has to settle
        // on a usable device.
        let _ = DeviceRequest::Cuda.resolve();
        let _ = DeviceRequest::Mps.resolve();
        let _ = DeviceRequest::Auto.resolve();
    }
}
