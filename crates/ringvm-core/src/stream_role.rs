//! Stream roles and their per-device synchronization policy.
//!
//! Every stream plays exactly one role. The role together with the device
//! kind decides whether dependents on another stream need a soft sync token
//! before they may consume a result, and which release instruction signals
//! completion of a tensor on that stream.
//!
//! | Role | Soft sync | Release instruction |
//! |------|-----------|---------------------|
//! | `Compute` | device is not CPU | `<device-tag>.ReleaseTensor` |
//! | `Host2Device` | never | `cuda_h2d.ReleaseTensor` |
//! | `Device2Host` | never | `cuda_d2h.ReleaseTensor` |
//! | `SyncedLaunchedCollective` | device is not CPU | `comm_net` / `sync_launched_nccl` |
//! | `AsyncedLaunchedCollective` | never | `comm_net` / `async_launched_nccl` |

use std::borrow::Cow;
use std::fmt;

use crate::error::{Result, VmError};
use crate::types::DeviceType;

/// Role of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamRole {
    /// Placeholder role. Never valid at runtime.
    Invalid,
    /// Kernel execution.
    Compute,
    /// Host to device copies.
    Host2Device,
    /// Device to host copies.
    Device2Host,
    /// Collective communication launched synchronously.
    SyncedLaunchedCollective,
    /// Collective communication launched asynchronously.
    AsyncedLaunchedCollective,
    /// Critical section entry/exit.
    CriticalSection,
}

impl StreamRole {
    /// All roles, including the ones without runtime support.
    pub const ALL: [StreamRole; 7] = [
        StreamRole::Invalid,
        StreamRole::Compute,
        StreamRole::Host2Device,
        StreamRole::Device2Host,
        StreamRole::SyncedLaunchedCollective,
        StreamRole::AsyncedLaunchedCollective,
        StreamRole::CriticalSection,
    ];

    /// Roles that can be scheduled.
    pub const SCHEDULABLE: [StreamRole; 5] = [
        StreamRole::Compute,
        StreamRole::Host2Device,
        StreamRole::Device2Host,
        StreamRole::SyncedLaunchedCollective,
        StreamRole::AsyncedLaunchedCollective,
    ];

    /// Whether the scheduler has a handler for this role.
    pub fn is_schedulable(self) -> bool {
        !matches!(self, StreamRole::Invalid | StreamRole::CriticalSection)
    }

    /// Whether a cross-stream consumer must wait for a soft sync token.
    ///
    /// # Panics
    ///
    /// Panics for [`StreamRole::Invalid`] and [`StreamRole::CriticalSection`];
    /// callers must never ask about those roles.
    pub fn need_soft_sync(self, device: DeviceType) -> bool {
        match self {
            StreamRole::Invalid => fatal_role(self, device),
            StreamRole::Compute => device != DeviceType::Cpu,
            StreamRole::Host2Device => false,
            StreamRole::Device2Host => false,
            StreamRole::SyncedLaunchedCollective => device != DeviceType::Cpu,
            StreamRole::AsyncedLaunchedCollective => false,
            StreamRole::CriticalSection => fatal_role(self, device),
        }
    }

    /// Name of the instruction that releases a tensor on this role/device.
    ///
    /// # Panics
    ///
    /// Panics for [`StreamRole::Invalid`].
    pub fn release_instruction_name(self, device: DeviceType) -> Result<Cow<'static, str>> {
        match self {
            StreamRole::Invalid => fatal_role(self, device),
            StreamRole::Compute => Ok(Cow::Owned(format!("{}.ReleaseTensor", device.tag()))),
            StreamRole::Host2Device => {
                require_accelerator(self, device)?;
                Ok(Cow::Borrowed("cuda_h2d.ReleaseTensor"))
            }
            StreamRole::Device2Host => {
                require_accelerator(self, device)?;
                Ok(Cow::Borrowed("cuda_d2h.ReleaseTensor"))
            }
            StreamRole::SyncedLaunchedCollective => {
                if device == DeviceType::Cpu {
                    return Ok(Cow::Borrowed("comm_net.ReleaseTensor"));
                }
                Ok(Cow::Borrowed("sync_launched_nccl.ReleaseTensor"))
            }
            StreamRole::AsyncedLaunchedCollective => {
                if device == DeviceType::Cpu {
                    return Ok(Cow::Borrowed("comm_net.ReleaseTensor"));
                }
                Ok(Cow::Borrowed("async_launched_nccl.ReleaseTensor"))
            }
            StreamRole::CriticalSection => Err(VmError::Unimplemented(
                "release instruction for critical section streams".to_string(),
            )),
        }
    }

    /// Whether this role can run on the given device at all.
    pub fn supports_device(self, device: DeviceType) -> bool {
        match self {
            StreamRole::Host2Device | StreamRole::Device2Host => device.is_accelerator(),
            other => other.is_schedulable(),
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamRole::Invalid => "invalid",
            StreamRole::Compute => "compute",
            StreamRole::Host2Device => "h2d",
            StreamRole::Device2Host => "d2h",
            StreamRole::SyncedLaunchedCollective => "synced_collective",
            StreamRole::AsyncedLaunchedCollective => "asynced_collective",
            StreamRole::CriticalSection => "critical_section",
        };
        f.write_str(name)
    }
}

fn require_accelerator(role: StreamRole, device: DeviceType) -> Result<()> {
    if device.is_accelerator() {
        Ok(())
    } else {
        Err(VmError::RoleDeviceMismatch { role, device })
    }
}

#[cold]
fn fatal_role(role: StreamRole, device: DeviceType) -> ! {
    tracing::error!(%role, %device, "stream role has no handler");
    panic!("stream role {role} has no handler (device {device})");
}

/// Stream type tag: a role bound to a concrete device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamDesc {
    /// Role of the stream.
    pub role: StreamRole,
    /// Device kind.
    pub device_type: DeviceType,
    /// Device ordinal.
    pub device_id: u32,
}

impl StreamDesc {
    /// Create a stream descriptor.
    pub fn new(role: StreamRole, device_type: DeviceType, device_id: u32) -> Self {
        Self {
            role,
            device_type,
            device_id,
        }
    }

    /// Compute stream on a device.
    pub fn compute(device_type: DeviceType, device_id: u32) -> Self {
        Self::new(StreamRole::Compute, device_type, device_id)
    }

    /// Whether dependents on other streams need a soft sync token.
    pub fn need_soft_sync(&self) -> bool {
        self.role.need_soft_sync(self.device_type)
    }

    /// Release instruction name for this stream.
    pub fn release_instruction_name(&self) -> Result<Cow<'static, str>> {
        self.role.release_instruction_name(self.device_type)
    }
}

impl fmt::Display for StreamDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.role, self.device_type, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_sync_table() {
        assert!(!StreamRole::Compute.need_soft_sync(DeviceType::Cpu));
        assert!(StreamRole::Compute.need_soft_sync(DeviceType::Cuda));
        assert!(!StreamRole::Host2Device.need_soft_sync(DeviceType::Cuda));
        assert!(!StreamRole::Device2Host.need_soft_sync(DeviceType::Cuda));
        assert!(!StreamRole::SyncedLaunchedCollective.need_soft_sync(DeviceType::Cpu));
        assert!(StreamRole::SyncedLaunchedCollective.need_soft_sync(DeviceType::Cuda));
        assert!(!StreamRole::AsyncedLaunchedCollective.need_soft_sync(DeviceType::Cuda));
    }

    #[test]
    fn test_release_names() {
        assert_eq!(
            StreamRole::Compute
                .release_instruction_name(DeviceType::Cpu)
                .unwrap(),
            "cpu.ReleaseTensor"
        );
        assert_eq!(
            StreamRole::Compute
                .release_instruction_name(DeviceType::Cuda)
                .unwrap(),
            "cuda.ReleaseTensor"
        );
        assert_eq!(
            StreamRole::Host2Device
                .release_instruction_name(DeviceType::Cuda)
                .unwrap(),
            "cuda_h2d.ReleaseTensor"
        );
        assert_eq!(
            StreamRole::Device2Host
                .release_instruction_name(DeviceType::Cuda)
                .unwrap(),
            "cuda_d2h.ReleaseTensor"
        );
        assert_eq!(
            StreamRole::SyncedLaunchedCollective
                .release_instruction_name(DeviceType::Cpu)
                .unwrap(),
            "comm_net.ReleaseTensor"
        );
        assert_eq!(
            StreamRole::SyncedLaunchedCollective
                .release_instruction_name(DeviceType::Cuda)
                .unwrap(),
            "sync_launched_nccl.ReleaseTensor"
        );
        assert_eq!(
            StreamRole::AsyncedLaunchedCollective
                .release_instruction_name(DeviceType::Cuda)
                .unwrap(),
            "async_launched_nccl.ReleaseTensor"
        );
    }

    #[test]
    fn test_copy_roles_reject_cpu() {
        for role in [StreamRole::Host2Device, StreamRole::Device2Host] {
            let err = role.release_instruction_name(DeviceType::Cpu).unwrap_err();
            assert_eq!(
                err,
                VmError::RoleDeviceMismatch {
                    role,
                    device: DeviceType::Cpu
                }
            );
            assert!(!role.supports_device(DeviceType::Cpu));
        }
    }

    #[test]
    fn test_critical_section_release_unimplemented() {
        let err = StreamRole::CriticalSection
            .release_instruction_name(DeviceType::Cpu)
            .unwrap_err();
        assert!(matches!(err, VmError::Unimplemented(_)));
    }

    #[test]
    #[should_panic(expected = "has no handler")]
    fn test_invalid_role_soft_sync_panics() {
        StreamRole::Invalid.need_soft_sync(DeviceType::Cuda);
    }

    #[test]
    #[should_panic(expected = "has no handler")]
    fn test_invalid_role_release_panics() {
        let _ = StreamRole::Invalid.release_instruction_name(DeviceType::Cpu);
    }

    #[test]
    fn test_stream_desc_display() {
        let desc = StreamDesc::compute(DeviceType::Cuda, 1);
        assert_eq!(desc.to_string(), "compute@cuda:1");
        assert!(desc.need_soft_sync());
    }
}
