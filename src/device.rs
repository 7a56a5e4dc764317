//! Opaque device environment consumed by the kernel code generator.
//!
//! The IR layer never talks to a device; the code generator receives a
//! [`DeviceEnv`] value and compiles cluster sources against it, keyed by
//! node signatures. Device selection is an explicit [`DeviceConfig`] record
//! threaded by value; there is no process-wide device table.

use crate::ir::{Coord, DataValue};

/// Classes of compute devices a context can be built over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    /// Host CPUs.
    Cpu,
    /// Discrete or integrated GPUs.
    Gpu,
    /// Other accelerators.
    Acc,
}

/// How to pick the platform a context is created on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlatformPredicate {
    /// Any available platform.
    Any,
    /// The platform whose name contains the given fragment.
    NameContains(String),
    /// The platform with the given vendor string.
    Vendor(String),
}

/// Device selection options.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Which platform to select.
    pub platform_match: PlatformPredicate,
    /// Which device class to select on it.
    pub device_type: DeviceType,
    /// How many devices to put into the context.
    pub device_count: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            platform_match: PlatformPredicate::Any,
            device_type: DeviceType::Gpu,
            device_count: 1,
        }
    }
}

/// Description of one platform.
#[derive(Clone, Debug)]
pub struct PlatformInfo {
    /// Platform name.
    pub name: String,
    /// Platform vendor.
    pub vendor: String,
}

/// Description of one device.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// Device name.
    pub name: String,
    /// Device class.
    pub device_type: DeviceType,
}

/// One kernel argument binding.
#[derive(Clone, Debug)]
pub enum KernelArg {
    /// A device buffer, named by the slot the runtime allocated it in.
    Buffer(usize),
    /// An immediate scalar.
    Scalar(DataValue),
}

/// The device environment interface.
///
/// Implementations wrap a real platform stack (platforms, devices,
/// contexts, programs, kernels, queues). The IR layer requires only the
/// capabilities below: enumerate, build a context from a [`DeviceConfig`],
/// compile source text, fetch kernels by name, enqueue with argument
/// bindings, and wait. Errors are the implementation's own; nothing in the
/// IR error taxonomy describes device failures.
pub trait DeviceEnv {
    /// Context over a selected device set.
    type Context;
    /// A compiled program.
    type Program;
    /// A kernel extracted from a program.
    type Kernel;
    /// A command queue bound to one device of a context.
    type Queue;
    /// The implementation's error type.
    type Error;

    /// Enumerate the available platforms.
    fn platforms(&self) -> Vec<PlatformInfo>;

    /// Enumerate the devices of one platform.
    fn devices(&self, platform: usize) -> Vec<DeviceInfo>;

    /// Create a context on the devices selected by `config`.
    fn create_context(&mut self, config: &DeviceConfig) -> Result<Self::Context, Self::Error>;

    /// Compile a program from source text.
    fn compile(&mut self, cx: &Self::Context, source: &str) -> Result<Self::Program, Self::Error>;

    /// Retrieve a kernel by name.
    fn kernel(&self, program: &Self::Program, name: &str) -> Result<Self::Kernel, Self::Error>;

    /// Create a queue on one device of a context.
    fn queue(&mut self, cx: &Self::Context, device: usize) -> Result<Self::Queue, Self::Error>;

    /// Enqueue a kernel over a global work extent.
    fn enqueue(
        &mut self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        args: &[KernelArg],
        global: Coord,
    ) -> Result<(), Self::Error>;

    /// Wait for everything enqueued on a queue.
    fn wait(&mut self, queue: &Self::Queue) -> Result<(), Self::Error>;
}
