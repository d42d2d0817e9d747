use anyhow::{bail, Result};

/// Per-frame eye-state classifier backed by a capture device.
pub trait EyeStateDetector: Send {
    /// Grabs one frame and reports whether both eyes are open. An `Err`
    /// means the device is no longer usable.
    fn eyes_open(&mut self) -> Result<bool>;

    /// Frees the underlying device. Called once when the loop exits.
    fn release(&mut self) {}
}

/// Opens a detector for a camera. Failing to acquire one puts the blink
/// sampler into simulated mode.
pub trait CaptureDevice: Send + Sync {
    fn acquire(&self, camera_index: u32) -> Result<Box<dyn EyeStateDetector>>;
}

/// Used when no camera backend is linked in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCaptureDevice;

impl CaptureDevice for NoCaptureDevice {
    fn acquire(&self, camera_index: u32) -> Result<Box<dyn EyeStateDetector>> {
        bail!("no capture backend available for camera {camera_index}")
    }
}
