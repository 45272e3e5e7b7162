//! Handing control back once the updater is done, successful or not.

#[cfg(feature = "cortex_m")]
pub mod cortex_m;

/// What to start after the restart.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RestartMode {
    /// The freshly written application.
    Firmware,
    /// A safe mode from which the device can be recovered, as the application cannot be trusted.
    Recovery,
}

/// Restart mechanism of the device.
///
/// Could for example select a ROM bootloader before resetting when asked for [`RestartMode::Recovery`].
pub trait Restart {
    fn restart(&mut self, mode: RestartMode) -> !;
}
