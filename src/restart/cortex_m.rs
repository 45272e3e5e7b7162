use crate::restart::{Restart, RestartMode};
use crate::source::file::firmware_file_name;

/// Table offset bits of the VTOR register.
const VTOR_TBLOFF_MASK: u32 = 0xFFFF_FF80;

/// Simple restart mechanism for Cortex-M, performing a system reset regardless of the mode.
///
/// Devices able to select a recovery boot source should wrap this.
pub struct SimpleCortexM;

impl Restart for SimpleCortexM {
    fn restart(&mut self, mode: RestartMode) -> ! {
        info!("restarting into {}", mode);
        cortex_m::peripheral::SCB::sys_reset()
    }
}

/// Bytes the application left directly above the initial stack pointer of the updater.
///
/// # Safety
/// The `len` bytes above the initial stack pointer must be readable memory that is not written
/// while the returned slice is alive.
pub unsafe fn handoff_area(len: usize) -> &'static [u8] {
    // SAFETY: the system control block is always present and mapped.
    let vector_table = unsafe { (*cortex_m::peripheral::SCB::PTR).vtor.read() } & VTOR_TBLOFF_MASK;
    // SAFETY: the first entry of the active vector table is the initial stack pointer.
    let stack_top = unsafe { core::ptr::read_volatile(vector_table as *const u32) };
    // SAFETY: upheld by the caller.
    unsafe { core::slice::from_raw_parts(stack_top as *const u8, len) }
}

/// Name of the firmware file handed over by the application, or `default` if there is none.
///
/// # Safety
/// See [`handoff_area`].
pub unsafe fn handed_over_file_name(max_len: usize, prefix: &str, default: &'static str) -> &'static str {
    // SAFETY: upheld by the caller.
    let area = unsafe { handoff_area(max_len) };
    firmware_file_name(area, prefix, default)
}
