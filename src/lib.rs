//! Toolkit for building your own in-application firmware updater, tailored to your needs.
//!
//! The updater is a small program living in a reserved part of program memory.
//! The main application hands over control to it, after which it replaces the application image
//! with a new one, acquired from a [`source::BlockSource`]:
//!
//! * a file on removable storage, either a raw image or a UF2 file ([`source::file`]);
//! * a companion host pushing blocks over a synchronous peripheral link ([`source::host`]).
//!
//! Writing happens through a [`flash::FlashManager`], which brackets the region with unlock and lock,
//! skips erasing sectors that are already erased, and verifies every page right after writing it.
//! The [`machine::Updater`] drives all of this one step at a time, so that the surrounding loop can
//! keep servicing a watchdog.
#![no_std]

#[macro_use]
mod fmt;

pub mod checksum;
pub mod flash;
pub mod machine;
pub mod report;
pub mod restart;
pub mod source;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod mock;

pub use flash::{FlashDevice, FlashRegion};
pub use machine::{Config, Outcome, ProgramState, Updater};
pub use source::{BlockSource, TransferBlock};

/// Configuration errors, detected when an [`Updater`] or a source is constructed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The transfer block size is not a non-zero multiple of the flash page size.
    BlockSize,
    /// The region start or end is not aligned to a flash page.
    PageMisaligned,
    /// Walking the sectors from the region start does not land exactly on the region end.
    SectorMisaligned,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::BlockSize => f.write_str("transfer block size does not fit the flash page size"),
            Error::PageMisaligned => f.write_str("flash region is not page aligned"),
            Error::SectorMisaligned => f.write_str("flash region does not end on a sector boundary"),
        }
    }
}
