//! A control file that gates access to the driver: at most one user may hold it open.
//!
//! The file only tracks whether it's open; it doesn't support reading, writing or ioctls.

use core::sync::atomic::{AtomicBool, Ordering};
use crate::E1000Error;

/// A named control file registered under a major device number.
pub struct ControlFile {
    name: &'static str,
    major: u32,
    open: AtomicBool,
}

impl ControlFile {
    /// Registers a control file with the given name and major number.
    pub fn register(name: &'static str, major: u32) -> ControlFile {
        info!("e1000::control_file: registered {} with major number {}", name, major);
        info!("e1000::control_file: to talk to the driver, create a device file with: mknod {} c {} 0", name, major);
        ControlFile { name, major, open: AtomicBool::new(false) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    /// Opens the file, failing with [`E1000Error::Busy`] if it's already open.
    pub fn open(&self) -> Result<ControlFileHandle<'_>, E1000Error> {
        if self.open.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            warn!("e1000::control_file::open(): {} is already open", self.name);
            return Err(E1000Error::Busy);
        }
        debug!("e1000::control_file::open(): opened {}", self.name);
        Ok(ControlFileHandle { file: self })
    }

    /// Closes the file. Dropping the handle has the same effect.
    pub fn release(&self, handle: ControlFileHandle<'_>) {
        drop(handle);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Drop for ControlFile {
    fn drop(&mut self) {
        info!("e1000::control_file: unregistered {} (major number {})", self.name, self.major);
    }
}


/// An open [`ControlFile`], which is closed when this handle is dropped.
pub struct ControlFileHandle<'f> {
    file: &'f ControlFile,
}

impl<'f> Drop for ControlFileHandle<'f> {
    fn drop(&mut self) {
        self.file.open.store(false, Ordering::Release);
        debug!("e1000::control_file: released {}", self.file.name);
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn second_open_is_busy_until_release() {
        let file = ControlFile::register("my_e1000_driver_file", 100);
        let handle = file.open().unwrap();
        assert!(file.is_open());
        assert_eq!(file.open().err(), Some(E1000Error::Busy));

        file.release(handle);
        assert!(!file.is_open());
        let handle = file.open().unwrap();
        drop(handle);
        assert!(!file.is_open());
    }
}
