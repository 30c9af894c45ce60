//! POSIX shared memory regions with create/attach/close/unlink lifecycle.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;

use memmap2::MmapMut;
use tandem_core::{Error, Result};
use uuid::Uuid;

/// Prefix for generated region names, reserved to avoid collision with
/// unrelated objects in the system shared-memory namespace.
pub const NAME_PREFIX: &str = "tandem-";

/// Upper bound on region names; POSIX implementations commonly cap the
/// shm name (including the leading slash) at NAME_MAX.
const MAX_NAME_LEN: usize = 250;

/// A named block of memory visible to both peer processes.
///
/// The creator is responsible for the eventual [`unlink`](Self::unlink);
/// an attacher only ever detaches its own mapping. Dropping a creator
/// handle unlinks the region unless [`keep_on_drop`](Self::keep_on_drop)
/// was set, which is how a region created in the worker hands cleanup
/// responsibility to the service process across a message boundary.
pub struct SharedMemory {
    name: String,
    len: usize,
    map: Option<MmapMut>,
    creator: bool,
    unlinked: bool,
    keep: bool,
}

impl SharedMemory {
    /// Allocate a new region of `len` bytes, choosing a unique generated
    /// name when none is given. The region is zero-filled.
    pub fn create(name: Option<&str>, len: usize) -> Result<Self> {
        let name = match name {
            Some(n) => n.to_string(),
            None => format!("{NAME_PREFIX}{}", Uuid::new_v4().simple()),
        };
        validate_name(&name)?;
        if len == 0 {
            return Err(Error::invalid_operation(
                "shared memory region length must be non-zero",
            ));
        }

        let c_name = shm_c_name(&name)?;
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(Error::Resource {
                name,
                message: "failed to create region".to_string(),
                source: Some(io::Error::last_os_error()),
            });
        }
        // File takes ownership of the descriptor from here on.
        let file = unsafe { File::from_raw_fd(fd) };

        if let Err(source) = file.set_len(len as u64) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(Error::Resource {
                name,
                message: format!("failed to size region to {len} bytes"),
                source: Some(source),
            });
        }

        let map = match unsafe { MmapMut::map_mut(&file) } {
            Ok(map) => map,
            Err(source) => {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(Error::Resource {
                    name,
                    message: "failed to map region".to_string(),
                    source: Some(source),
                });
            }
        };

        Ok(Self {
            name,
            len,
            map: Some(map),
            creator: true,
            unlinked: false,
            keep: false,
        })
    }

    /// Map an existing region read/write. Fails if the name does not exist
    /// or the region is smaller than `len`.
    pub fn attach(name: &str, len: usize) -> Result<Self> {
        validate_name(name)?;
        let c_name = shm_c_name(name)?;
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(Error::Resource {
                name: name.to_string(),
                message: "failed to attach to region".to_string(),
                source: Some(io::Error::last_os_error()),
            });
        }
        let file = unsafe { File::from_raw_fd(fd) };

        let actual = file
            .metadata()
            .map_err(|source| Error::Resource {
                name: name.to_string(),
                message: "failed to stat region".to_string(),
                source: Some(source),
            })?
            .len() as usize;
        if actual < len {
            return Err(Error::resource(
                name,
                format!("region holds {actual} bytes but {len} were requested"),
            ));
        }

        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| Error::Resource {
            name: name.to_string(),
            message: "failed to map region".to_string(),
            source: Some(source),
        })?;

        Ok(Self {
            name: name.to_string(),
            len,
            map: Some(map),
            creator: false,
            unlinked: false,
            keep: false,
        })
    }

    /// The region's name in the system shared-memory namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The byte length requested when this handle was created or attached.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True iff this handle created the region (and thus owns the unlink).
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    /// Read view of the region's bytes.
    pub fn as_slice(&self) -> Result<&[u8]> {
        match &self.map {
            Some(map) => Ok(&map[..self.len]),
            None => Err(Error::invalid_operation("region mapping is closed")),
        }
    }

    /// Write view of the region's bytes.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        match &mut self.map {
            Some(map) => Ok(&mut map[..self.len]),
            None => Err(Error::invalid_operation("region mapping is closed")),
        }
    }

    /// Unmap this handle's view. Safe to call repeatedly; other handles on
    /// the same region are unaffected.
    pub fn close(&mut self) {
        self.map = None;
    }

    /// Remove the region from the system namespace. Creator-only; calling
    /// twice is an error. Existing mappings stay valid until closed.
    pub fn unlink(&mut self) -> Result<()> {
        if !self.creator {
            return Err(Error::invalid_operation(format!(
                "only the creator may unlink region '{}'",
                self.name
            )));
        }
        if self.unlinked {
            return Err(Error::invalid_operation(format!(
                "region '{}' is already unlinked",
                self.name
            )));
        }
        let c_name = shm_c_name(&self.name)?;
        let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        self.unlinked = true;
        if rc != 0 {
            return Err(Error::Resource {
                name: self.name.clone(),
                message: "failed to unlink region".to_string(),
                source: Some(io::Error::last_os_error()),
            });
        }
        Ok(())
    }

    /// Keep the region name alive past this handle's drop, handing the
    /// final unlink to whichever peer attaches next.
    pub fn keep_on_drop(&mut self, keep: bool) {
        self.keep = keep;
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        self.map = None;
        if self.creator && !self.unlinked && !self.keep {
            if let Err(e) = self.unlink() {
                tracing::debug!(region = %self.name, "unlink on drop failed: {e}");
            }
        }
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("creator", &self.creator)
            .field("mapped", &self.map.is_some())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::resource(name, "region name has invalid length"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::resource(
            name,
            "region name may only contain [A-Za-z0-9._-]",
        ));
    }
    Ok(())
}

fn shm_c_name(name: &str) -> Result<CString> {
    CString::new(format!("/{name}"))
        .map_err(|_| Error::resource(name, "region name contains a NUL byte"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_attach_read() {
        let mut created = SharedMemory::create(None, 64).unwrap();
        assert!(created.is_creator());
        assert!(created.name().starts_with(NAME_PREFIX));
        // Fresh regions are zero-filled.
        assert!(created.as_slice().unwrap().iter().all(|&b| b == 0));

        created.as_mut_slice().unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);

        let attached = SharedMemory::attach(created.name(), 64).unwrap();
        assert!(!attached.is_creator());
        assert_eq!(&attached.as_slice().unwrap()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn create_rejects_name_collision() {
        let created = SharedMemory::create(None, 16).unwrap();
        let err = SharedMemory::create(Some(created.name()), 16).unwrap_err();
        assert!(matches!(err, Error::Resource { .. }));
    }

    #[test]
    fn attach_rejects_missing_name() {
        let err = SharedMemory::attach("tandem-no-such-region", 16).unwrap_err();
        assert!(matches!(err, Error::Resource { .. }));
    }

    #[test]
    fn attach_rejects_oversized_request() {
        let created = SharedMemory::create(None, 16).unwrap();
        let err = SharedMemory::attach(created.name(), 4096).unwrap_err();
        assert!(matches!(err, Error::Resource { .. }));
    }

    #[test]
    fn unlink_is_creator_only_and_single_shot() {
        let mut created = SharedMemory::create(None, 16).unwrap();
        let mut attached = SharedMemory::attach(created.name(), 16).unwrap();

        let err = attached.unlink().unwrap_err();
        assert!(matches!(err, Error::InvalidOperation { .. }));

        created.unlink().unwrap();
        let err = created.unlink().unwrap_err();
        assert!(matches!(err, Error::InvalidOperation { .. }));
    }

    #[test]
    fn close_is_idempotent_and_independent() {
        let mut created = SharedMemory::create(None, 16).unwrap();
        let mut attached = SharedMemory::attach(created.name(), 16).unwrap();

        attached.close();
        attached.close();
        assert!(attached.as_slice().is_err());

        // The creator's view is unaffected by the attacher closing.
        assert!(created.as_slice().is_ok());
        created.close();
    }

    #[test]
    fn invalid_names_rejected() {
        assert!(SharedMemory::create(Some("has/slash"), 16).is_err());
        assert!(SharedMemory::create(Some(""), 16).is_err());
        assert!(SharedMemory::create(None, 0).is_err());
    }
}
