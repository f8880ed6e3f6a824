use std::fmt;
use std::ops::{BitAnd, BitOr};

/// Open mode for a blob or blob store.
///
/// A store advertises the flags it supports; a handle carries the flags it
/// was opened with, masked by the store's.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const NONE: OpenFlags = OpenFlags(0);
    pub const READ: OpenFlags = OpenFlags(1 << 0);
    pub const WRITE: OpenFlags = OpenFlags(1 << 1);
    pub const CREATE: OpenFlags = OpenFlags(1 << 2);
    pub const EXCL: OpenFlags = OpenFlags(1 << 3);
    pub const APPEND: OpenFlags = OpenFlags(1 << 4);
    pub const TRUNCATE: OpenFlags = OpenFlags(1 << 5);

    pub const RDONLY: OpenFlags = Self::READ;
    pub const WRONLY: OpenFlags = Self::WRITE;
    pub const RDWR: OpenFlags = OpenFlags(Self::READ.0 | Self::WRITE.0);
    pub const RDWR_CREATE: OpenFlags = OpenFlags(Self::RDWR.0 | Self::CREATE.0);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_read_allowed(self) -> bool {
        self.contains(Self::READ)
    }

    pub const fn is_write_allowed(self) -> bool {
        self.contains(Self::WRITE)
    }

    pub const fn is_read_write_allowed(self) -> bool {
        self.contains(Self::RDWR)
    }

    pub const fn is_create_allowed(self) -> bool {
        self.contains(Self::CREATE)
    }

    pub const fn is_create_exclusive(self) -> bool {
        self.contains(Self::CREATE) && self.contains(Self::EXCL)
    }

    /// Restrict `self` to what `allowed` permits.
    ///
    /// Create/exclusive bits only survive when writing survives.
    pub fn mask(self, allowed: OpenFlags) -> OpenFlags {
        let mut masked = OpenFlags(self.0 & allowed.0);
        if !masked.is_write_allowed() {
            let write_only = Self::CREATE.0 | Self::EXCL.0 | Self::TRUNCATE.0 | Self::APPEND.0;
            masked = OpenFlags(masked.0 & !write_only);
        }
        masked
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

impl BitAnd for OpenFlags {
    type Output = OpenFlags;

    fn bitand(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 & rhs.0)
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::with_capacity(6);
        for (flag, c) in [
            (Self::READ, 'R'),
            (Self::WRITE, 'W'),
            (Self::CREATE, 'C'),
            (Self::EXCL, 'X'),
            (Self::APPEND, 'A'),
            (Self::TRUNCATE, 'T'),
        ] {
            if self.contains(flag) {
                s.push(c);
            }
        }
        f.write_str(&s)
    }
}

impl fmt::Debug for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpenFlags({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        assert!(OpenFlags::RDONLY.is_read_allowed());
        assert!(!OpenFlags::RDONLY.is_write_allowed());
        assert!(OpenFlags::RDWR.is_read_write_allowed());
        assert!(!OpenFlags::WRONLY.is_read_write_allowed());
        assert!(OpenFlags::RDWR_CREATE.is_create_allowed());
        assert!(!OpenFlags::RDWR_CREATE.is_create_exclusive());
        assert!((OpenFlags::RDWR_CREATE | OpenFlags::EXCL).is_create_exclusive());
    }

    #[test]
    fn mask_drops_create_without_write() {
        let masked = OpenFlags::RDWR_CREATE.mask(OpenFlags::RDONLY);
        assert_eq!(masked, OpenFlags::RDONLY);
        assert!(!masked.is_create_allowed());

        let masked = OpenFlags::RDWR_CREATE.mask(OpenFlags::RDWR_CREATE);
        assert_eq!(masked, OpenFlags::RDWR_CREATE);
    }

    #[test]
    fn display_lists_set_bits() {
        assert_eq!(OpenFlags::RDONLY.to_string(), "R");
        assert_eq!(OpenFlags::RDWR_CREATE.to_string(), "RWC");
        assert_eq!((OpenFlags::RDWR_CREATE | OpenFlags::EXCL).to_string(), "RWCX");
        assert_eq!(OpenFlags::NONE.to_string(), "");
    }
}
