//! Memory addressing.
//!
//! The hypervisor deals with two address spaces. A [`Pa`] names a byte of
//! machine RAM. An [`Ipa`] names a byte of a domain's intermediate physical
//! address space; stage-2 translation maps the latter onto the former.
//! Both spaces are 48 bits wide and split into 4 KiB frames.

/// Page size.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: usize = 12;
/// Mask for page offset.
pub const PAGE_MASK: usize = 0xfff;
/// Width of both physical and intermediate physical addresses.
pub const ADDR_BITS: usize = 48;

/// Physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// PA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new physical address with a check.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < (1 << ADDR_BITS) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Physical address of the first byte of frame `pfn`.
    #[inline]
    pub const fn from_pfn(pfn: usize) -> Self {
        Self(pfn << PAGE_SHIFT)
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Frame number of this address.
    #[inline]
    pub const fn pfn(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Offset of this address inside its frame.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns true if this address is the start of a frame.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Move this address by `pfn_offset` frames in either direction.
    ///
    /// Returns None when the result leaves the physical address space.
    #[inline]
    pub fn shift_pfn(self, pfn_offset: isize) -> Option<Self> {
        let delta = pfn_offset.checked_mul(PAGE_SIZE as isize)?;
        self.0.checked_add_signed(delta).and_then(Self::new)
    }
}

/// Intermediate physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Ipa(usize);

impl Ipa {
    /// IPA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new intermediate physical address with a check.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < (1 << ADDR_BITS) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Intermediate physical address of the first byte of frame `pfn`.
    #[inline]
    pub const fn from_pfn(pfn: usize) -> Self {
        Self(pfn << PAGE_SHIFT)
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Frame number of this address.
    #[inline]
    pub const fn pfn(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Offset of this address inside its frame.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns true if this address is the start of a frame.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 += other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<$t> for $t {
            type Output = usize;

            fn sub(self, other: $t) -> usize {
                self.0 - other.0
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }
    };
}

impl_arith!(Pa);
impl_arith!(Ipa);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_pfn_both_ways() {
        let pa = Pa::from_pfn(0x80200);
        assert_eq!(pa.shift_pfn(7), Some(Pa::from_pfn(0x80207)));
        assert_eq!(pa.shift_pfn(-0x200), Some(Pa::from_pfn(0x80000)));
        assert_eq!(Pa::from_pfn(3).shift_pfn(-4), None);
        assert_eq!(format!("{:?}", pa + 0x10), "Pa(0x80200010)");
    }
}
