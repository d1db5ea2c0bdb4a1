use core::cmp::Ordering;
use core::fmt;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Granule of object addresses. Every object handed out by a space and
/// every object recorded in an image starts on this boundary, and the
/// space bitmaps keep one bit per granule.
pub const OBJECT_ALIGNMENT: usize = 8;

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    #[inline(always)]
    pub const fn from(val: usize) -> Address {
        Address(val)
    }

    #[inline(always)]
    pub fn region_start(self, size: usize) -> Region {
        Region::new(self, self.offset(size))
    }

    #[inline(always)]
    pub fn offset_from(self, base: Address) -> usize {
        debug_assert!(self >= base);

        self.to_usize() - base.to_usize()
    }

    #[inline(always)]
    pub const fn offset(self, offset: usize) -> Address {
        Address(self.0 + offset)
    }

    #[inline(always)]
    pub const fn sub(self, offset: usize) -> Address {
        Address(self.0 - offset)
    }

    #[inline(always)]
    pub const fn to_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    #[inline(always)]
    pub fn to_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    #[inline(always)]
    pub fn to_mut_ptr<T>(&self) -> *mut T {
        self.0 as *const T as *mut T
    }

    #[inline(always)]
    pub const fn null() -> Address {
        Address(0)
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn is_non_null(self) -> bool {
        self.0 != 0
    }

    #[inline(always)]
    pub fn is_aligned_to(self, align: usize) -> bool {
        mem::is_aligned(self.0, align)
    }

    #[inline(always)]
    pub fn is_page_aligned(self) -> bool {
        mem::is_page_aligned(self.to_usize())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.to_usize())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.to_usize())
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Address) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Address) -> Ordering {
        self.to_usize().cmp(&other.to_usize())
    }
}

impl From<usize> for Address {
    fn from(val: usize) -> Address {
        Address(val)
    }
}

/// Half-open address range `[start, end)`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Region {
    pub start: Address,
    pub end: Address,
}

impl Region {
    pub fn new(start: Address, end: Address) -> Region {
        debug_assert!(start <= end);

        Region { start, end }
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.end.to_usize() - self.start.to_usize()
    }

    #[inline(always)]
    pub fn empty(&self) -> bool {
        self.start == self.end
    }

    #[inline(always)]
    pub fn disjunct(&self, other: &Region) -> bool {
        self.end <= other.start || self.start >= other.end
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

pub struct FormattedSize {
    pub size: usize,
}

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

pub const fn round_down(x: usize, n: usize) -> usize {
    (x as isize & -(n as isize)) as usize
}

pub const fn round_up(x: usize, n: usize) -> usize {
    round_down(x + n - 1, n)
}

pub mod mem {
    use super::os;

    /// returns true if given value is a multiple of a page size.
    pub fn is_page_aligned(val: usize) -> bool {
        let align = os::page_size_bits();

        // page size is a power of two
        val == ((val >> align) << align)
    }

    /// round the given value up to the nearest multiple of a page
    pub fn page_align(val: usize) -> usize {
        let align = os::page_size_bits();

        ((val + (1 << align) - 1) >> align) << align
    }

    /// Like `page_align`, but `None` when the rounded value does not fit in a `usize`.
    pub fn checked_page_align(val: usize) -> Option<usize> {
        let align = os::page_size_bits();
        Some((val.checked_add((1 << align) - 1)? >> align) << align)
    }

    /// rounds the given value `val` up to the nearest multiple
    /// of `align`.
    pub fn align_usize(value: usize, align: usize) -> usize {
        if align == 0 {
            return value;
        }

        ((value + align - 1) / align) * align
    }

    /// returns 'true' if th given `value` is already aligned
    /// to `align`.
    pub fn is_aligned(value: usize, align: usize) -> bool {
        align_usize(value, align) == value
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_is_page_aligned() {
            let p = os::page_size();

            assert!(!is_page_aligned(1));
            assert!(!is_page_aligned(64));
            assert!(is_page_aligned(p));
            assert!(is_page_aligned(3 * p));
        }

        #[test]
        fn test_page_align() {
            let p = os::page_size();

            assert_eq!(p, page_align(1));
            assert_eq!(p, page_align(p - 1));
            assert_eq!(p, page_align(p));
            assert_eq!(2 * p, page_align(p + 1));
        }

        #[test]
        fn test_checked_page_align() {
            let p = os::page_size();

            assert_eq!(Some(0), checked_page_align(0));
            assert_eq!(Some(2 * p), checked_page_align(p + 1));
            assert_eq!(Some(usize::MAX - p + 1), checked_page_align(usize::MAX - p + 1));
            assert_eq!(None, checked_page_align(usize::MAX - p + 2));
            assert_eq!(None, checked_page_align(usize::MAX));
        }

        #[test]
        fn test_align_usize() {
            assert_eq!(0, align_usize(0, 8));
            assert_eq!(8, align_usize(1, 8));
            assert_eq!(16, align_usize(9, 8));
            assert_eq!(7, align_usize(7, 0));
            assert!(is_aligned(24, 8));
            assert!(!is_aligned(20, 8));
        }
    }
}

pub mod os {
    use once_cell::sync::Lazy;

    static PAGE_SIZE: Lazy<(usize, usize)> = Lazy::new(|| {
        let size = determine_page_size();
        assert!((size & (size - 1)) == 0);
        (size, size.trailing_zeros() as usize)
    });

    pub fn page_size() -> usize {
        PAGE_SIZE.0
    }

    pub fn page_size_bits() -> usize {
        PAGE_SIZE.1
    }

    #[cfg(target_family = "unix")]
    fn determine_page_size() -> usize {
        let val = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        if val <= 0 {
            panic!("could not determine page size.");
        }

        val as usize
    }

    #[test]
    fn test_page_size_bits() {
        assert_eq!(1 << page_size_bits(), page_size());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round() {
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_down(4095, 4096), 0);
        assert_eq!(round_down(8193, 4096), 8192);
    }

    #[test]
    fn test_region() {
        let a = Address::from(0x1000).region_start(0x1000);
        let b = Address::from(0x2000).region_start(0x1000);

        assert!(a.contains(Address::from(0x1000)));
        assert!(!a.contains(Address::from(0x2000)));
        assert!(a.disjunct(&b));
        assert_eq!(a.size(), 0x1000);
        assert!(Address::from(0x2000).region_start(0).empty());
    }

    #[test]
    fn test_formatted_size() {
        assert_eq!(format!("{}", formatted_size(512)), "512B");
        assert_eq!(format!("{}", formatted_size(4 * KB)), "4.0K");
        assert_eq!(format!("{}", formatted_size(16 * MB)), "16.0M");
    }
}
