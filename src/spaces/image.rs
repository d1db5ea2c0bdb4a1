//! On-disk layout of a boot image.
//!
//! An image is a [`ImageHeader`] followed by a run of objects, each aligned to
//! [`OBJECT_ALIGNMENT`] and starting with a `u64` word that holds the object's total size.

use crate::utils::*;
use bytemuck::{Pod, Zeroable};
use std::io;
use std::path::Path;

pub const IMAGE_MAGIC: [u8; 8] = *b"gcsimg\n\0";
pub const IMAGE_VERSION: [u8; 8] = *b"0001\0\0\0\0";

const OBJECT_HEADER_SIZE: usize = core::mem::size_of::<u64>();

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct ImageHeader {
    magic: [u8; 8],
    version: [u8; 8],
    /// Address the image wants to be mapped at, 0 for anywhere.
    image_begin: u64,
    /// Size of the whole file.
    image_size: u64,
    objects_offset: u64,
    objects_end: u64,
    object_count: u64,
    /// Adler-32 of `[objects_offset, objects_end)`.
    checksum: u32,
    object_alignment: u32,
}

impl ImageHeader {
    pub const SIZE: usize = core::mem::size_of::<ImageHeader>();

    pub fn magic(&self) -> &[u8; 8] {
        &self.magic
    }

    pub fn version(&self) -> &[u8; 8] {
        &self.version
    }

    pub fn image_begin(&self) -> Option<Address> {
        match self.image_begin {
            0 => None,
            begin => Some(Address::from(begin as usize)),
        }
    }

    pub fn image_size(&self) -> usize {
        self.image_size as usize
    }

    pub fn objects_offset(&self) -> usize {
        self.objects_offset as usize
    }

    pub fn objects_end(&self) -> usize {
        self.objects_end as usize
    }

    pub fn object_count(&self) -> usize {
        self.object_count as usize
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn object_alignment(&self) -> usize {
        self.object_alignment as usize
    }

    /// Checks everything that can be checked without mapping the image.
    pub fn validate(&self, file_len: u64) -> Result<(), String> {
        if self.magic != IMAGE_MAGIC {
            return Err(format!("bad magic {:?}", self.magic));
        }
        if self.version != IMAGE_VERSION {
            return Err(format!(
                "unsupported version {:?}, expected {:?}",
                String::from_utf8_lossy(&self.version),
                String::from_utf8_lossy(&IMAGE_VERSION)
            ));
        }
        if self.object_alignment() != OBJECT_ALIGNMENT {
            return Err(format!(
                "object alignment {} does not match {}",
                self.object_alignment, OBJECT_ALIGNMENT
            ));
        }
        if self.image_size != file_len {
            return Err(format!(
                "header says {} bytes but the file has {}",
                self.image_size, file_len
            ));
        }
        if self.objects_offset < ImageHeader::SIZE as u64
            || !mem::is_aligned(self.objects_offset(), OBJECT_ALIGNMENT)
        {
            return Err(format!("bad objects offset {}", self.objects_offset));
        }
        if self.objects_offset > self.objects_end || self.objects_end > self.image_size {
            return Err(format!(
                "object region [{}, {}) does not fit in {} bytes",
                self.objects_offset, self.objects_end, self.image_size
            ));
        }
        Ok(())
    }
}

const ADLER_MOD: u32 = 65521;
/// Largest run of bytes that can be summed before `b` may overflow.
const ADLER_NMAX: usize = 5552;

pub fn adler32(data: &[u8]) -> u32 {
    let (mut a, mut b) = (1u32, 0u32);
    for chunk in data.chunks(ADLER_NMAX) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= ADLER_MOD;
        b %= ADLER_MOD;
    }
    (b << 16) | a
}

/// Reads the size word of the object at `offset` in `region`.
fn object_size_at(region: &[u8], offset: usize) -> Option<usize> {
    let word = region.get(offset..offset + OBJECT_HEADER_SIZE)?;
    Some(bytemuck::pod_read_unaligned::<u64>(word) as usize)
}

/// Walks the object region `region`, which is mapped at `base`, calling `visitor` with the
/// address of every object. Returns the number of objects, or why the region is malformed.
pub fn walk_objects(
    base: Address,
    region: &[u8],
    mut visitor: impl FnMut(Address),
) -> Result<usize, String> {
    let mut offset = 0;
    let mut count = 0;
    while offset < region.len() {
        let size = object_size_at(region, offset)
            .ok_or_else(|| format!("truncated object header at +{}", offset))?;
        if size < OBJECT_HEADER_SIZE || !mem::is_aligned(size, OBJECT_ALIGNMENT) {
            return Err(format!("object at +{} has bad size {}", offset, size));
        }
        if size > region.len() - offset {
            return Err(format!(
                "object at +{} of size {} runs past the object region",
                offset, size
            ));
        }
        visitor(base.offset(offset));
        offset += size;
        count += 1;
    }
    Ok(count)
}

/// Builds image files.
pub struct ImageWriter {
    requested_begin: Option<Address>,
    objects: Vec<u8>,
    object_count: usize,
}

impl ImageWriter {
    pub fn new() -> Self {
        Self {
            requested_begin: None,
            objects: Vec::new(),
            object_count: 0,
        }
    }

    /// The image will only load at `begin`.
    pub fn with_requested_begin(mut self, begin: Address) -> Self {
        self.requested_begin = Some(begin);
        self
    }

    /// Appends an object carrying `payload` and returns its offset from the start of the image.
    pub fn add_object(&mut self, payload: &[u8]) -> usize {
        let offset = ImageHeader::SIZE + self.objects.len();
        let size = round_up(OBJECT_HEADER_SIZE + payload.len(), OBJECT_ALIGNMENT);
        self.objects.extend_from_slice(&(size as u64).to_ne_bytes());
        self.objects.extend_from_slice(payload);
        self.objects.resize(offset - ImageHeader::SIZE + size, 0);
        self.object_count += 1;
        offset
    }

    pub fn object_count(&self) -> usize {
        self.object_count
    }

    pub fn header(&self) -> ImageHeader {
        let objects_end = ImageHeader::SIZE + self.objects.len();
        ImageHeader {
            magic: IMAGE_MAGIC,
            version: IMAGE_VERSION,
            image_begin: self.requested_begin.map_or(0, |begin| begin.to_usize() as u64),
            image_size: objects_end as u64,
            objects_offset: ImageHeader::SIZE as u64,
            objects_end: objects_end as u64,
            object_count: self.object_count as u64,
            checksum: adler32(&self.objects),
            object_alignment: OBJECT_ALIGNMENT as u32,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let header = self.header();
        let mut image = Vec::with_capacity(header.image_size());
        image.extend_from_slice(bytemuck::bytes_of(&header));
        image.extend_from_slice(&self.objects);
        image
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> io::Result<()> {
        std::fs::write(path, self.build())
    }
}

impl Default for ImageWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(ImageHeader::SIZE, 64);
        assert!(mem::is_aligned(ImageHeader::SIZE, OBJECT_ALIGNMENT));
    }

    #[test]
    fn test_adler32() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
        // Long enough to need the intermediate reductions.
        let big = vec![0xffu8; 100_000];
        let (mut a, mut b) = (1u64, 0u64);
        for &byte in &big {
            a = (a + byte as u64) % 65521;
            b = (b + a) % 65521;
        }
        assert_eq!(adler32(&big), ((b << 16) | a) as u32);
    }

    #[test]
    fn test_writer_layout() {
        let mut writer = ImageWriter::new();
        assert_eq!(writer.add_object(&[1, 2, 3]), 64);
        assert_eq!(writer.add_object(&[]), 64 + 16);
        assert_eq!(writer.add_object(&[7; 8]), 64 + 16 + 8);
        let image = writer.build();
        let header: ImageHeader = bytemuck::pod_read_unaligned(&image[..ImageHeader::SIZE]);
        assert_eq!(header.image_size(), image.len());
        assert_eq!(header.objects_end(), 64 + 16 + 8 + 16);
        assert_eq!(header.object_count(), 3);
        assert_eq!(header.image_begin(), None);
        header.validate(image.len() as u64).unwrap();

        let mut sizes = Vec::new();
        let region = &image[header.objects_offset()..header.objects_end()];
        let base = Address::from(0x1000);
        let count = walk_objects(base, region, |addr| {
            sizes.push(object_size_at(region, addr.offset_from(base)).unwrap())
        })
        .unwrap();
        assert_eq!(count, 3);
        assert_eq!(sizes, vec![16, 8, 16]);
    }

    #[test]
    fn test_validate_rejects() {
        let mut writer = ImageWriter::new();
        writer.add_object(&[0; 24]);
        let good = writer.header();
        let len = good.image_size() as u64;

        let mut bad = good;
        bad.magic[0] = b'x';
        assert!(bad.validate(len).unwrap_err().contains("magic"));

        let mut bad = good;
        bad.version = *b"0002\0\0\0\0";
        assert!(bad.validate(len).unwrap_err().contains("version"));

        let mut bad = good;
        bad.object_alignment = 16;
        assert!(bad.validate(len).unwrap_err().contains("alignment"));

        assert!(good.validate(len + 1).is_err());

        let mut bad = good;
        bad.objects_offset = 8;
        assert!(bad.validate(len).unwrap_err().contains("offset"));

        let mut bad = good;
        bad.objects_end = bad.image_size + 8;
        assert!(bad.validate(len).unwrap_err().contains("does not fit"));
    }

    #[test]
    fn test_walk_rejects_bad_sizes() {
        let base = Address::from(0x1000);
        let zero = 0u64.to_ne_bytes();
        assert!(walk_objects(base, &zero, |_| {}).is_err());
        let odd = 12u64.to_ne_bytes();
        assert!(walk_objects(base, &odd, |_| {}).is_err());
        let too_big = 64u64.to_ne_bytes();
        assert!(walk_objects(base, &too_big, |_| {}).is_err());
        assert!(walk_objects(base, &[0u8; 4], |_| {}).is_err());
        assert_eq!(walk_objects(base, &[], |_| {}), Ok(0));
    }
}
