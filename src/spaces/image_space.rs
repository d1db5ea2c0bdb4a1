use super::continuous_space::ContinuousSpace;
use super::image::*;
use super::GcRetentionPolicy;
use crate::accounting::space_bitmap::SpaceBitmap;
use crate::error::SpaceError;
use crate::locks::MutatorAccess;
use crate::mem_map::*;
use crate::utils::*;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

static BITMAP_INDEX: AtomicUsize = AtomicUsize::new(0);

/// An image loaded into memory. Its objects are never collected, so the live bitmap doubles
/// as the mark bitmap.
pub struct ImageSpace {
    pub(crate) c: ContinuousSpace,
    image_filename: PathBuf,
    live_bitmap: Arc<SpaceBitmap>,
}

impl ImageSpace {
    /// Maps the image at `path` and marks each of its objects live.
    pub fn create(
        path: impl AsRef<Path>,
        access: &impl MutatorAccess,
    ) -> Result<ImageSpace, SpaceError> {
        access.assert_shared_held();
        let path = path.as_ref();
        let start = Instant::now();
        log::debug!("Space::create_image_space entering {}", path.display());

        let io_error = |source| SpaceError::ImageIo {
            path: path.to_path_buf(),
            source,
        };
        let format_error = |reason: String| {
            log::warn!("Invalid image {}: {}", path.display(), reason);
            SpaceError::image_format(path, reason)
        };

        let mut file = File::open(path).map_err(io_error)?;
        let file_len = file.metadata().map_err(io_error)?.len();
        if file_len < ImageHeader::SIZE as u64 {
            return Err(format_error(format!(
                "{} bytes is too short for an image header",
                file_len
            )));
        }
        let mut header_bytes = [0u8; ImageHeader::SIZE];
        file.read_exact(&mut header_bytes).map_err(io_error)?;
        let header: ImageHeader = bytemuck::pod_read_unaligned(&header_bytes);
        header.validate(file_len).map_err(format_error)?;

        let name = path.to_string_lossy();
        let mem_map = MemMap::map_file(
            &name,
            &file,
            header.image_size(),
            header.image_begin(),
            PROT_READ | PROT_WRITE,
        )
        .map_err(io_error)?;
        if let Some(requested) = header.image_begin() {
            if mem_map.begin() != requested {
                log::warn!(
                    "Image {} wants to live at {} but was mapped at {}",
                    path.display(),
                    requested,
                    mem_map.begin()
                );
                return Err(SpaceError::ImagePlacement {
                    path: path.to_path_buf(),
                    requested,
                    actual: mem_map.begin(),
                });
            }
        }

        let begin = mem_map.begin();
        let objects = unsafe {
            core::slice::from_raw_parts(
                begin.offset(header.objects_offset()).to_ptr::<u8>(),
                header.objects_end() - header.objects_offset(),
            )
        };
        let checksum = adler32(objects);
        if checksum != header.checksum() {
            return Err(format_error(format!(
                "checksum {:#010x} does not match header {:#010x}",
                checksum,
                header.checksum()
            )));
        }

        let index = BITMAP_INDEX.fetch_add(1, Ordering::Relaxed);
        let bitmap_name = format!("imagespace {} live-bitmap {}", name, index);
        let live_bitmap = SpaceBitmap::new(&bitmap_name, begin, mem_map.size())
            .map(Arc::new)
            .map_err(|source| SpaceError::Reservation {
                name: bitmap_name,
                size: SpaceBitmap::compute_size(mem_map.size()),
                source,
            })?;
        let count = walk_objects(begin.offset(header.objects_offset()), objects, |obj| {
            live_bitmap.set(obj);
        })
        .map_err(format_error)?;
        if count != header.object_count() {
            return Err(format_error(format!(
                "found {} objects, header says {}",
                count,
                header.object_count()
            )));
        }

        let end = begin.offset(header.objects_end());
        let space = ImageSpace {
            c: ContinuousSpace::new(&name, mem_map, end, GcRetentionPolicy::NeverCollect),
            image_filename: path.to_path_buf(),
            live_bitmap,
        };
        log::info!(
            "Space::create_image_space exiting ({:?}) {}",
            start.elapsed(),
            space
        );
        Ok(space)
    }

    /// The header at the start of the mapping.
    pub fn header(&self) -> &ImageHeader {
        let bytes = unsafe {
            core::slice::from_raw_parts(self.begin().to_ptr::<u8>(), ImageHeader::SIZE)
        };
        bytemuck::from_bytes(bytes)
    }

    pub fn image_filename(&self) -> &Path {
        &self.image_filename
    }

    pub fn objects_begin(&self) -> Address {
        self.begin().offset(self.header().objects_offset())
    }

    /// Calls `visitor` with every object of the image in address order.
    pub fn visit_objects(&self, visitor: impl FnMut(Address)) {
        self.live_bitmap
            .visit_marked_range(self.objects_begin(), self.end(), visitor)
    }

    /// Total size of the image object at `obj`, size word included.
    pub fn object_size(&self, obj: Address) -> usize {
        assert!(
            self.live_bitmap.test(obj),
            "{} is not an object of {}",
            obj,
            self.name()
        );
        unsafe { obj.to_ptr::<u64>().read() as usize }
    }

    /// Marks every object of the image in `live_bitmap`.
    pub fn record_image_allocations(&self, live_bitmap: &SpaceBitmap, access: &impl MutatorAccess) {
        access.assert_shared_held();
        let start = Instant::now();
        live_bitmap.union_with(&self.live_bitmap);
        log::debug!(
            "Space::record_image_allocations {} took {:?}",
            self.name(),
            start.elapsed()
        );
    }

    pub fn name(&self) -> &str {
        self.c.name()
    }

    pub fn begin(&self) -> Address {
        self.c.begin()
    }

    pub fn end(&self) -> Address {
        self.c.end()
    }

    pub fn size(&self) -> usize {
        self.c.size()
    }

    /// Bytes mapped for the image.
    pub fn capacity(&self) -> usize {
        self.c.mem_map().size()
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.c.contains(addr)
    }

    pub fn region(&self) -> Region {
        self.c.region()
    }

    pub fn gc_retention_policy(&self) -> GcRetentionPolicy {
        self.c.gc_retention_policy()
    }

    pub fn live_bitmap(&self) -> &Arc<SpaceBitmap> {
        &self.live_bitmap
    }

    pub fn mark_bitmap(&self) -> &Arc<SpaceBitmap> {
        &self.live_bitmap
    }
}

impl fmt::Display for ImageSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} begin={} end={} size={} objects={} policy={}",
            self.name(),
            self.begin(),
            self.end(),
            formatted_size(self.size()),
            self.header().object_count(),
            self.gc_retention_policy()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::{mutator_lock, MutatorLock};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_image(writer: &ImageWriter) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&writer.build()).unwrap();
        file.flush().unwrap();
        file
    }

    fn write_bytes(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_image() {
        crate::init_logging(log::Level::Warn);
        let mut writer = ImageWriter::new();
        let offsets: Vec<usize> = (0..10u8).map(|i| writer.add_object(&[i; 20])).collect();
        let file = write_image(&writer);

        let lock = mutator_lock().shared();
        let space = ImageSpace::create(file.path(), &lock).unwrap();
        assert_eq!(space.image_filename(), file.path());
        assert_eq!(space.gc_retention_policy(), GcRetentionPolicy::NeverCollect);
        assert_eq!(space.header(), &writer.header());
        assert_eq!(space.objects_begin(), space.begin().offset(ImageHeader::SIZE));
        assert_eq!(space.size(), space.header().objects_end());
        assert!(space.capacity() >= space.size());

        let mut visited = Vec::new();
        space.visit_objects(|obj| visited.push(obj.offset_from(space.begin())));
        assert_eq!(visited, offsets);
        assert_eq!(space.live_bitmap().count(), 10);
        for offset in offsets {
            let obj = space.begin().offset(offset);
            assert_eq!(space.object_size(obj), 32);
            let payload = unsafe { *obj.offset(8).to_ptr::<u8>() };
            assert_eq!(payload as usize, (offset - 64) / 32);
        }
    }

    #[test]
    fn test_record_image_allocations() {
        let mut writer = ImageWriter::new();
        writer.add_object(&[1; 8]);
        writer.add_object(&[2; 40]);
        let file = write_image(&writer);

        let lock = MutatorLock::new();
        let guard = lock.exclusive();
        let space = ImageSpace::create(file.path(), &guard).unwrap();
        let heap_bitmap =
            SpaceBitmap::new("heap live-bitmap", space.begin(), space.capacity()).unwrap();
        space.record_image_allocations(&heap_bitmap, &guard);
        let mut marked = Vec::new();
        heap_bitmap.walk(|obj| marked.push(obj));
        let mut objects = Vec::new();
        space.visit_objects(|obj| objects.push(obj));
        assert_eq!(marked, objects);
        assert!(Arc::ptr_eq(space.live_bitmap(), space.mark_bitmap()));
    }

    #[test]
    fn test_rejects_short_file() {
        let file = write_bytes(b"gcsimg\n\0");
        let lock = mutator_lock().shared();
        match ImageSpace::create(file.path(), &lock) {
            Err(SpaceError::ImageFormat { reason, .. }) => assert!(reason.contains("too short")),
            other => panic!("unexpected {:?}", other.map(|space| space.to_string())),
        }
    }

    #[test]
    fn test_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = mutator_lock().shared();
        let result = ImageSpace::create(dir.path().join("missing.img"), &lock);
        assert!(matches!(result, Err(SpaceError::ImageIo { .. })));
    }

    #[test]
    fn test_rejects_corrupt_objects() {
        let mut writer = ImageWriter::new();
        writer.add_object(&[9; 16]);
        let mut image = writer.build();
        let last = image.len() - 1;
        image[last] ^= 0xff;
        let file = write_bytes(&image);
        let lock = mutator_lock().shared();
        match ImageSpace::create(file.path(), &lock) {
            Err(SpaceError::ImageFormat { reason, .. }) => assert!(reason.contains("checksum")),
            other => panic!("unexpected {:?}", other.map(|space| space.to_string())),
        }
    }

    #[test]
    fn test_rejects_wrong_object_count() {
        let mut writer = ImageWriter::new();
        writer.add_object(&[0; 16]);
        let mut image = writer.build();
        // Rewrite the header with one object too many.
        let count_offset = 6 * 8;
        image[count_offset..count_offset + 8].copy_from_slice(&2u64.to_ne_bytes());
        let header: ImageHeader = bytemuck::pod_read_unaligned(&image[..ImageHeader::SIZE]);
        assert_eq!(header.object_count(), 2);
        let file = write_bytes(&image);
        let lock = mutator_lock().shared();
        match ImageSpace::create(file.path(), &lock) {
            Err(SpaceError::ImageFormat { reason, .. }) => assert!(reason.contains("objects")),
            other => panic!("unexpected {:?}", other.map(|space| space.to_string())),
        }
    }
}
