use crate::error::{Result, VMError};
use super::memory::GuestMem;
use log::info;
use std::path::Path;


/// Copy a flat guest image (no header, no relocation) into guest memory at
/// `load_addr`. Returns the number of bytes loaded.
pub fn load_image(gm: &GuestMem, image_path: &Path, load_addr: u64) -> Result<usize> {
    let bytes = std::fs::read(image_path)?;
    let capacity = gm.capacity_from(load_addr);
    if bytes.len() > capacity {
        return Err(VMError::ImageTooLarge {
            path: image_path.to_path_buf(),
            size: bytes.len(),
            capacity,
        });
    }
    gm.load(load_addr, &bytes)?;
    info!("loaded {} ({} bytes) at {:#x}", image_path.display(), bytes.len(), load_addr);
    Ok(bytes.len())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vm_memory::{Bytes, GuestAddress};

    #[test]
    fn image_lands_verbatim() {
        let gm = GuestMem::create(0x1000).unwrap();
        let mut img = tempfile::NamedTempFile::new().unwrap();
        img.write_all(&[0xb0, 0x41, 0xe6, 0xe9, 0xf4]).unwrap();

        assert_eq!(load_image(&gm, img.path(), 0).unwrap(), 5);
        let mut back = [0u8; 5];
        gm.mem.read_slice(&mut back, GuestAddress(0)).unwrap();
        assert_eq!(back, [0xb0, 0x41, 0xe6, 0xe9, 0xf4]);
    }

    #[test]
    fn oversized_image_is_refused() {
        let gm = GuestMem::create(0x1000).unwrap();
        let mut img = tempfile::NamedTempFile::new().unwrap();
        img.write_all(&[0u8; 0x200]).unwrap();

        match load_image(&gm, img.path(), 0xf00) {
            Err(VMError::ImageTooLarge { size, capacity, .. }) => {
                assert_eq!(size, 0x200);
                assert_eq!(capacity, 0x100);
            }
            other => panic!("expected ImageTooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_image_is_an_io_error() {
        let gm = GuestMem::create(0x1000).unwrap();
        let err = load_image(&gm, Path::new("/nonexistent/guest.bin"), 0).unwrap_err();
        assert!(matches!(err, VMError::IO(_)));
    }
}
