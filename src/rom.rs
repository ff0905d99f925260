use std::fs;
use std::path::Path;

use crate::chip8::MAX_ROM_SIZE;
use crate::errors::RomError;

/// Read a ROM image from disk. ROMs are raw byte streams with no header or
/// checksum; the only check is the size bound, enforced here so an oversized
/// image never reaches the machine.
pub fn read<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, RomError> {
    let data = fs::read(path)?;
    if data.len() > MAX_ROM_SIZE {
        return Err(RomError::TooLarge {
            size: data.len(),
            max: MAX_ROM_SIZE,
        });
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_an_io_error() {
        let err = read("does/not/exist.ch8").unwrap_err();
        assert!(matches!(err, RomError::Io(_)));
    }

    #[test]
    fn oversized_image_is_rejected() {
        let path = std::env::temp_dir().join("crisp8-oversized-rom-test.ch8");
        fs::write(&path, vec![0u8; MAX_ROM_SIZE + 1]).unwrap();

        let err = read(&path).unwrap_err();
        assert!(matches!(
            err,
            RomError::TooLarge { size, max } if size == MAX_ROM_SIZE + 1 && max == MAX_ROM_SIZE
        ));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn image_at_the_bound_loads() {
        let path = std::env::temp_dir().join("crisp8-full-size-rom-test.ch8");
        fs::write(&path, vec![0xEEu8; MAX_ROM_SIZE]).unwrap();

        let data = read(&path).unwrap();
        assert_eq!(data.len(), MAX_ROM_SIZE);

        fs::remove_file(&path).unwrap();
    }
}
