//! Program image loading: ELF executables and plain hex memory images.

use crate::dram::Dram;
use goblin::elf::{program_header::PT_LOAD, Elf};
use std::path::{Path, PathBuf};
use thiserror::Error;

const ELF_MAGIC: &[u8] = b"\x7fELF";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read image {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed hex image at line {line}: '{text}'")]
    HexLine { line: usize, text: String },

    #[error("ELF parse error: {0}")]
    Elf(#[from] goblin::error::Error),

    #[error("ELF image must be a 32-bit little-endian executable")]
    UnsupportedElf,

    #[error("segment exceeds file bounds (offset {offset:#x}, size {size:#x})")]
    TruncatedSegment { offset: usize, size: usize },

    #[error("segment {address:#010x}+{size:#x} does not fit in {memory:#x} bytes of memory")]
    OutOfRange {
        address: u32,
        size: usize,
        memory: usize,
    },
}

/// A contiguous run of bytes to place in memory. Bytes past `data` up to
/// `mem_size` are zeroed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
    pub mem_size: usize,
}

/// A parsed program image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub entry: u32,
    pub segments: Vec<Segment>,
}

impl Image {
    /// Copy every segment into memory.
    pub fn load_into(&self, dram: &mut Dram) -> Result<(), LoadError> {
        let memory = dram.size();
        for segment in &self.segments {
            let out_of_range = || LoadError::OutOfRange {
                address: segment.address,
                size: segment.mem_size,
                memory,
            };
            if !dram.contains(segment.address, segment.mem_size.max(segment.data.len())) {
                return Err(out_of_range());
            }
            dram.write_bytes(segment.address, &segment.data)
                .map_err(|_| out_of_range())?;
            if segment.mem_size > segment.data.len() {
                let bss = segment.address + segment.data.len() as u32;
                dram.zero_range(bss, segment.mem_size - segment.data.len())
                    .map_err(|_| out_of_range())?;
            }
        }
        log::debug!(
            "image loaded: entry={:#010x}, segments={}",
            self.entry,
            self.segments.len()
        );
        Ok(())
    }
}

/// Parse a hex memory image: one 32-bit word per line, written as eight hex
/// digits with the bytes in memory order. Loaded at address 0.
pub fn parse_hex(text: &str) -> Result<Image, LoadError> {
    let mut data = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let bytes = hex::decode(line).map_err(|_| LoadError::HexLine {
            line: index + 1,
            text: line.to_string(),
        })?;
        if bytes.len() != 4 {
            return Err(LoadError::HexLine {
                line: index + 1,
                text: line.to_string(),
            });
        }
        data.extend_from_slice(&bytes);
    }
    let mem_size = data.len();
    Ok(Image {
        entry: 0,
        segments: vec![Segment {
            address: 0,
            data,
            mem_size,
        }],
    })
}

/// Extract the PT_LOAD segments of an ELF executable.
pub fn parse_elf(buffer: &[u8]) -> Result<Image, LoadError> {
    let elf = Elf::parse(buffer)?;
    if elf.is_64 || !elf.little_endian {
        return Err(LoadError::UnsupportedElf);
    }

    let mut segments = Vec::new();
    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let file_size = ph.p_filesz as usize;
        let file_offset = ph.p_offset as usize;
        if file_offset + file_size > buffer.len() {
            return Err(LoadError::TruncatedSegment {
                offset: file_offset,
                size: file_size,
            });
        }

        let target = if ph.p_paddr != 0 { ph.p_paddr } else { ph.p_vaddr };
        segments.push(Segment {
            address: target as u32,
            data: buffer[file_offset..file_offset + file_size].to_vec(),
            mem_size: ph.p_memsz as usize,
        });
    }

    Ok(Image {
        entry: elf.entry as u32,
        segments,
    })
}

/// Read an image from disk, choosing the format from its contents.
pub fn load_file(path: &Path) -> Result<Image, LoadError> {
    let buffer = std::fs::read(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if buffer.starts_with(ELF_MAGIC) {
        parse_elf(&buffer)
    } else {
        parse_hex(&String::from_utf8_lossy(&buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hex_words_keep_memory_order() {
        let image = parse_hex("c0ff03e0\n\n00000001\n").unwrap();
        assert_eq!(image.entry, 0);
        assert_eq!(
            image.segments[0].data,
            vec![0xc0, 0xff, 0x03, 0xe0, 0x00, 0x00, 0x00, 0x01]
        );

        let mut dram = Dram::new(0x100);
        image.load_into(&mut dram).unwrap();
        assert_eq!(dram.load_32(0).unwrap(), 0xe003_ffc0);
    }

    #[test]
    fn bad_hex_reports_line() {
        let err = parse_hex("00000000\nnothex!!\n").unwrap_err();
        assert!(matches!(err, LoadError::HexLine { line: 2, .. }));
        let err = parse_hex("0011\n").unwrap_err();
        assert!(matches!(err, LoadError::HexLine { line: 1, .. }));
    }

    #[test]
    fn oversized_image_is_rejected() {
        let image = Image {
            entry: 0,
            segments: vec![Segment {
                address: 0xf0,
                data: vec![1; 8],
                mem_size: 0x20,
            }],
        };
        let mut dram = Dram::new(0x100);
        assert!(matches!(
            image.load_into(&mut dram),
            Err(LoadError::OutOfRange { address: 0xf0, .. })
        ));
    }

    #[test]
    fn segment_tail_is_zero_filled() {
        let image = Image {
            entry: 0x40,
            segments: vec![Segment {
                address: 0x40,
                data: vec![0xaa; 4],
                mem_size: 12,
            }],
        };
        let mut dram = Dram::new(0x100);
        dram.write_bytes(0x44, &[0xff; 8]).unwrap();
        image.load_into(&mut dram).unwrap();
        assert_eq!(dram.read_bytes(0x40, 4).unwrap(), &[0xaa; 4]);
        assert_eq!(dram.read_bytes(0x44, 8).unwrap(), &[0; 8]);
    }

    #[test]
    fn load_file_detects_format() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "deadbeef").unwrap();
        let image = load_file(file.path()).unwrap();
        assert_eq!(image.segments[0].data, vec![0xde, 0xad, 0xbe, 0xef]);

        let mut elf = tempfile::NamedTempFile::new().unwrap();
        elf.write_all(b"\x7fELF\x01\x01").unwrap();
        assert!(matches!(load_file(elf.path()), Err(LoadError::Elf(_))));

        assert!(matches!(
            load_file(Path::new("/nonexistent/image.hex")),
            Err(LoadError::Read { .. })
        ));
    }
}
