// SPDX-License-Identifier: GPL-3.0-only

//! EXIF tag table attached to encode jobs

use crate::constants::MAX_EXIF_TABLE_ENTRIES;
use thiserror::Error;

/// Commonly used tag IDs
pub mod tags {
    pub const MAKE: u16 = 0x010F;
    pub const MODEL: u16 = 0x0110;
    pub const ORIENTATION: u16 = 0x0112;
    pub const SOFTWARE: u16 = 0x0131;
    pub const DATE_TIME: u16 = 0x0132;
    pub const EXPOSURE_TIME: u16 = 0x829A;
    pub const F_NUMBER: u16 = 0x829D;
    pub const ISO_SPEED: u16 = 0x8827;
    pub const DATE_TIME_ORIGINAL: u16 = 0x9003;
    pub const EXPOSURE_BIAS: u16 = 0x9204;
    pub const FOCAL_LENGTH: u16 = 0x920A;
    pub const MAKER_NOTE: u16 = 0x927C;
    pub const PIXEL_X_DIMENSION: u16 = 0xA002;
    pub const PIXEL_Y_DIMENSION: u16 = 0xA003;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExifError {
    #[error("EXIF table full ({max} entries)")]
    TableFull { max: usize },
    #[error("EXIF value for tag {0:#06x} is empty")]
    EmptyValue(u16),
}

/// Typed tag value; every variant holds one or more elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExifValue {
    Byte(Vec<u8>),
    Ascii(String),
    Short(Vec<u16>),
    Long(Vec<u32>),
    Rational(Vec<(u32, u32)>),
    Undefined(Vec<u8>),
    SLong(Vec<i32>),
    SRational(Vec<(i32, i32)>),
}

impl ExifValue {
    /// TIFF field type code
    fn type_code(&self) -> u16 {
        match self {
            ExifValue::Byte(_) => 1,
            ExifValue::Ascii(_) => 2,
            ExifValue::Short(_) => 3,
            ExifValue::Long(_) => 4,
            ExifValue::Rational(_) => 5,
            ExifValue::Undefined(_) => 7,
            ExifValue::SLong(_) => 9,
            ExifValue::SRational(_) => 10,
        }
    }

    /// Element count as written in the IFD; ASCII includes the terminator
    pub fn count(&self) -> u32 {
        let n = match self {
            ExifValue::Byte(v) | ExifValue::Undefined(v) => v.len(),
            ExifValue::Ascii(s) => s.len() + 1,
            ExifValue::Short(v) => v.len(),
            ExifValue::Long(v) => v.len(),
            ExifValue::Rational(v) => v.len(),
            ExifValue::SLong(v) => v.len(),
            ExifValue::SRational(v) => v.len(),
        };
        n as u32
    }

    fn is_empty(&self) -> bool {
        match self {
            ExifValue::Ascii(_) => false,
            _ => self.count() == 0,
        }
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ExifValue::Byte(v) | ExifValue::Undefined(v) => out.extend_from_slice(v),
            ExifValue::Ascii(s) => {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            ExifValue::Short(v) => v.iter().for_each(|x| out.extend(x.to_le_bytes())),
            ExifValue::Long(v) => v.iter().for_each(|x| out.extend(x.to_le_bytes())),
            ExifValue::Rational(v) => v.iter().for_each(|(n, d)| {
                out.extend(n.to_le_bytes());
                out.extend(d.to_le_bytes());
            }),
            ExifValue::SLong(v) => v.iter().for_each(|x| out.extend(x.to_le_bytes())),
            ExifValue::SRational(v) => v.iter().for_each(|(n, d)| {
                out.extend(n.to_le_bytes());
                out.extend(d.to_le_bytes());
            }),
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExifEntry {
    pub tag: u16,
    pub value: ExifValue,
}

/// Bounded EXIF tag table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExifTable {
    entries: Vec<ExifEntry>,
}

impl ExifTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tag; fails once `MAX_EXIF_TABLE_ENTRIES` are present
    pub fn add_entry(&mut self, tag: u16, value: ExifValue) -> Result<(), ExifError> {
        if self.entries.len() >= MAX_EXIF_TABLE_ENTRIES {
            return Err(ExifError::TableFull {
                max: MAX_EXIF_TABLE_ENTRIES,
            });
        }
        if value.is_empty() {
            return Err(ExifError::EmptyValue(tag));
        }
        self.entries.push(ExifEntry { tag, value });
        Ok(())
    }

    pub fn entries(&self) -> &[ExifEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, tag: u16) -> Option<&ExifValue> {
        self.entries.iter().find(|e| e.tag == tag).map(|e| &e.value)
    }

    /// Serialize as a JPEG APP1 segment (marker included)
    ///
    /// All tags go into a single little-endian IFD0, sorted by tag ID.
    pub fn to_app1(&self) -> Vec<u8> {
        let mut sorted: Vec<&ExifEntry> = self.entries.iter().collect();
        sorted.sort_by_key(|e| e.tag);

        // TIFF header (8) + entry count (2) + entries (12 each) + next IFD (4)
        let ifd_len = 2 + sorted.len() * 12 + 4;
        let mut data_offset = 8 + ifd_len;
        let mut ifd = Vec::with_capacity(ifd_len);
        let mut data = Vec::new();

        ifd.extend((sorted.len() as u16).to_le_bytes());
        for entry in &sorted {
            let bytes = entry.value.to_le_bytes();
            ifd.extend(entry.tag.to_le_bytes());
            ifd.extend(entry.value.type_code().to_le_bytes());
            ifd.extend(entry.value.count().to_le_bytes());
            if bytes.len() <= 4 {
                let mut inline = [0u8; 4];
                inline[..bytes.len()].copy_from_slice(&bytes);
                ifd.extend(inline);
            } else {
                ifd.extend((data_offset as u32).to_le_bytes());
                data_offset += bytes.len() + bytes.len() % 2;
                data.extend_from_slice(&bytes);
                if bytes.len() % 2 == 1 {
                    data.push(0);
                }
            }
        }
        ifd.extend(0u32.to_le_bytes());

        let mut tiff = Vec::with_capacity(8 + ifd.len() + data.len());
        tiff.extend(b"II");
        tiff.extend(42u16.to_le_bytes());
        tiff.extend(8u32.to_le_bytes());
        tiff.extend(ifd);
        tiff.extend(data);

        let segment_len = (2 + 6 + tiff.len()) as u16;
        let mut app1 = Vec::with_capacity(segment_len as usize + 2);
        app1.extend([0xFF, 0xE1]);
        app1.extend(segment_len.to_be_bytes());
        app1.extend(b"Exif\0\0");
        app1.extend(tiff);
        app1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_bounded() {
        let mut table = ExifTable::new();
        for i in 0..MAX_EXIF_TABLE_ENTRIES {
            table
                .add_entry(i as u16, ExifValue::Short(vec![1]))
                .unwrap();
        }
        assert_eq!(
            table.add_entry(0xFFFF, ExifValue::Short(vec![1])),
            Err(ExifError::TableFull {
                max: MAX_EXIF_TABLE_ENTRIES
            })
        );
    }

    #[test]
    fn test_app1_layout() {
        let mut table = ExifTable::new();
        table
            .add_entry(tags::ORIENTATION, ExifValue::Short(vec![6]))
            .unwrap();
        table
            .add_entry(tags::MAKE, ExifValue::Ascii("Camera".into()))
            .unwrap();
        let app1 = table.to_app1();

        assert_eq!(&app1[..2], &[0xFF, 0xE1]);
        let len = u16::from_be_bytes([app1[2], app1[3]]) as usize;
        assert_eq!(len + 2, app1.len());
        assert_eq!(&app1[4..10], b"Exif\0\0");
        assert_eq!(&app1[10..12], b"II");
        // first entry is MAKE (sorted), stored out of line
        let first_tag = u16::from_le_bytes([app1[20], app1[21]]);
        assert_eq!(first_tag, tags::MAKE);
        assert!(app1.windows(7).any(|w| w == b"Camera\0"));
    }

    #[test]
    fn test_ascii_count_includes_terminator() {
        assert_eq!(ExifValue::Ascii("abc".into()).count(), 4);
        assert_eq!(ExifValue::Rational(vec![(1, 2), (3, 4)]).count(), 2);
    }
}
