//! On-disk entry layout: `name\nvendor\ndriver\n` followed by the binary image.

use offload_api::Fingerprint;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    Name,
    Vendor,
    Driver,
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderField::Name => f.write_str("device name"),
            HeaderField::Vendor => f.write_str("vendor"),
            HeaderField::Driver => f.write_str("driver version"),
        }
    }
}

/// Why a header failed to match a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// The file ended inside `field`.
    Truncated(HeaderField),
    Mismatch(HeaderField),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHeader {
    pub name: String,
    pub vendor: String,
    pub driver: String,
}

impl CacheHeader {
    pub fn from_fingerprint(fp: &Fingerprint) -> Self {
        Self {
            name: fp.name.clone(),
            vendor: fp.vendor.clone(),
            driver: fp.driver.clone(),
        }
    }

    fn fields(&self) -> [(HeaderField, &str); 3] {
        [
            (HeaderField::Name, self.name.as_str()),
            (HeaderField::Vendor, self.vendor.as_str()),
            (HeaderField::Driver, self.driver.as_str()),
        ]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.name.len() + self.vendor.len() + self.driver.len() + 3);
        for (_, value) in self.fields() {
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out
    }

    /// Full cache entry: header followed by `image`.
    pub fn encode(&self, image: &[u8]) -> Vec<u8> {
        let mut out = self.to_bytes();
        out.extend_from_slice(image);
        out
    }

    /// Consumes exactly this header from the front of `bytes`, byte for
    /// byte, and returns the remainder.
    pub fn strip<'a>(&self, bytes: &'a [u8]) -> Result<&'a [u8], HeaderError> {
        let mut rest = bytes;
        for (field, value) in self.fields() {
            let value = value.as_bytes();
            let line_len = value.len() + 1;
            if rest.len() < line_len {
                let available = &rest[..rest.len().min(value.len())];
                return Err(if value.starts_with(available) {
                    HeaderError::Truncated(field)
                } else {
                    HeaderError::Mismatch(field)
                });
            }
            if &rest[..value.len()] != value || rest[value.len()] != b'\n' {
                return Err(HeaderError::Mismatch(field));
            }
            rest = &rest[line_len..];
        }
        Ok(rest)
    }

    /// Reads whatever header an entry carries, for diagnostics.
    pub fn parse(bytes: &[u8]) -> Option<(CacheHeader, &[u8])> {
        let (name, rest) = split_line(bytes)?;
        let (vendor, rest) = split_line(rest)?;
        let (driver, rest) = split_line(rest)?;
        Some((
            CacheHeader {
                name,
                vendor,
                driver,
            },
            rest,
        ))
    }
}

fn split_line(bytes: &[u8]) -> Option<(String, &[u8])> {
    let end = bytes.iter().position(|&b| b == b'\n')?;
    let line = String::from_utf8_lossy(&bytes[..end]).into_owned();
    Some((line, &bytes[end + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> CacheHeader {
        CacheHeader::from_fingerprint(&Fingerprint::new("GPU X", "ACME", "1.2.3"))
    }

    #[test]
    fn encodes_three_lines_then_image() {
        let bytes = header().encode(&[0xde, 0xad]);
        assert_eq!(bytes, b"GPU X\nACME\n1.2.3\n\xde\xad".to_vec());
        assert_eq!(header().strip(&bytes).unwrap(), &[0xde, 0xad]);
    }

    #[test]
    fn strip_is_byte_exact() {
        let h = header();
        assert_eq!(
            h.strip(b"GPU Y\nACME\n1.2.3\nimg"),
            Err(HeaderError::Mismatch(HeaderField::Name))
        );
        assert_eq!(
            h.strip(b"GPU X\nACME\n1.2.3.4\nimg"),
            Err(HeaderError::Mismatch(HeaderField::Driver))
        );
        assert_eq!(
            h.strip(b"GPU X\nACME \n1.2.3\n"),
            Err(HeaderError::Mismatch(HeaderField::Vendor))
        );
    }

    #[test]
    fn short_files_are_truncated() {
        let h = header();
        assert_eq!(h.strip(b""), Err(HeaderError::Truncated(HeaderField::Name)));
        assert_eq!(
            h.strip(b"GPU X\nAC"),
            Err(HeaderError::Truncated(HeaderField::Vendor))
        );
        assert_eq!(
            h.strip(b"GPU X\nACME\n1.2.3"),
            Err(HeaderError::Truncated(HeaderField::Driver))
        );
        assert_eq!(h.strip(b"GPU X\nACME\n1.2.3\n").unwrap(), b"");
    }

    #[test]
    fn parse_reads_foreign_headers() {
        let (parsed, rest) = CacheHeader::parse(b"a\nb\nc\nrest").unwrap();
        assert_eq!(parsed.name, "a");
        assert_eq!(parsed.driver, "c");
        assert_eq!(rest, b"rest");
        assert!(CacheHeader::parse(b"a\nb").is_none());
    }
}
