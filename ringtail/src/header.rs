//! NPY array header encoding and parsing.
//!
//! Segment files start with a standard NPY header so any `.npy` reader can map
//! the data region as a plain array. The header is written as format version
//! 1.0:
//!
//! ```text
//! [0..6)     b"\x93NUMPY"
//! [6..8)     major, minor version (1, 0)
//! [8..10)    u16 LE length of the dictionary text that follows
//! [10..N)    {'descr': '<u8', 'fortran_order': False, 'shape': (                    6,), }
//!            padded with spaces and terminated by '\n' so N % 64 == 0
//! ```
//!
//! The first shape dimension is right-aligned in a fixed-width field, which
//! keeps the header length independent of the capacity. A resize can rewrite
//! the header in place without moving the data region.

use std::path::Path;

use crate::error::{FormatError, Result};

/// Magic prefix of every NPY file.
pub const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// The data region starts at a multiple of this many bytes.
pub const HEADER_ALIGN: usize = 64;

/// Printed width of the first shape dimension (enough for any u64).
const CAPACITY_FIELD_WIDTH: usize = 21;

/// Length of the version 1.0 prefix (magic + version + u16 length).
const V1_PREFIX_LEN: usize = 10;

/// Length of the version 2.0/3.0 prefix (magic + version + u32 length).
const V2_PREFIX_LEN: usize = 12;

/// Decoded array header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayHeader {
    /// Element descriptor literal, exactly as stored.
    pub descr: String,
    /// Whether the array is stored column-major.
    pub fortran_order: bool,
    /// Full array shape; the first dimension is the row capacity.
    pub shape: Vec<usize>,
}

impl ArrayHeader {
    /// Creates a row-major header for `capacity` rows of the given row shape.
    pub fn new(descr: impl Into<String>, capacity: usize, sub_shape: &[usize]) -> Self {
        let mut shape = Vec::with_capacity(1 + sub_shape.len());
        shape.push(capacity);
        shape.extend_from_slice(sub_shape);
        Self {
            descr: descr.into(),
            fortran_order: false,
            shape,
        }
    }

    /// Number of rows. A zero-dimensional array holds a single row.
    pub fn capacity(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Dimensions of one row.
    pub fn sub_shape(&self) -> &[usize] {
        self.shape.get(1..).unwrap_or(&[])
    }

    /// Encodes the header, returning the complete prefix of the file.
    ///
    /// The returned length is the data offset.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::HeaderTooLarge`] if the dictionary does not fit
    /// the 16-bit length field of format version 1.0.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let dict = format!(
            "{{'descr': {}, 'fortran_order': {}, 'shape': {}, }}",
            self.descr,
            if self.fortran_order { "True" } else { "False" },
            shape_repr(&self.shape),
        );

        // Pad so the data region (after the trailing newline) is aligned.
        let unpadded = V1_PREFIX_LEN + dict.len() + 1;
        let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
        let dict_len = dict.len() + padding + 1;
        let dict_len_field =
            u16::try_from(dict_len).map_err(|_| FormatError::HeaderTooLarge { len: dict_len })?;

        let mut out = Vec::with_capacity(V1_PREFIX_LEN + dict_len);
        out.extend_from_slice(NPY_MAGIC);
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&dict_len_field.to_le_bytes());
        out.extend_from_slice(dict.as_bytes());
        out.resize(out.len() + padding, b' ');
        out.push(b'\n');
        Ok(out)
    }

    /// Parses a header from the start of a file.
    ///
    /// Returns the header and the byte offset where the data region begins.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Truncated`] if `bytes` ends inside the header and
    /// [`FormatError::InvalidHeader`] if it is not a supported NPY header.
    pub fn parse(bytes: &[u8], path: &Path) -> Result<(Self, usize)> {
        let invalid = |reason: String| FormatError::InvalidHeader {
            path: path.to_path_buf(),
            reason,
        };
        let truncated = |expected: usize| FormatError::Truncated {
            path: path.to_path_buf(),
            len: bytes.len() as u64,
            expected: expected as u64,
        };

        if bytes.len() < V1_PREFIX_LEN {
            return Err(truncated(V1_PREFIX_LEN).into());
        }
        if &bytes[..NPY_MAGIC.len()] != NPY_MAGIC {
            return Err(invalid("missing NPY magic".to_string()).into());
        }

        let (prefix_len, dict_len) = match bytes[6] {
            1 => (V1_PREFIX_LEN, usize::from(u16::from_le_bytes([bytes[8], bytes[9]]))),
            2 | 3 => {
                if bytes.len() < V2_PREFIX_LEN {
                    return Err(truncated(V2_PREFIX_LEN).into());
                }
                let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
                (V2_PREFIX_LEN, len as usize)
            }
            major => {
                return Err(invalid(format!(
                    "unsupported format version {major}.{}",
                    bytes[7]
                ))
                .into());
            }
        };

        let data_offset = prefix_len + dict_len;
        if bytes.len() < data_offset {
            return Err(truncated(data_offset).into());
        }
        let text = std::str::from_utf8(&bytes[prefix_len..data_offset])
            .map_err(|e| invalid(format!("header is not text: {e}")))?;

        let descr = dict_value(text, "descr")
            .ok_or_else(|| invalid("missing 'descr'".to_string()))?
            .to_string();
        let fortran_order = match dict_value(text, "fortran_order") {
            Some("True") => true,
            Some("False") => false,
            other => return Err(invalid(format!("bad 'fortran_order': {other:?}")).into()),
        };
        let shape_text =
            dict_value(text, "shape").ok_or_else(|| invalid("missing 'shape'".to_string()))?;
        let shape = parse_shape(shape_text).ok_or_else(|| invalid(format!("bad 'shape': {shape_text}")))?;

        Ok((
            Self {
                descr,
                fortran_order,
                shape,
            },
            data_offset,
        ))
    }
}

/// Encodes an array header for `shape`, returning the bytes and their length.
///
/// # Errors
///
/// See [`ArrayHeader::encode`].
pub fn encode_header(descr: &str, shape: &[usize]) -> Result<(Vec<u8>, usize)> {
    let header = ArrayHeader {
        descr: descr.to_string(),
        fortran_order: false,
        shape: shape.to_vec(),
    };
    let bytes = header.encode()?;
    let len = bytes.len();
    Ok((bytes, len))
}

/// Python tuple literal with a fixed-width first element.
fn shape_repr(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [rows] => format!("({rows:>width$},)", width = CAPACITY_FIELD_WIDTH),
        [rows, rest @ ..] => {
            let mut out = format!("({rows:>width$}", width = CAPACITY_FIELD_WIDTH);
            for dim in rest {
                out.push_str(", ");
                out.push_str(&dim.to_string());
            }
            out.push(')');
            out
        }
    }
}

/// Finds the literal stored under `key` in a Python dict literal.
///
/// Only top-level keys match; names inside a structured `descr` are skipped
/// along with the rest of its value.
fn dict_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let mut rest = text.trim_start().strip_prefix('{')?;
    loop {
        rest = rest.trim_start();
        if rest.is_empty() || rest.starts_with('}') {
            return None;
        }

        let key_len = literal_len(rest)?;
        let name = rest[..key_len].trim_matches(['\'', '"']);
        rest = rest[key_len..].trim_start().strip_prefix(':')?.trim_start();

        let value_len = literal_len(rest)?;
        if name == key {
            return Some(&rest[..value_len]);
        }
        rest = rest[value_len..].trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest);
    }
}

/// Length of the literal at the start of `text`: a quoted string, a bracketed
/// list/tuple (nesting and quotes respected), or a bare word.
fn literal_len(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    match *bytes.first()? {
        quote @ (b'\'' | b'"') => text[1..].find(char::from(quote)).map(|end| end + 2),
        b'[' | b'(' => {
            let mut depth = 0usize;
            let mut quote: Option<u8> = None;
            for (i, &b) in bytes.iter().enumerate() {
                match (quote, b) {
                    (Some(q), _) if b == q => quote = None,
                    (Some(_), _) => {}
                    (None, b'\'' | b'"') => quote = Some(b),
                    (None, b'[' | b'(') => depth += 1,
                    (None, b']' | b')') => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(i + 1);
                        }
                    }
                    _ => {}
                }
            }
            None
        }
        _ => {
            let end = text.find([',', '}']).unwrap_or(text.len());
            Some(text[..end].trim_end().len())
        }
    }
}

fn parse_shape(text: &str) -> Option<Vec<usize>> {
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;
    inner
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| dim.trim_end_matches('L').parse().ok())
        .collect()
}
