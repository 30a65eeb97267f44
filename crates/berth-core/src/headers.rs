// ABOUTME: Builder and parser for the NUL-separated request header block.
// ABOUTME: headers ::= (name NUL value NUL)* with non-empty, NUL-free names and values.

use thiserror::Error;

/// Errors from building or parsing a header block.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header name must not be empty")]
    EmptyName,

    #[error("header '{0}' has an empty value")]
    EmptyValue(String),

    #[error("header '{0}' contains a NUL byte")]
    EmbeddedNul(String),

    #[error("header block is truncated")]
    Truncated,
}

/// An encoded header block ready for [`WorkerSession::send_headers`](crate::WorkerSession::send_headers).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    buf: Vec<u8>,
    count: usize,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one name/value pair.
    pub fn push(
        &mut self,
        name: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<&mut Self, HeaderError> {
        let name = name.as_ref();
        let value = value.as_ref();
        let display = String::from_utf8_lossy(name).into_owned();

        if name.is_empty() {
            return Err(HeaderError::EmptyName);
        }
        if value.is_empty() {
            return Err(HeaderError::EmptyValue(display));
        }
        if name.contains(&0) || value.contains(&0) {
            return Err(HeaderError::EmbeddedNul(display));
        }

        self.buf.extend_from_slice(name);
        self.buf.push(0);
        self.buf.extend_from_slice(value);
        self.buf.push(0);
        self.count += 1;
        Ok(self)
    }

    /// Builder-style variant of [`push`](Self::push).
    pub fn with(mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<Self, HeaderError> {
        self.push(name, value)?;
        Ok(self)
    }

    /// Number of pairs in the block.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl AsRef<[u8]> for HeaderBlock {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

/// Decode a header block into ordered name/value pairs.
pub fn parse_header_block(bytes: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, HeaderError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let Some(body) = bytes.strip_suffix(&[0]) else {
        return Err(HeaderError::Truncated);
    };

    let fields: Vec<&[u8]> = body.split(|b| *b == 0).collect();
    if fields.len() % 2 != 0 {
        return Err(HeaderError::Truncated);
    }

    fields
        .chunks(2)
        .map(|pair| {
            let (name, value) = (pair[0], pair[1]);
            if name.is_empty() {
                return Err(HeaderError::EmptyName);
            }
            if value.is_empty() {
                return Err(HeaderError::EmptyValue(
                    String::from_utf8_lossy(name).into_owned(),
                ));
            }
            Ok((name.to_vec(), value.to_vec()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodes_cgi_style_pairs() {
        let block = HeaderBlock::new()
            .with("REQUEST_METHOD", "GET")
            .unwrap()
            .with("PATH_INFO", "/users")
            .unwrap();
        assert_eq!(block.len(), 2);
        assert_eq!(
            block.as_bytes(),
            b"REQUEST_METHOD\0GET\0PATH_INFO\0/users\0".as_slice()
        );
    }

    #[test]
    fn test_rejects_unframeable_pairs() {
        let mut block = HeaderBlock::new();
        assert_eq!(block.push("", "x").unwrap_err(), HeaderError::EmptyName);
        assert_eq!(
            block.push("QUERY_STRING", "").unwrap_err(),
            HeaderError::EmptyValue("QUERY_STRING".to_string())
        );
        assert_eq!(
            block.push("HTTP_X", b"a\0b").unwrap_err(),
            HeaderError::EmbeddedNul("HTTP_X".to_string())
        );
        assert!(block.is_empty());
    }

    #[test]
    fn test_parse_preserves_order() {
        let pairs = parse_header_block(b"SCRIPT_NAME\0/\0HTTP_HOST\0example.com\0").unwrap();
        assert_eq!(
            pairs,
            vec![
                (b"SCRIPT_NAME".to_vec(), b"/".to_vec()),
                (b"HTTP_HOST".to_vec(), b"example.com".to_vec()),
            ]
        );
    }

    #[test]
    fn test_parse_rejects_truncated_blocks() {
        assert_eq!(
            parse_header_block(b"HTTP_HOST\0example.com").unwrap_err(),
            HeaderError::Truncated
        );
        assert_eq!(
            parse_header_block(b"HTTP_HOST\0").unwrap_err(),
            HeaderError::Truncated
        );
        assert!(parse_header_block(b"").unwrap().is_empty());
    }
}
