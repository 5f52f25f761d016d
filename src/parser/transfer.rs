//! Content-Transfer-Encoding decoders (RFC 2045 §6).

use std::io::Read;

/// Transfer encoding declared by a MIME part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    Base64,
    QuotedPrintable,
    /// `7bit`, `8bit`, `binary` or anything unrecognised.
    Identity,
}

impl TransferEncoding {
    /// Parse a `Content-Transfer-Encoding` header value.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("base64") => Self::Base64,
            Some("quoted-printable") => Self::QuotedPrintable,
            _ => Self::Identity,
        }
    }

    /// Decode a part body (lines already joined with `\n`).
    pub fn decode(self, body: &[u8]) -> Vec<u8> {
        match self {
            Self::Base64 => decode_base64(body),
            Self::QuotedPrintable => decode_quoted_printable(body),
            Self::Identity => body.to_vec(),
        }
    }
}

/// Decode base64, skipping whitespace. Invalid characters decode as zero bits.
pub fn decode_base64(input: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(input.len() / 4 * 3);
    // Reading from an in-memory slice cannot fail.
    let _ = Base64Reader::new(input).read_to_end(&mut buf);
    buf
}

/// Minimal streaming base64 decoder over a byte slice.
struct Base64Reader<'a> {
    input: &'a [u8],
    pos: usize,
    buf: [u8; 3],
    buf_len: usize,
    buf_pos: usize,
    finished: bool,
}

impl<'a> Base64Reader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            buf: [0; 3],
            buf_len: 0,
            buf_pos: 0,
            finished: false,
        }
    }
}

impl Read for Base64Reader<'_> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let mut written = 0;
        while written < out.len() {
            if self.buf_pos < self.buf_len {
                out[written] = self.buf[self.buf_pos];
                self.buf_pos += 1;
                written += 1;
                continue;
            }
            if self.finished {
                return Ok(written);
            }
            // Decode next 4-char block
            let mut quad = [0u8; 4];
            let mut qi = 0;
            while qi < 4 {
                if self.pos >= self.input.len() {
                    if qi == 0 {
                        self.finished = true;
                        return Ok(written);
                    }
                    // Pad remaining
                    while qi < 4 {
                        quad[qi] = b'=';
                        qi += 1;
                    }
                    break;
                }
                let b = self.input[self.pos];
                self.pos += 1;
                if b.is_ascii_whitespace() {
                    continue;
                }
                quad[qi] = b;
                qi += 1;
            }
            let vals: [u8; 4] = quad.map(b64val);
            self.buf[0] = (vals[0] << 2) | (vals[1] >> 4);
            self.buf[1] = (vals[1] << 4) | (vals[2] >> 2);
            self.buf[2] = (vals[2] << 6) | vals[3];
            self.buf_len = if quad[2] == b'=' {
                1
            } else if quad[3] == b'=' {
                2
            } else {
                3
            };
            self.buf_pos = 0;
            // Padding ends the data; anything after it is ignored.
            if quad[3] == b'=' {
                self.finished = true;
            }
        }
        Ok(written)
    }
}

fn b64val(c: u8) -> u8 {
    match c {
        b'A'..=b'Z' => c - b'A',
        b'a'..=b'z' => c - b'a' + 26,
        b'0'..=b'9' => c - b'0' + 52,
        b'+' | b'-' => 62,
        b'/' | b'_' => 63,
        _ => 0,
    }
}

/// Decode quoted-printable text. `=` at end of line is a soft line break.
pub fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut lines = input.split(|&b| b == b'\n').peekable();

    while let Some(line) = lines.next() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        // Trailing whitespace is transport padding (RFC 2045 §6.7 rule 3).
        let end = line
            .iter()
            .rposition(|&b| b != b' ' && b != b'\t')
            .map_or(0, |p| p + 1);
        let line = &line[..end];
        let (bytes, soft_break) = match line.strip_suffix(b"=") {
            Some(rest) => (rest, true),
            None => (line, false),
        };

        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'=' {
                if let Some(byte) = hex_pair(bytes.get(i + 1).copied(), bytes.get(i + 2).copied())
                {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
            out.push(bytes[i]);
            i += 1;
        }

        if !soft_break && lines.peek().is_some() {
            out.push(b'\n');
        }
    }
    out
}

/// Two hex digits to a byte.
pub(crate) fn hex_pair(hi: Option<u8>, lo: Option<u8>) -> Option<u8> {
    let hi = (hi? as char).to_digit(16)?;
    let lo = (lo? as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}
