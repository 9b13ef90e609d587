use crate::model::IndexKind;

// Escaping scheme for order-preserving concatenation: 0x00 and 0xff are
// reserved so that the separator (0x00 0x01) sorts before any real byte and
// the infinity marker (0xff 0xff) sorts after. Descending encodings are the
// byte complement of the ascending ones.
const ESCAPE1: u8 = 0x00;
const ESCAPE2: u8 = 0xff;
const SEPARATOR: u8 = 0x01;

/// Appends values to a byte buffer such that the byte-wise order of two
/// buffers matches the order of the value sequences written into them.
/// Decoding is never needed; index entries are only ever compared.
#[derive(Default)]
pub struct OrderedCodeWriter {
    buffer: Vec<u8>,
}

impl OrderedCodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes, already encoded elsewhere. Used to stitch scan boundaries
    /// out of previously encoded values.
    pub fn seed(&mut self, encoded: &[u8]) {
        self.buffer.extend_from_slice(encoded);
    }

    pub fn write_bytes_ascending(&mut self, value: &[u8]) {
        for &byte in value {
            self.write_byte_ascending(byte);
        }
        self.write_separator_ascending();
    }

    pub fn write_bytes_descending(&mut self, value: &[u8]) {
        for &byte in value {
            self.write_byte_descending(byte);
        }
        self.write_separator_descending();
    }

    pub fn write_utf8_ascending(&mut self, value: &str) {
        self.write_bytes_ascending(value.as_bytes());
    }

    pub fn write_utf8_descending(&mut self, value: &str) {
        self.write_bytes_descending(value.as_bytes());
    }

    /// Writes a double as its order-preserving bit pattern, length-prefixed
    /// with leading zero bytes stripped.
    pub fn write_number_ascending(&mut self, value: f64) {
        let bytes = Self::ordered_bits(value).to_be_bytes();
        let significant = Self::significant_length(&bytes);
        self.buffer.push(significant as u8);
        self.buffer.extend_from_slice(&bytes[8 - significant..]);
    }

    pub fn write_number_descending(&mut self, value: f64) {
        let bytes = Self::ordered_bits(value).to_be_bytes();
        let significant = Self::significant_length(&bytes);
        self.buffer.push(!(significant as u8));
        for &byte in &bytes[8 - significant..] {
            self.buffer.push(!byte);
        }
    }

    /// Marks the end of an index value; sorts after every encodable value.
    pub fn write_infinity_ascending(&mut self) {
        self.buffer.push(ESCAPE2);
        self.buffer.push(0xff);
    }

    pub fn write_infinity_descending(&mut self) {
        self.buffer.push(!ESCAPE2);
        self.buffer.push(0x00);
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn encoded_bytes(&self) -> Vec<u8> {
        self.buffer.clone()
    }

    fn write_byte_ascending(&mut self, byte: u8) {
        match byte {
            ESCAPE1 => {
                self.buffer.push(ESCAPE1);
                self.buffer.push(0xff);
            }
            ESCAPE2 => {
                self.buffer.push(ESCAPE2);
                self.buffer.push(0x00);
            }
            _ => self.buffer.push(byte),
        }
    }

    fn write_byte_descending(&mut self, byte: u8) {
        match byte {
            ESCAPE1 => {
                self.buffer.push(!ESCAPE1);
                self.buffer.push(0x00);
            }
            ESCAPE2 => {
                self.buffer.push(!ESCAPE2);
                self.buffer.push(0xff);
            }
            _ => self.buffer.push(!byte),
        }
    }

    fn write_separator_ascending(&mut self) {
        self.buffer.push(ESCAPE1);
        self.buffer.push(SEPARATOR);
    }

    fn write_separator_descending(&mut self) {
        self.buffer.push(!ESCAPE1);
        self.buffer.push(!SEPARATOR);
    }

    /// Maps a double onto an unsigned integer whose natural order matches
    /// the numeric order: flip the sign bit for positives, complement
    /// everything for negatives.
    fn ordered_bits(value: f64) -> u64 {
        let bits = value.to_bits() as i64;
        if bits < 0 {
            !bits as u64
        } else {
            (bits | i64::MIN) as u64
        }
    }

    fn significant_length(bytes: &[u8; 8]) -> usize {
        let leading_zeros = bytes.iter().take_while(|&&b| b == 0).count();
        8 - leading_zeros
    }
}

/// Accumulates one index position, dispatching each segment's writes in the
/// direction its index segment declares.
#[derive(Default)]
pub struct IndexByteEncoder {
    writer: OrderedCodeWriter,
}

impl IndexByteEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&mut self, encoded: &[u8]) {
        self.writer.seed(encoded);
    }

    pub fn for_kind(&mut self, kind: IndexKind) -> DirectionalIndexByteEncoder<'_> {
        DirectionalIndexByteEncoder {
            writer: &mut self.writer,
            descending: kind == IndexKind::Descending,
        }
    }

    pub fn encoded_bytes(&self) -> Vec<u8> {
        self.writer.encoded_bytes()
    }

    pub fn reset(&mut self) {
        self.writer.reset();
    }
}

/// Direction-resolved view over the shared writer.
pub struct DirectionalIndexByteEncoder<'a> {
    writer: &'a mut OrderedCodeWriter,
    descending: bool,
}

impl DirectionalIndexByteEncoder<'_> {
    pub fn write_bytes(&mut self, value: &[u8]) {
        if self.descending {
            self.writer.write_bytes_descending(value);
        } else {
            self.writer.write_bytes_ascending(value);
        }
    }

    pub fn write_string(&mut self, value: &str) {
        if self.descending {
            self.writer.write_utf8_descending(value);
        } else {
            self.writer.write_utf8_ascending(value);
        }
    }

    pub fn write_number(&mut self, value: f64) {
        if self.descending {
            self.writer.write_number_descending(value);
        } else {
            self.writer.write_number_ascending(value);
        }
    }

    pub fn write_infinity(&mut self) {
        if self.descending {
            self.writer.write_infinity_descending();
        } else {
            self.writer.write_infinity_ascending();
        }
    }
}
