use byteorder::{ByteOrder, LittleEndian};

/// Fixed-width key codec for B+ tree pages. Node layouts are arrays of
/// `(key, value)` pairs, so every key type must encode to a constant
/// number of bytes.
pub trait IndexKey:
    Copy + Ord + Default + std::fmt::Debug + Send + Sync + 'static
{
    const ENCODED_LEN: usize;

    fn encode_into(&self, buf: &mut [u8]);
    fn decode_from(buf: &[u8]) -> Self;
}

impl IndexKey for i32 {
    const ENCODED_LEN: usize = 4;

    fn encode_into(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(buf, *self);
    }

    fn decode_from(buf: &[u8]) -> Self {
        LittleEndian::read_i32(buf)
    }
}

impl IndexKey for u32 {
    const ENCODED_LEN: usize = 4;

    fn encode_into(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, *self);
    }

    fn decode_from(buf: &[u8]) -> Self {
        LittleEndian::read_u32(buf)
    }
}

impl IndexKey for i64 {
    const ENCODED_LEN: usize = 8;

    fn encode_into(&self, buf: &mut [u8]) {
        LittleEndian::write_i64(buf, *self);
    }

    fn decode_from(buf: &[u8]) -> Self {
        LittleEndian::read_i64(buf)
    }
}

impl IndexKey for u64 {
    const ENCODED_LEN: usize = 8;

    fn encode_into(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(buf, *self);
    }

    fn decode_from(buf: &[u8]) -> Self {
        LittleEndian::read_u64(buf)
    }
}
