quick_error! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum ProtocolError {
        BadMagic(magic: u8) {
            display("Unknown magic byte 0x{:02x}", magic)
        }
        ShortHeader(len: usize) {
            display("Header needs 24 bytes, got {}", len)
        }
        BodyLength(body: u32, extras: u8, key: u16) {
            display("Body length {} cannot hold {} bytes of extras and {} bytes of key", body, extras, key)
        }
        KeyTooLong(len: usize) {
            display("Key of {} bytes does not fit in a header", len)
        }
        ExtrasTooLong(len: usize) {
            display("Extras of {} bytes do not fit in a header", len)
        }
        BodyTooLong(len: usize) {
            display("Body of {} bytes does not fit in a header", len)
        }
        FrameTooLong(len: usize, max: usize) {
            display("Frame of {} bytes exceeds the {} byte limit", len, max)
        }
        ShortExtras(expected: usize, got: usize) {
            display("Expected {} bytes of extras, got {}", expected, got)
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
